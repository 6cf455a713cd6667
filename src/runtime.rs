//! The frozen runtime the configuration loader hands to the workers:
//! compiled servers, bound listeners with their virtual-host indices, the
//! phase engine, the filter chains, and the only cross-worker state (the
//! accept mutex and the shared counters).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::config::{AppConfig, EventsConfig, HttpConfig, ServerConfig};
use crate::error::{Result, ServerError};
use crate::event::accept_mutex::{AcceptMutex, SharedCounters};
use crate::http::handlers;
use crate::http::handlers::rewrite::CompiledRewrite;
use crate::http::filter::{FilterChains, FilterRegistry};
use crate::http::location::{LocationIndex, LocationRuntime};
use crate::http::phase::{Phase, PhaseEngine, PhaseEngineBuilder, PhaseHandlerFn};
use crate::http::variables::VariableRegistry;
use crate::http::vhost::VirtualHosts;
use crate::listener::{bind, BoundListener};
use crate::worker::Worker;

/// A server scope compiled for runtime use.
pub struct ServerRuntime {
    pub conf: ServerConfig,
    pub locations: LocationIndex,
    pub rewrites: Vec<CompiledRewrite>,
}

impl ServerRuntime {
    fn compile(conf: ServerConfig, hooks: &Hooks) -> Result<ServerRuntime> {
        let mut locations = Vec::with_capacity(conf.locations.len());
        for location_conf in conf.locations.iter().cloned() {
            let mut location = LocationRuntime::compile(location_conf)?;
            for (pattern, handler) in &hooks.content_handlers {
                if *pattern == location.conf.pattern {
                    location.content_handler = Some(*handler);
                }
            }
            locations.push(location);
        }
        let rewrites = conf
            .rewrites
            .iter()
            .map(CompiledRewrite::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(ServerRuntime {
            locations: LocationIndex::build(locations)?,
            rewrites,
            conf,
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Arc<ServerRuntime> {
        Arc::new(
            ServerRuntime::compile(ServerConfig::default(), &Hooks::default())
                .expect("default server compiles"),
        )
    }
}

/// A bound endpoint plus the virtual-host selector over the servers
/// listening on it.
pub struct ListenerRuntime {
    pub bound: BoundListener,
    pub vhosts: VirtualHosts,
}

/// Test and embedding seams: handlers installed into the phase engine or
/// onto specific locations before the runtime freezes.
#[derive(Default)]
pub struct Hooks {
    /// `(location pattern, handler)` — installs a content producer on
    /// every location with that pattern.
    pub content_handlers: Vec<(String, PhaseHandlerFn)>,
    pub phase_handlers: Vec<(Phase, PhaseHandlerFn)>,
}

pub struct Runtime {
    pub http: HttpConfig,
    pub events: EventsConfig,
    pub servers: Vec<Arc<ServerRuntime>>,
    pub listeners: Vec<ListenerRuntime>,
    pub engine: PhaseEngine,
    pub filters: FilterChains,
    pub variables: VariableRegistry,

    pub accept_mutex: AcceptMutex,
    pub accept_mutex_enabled: bool,
    pub counters: SharedCounters,
    stop: AtomicBool,
}

impl Runtime {
    pub fn build(conf: AppConfig) -> Result<Arc<Runtime>> {
        Runtime::build_with(conf, Hooks::default())
    }

    pub fn build_with(conf: AppConfig, hooks: Hooks) -> Result<Arc<Runtime>> {
        conf.validate()?;
        let AppConfig {
            worker_threads,
            events,
            mut http,
            pid_file: _,
        } = conf;
        // A single worker has nobody to balance against.
        let accept_mutex_enabled = events.accept_mutex && worker_threads > 1;

        let server_confs = std::mem::take(&mut http.servers);
        let mut servers = Vec::with_capacity(server_confs.len());
        for server_conf in server_confs {
            servers.push(Arc::new(ServerRuntime::compile(server_conf, &hooks)?));
        }

        let listeners = build_listeners(&servers)?;
        for listener in &listeners {
            info!(addr = %listener.bound.local_addr(), "listening");
        }

        let mut builder = PhaseEngineBuilder::new();
        builder.install(Phase::ServerRewrite, handlers::rewrite::server_rewrite_phase);
        builder.install(Phase::Rewrite, handlers::rewrite::location_rewrite_phase);
        builder.install(Phase::PreAccess, handlers::limit::limit_conn_phase);
        builder.install(Phase::Access, handlers::access::access_phase);
        // Registered first so every hook-installed producer runs ahead of
        // the static file handler.
        builder.install(Phase::Content, handlers::static_files::static_phase);
        builder.install(Phase::Log, handlers::access_log_phase);
        for (phase, handler) in &hooks.phase_handlers {
            builder.install(*phase, *handler);
        }

        Ok(Arc::new(Runtime {
            http,
            events,
            servers,
            listeners,
            engine: builder.build(),
            filters: FilterRegistry::standard().build(),
            variables: VariableRegistry::builtin(),
            accept_mutex: AcceptMutex::new(),
            accept_mutex_enabled,
            counters: SharedCounters::default(),
            stop: AtomicBool::new(false),
        }))
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/// Group servers by listen address; the first `default_server` (or the
/// first server) on an address becomes its fallback scope.
fn build_listeners(servers: &[Arc<ServerRuntime>]) -> Result<Vec<ListenerRuntime>> {
    let mut listeners: Vec<(String, crate::config::ListenConfig, Vec<usize>)> = Vec::new();
    for (index, server) in servers.iter().enumerate() {
        for listen in &server.conf.listen {
            match listeners.iter_mut().find(|(addr, ..)| *addr == listen.addr) {
                Some((_, _, members)) => members.push(index),
                None => listeners.push((listen.addr.clone(), listen.clone(), vec![index])),
            }
        }
    }

    let mut built = Vec::with_capacity(listeners.len());
    for (_, listen_conf, members) in listeners {
        let default_server = members
            .iter()
            .copied()
            .find(|&index| servers[index].conf.default_server)
            .unwrap_or(members[0]);
        let mut names = Vec::new();
        for &index in &members {
            for name in &servers[index].conf.server_names {
                names.push((name.clone(), index));
            }
        }
        let vhosts = VirtualHosts::build(&names, default_server)?;
        built.push(ListenerRuntime {
            bound: bind(&listen_conf)?,
            vhosts,
        });
    }
    if built.is_empty() {
        return Err(ServerError::Config("no listeners".into()));
    }
    Ok(built)
}

/// Spawn `count` worker threads over a shared runtime. Each worker owns
/// its reactor, pool and timers outright; they share nothing else.
pub fn spawn_workers(
    rt: &Arc<Runtime>,
    count: usize,
) -> Vec<std::thread::JoinHandle<Result<()>>> {
    (0..count)
        .map(|id| {
            let rt = Arc::clone(rt);
            std::thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || Worker::new(rt, id)?.run())
                .expect("spawn worker thread")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenConfig;

    fn config_on(addr: &str) -> AppConfig {
        let mut conf = AppConfig::default();
        conf.http.servers.push(ServerConfig {
            listen: vec![ListenConfig {
                addr: addr.to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
        conf
    }

    #[test]
    fn builds_runtime_with_one_listener() {
        let rt = Runtime::build(config_on("127.0.0.1:0")).expect("runtime builds");
        assert_eq!(rt.listeners.len(), 1);
        assert_eq!(rt.servers.len(), 1);
        assert!(!rt.stopping());
        rt.shutdown();
        assert!(rt.stopping());
    }

    #[test]
    fn two_servers_share_a_listener() {
        let mut conf = config_on("127.0.0.1:0");
        // The second server re-uses the same address but is the declared
        // default.
        conf.http.servers.push(ServerConfig {
            listen: vec![ListenConfig {
                addr: "127.0.0.1:0".to_string(),
                ..Default::default()
            }],
            server_names: vec!["b.example".to_string()],
            default_server: true,
            ..Default::default()
        });
        let rt = Runtime::build(conf).expect("runtime builds");
        assert_eq!(rt.listeners.len(), 1);
        assert_eq!(rt.listeners[0].vhosts.default_server(), 1);
        assert_eq!(rt.listeners[0].vhosts.select("b.example"), 1);
    }
}

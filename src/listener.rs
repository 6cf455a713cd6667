//! Listening-endpoint setup. Sockets are created and bound once with the
//! full option set, then duplicated per worker; whether a worker's copy is
//! registered with its reactor at any moment is governed by the accept
//! mutex, not by this module.

use std::io;
use std::net::SocketAddr;
#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use mio::event::Source;
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::warn;

use crate::config::ListenConfig;
use crate::conn::Stream;
use crate::error::{Result, ServerError};

pub enum StdListener {
    Tcp(std::net::TcpListener),
    Unix(std::os::unix::net::UnixListener),
}

/// An endpoint bound by the engine, shared read-only by every worker.
pub struct BoundListener {
    pub conf: ListenConfig,
    std: StdListener,
}

/// A worker's duplicate of a bound endpoint.
pub enum WorkerListener {
    Tcp(mio::net::TcpListener),
    Unix(mio::net::UnixListener),
}

pub fn bind(conf: &ListenConfig) -> Result<BoundListener> {
    if conf.is_unix() {
        bind_unix(conf)
    } else {
        bind_tcp(conf)
    }
}

fn bind_tcp(conf: &ListenConfig) -> Result<BoundListener> {
    let addr: SocketAddr = conf.addr.parse()?;
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if conf.reuseport {
        socket.set_reuse_port(true)?;
    }
    if addr.is_ipv6() {
        socket.set_only_v6(conf.ipv6only)?;
    }
    if let Some(size) = conf.rcvbuf {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = conf.sndbuf {
        socket.set_send_buffer_size(size)?;
    }
    if let Some(ka) = &conf.so_keepalive {
        let params = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(ka.idle_secs))
            .with_interval(Duration::from_secs(ka.interval_secs))
            .with_retries(ka.count);
        socket.set_tcp_keepalive(&params)?;
    }

    socket.bind(&SockAddr::from(addr))?;
    socket.listen(conf.backlog)?;

    #[cfg(target_os = "linux")]
    apply_linux_options(&socket, conf);

    socket.set_nonblocking(true)?;
    Ok(BoundListener {
        conf: conf.clone(),
        std: StdListener::Tcp(socket.into()),
    })
}

/// Options socket2 does not surface.
#[cfg(target_os = "linux")]
fn apply_linux_options(socket: &Socket, conf: &ListenConfig) {
    use std::mem::size_of;

    unsafe {
        if conf.deferred_accept {
            let timeout: libc::c_int = 1;
            let rc = libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_DEFER_ACCEPT,
                &timeout as *const _ as *const libc::c_void,
                size_of::<libc::c_int>() as libc::socklen_t,
            );
            if rc != 0 {
                warn!(addr = %conf.addr, "TCP_DEFER_ACCEPT not applied");
            }
        }
        if let Some(qlen) = conf.fastopen {
            let qlen = qlen as libc::c_int;
            let rc = libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_FASTOPEN,
                &qlen as *const _ as *const libc::c_void,
                size_of::<libc::c_int>() as libc::socklen_t,
            );
            if rc != 0 {
                warn!(addr = %conf.addr, "TCP_FASTOPEN not applied");
            }
        }
    }
}

fn bind_unix(conf: &ListenConfig) -> Result<BoundListener> {
    let path = conf
        .addr
        .strip_prefix("unix:")
        .ok_or_else(|| ServerError::Config(format!("bad unix listen address: {}", conf.addr)))?;
    // A previous run may have left the socket file behind.
    let _ = std::fs::remove_file(path);

    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.bind(&SockAddr::unix(path)?)?;
    socket.listen(conf.backlog)?;
    socket.set_nonblocking(true)?;
    Ok(BoundListener {
        conf: conf.clone(),
        std: StdListener::Unix(socket.into()),
    })
}

impl BoundListener {
    /// Duplicate the endpoint for one worker's reactor.
    pub fn worker_instance(&self) -> Result<WorkerListener> {
        match &self.std {
            StdListener::Tcp(listener) => {
                let clone = listener.try_clone()?;
                clone.set_nonblocking(true)?;
                Ok(WorkerListener::Tcp(mio::net::TcpListener::from_std(clone)))
            }
            StdListener::Unix(listener) => {
                let clone = listener.try_clone()?;
                clone.set_nonblocking(true)?;
                Ok(WorkerListener::Unix(mio::net::UnixListener::from_std(
                    clone,
                )))
            }
        }
    }

    pub fn local_addr(&self) -> String {
        match &self.std {
            StdListener::Tcp(listener) => listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            StdListener::Unix(_) => self.conf.addr.clone(),
        }
    }
}

impl WorkerListener {
    /// One non-blocking accept. `Ok(None)` means the backlog is drained.
    pub fn accept(&self) -> io::Result<Option<Stream>> {
        match self {
            WorkerListener::Tcp(listener) => match listener.accept() {
                Ok((stream, _)) => Ok(Some(Stream::Tcp(stream))),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e),
            },
            WorkerListener::Unix(listener) => match listener.accept() {
                Ok((stream, _)) => Ok(Some(Stream::Unix(stream))),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e),
            },
        }
    }
}

impl Source for WorkerListener {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            WorkerListener::Tcp(l) => l.register(registry, token, interests),
            WorkerListener::Unix(l) => l.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            WorkerListener::Tcp(l) => l.reregister(registry, token, interests),
            WorkerListener::Unix(l) => l.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            WorkerListener::Tcp(l) => l.deregister(registry),
            WorkerListener::Unix(l) => l.deregister(registry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_and_clones_for_two_workers() {
        let conf = ListenConfig {
            addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        };
        let bound = bind(&conf).expect("bind");
        let first = bound.worker_instance().expect("clone one");
        let second = bound.worker_instance().expect("clone two");
        assert!(matches!(first, WorkerListener::Tcp(_)));
        assert!(matches!(second, WorkerListener::Tcp(_)));
        assert!(bound.local_addr().starts_with("127.0.0.1:"));
    }
}

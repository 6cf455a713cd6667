//! The configuration tree handed to the engine before the reactor starts.
//!
//! These are plain deserializable structs; `Runtime::build` compiles them
//! into the frozen lookup structures (virtual-host indices, location trees,
//! phase handlers) the workers actually run against.

use serde::Deserialize;

use crate::error::{Result, ServerError};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
pub const DEFAULT_SERVER_NAME: &str = "";
pub const DEFAULT_ROOT: &str = "./www";
pub const DEFAULT_INDEX: &str = "index.html";
pub const DEFAULT_MAX_BODY_SIZE: u64 = 1_048_576;
pub const DEFAULT_WORKER_CONNECTIONS: usize = 512;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub worker_threads: usize,
    /// Written at startup when set; the only on-disk artifact besides
    /// the logs.
    pub pid_file: Option<String>,
    pub events: EventsConfig,
    pub http: HttpConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            worker_threads: 1,
            pid_file: None,
            events: EventsConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_yaml(text: &str) -> Result<AppConfig> {
        let config: AppConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(ServerError::Config("worker_threads must be > 0".into()));
        }
        if self.events.worker_connections < 2 {
            return Err(ServerError::Config(
                "worker_connections must be at least 2".into(),
            ));
        }
        if self.http.servers.is_empty() {
            return Err(ServerError::Config("no servers configured".into()));
        }
        for server in &self.http.servers {
            server.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub worker_connections: usize,
    /// Drain the whole accept backlog per readiness report instead of one
    /// connection at a time.
    pub multi_accept: bool,
    pub accept_mutex: bool,
    /// Poll-timeout clamp while another worker holds the accept mutex.
    pub accept_mutex_delay_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            worker_connections: DEFAULT_WORKER_CONNECTIONS,
            multi_accept: false,
            accept_mutex: true,
            accept_mutex_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub servers: Vec<ServerConfig>,

    pub client_header_buffer_size: usize,
    pub large_client_header_buffers: BufSpec,
    pub output_buffers: BufSpec,
    /// Minimum bytes the write filter batches before touching the socket,
    /// unless a flush or last-buffer marker is present.
    pub postpone_output: usize,
    pub sendfile: bool,

    pub merge_slashes: bool,
    pub underscores_in_headers: bool,
    pub server_tokens: bool,

    pub keepalive_timeout_ms: u64,
    pub keepalive_requests: usize,
    pub client_header_timeout_ms: u64,
    pub client_body_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub lingering_time_ms: u64,
    pub lingering_timeout_ms: u64,

    pub max_subrequests: u32,
    pub max_uri_changes: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            client_header_buffer_size: 1024,
            large_client_header_buffers: BufSpec {
                count: 4,
                size: 8192,
            },
            output_buffers: BufSpec {
                count: 2,
                size: 32768,
            },
            postpone_output: 1460,
            sendfile: true,
            merge_slashes: true,
            underscores_in_headers: false,
            server_tokens: true,
            keepalive_timeout_ms: 65_000,
            keepalive_requests: 100,
            client_header_timeout_ms: 60_000,
            client_body_timeout_ms: 60_000,
            send_timeout_ms: 60_000,
            lingering_time_ms: 30_000,
            lingering_timeout_ms: 5_000,
            max_subrequests: 50,
            max_uri_changes: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BufSpec {
    pub count: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// "host:port" or "unix:/path/to.sock".
    pub addr: String,
    pub backlog: i32,
    pub rcvbuf: Option<usize>,
    pub sndbuf: Option<usize>,
    pub reuseport: bool,
    pub ipv6only: bool,
    pub deferred_accept: bool,
    pub fastopen: Option<u32>,
    pub so_keepalive: Option<TcpKeepalive>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_LISTEN.to_string(),
            backlog: 511,
            rcvbuf: None,
            sndbuf: None,
            reuseport: false,
            ipv6only: true,
            deferred_accept: false,
            fastopen: None,
            so_keepalive: None,
        }
    }
}

impl ListenConfig {
    pub fn is_unix(&self) -> bool {
        self.addr.starts_with("unix:")
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TcpKeepalive {
    pub idle_secs: u64,
    pub interval_secs: u64,
    pub count: u32,
}

impl Default for TcpKeepalive {
    fn default() -> Self {
        Self {
            idle_secs: 60,
            interval_secs: 10,
            count: 6,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: Vec<ListenConfig>,
    /// Exact names, `*.head` / `tail.*` wildcards, or `~pattern` regexes.
    pub server_names: Vec<String>,
    pub default_server: bool,

    pub root: String,
    pub index: Vec<String>,
    pub client_max_body_size: u64,
    pub error_pages: Vec<ErrorPage>,
    pub rewrites: Vec<RewriteRule>,
    pub ret: Option<ReturnDirective>,
    pub locations: Vec<LocationConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: vec![ListenConfig::default()],
            server_names: vec![DEFAULT_SERVER_NAME.to_string()],
            default_server: false,
            root: DEFAULT_ROOT.to_string(),
            index: vec![DEFAULT_INDEX.to_string()],
            client_max_body_size: DEFAULT_MAX_BODY_SIZE,
            error_pages: Vec::new(),
            rewrites: Vec::new(),
            ret: None,
            locations: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            return Err(ServerError::Config("server without listen address".into()));
        }
        for location in &self.locations {
            if location.pattern.is_empty() {
                return Err(ServerError::Config("location with empty pattern".into()));
            }
            if location.modifier == LocationModifier::Named
                && !location.pattern.starts_with('@')
            {
                return Err(ServerError::Config(format!(
                    "named location `{}` must start with '@'",
                    location.pattern
                )));
            }
        }
        Ok(())
    }
}

/// `error_page 404 500 [=200] /uri;`
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorPage {
    pub codes: Vec<u16>,
    /// Response status override (the `=code` form). `Some(0)` means "use
    /// the status the redirected request produces".
    #[serde(default)]
    pub response: Option<u16>,
    pub uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LocationModifier {
    /// Plain prefix match.
    #[default]
    Prefix,
    /// `=` exact match.
    Exact,
    /// `^~` prefix match that suppresses the regex pass.
    Prefer,
    /// `~` case-sensitive regex.
    Regex,
    /// `~*` case-insensitive regex.
    RegexInsensitive,
    /// `@name`, reachable only through internal jumps.
    Named,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    pub pattern: String,
    pub modifier: LocationModifier,

    pub root: Option<String>,
    pub index: Option<Vec<String>>,
    /// Allowed methods; empty admits every method.
    pub methods: Vec<String>,
    pub client_max_body_size: Option<u64>,

    pub rewrites: Vec<RewriteRule>,
    pub ret: Option<ReturnDirective>,
    pub access: Vec<AccessRule>,
    pub try_files: Option<TryFilesConfig>,
    pub error_pages: Vec<ErrorPage>,
    /// Per-peer concurrent request ceiling, checked in PREACCESS.
    pub limit_conn: Option<usize>,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            pattern: "/".to_string(),
            modifier: LocationModifier::Prefix,
            root: None,
            index: None,
            methods: Vec::new(),
            client_max_body_size: None,
            rewrites: Vec::new(),
            ret: None,
            access: Vec::new(),
            try_files: None,
            error_pages: Vec::new(),
            limit_conn: None,
        }
    }
}

/// `rewrite <regex> <replacement> [flag];`
#[derive(Debug, Clone, Deserialize)]
pub struct RewriteRule {
    pub pattern: String,
    pub replacement: String,
    #[serde(default)]
    pub flag: RewriteFlag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RewriteFlag {
    /// Keep running the remaining rules of this scope.
    #[default]
    None,
    /// Stop and re-run location matching with the new URI.
    Last,
    /// Stop rewriting, stay in the current location.
    Break,
    /// 302 with the substituted URI.
    Redirect,
    /// 301 with the substituted URI.
    Permanent,
}

/// `return <code> [text-or-url];`
#[derive(Debug, Clone, Deserialize)]
pub struct ReturnDirective {
    pub code: u16,
    #[serde(default)]
    pub text: Option<String>,
}

/// `allow`/`deny` with an address, a CIDR block, or `all`.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessRule {
    pub allow: bool,
    pub source: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TryFilesConfig {
    /// Probe templates; `$uri` expands to the decoded request URI.
    pub probes: Vec<String>,
    /// Final element: a URI, `@named` location, or `=code` status.
    pub fallback: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_once_a_server_exists() {
        let mut config = AppConfig::default();
        config.http.servers.push(ServerConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_server_list() {
        let config = AppConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_yaml_document() {
        let text = r#"
worker_threads: 2
http:
  keepalive_requests: 10
  servers:
    - listen: [{ addr: "127.0.0.1:9000" }]
      server_names: ["example.com", "*.example.com"]
      locations:
        - pattern: "/static/"
          root: "/srv/files"
        - pattern: "/old"
          rewrites:
            - { pattern: "^/old(.*)$", replacement: "/new$1", flag: last }
"#;
        let config = AppConfig::from_yaml(text).expect("yaml parses");
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.http.keepalive_requests, 10);
        assert_eq!(config.http.servers.len(), 1);
        let server = &config.http.servers[0];
        assert_eq!(server.listen[0].addr, "127.0.0.1:9000");
        assert_eq!(server.locations[1].rewrites[0].flag, RewriteFlag::Last);
    }

    #[test]
    fn named_location_requires_at_sign() {
        let mut server = ServerConfig::default();
        server.locations.push(LocationConfig {
            pattern: "missing".into(),
            modifier: LocationModifier::Named,
            ..Default::default()
        });
        assert!(server.validate().is_err());
    }
}

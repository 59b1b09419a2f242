//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `DBTUNNEL_STORE_URL`, `DBTUNNEL_STORE_AUTH`,
//!    `DBTUNNEL_SERVER_ID`, `DBTUNNEL_MANAGE_LISTEN`
//! 2. **Config file**: path via `--config <path>`, or `dbtunnel.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [store]
//! url = "https://my-project-default-rtdb.firebaseio.com"   # omit for in-process store
//! auth = "database-secret-or-id-token"                      # optional
//! reconnect_delay_secs = 1
//! reconnect_max_delay_secs = 30
//!
//! [node]
//! server_id = "build-box"        # default: hostname
//!
//! [shell]
//! default_shell = "/bin/bash"
//! default_working_dir = "~"
//! default_cols = 100
//! default_rows = 30
//!
//! [http]
//! proxy_listen = "127.0.0.1:55080"
//! local_host = "localhost"
//! initial_timeout_ms = 10000
//! stream_timeout_ms = 30000
//! response_mode = "auto"         # auto | buffered | streamed
//!
//! [registry]
//! heartbeat_interval_secs = 30
//! stale_after_secs = 45
//!
//! [manage]
//! listen = "0.0.0.0:55777"
//! ui_path = "./assets/feature_manager.html"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub manage: ManageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Realtime store connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// REST base URL of the realtime database. `None` selects the in-process
    /// memory store, which only connects tunnels inside one process.
    pub url: Option<String>,
    /// Access token appended as `?auth=` to every request.
    pub auth: Option<String>,
    /// Initial delay before re-opening a dropped event stream (default 1 s).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Upper bound for the event-stream reconnect backoff (default 30 s).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
}

/// Identity of this node in the server registry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    /// Registry key for this node. Defaults to the hostname so the id is stable
    /// across restarts.
    pub server_id: Option<String>,
}

/// Shell defaults for the shell tunnel.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    /// Shell binary (default `/bin/bash`).
    #[serde(default = "default_shell")]
    pub default_shell: String,
    /// Working directory; `~` is expanded (default `~`).
    #[serde(default = "default_working_dir")]
    pub default_working_dir: String,
    /// Start the shell as a login shell (`-l`) so rc files are sourced.
    #[serde(default = "default_true")]
    pub login: bool,
    /// `TERM` exported to the shell (default `xterm-256color`).
    #[serde(default = "default_term")]
    pub term: String,
    /// Terminal columns used until the client reports its size (default 100).
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    /// Terminal rows used until the client reports its size (default 30).
    #[serde(default = "default_rows")]
    pub default_rows: u16,
}

/// How the server side ships upstream response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    /// Stream when the upstream length is unknown or the body is an event
    /// stream; buffer otherwise.
    Auto,
    /// Always buffer and send a single response message.
    Buffered,
    /// Always send `start` + chunks + `end`.
    Streamed,
}

/// HTTP tunnel settings (both sides).
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Local listen address of the client-side proxy (default `127.0.0.1:55080`).
    #[serde(default = "default_proxy_listen")]
    pub proxy_listen: String,
    /// Forward every request to this port instead of parsing `/{port}/...`.
    pub fixed_port: Option<u16>,
    /// Host the server side forwards to (default `localhost`).
    #[serde(default = "default_local_host")]
    pub local_host: String,
    /// Client: max wait for the first response message (default 10 000 ms).
    #[serde(default = "default_initial_timeout_ms")]
    pub initial_timeout_ms: u64,
    /// Client: max wait from `start` to `end` of a streamed body (default 30 000 ms).
    #[serde(default = "default_stream_timeout_ms")]
    pub stream_timeout_ms: u64,
    /// Server: upstream request timeout (default 100 000 ms).
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    /// Server: response shipping mode (default `auto`).
    #[serde(default = "default_response_mode")]
    pub response_mode: ResponseMode,
    /// Client: maximum accepted request body in bytes (default 8 MB).
    #[serde(default = "default_max_request_body")]
    pub max_request_body: usize,
}

/// Registry heartbeat and liveness settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Seconds between heartbeats of server and session records (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Heartbeat age after which a record is reported stale (default 45).
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

/// Management endpoint settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ManageConfig {
    /// Socket address to bind (default `0.0.0.0:55777`).
    #[serde(default = "default_manage_listen")]
    pub listen: String,
    /// Operator UI document served at `/`. A built-in page is used when unset
    /// or unreadable.
    pub ui_path: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Supervisor settings for `dbtunnel supervise`.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Maximum seconds between restart attempts (default 60).
    #[serde(default = "default_supervisor_max_backoff")]
    pub max_backoff: u64,
    /// Seconds of uptime before resetting backoff (default 60).
    #[serde(default = "default_supervisor_stable_threshold")]
    pub stable_threshold: u64,
}

fn default_reconnect_delay() -> u64 {
    1
}
fn default_reconnect_max_delay() -> u64 {
    30
}
fn default_shell() -> String {
    "/bin/bash".to_string()
}
fn default_working_dir() -> String {
    "~".to_string()
}
fn default_true() -> bool {
    true
}
fn default_term() -> String {
    "xterm-256color".to_string()
}
fn default_cols() -> u16 {
    100
}
fn default_rows() -> u16 {
    30
}
fn default_proxy_listen() -> String {
    "127.0.0.1:55080".to_string()
}
fn default_local_host() -> String {
    "localhost".to_string()
}
fn default_initial_timeout_ms() -> u64 {
    10_000
}
fn default_stream_timeout_ms() -> u64 {
    30_000
}
fn default_upstream_timeout_ms() -> u64 {
    100_000
}
fn default_response_mode() -> ResponseMode {
    ResponseMode::Auto
}
fn default_max_request_body() -> usize {
    8 * 1024 * 1024
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_stale_after() -> u64 {
    45
}
fn default_manage_listen() -> String {
    "0.0.0.0:55777".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_supervisor_max_backoff() -> u64 {
    60
}
fn default_supervisor_stable_threshold() -> u64 {
    60
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            auth: None,
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            default_working_dir: default_working_dir(),
            login: default_true(),
            term: default_term(),
            default_cols: default_cols(),
            default_rows: default_rows(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            proxy_listen: default_proxy_listen(),
            fixed_port: None,
            local_host: default_local_host(),
            initial_timeout_ms: default_initial_timeout_ms(),
            stream_timeout_ms: default_stream_timeout_ms(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
            response_mode: default_response_mode(),
            max_request_body: default_max_request_body(),
        }
    }
}

impl HttpConfig {
    pub fn initial_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_timeout_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            stale_after_secs: default_stale_after(),
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Staleness threshold in milliseconds, for comparison with store timestamps.
    pub fn stale_after_ms(&self) -> u64 {
        self.stale_after_secs * 1000
    }
}

impl Default for ManageConfig {
    fn default() -> Self {
        Self {
            listen: default_manage_listen(),
            ui_path: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_backoff: default_supervisor_max_backoff(),
            stable_threshold: default_supervisor_stable_threshold(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `dbtunnel.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            Self::parse(&content).unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("dbtunnel.toml").exists() {
            let content =
                std::fs::read_to_string("dbtunnel.toml").expect("Failed to read dbtunnel.toml");
            Self::parse(&content).expect("Failed to parse dbtunnel.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(url) = std::env::var("DBTUNNEL_STORE_URL") {
            config.store.url = Some(url);
        }
        if let Ok(auth) = std::env::var("DBTUNNEL_STORE_AUTH") {
            config.store.auth = Some(auth);
        }
        if let Ok(id) = std::env::var("DBTUNNEL_SERVER_ID") {
            config.node.server_id = Some(id);
        }
        if let Ok(listen) = std::env::var("DBTUNNEL_MANAGE_LISTEN") {
            config.manage.listen = listen;
        }

        config
    }

    /// Parse a TOML document, filling every omitted field with its default.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Base registry id of this host: configured value or the hostname.
    /// Dedicated roles derive their own id from it (see
    /// [`ServerRole::server_id`](crate::registry::ServerRole::server_id)).
    pub fn server_id(&self) -> String {
        self.node
            .server_id
            .clone()
            .unwrap_or_else(crate::util::hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::parse("").unwrap();
        assert!(config.store.url.is_none());
        assert_eq!(config.http.proxy_listen, "127.0.0.1:55080");
        assert_eq!(config.http.response_mode, ResponseMode::Auto);
        assert_eq!(config.registry.heartbeat_interval_secs, 30);
        assert_eq!(config.manage.listen, "0.0.0.0:55777");
        assert_eq!(config.shell.default_cols, 100);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [http]
            fixed_port = 8080
            response_mode = "streamed"

            [node]
            server_id = "box-1"
            "#,
        )
        .unwrap();
        assert_eq!(config.http.fixed_port, Some(8080));
        assert_eq!(config.http.response_mode, ResponseMode::Streamed);
        assert_eq!(config.http.initial_timeout_ms, 10_000);
        assert_eq!(config.server_id(), "box-1");
    }

    #[test]
    fn unknown_response_mode_is_rejected() {
        assert!(Config::parse("[http]\nresponse_mode = \"sometimes\"\n").is_err());
    }
}

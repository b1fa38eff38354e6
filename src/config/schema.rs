//! Configuration schema definitions.
//!
//! Mirrors the declarative surface of a prefork application server: socket,
//! worker pool sizing, timeouts, logging, process identity. All types derive
//! Serde traits for deserialization from config files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address the listener binds (e.g., "0.0.0.0:8000").
    pub bind: String,

    /// OS-level pending-connection queue depth.
    pub backlog: i32,

    /// Fixed worker process count. `0` resolves to `cpu_count * 2 + 1`.
    pub workers: usize,

    /// Worker execution model.
    pub worker_class: WorkerClass,

    /// Max concurrent connections per worker (`pool` class only).
    pub worker_connections: usize,

    /// Seconds of worker silence tolerated before a forced recycle.
    pub timeout: u64,

    /// Seconds granted to draining workers during graceful shutdown.
    pub graceful_timeout: u64,

    /// Idle keep-alive connection retention, in seconds. `0` disables.
    pub keepalive: u64,

    /// Access log sink: `"-"` for stdout, a path for a file, absent to disable.
    pub accesslog: Option<String>,

    /// Error log sink: `"-"` for stderr, or a file path.
    pub errorlog: String,

    /// Minimum severity emitted to the error log.
    pub loglevel: LogLevel,

    /// Field template for access records.
    pub access_log_format: String,

    /// Process title used for operational visibility.
    pub proc_name: Option<String>,

    /// Detach from the controlling terminal at startup.
    pub daemon: bool,

    /// Path to write the supervisor's process id.
    pub pidfile: Option<PathBuf>,

    /// Umask applied to worker processes.
    pub umask: u32,

    /// User name workers switch to after spawn.
    pub user: Option<String>,

    /// Group name workers switch to after spawn.
    pub group: Option<String>,

    /// `KEY=VALUE` environment entries injected into worker processes.
    pub raw_env: Vec<String>,

    /// Optional transport encryption material (paths only; termination is
    /// delegated to the deployment in front of this server).
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            backlog: 2048,
            workers: 0,
            worker_class: WorkerClass::Sync,
            worker_connections: 1000,
            timeout: 30,
            graceful_timeout: 30,
            keepalive: 2,
            accesslog: Some("-".to_string()),
            errorlog: "-".to_string(),
            loglevel: LogLevel::Info,
            access_log_format: DEFAULT_ACCESS_LOG_FORMAT.to_string(),
            proc_name: None,
            daemon: false,
            pidfile: None,
            umask: 0,
            user: None,
            group: None,
            raw_env: Vec::new(),
            tls: None,
        }
    }
}

/// Default access record template (common log format plus referrer, user
/// agent and request duration in microseconds).
pub const DEFAULT_ACCESS_LOG_FORMAT: &str =
    r#"%(h)s %(l)s %(u)s %(t)s "%(r)s" %(s)s %(b)s "%(f)s" "%(a)s" %(D)s"#;

impl ServerConfig {
    /// Resolved worker count: the configured value, or `cpu_count * 2 + 1`
    /// when left at `0`.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get() * 2 + 1
        } else {
            self.workers
        }
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn graceful_duration(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout)
    }

    pub fn keepalive_duration(&self) -> Option<Duration> {
        if self.keepalive == 0 {
            None
        } else {
            Some(Duration::from_secs(self.keepalive))
        }
    }
}

/// Worker execution model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerClass {
    /// One connection at a time per worker.
    #[default]
    Sync,
    /// Event-driven: up to `worker_connections` concurrent connections.
    Pool,
}

/// Minimum severity emitted to the error log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Directive understood by the tracing subscriber's filter.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            // tracing has no level above `error`; both map onto it and the
            // distinction is kept only in the configuration surface.
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

/// TLS material paths for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to the private key file (PEM).
    pub keyfile: PathBuf,

    /// Path to the certificate file (PEM).
    pub certfile: PathBuf,

    /// Optional CA bundle for client verification.
    pub ca_certs: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_surface() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind, "0.0.0.0:8000");
        assert_eq!(cfg.backlog, 2048);
        assert_eq!(cfg.workers, 0);
        assert_eq!(cfg.worker_class, WorkerClass::Sync);
        assert_eq!(cfg.timeout, 30);
        assert_eq!(cfg.keepalive, 2);
        assert_eq!(cfg.accesslog.as_deref(), Some("-"));
        assert_eq!(cfg.errorlog, "-");
        assert_eq!(cfg.loglevel, LogLevel::Info);
    }

    #[test]
    fn zero_workers_resolves_to_cpu_formula() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.worker_count(), num_cpus::get() * 2 + 1);

        let fixed = ServerConfig { workers: 4, ..Default::default() };
        assert_eq!(fixed.worker_count(), 4);
    }

    #[test]
    fn zero_keepalive_disables_retention() {
        let cfg = ServerConfig { keepalive: 0, ..Default::default() };
        assert!(cfg.keepalive_duration().is_none());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: ServerConfig = toml::from_str(
            r#"
            bind = "127.0.0.1:9000"
            workers = 2
            worker_class = "pool"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:9000");
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.worker_class, WorkerClass::Pool);
        assert_eq!(cfg.backlog, 2048);
        assert_eq!(cfg.timeout, 30);
    }

    #[test]
    fn config_round_trips_through_json() {
        let cfg = ServerConfig {
            bind: "127.0.0.1:8080".into(),
            workers: 3,
            raw_env: vec!["APP_ENV=production".into()],
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bind, cfg.bind);
        assert_eq!(back.workers, 3);
        assert_eq!(back.raw_env, cfg.raw_env);
    }
}

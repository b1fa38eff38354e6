//! Configuration validation.
//!
//! Semantic checks on top of what serde already guarantees. Validation is a
//! pure function over the resolved config and reports every problem it finds,
//! not just the first.

use std::net::SocketAddr;

use crate::config::schema::{ServerConfig, WorkerClass};
use crate::observability::access::AccessFormat;

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidBindAddress(String),
    NonPositiveBacklog(i32),
    ZeroTimeout,
    ZeroWorkerConnections,
    MalformedEnvEntry(String),
    UmaskOutOfRange(u32),
    BadAccessFormat(String),
    MissingTlsFile(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::InvalidBindAddress(addr) => {
                write!(f, "bind address '{}' is not a valid socket address", addr)
            }
            ValidationError::NonPositiveBacklog(n) => {
                write!(f, "backlog must be positive, got {}", n)
            }
            ValidationError::ZeroTimeout => write!(f, "timeout must be at least 1 second"),
            ValidationError::ZeroWorkerConnections => {
                write!(f, "worker_connections must be at least 1 for the pool class")
            }
            ValidationError::MalformedEnvEntry(entry) => {
                write!(f, "raw_env entry '{}' is not of the form KEY=VALUE", entry)
            }
            ValidationError::UmaskOutOfRange(mask) => {
                write!(f, "umask {:#o} has bits outside the permission range", mask)
            }
            ValidationError::BadAccessFormat(detail) => {
                write!(f, "access_log_format is invalid: {}", detail)
            }
            ValidationError::MissingTlsFile(path) => {
                write!(f, "TLS file '{}' does not exist", path)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate a resolved configuration, collecting every failure.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.bind.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(config.bind.clone()));
    }

    if config.backlog <= 0 {
        errors.push(ValidationError::NonPositiveBacklog(config.backlog));
    }

    if config.timeout == 0 {
        errors.push(ValidationError::ZeroTimeout);
    }

    if config.worker_class == WorkerClass::Pool && config.worker_connections == 0 {
        errors.push(ValidationError::ZeroWorkerConnections);
    }

    for entry in &config.raw_env {
        if !entry.contains('=') || entry.starts_with('=') {
            errors.push(ValidationError::MalformedEnvEntry(entry.clone()));
        }
    }

    if config.umask > 0o777 {
        errors.push(ValidationError::UmaskOutOfRange(config.umask));
    }

    if let Err(e) = AccessFormat::compile(&config.access_log_format) {
        errors.push(ValidationError::BadAccessFormat(e.to_string()));
    }

    if let Some(tls) = &config.tls {
        for path in [Some(&tls.keyfile), Some(&tls.certfile), tls.ca_certs.as_ref()]
            .into_iter()
            .flatten()
        {
            if !path.exists() {
                errors.push(ValidationError::MissingTlsFile(path.display().to_string()));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

//! Error log initialization.
//!
//! # Responsibilities
//! - Install the global tracing subscriber once per process
//! - Map the configured severity threshold onto the subscriber filter
//! - Route output to stderr or the configured file
//!
//! Both the supervisor and every worker call this at startup; with a file
//! sink all processes append to the same file.

use std::io;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;

/// Initialize the tracing subscriber from `errorlog` and `loglevel`.
///
/// An explicit `RUST_LOG` in the environment takes precedence over the
/// configured level so an operator can raise verbosity without a config edit.
pub fn init(config: &ServerConfig) -> io::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.loglevel.as_filter()));

    if config.errorlog == "-" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.errorlog)?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false),
            )
            .init();
    }

    Ok(())
}

//! Worker process implementation.
//!
//! # Responsibilities
//! - Adopt the inherited listener and status descriptors
//! - Run `post_fork` hooks, then report ready and start accepting
//! - Translate termination signals into cooperative stop requests
//! - Run `worker_interrupt` hooks before exiting
//!
//! A worker is single-threaded. The `sync` class serves connections
//! serially; the `pool` class serves up to `worker_connections` of them
//! concurrently on the same thread.

pub mod pool_worker;
pub mod service;
pub mod sync_worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::mpsc;

use crate::config::{ServerConfig, WorkerClass};
use crate::error::ServerError;
use crate::hooks::{HookRegistry, WorkerContext};
use crate::lifecycle::shutdown::{Shutdown, StopMode};
use crate::lifecycle::set_process_title;
use crate::net::{BindError, BoundSocket};
use crate::observability::AccessLogger;
use crate::supervisor::{StatusPipe, WorkerMessage, WORKER_ID_ENV};

pub use service::{default_app, Handler};

/// Clone-able status reporter; a single writer task owns the actual channel
/// so the accept loop and connection tasks never contend on it.
#[derive(Debug, Clone)]
pub struct StatusSender {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl StatusSender {
    /// Queue a status report. Best-effort: the worker must not fail because
    /// the supervisor went away.
    pub fn send(&self, message: WorkerMessage) {
        let _ = self.tx.send(message);
    }
}

fn start_status_writer(mut pipe: StatusPipe) -> StatusSender {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if pipe.send(message).await.is_err() {
                // Supervisor gone; the kill signal will follow shortly.
                break;
            }
        }
    });
    StatusSender { tx }
}

/// Heartbeat emission period: half the silence tolerance, at least a second.
fn heartbeat_period(config: &ServerConfig) -> Duration {
    Duration::from_secs((config.timeout / 2).max(1))
}

fn install_signal_handlers(shutdown: &Arc<Shutdown>) -> std::io::Result<()> {
    let mut term = unix_signal(SignalKind::terminate())?;
    let mut int = unix_signal(SignalKind::interrupt())?;
    let mut quit = unix_signal(SignalKind::quit())?;

    let graceful = shutdown.clone();
    tokio::spawn(async move {
        if term.recv().await.is_some() {
            graceful.trigger(StopMode::Graceful);
        }
    });

    let fast = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = int.recv() => {}
            _ = quit.recv() => {}
        }
        fast.trigger(StopMode::Fast);
    });

    Ok(())
}

/// Entry point for the worker role.
pub async fn run(
    config: ServerConfig,
    hooks: Arc<HookRegistry>,
    app: Handler,
) -> crate::error::Result<()> {
    let worker_id: usize = std::env::var(WORKER_ID_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let title = config.proc_name.as_deref().unwrap_or("prefork-server");
    set_process_title(&format!("{}: worker", title));

    let ctx = WorkerContext { pid: std::process::id(), worker_id };
    hooks.run_post_fork(&ctx);

    let socket = BoundSocket::from_env()?.ok_or_else(|| {
        ServerError::Bind(BindError::Inherit(
            "listener descriptor not in environment".to_string(),
        ))
    })?;
    let listener = socket.into_tokio()?;

    let status = start_status_writer(StatusPipe::from_env()?);
    let logger =
        AccessLogger::from_config(config.accesslog.as_deref(), &config.access_log_format)?;

    let shutdown = Arc::new(Shutdown::new());
    install_signal_handlers(&shutdown)?;

    status.send(WorkerMessage::Ready);
    tracing::debug!(worker_id, pid = ctx.pid, "Worker accepting");

    let result = match config.worker_class {
        WorkerClass::Sync => {
            sync_worker::run(&config, listener, app, logger, status, shutdown.subscribe())
                .await
        }
        WorkerClass::Pool => {
            pool_worker::run(&config, listener, app, logger, status, shutdown.subscribe())
                .await
        }
    };

    hooks.run_worker_interrupt(&ctx);
    tracing::info!(worker_id, "Worker exiting");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_is_half_the_timeout() {
        let cfg = ServerConfig { timeout: 30, ..Default::default() };
        assert_eq!(heartbeat_period(&cfg), Duration::from_secs(15));
    }

    #[test]
    fn heartbeat_never_drops_below_one_second() {
        let cfg = ServerConfig { timeout: 1, ..Default::default() };
        assert_eq!(heartbeat_period(&cfg), Duration::from_secs(1));
    }
}

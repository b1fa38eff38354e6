//! Synchronous worker class: one connection at a time.
//!
//! The accept loop serves each connection to completion before touching the
//! socket again. Heartbeats are emitted from the same loop, so a handler
//! stuck past the configured timeout starves them and the supervisor
//! recycles this worker; that is the only per-request latency bound.
//!
//! Connections are closed after one response: with a serial loop, honoring
//! keep-alive would let a single idle client monopolize the worker.

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::service::{self, Handler};
use super::{heartbeat_period, StatusSender};
use crate::config::ServerConfig;
use crate::lifecycle::shutdown::StopMode;
use crate::observability::AccessLogger;
use crate::supervisor::WorkerMessage;

pub async fn run(
    config: &ServerConfig,
    listener: TcpListener,
    app: Handler,
    logger: Option<AccessLogger>,
    status: StatusSender,
    mut stop: watch::Receiver<Option<StopMode>>,
) -> crate::error::Result<()> {
    let mut heartbeat = tokio::time::interval(heartbeat_period(config));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        status.send(WorkerMessage::Busy);
                        service::serve_connection(stream, peer, &app, logger.as_ref(), None)
                            .await;
                        status.send(WorkerMessage::Idle);
                    }
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                }
            }
            _ = heartbeat.tick() => status.send(WorkerMessage::Heartbeat),
            _ = stop.changed() => break,
        }
    }

    // Nothing to drain: an in-flight connection was served inline before the
    // stop request could be observed.
    Ok(())
}

//! Pool worker class: bounded concurrent connections.
//!
//! Connection slots are controlled by a semaphore sized from
//! `worker_connections`; the permit is acquired before accept so a saturated
//! worker leaves pending connections in the shared backlog for its siblings.
//! The accept loop never blocks on request handling, so heartbeats keep
//! flowing under load and the supervisor timeout only catches a wedged
//! process.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
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
    let limit = Arc::new(Semaphore::new(config.worker_connections));
    let active = Arc::new(AtomicUsize::new(0));
    let keepalive = config.keepalive_duration();

    let mut heartbeat = tokio::time::interval(heartbeat_period(config));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            slot = async {
                // Acquire the slot first (backpressure), then accept.
                let permit = limit.clone().acquire_owned().await;
                let accepted = listener.accept().await;
                (permit, accepted)
            } => {
                let (permit, accepted) = slot;
                let Ok(permit) = permit else { break };
                match accepted {
                    Ok((stream, peer)) => {
                        if active.fetch_add(1, Ordering::SeqCst) == 0 {
                            status.send(WorkerMessage::Busy);
                        }

                        let app = app.clone();
                        let logger = logger.clone();
                        let status = status.clone();
                        let active = active.clone();
                        connections.spawn(async move {
                            service::serve_connection(
                                stream,
                                peer,
                                &app,
                                logger.as_ref(),
                                keepalive,
                            )
                            .await;
                            drop(permit);
                            if active.fetch_sub(1, Ordering::SeqCst) == 1 {
                                status.send(WorkerMessage::Idle);
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                }
            }
            _ = heartbeat.tick() => status.send(WorkerMessage::Heartbeat),
            _ = stop.changed() => break,
        }
    }

    if *stop.borrow() == Some(StopMode::Graceful) {
        tracing::debug!(
            in_flight = active.load(Ordering::SeqCst),
            "Draining connections"
        );
        while connections.join_next().await.is_some() {}
    }
    // Fast stop: dropping the JoinSet aborts whatever is still in flight.

    Ok(())
}

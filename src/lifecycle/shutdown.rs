//! Shutdown coordination.

use tokio::sync::watch;

/// How a stop request should be honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Finish in-flight work, then exit.
    Graceful,
    /// Exit as soon as the current await point is reached.
    Fast,
}

/// Coordinator for shutdown of a process's long-running tasks.
///
/// Wraps a watch channel: the signal handler publishes a stop mode once, and
/// every accept loop or drain task observes it at its next await point.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<Option<StopMode>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Subscribe to stop requests.
    pub fn subscribe(&self) -> watch::Receiver<Option<StopMode>> {
        self.tx.subscribe()
    }

    /// Publish a stop request. Later triggers may only escalate: a `Fast`
    /// request overrides a pending `Graceful` one, never the reverse.
    pub fn trigger(&self, mode: StopMode) {
        self.tx.send_if_modified(|current| match current {
            None => {
                *current = Some(mode);
                true
            }
            Some(StopMode::Graceful) if mode == StopMode::Fast => {
                *current = Some(StopMode::Fast);
                true
            }
            Some(_) => false,
        });
    }

    /// Current stop request, if any.
    pub fn requested(&self) -> Option<StopMode> {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

//! Lifecycle hook registry.
//!
//! # Responsibilities
//! - Hold callbacks for the three lifecycle extension points
//! - Invoke them synchronously at the matching transition
//!
//! # Design Decisions
//! - Hooks are registered once at startup and never mutated after
//! - Default behavior is a no-op; an empty registry is the common case
//! - A hook that hangs during worker boot is bounded by the supervisor's
//!   startup grace period, not by the registry itself

use std::fmt;

/// Context handed to worker-scoped hooks.
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext {
    /// OS process id of the worker.
    pub pid: u32,
    /// Stable worker slot number assigned by the supervisor.
    pub worker_id: usize,
}

type WorkerHook = Box<dyn Fn(&WorkerContext) + Send + Sync>;
type SupervisorHook = Box<dyn Fn() + Send + Sync>;

/// Registry of lifecycle callbacks.
///
/// Populated with the builder methods, then handed to the server. Each
/// callback list runs in registration order.
#[derive(Default)]
pub struct HookRegistry {
    post_fork: Vec<WorkerHook>,
    worker_interrupt: Vec<WorkerHook>,
    pre_exec: Vec<SupervisorHook>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run in the freshly spawned worker process, before it starts accepting.
    pub fn on_post_fork<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WorkerContext) + Send + Sync + 'static,
    {
        self.post_fork.push(Box::new(hook));
        self
    }

    /// Run in a worker that received a termination signal, before it exits.
    pub fn on_worker_interrupt<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WorkerContext) + Send + Sync + 'static,
    {
        self.worker_interrupt.push(Box::new(hook));
        self
    }

    /// Run in the supervisor immediately before it replaces its own image.
    pub fn on_pre_exec<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.pre_exec.push(Box::new(hook));
        self
    }

    pub(crate) fn run_post_fork(&self, ctx: &WorkerContext) {
        for hook in &self.post_fork {
            hook(ctx);
        }
    }

    pub(crate) fn run_worker_interrupt(&self, ctx: &WorkerContext) {
        for hook in &self.worker_interrupt {
            hook(ctx);
        }
    }

    pub(crate) fn run_pre_exec(&self) {
        for hook in &self.pre_exec {
            hook();
        }
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("post_fork", &self.post_fork.len())
            .field("worker_interrupt", &self.worker_interrupt.len())
            .field("pre_exec", &self.pre_exec.len())
            .finish()
    }
}

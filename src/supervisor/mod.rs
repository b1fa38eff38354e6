//! Worker pool supervision.
//!
//! # Responsibilities
//! - Bind (or inherit) the listening socket before any worker exists
//! - Keep exactly the configured number of workers accepting from it
//! - Enforce the per-request silence timeout with forced recycles
//! - Translate operator signals into shutdown, scaling, or in-place reexec
//!
//! # Data Flow
//! ```text
//! start():    bind listener → write pidfile → spawn N workers → all Ready
//! monitor():  worker events + heartbeat ticks + signals → respawn/recycle
//! shutdown(): signal workers → drain up to grace → SIGKILL stragglers
//! reexec():   pre_exec hooks → export listener fd → execv(self)
//! ```
//!
//! # Design Decisions
//! - The supervisor is the only process that spawns, signals, or reaps
//! - Startup is fail-fast: a worker that dies or stalls before Ready aborts
//! - Steady-state failures are contained to the affected worker

pub mod protocol;
pub mod spawn;
pub mod worker;

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStringExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hooks::HookRegistry;
use crate::lifecycle::shutdown::StopMode;
use crate::lifecycle::{set_process_title, PidFile};
use crate::net::{BoundSocket, LISTEN_FD_ENV};

pub use protocol::{StatusPipe, WorkerMessage, CONFIG_ENV, STATUS_FD_ENV, WORKER_ID_ENV};
pub use spawn::ProcessIdentity;
pub use worker::{describe_exit, WorkerHandle, WorkerState};

/// Environment variable listing worker pids of the pre-exec process image,
/// retired once the replacement pool is ready.
pub const PREDECESSOR_ENV: &str = "PREFORK_PREDECESSOR_WORKERS";

/// Grace granted to workers on a fast shutdown, enough to run their
/// interrupt hooks.
const FAST_STOP_GRACE: Duration = Duration::from_secs(1);

/// Error type for pool startup.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("worker {id} exited during startup ({detail})")]
    WorkerFailed { id: usize, detail: String },

    #[error("only {ready} of {expected} workers became ready within {grace:?}")]
    Timeout { ready: usize, expected: usize, grace: Duration },

    #[error("failed to spawn worker: {0}")]
    Spawn(io::Error),
}

/// Error type for the in-place upgrade path. Fatal to the upgrade attempt
/// only: the current process set keeps serving.
#[derive(Error, Debug)]
pub enum ReexecError {
    #[error("failed to resolve executable path: {0}")]
    Io(#[from] io::Error),

    #[error("argument contains an interior NUL byte")]
    BadArgument,

    #[error("failed to prepare listener descriptor: {0}")]
    Fd(nix::errno::Errno),

    #[error("exec failed: {0}")]
    Exec(nix::errno::Errno),
}

/// Internal supervisor event, produced by per-worker channel tasks.
#[derive(Debug)]
enum Event {
    Message { id: usize, message: WorkerMessage },
    Exited { id: usize, status: Option<ExitStatus> },
}

/// The control process: owns the configuration, the listening socket, and
/// every worker handle.
pub struct Supervisor {
    config: ServerConfig,
    hooks: Arc<HookRegistry>,
    socket: BoundSocket,
    identity: ProcessIdentity,
    workers: HashMap<usize, WorkerHandle>,
    next_id: usize,
    target: usize,
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    pidfile: Option<PidFile>,
    stopping: bool,
}

impl Supervisor {
    /// Bind the listener, spawn the pool, and wait until every worker
    /// reports ready.
    pub async fn start(
        config: ServerConfig,
        hooks: Arc<HookRegistry>,
    ) -> Result<Self, ServerError> {
        let socket = match BoundSocket::from_env()? {
            Some(socket) => {
                tracing::info!(address = %socket.addr(), "Listener inherited across exec");
                socket
                    .set_cloexec()
                    .map_err(crate::net::BindError::Os)?;
                socket
            }
            None => BoundSocket::bind(&config.bind, config.backlog)?,
        };

        let identity =
            ProcessIdentity::resolve(config.user.as_deref(), config.group.as_deref())?;

        let pidfile = match &config.pidfile {
            Some(path) => Some(PidFile::write(path)?),
            None => None,
        };

        let title = config.proc_name.as_deref().unwrap_or("prefork-server");
        set_process_title(&format!("{}: master", title));

        let (tx, rx) = mpsc::unbounded_channel();
        let target = config.worker_count();

        let mut supervisor = Self {
            config,
            hooks,
            socket,
            identity,
            workers: HashMap::new(),
            next_id: 0,
            target,
            tx,
            rx,
            pidfile,
            stopping: false,
        };

        for _ in 0..target {
            supervisor.spawn_one().map_err(StartupError::Spawn)?;
        }
        supervisor.wait_until_ready().await?;

        tracing::info!(
            workers = target,
            address = %supervisor.socket.addr(),
            "Server ready"
        );

        supervisor.retire_predecessors();

        Ok(supervisor)
    }

    /// The supervisor's own concurrency unit: react to worker events,
    /// heartbeat ticks, and operator signals until a shutdown signal ends it.
    pub async fn monitor(&mut self) -> Result<(), ServerError> {
        let mut sigterm = unix_signal(SignalKind::terminate())?;
        let mut sigint = unix_signal(SignalKind::interrupt())?;
        let mut sigquit = unix_signal(SignalKind::quit())?;
        let mut sigusr2 = unix_signal(SignalKind::user_defined2())?;
        let mut sighup = unix_signal(SignalKind::hangup())?;
        let mut sigttin = unix_signal(SignalKind::from_raw(nix::libc::SIGTTIN))?;
        let mut sigttou = unix_signal(SignalKind::from_raw(nix::libc::SIGTTOU))?;

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(event) = self.rx.recv() => self.handle_event(event),
                _ = tick.tick() => self.enforce_timeouts(),
                _ = sigterm.recv() => {
                    tracing::info!("SIGTERM received, shutting down gracefully");
                    self.shutdown(StopMode::Graceful).await;
                    return Ok(());
                }
                _ = sigint.recv() => {
                    tracing::info!("SIGINT received, shutting down");
                    self.shutdown(StopMode::Fast).await;
                    return Ok(());
                }
                _ = sigquit.recv() => {
                    tracing::info!("SIGQUIT received, shutting down");
                    self.shutdown(StopMode::Fast).await;
                    return Ok(());
                }
                _ = sigusr2.recv() => {
                    tracing::info!("SIGUSR2 received, re-executing in place");
                    if let Err(e) = self.reexec() {
                        tracing::error!(
                            error = %e,
                            "In-place upgrade failed, continuing with current process set"
                        );
                    }
                }
                _ = sighup.recv() => {
                    tracing::warn!("SIGHUP received; live reload is not supported, ignoring");
                }
                _ = sigttin.recv() => self.scale(1),
                _ = sigttou.recv() => self.scale(-1),
            }
        }
    }

    /// Stop accepting, drain up to `grace`, then terminate what remains.
    pub async fn shutdown(&mut self, mode: StopMode) {
        self.stopping = true;

        let (grace, sig) = match mode {
            StopMode::Graceful => (self.config.graceful_duration(), Signal::SIGTERM),
            StopMode::Fast => (FAST_STOP_GRACE, Signal::SIGQUIT),
        };

        tracing::info!(?mode, workers = self.live_count(), "Stopping workers");
        self.signal_live(sig);
        self.drain(grace).await;

        if self.live_count() > 0 {
            tracing::warn!(
                remaining = self.live_count(),
                "Grace period expired, killing remaining workers"
            );
            self.signal_live(Signal::SIGKILL);
            self.drain(Duration::from_secs(5)).await;
        }

        // Clean shutdown removes the pid file.
        self.pidfile = None;
        tracing::info!("Shutdown complete");
    }

    /// Replace the supervisor process image in place, preserving the bound
    /// listening socket. Current workers keep serving until the replacement
    /// pool is ready, then get retired by the new image.
    pub fn reexec(&mut self) -> Result<(), ReexecError> {
        self.hooks.run_pre_exec();

        let exe = std::env::current_exe()?;
        let exe_c = CString::new(exe.into_os_string().into_vec())
            .map_err(|_| ReexecError::BadArgument)?;
        let mut argv = vec![exe_c.clone()];
        for arg in std::env::args_os().skip(1) {
            argv.push(CString::new(arg.into_vec()).map_err(|_| ReexecError::BadArgument)?);
        }

        let predecessors = self
            .workers
            .values()
            .filter(|w| w.is_live())
            .map(|w| w.pid().as_raw().to_string())
            .collect::<Vec<_>>()
            .join(",");

        self.socket.clear_cloexec().map_err(ReexecError::Fd)?;
        std::env::set_var(LISTEN_FD_ENV, self.socket.raw_fd().to_string());
        std::env::set_var(PREDECESSOR_ENV, &predecessors);

        // On success this never returns; no destructor runs, so the pid file
        // stays on disk for the replacement image (same pid) to overwrite.
        let err = nix::unistd::execv(&exe_c, &argv).unwrap_err();

        std::env::remove_var(LISTEN_FD_ENV);
        std::env::remove_var(PREDECESSOR_ENV);
        let _ = self.socket.set_cloexec();
        Err(ReexecError::Exec(err))
    }

    fn spawn_one(&mut self) -> io::Result<()> {
        let id = self.next_id;
        self.next_id += 1;

        let spawned = spawn::spawn_worker(&self.config, &self.socket, &self.identity, id)?;
        tracing::info!(worker_id = id, pid = spawned.pid.as_raw(), "Worker spawned");

        self.workers.insert(id, WorkerHandle::new(id, spawned.pid));
        tokio::spawn(worker_channel(id, spawned.child, spawned.status, self.tx.clone()));
        Ok(())
    }

    async fn wait_until_ready(&mut self) -> Result<(), StartupError> {
        let grace = self.config.timeout_duration();
        let deadline = Instant::now() + grace;

        while self.initialized_count() < self.target {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.signal_live(Signal::SIGKILL);
                return Err(StartupError::Timeout {
                    ready: self.initialized_count(),
                    expected: self.target,
                    grace,
                });
            }

            match tokio::time::timeout(remaining, self.rx.recv()).await {
                Err(_) | Ok(None) => continue,
                Ok(Some(Event::Message { id, message })) => self.apply_message(id, message),
                Ok(Some(Event::Exited { id, status })) => {
                    let detail = describe_exit(status);
                    self.signal_live(Signal::SIGKILL);
                    return Err(StartupError::WorkerFailed { id, detail });
                }
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Message { id, message } => self.apply_message(id, message),
            Event::Exited { id, status } => {
                let Some(worker) = self.workers.get_mut(&id) else { return };
                let was_timed_out = worker.state() == WorkerState::TimedOut;
                let was_retiring = worker.is_retiring();
                worker.mark_exited();
                let detail = describe_exit(status);

                if self.stopping || was_retiring {
                    tracing::info!(worker_id = id, exit = %detail, "Worker exited");
                } else if was_timed_out {
                    tracing::info!(worker_id = id, exit = %detail, "Timed out worker reaped");
                } else {
                    tracing::warn!(worker_id = id, exit = %detail, "Worker exited unexpectedly");
                }

                self.workers.remove(&id);
                self.maintain();
            }
        }
    }

    fn apply_message(&mut self, id: usize, message: WorkerMessage) {
        let Some(worker) = self.workers.get_mut(&id) else { return };
        let before = worker.state();
        worker.apply_message(message);
        if before == WorkerState::Starting && worker.state() == WorkerState::Ready {
            tracing::info!(worker_id = id, pid = worker.pid().as_raw(), "Worker ready");
        }
    }

    /// Converge the live pool onto the target count.
    fn maintain(&mut self) {
        if self.stopping {
            return;
        }

        while self.active_count() < self.target {
            if let Err(e) = self.spawn_one() {
                tracing::error!(error = %e, "Worker respawn failed");
                break;
            }
        }

        while self.active_count() > self.target {
            let newest = self
                .workers
                .values()
                .filter(|w| w.is_live() && !w.is_retiring())
                .max_by_key(|w| w.spawned_at())
                .map(|w| w.id());
            let Some(id) = newest else { break };
            if let Some(worker) = self.workers.get_mut(&id) {
                tracing::info!(worker_id = id, "Scaling down, retiring worker");
                if let Err(e) = worker.signal(Signal::SIGTERM) {
                    tracing::warn!(worker_id = id, error = %e, "Retire signal failed");
                }
                worker.mark_retiring();
            }
        }
    }

    /// Recycle workers that have been silent past the configured timeout.
    fn enforce_timeouts(&mut self) {
        let timeout = self.config.timeout_duration();

        for worker in self.workers.values_mut() {
            let silent_for = worker.heartbeat_age();
            let over = silent_for > timeout;
            match worker.state() {
                WorkerState::Ready | WorkerState::Busy if over => {
                    tracing::error!(
                        worker_id = worker.id(),
                        pid = worker.pid().as_raw(),
                        silent_for_secs = silent_for.as_secs(),
                        "Worker timed out, recycling"
                    );
                    worker.mark_timed_out();
                    if let Err(e) = worker.signal(Signal::SIGKILL) {
                        tracing::warn!(worker_id = worker.id(), error = %e, "Kill failed");
                    }
                }
                WorkerState::Starting if over => {
                    tracing::error!(
                        worker_id = worker.id(),
                        pid = worker.pid().as_raw(),
                        "Worker failed to become ready, recycling"
                    );
                    worker.mark_timed_out();
                    if let Err(e) = worker.signal(Signal::SIGKILL) {
                        tracing::warn!(worker_id = worker.id(), error = %e, "Kill failed");
                    }
                }
                _ => {}
            }
        }
    }

    /// Adjust the target worker count (SIGTTIN/SIGTTOU). Never below one.
    fn scale(&mut self, delta: i64) {
        let new_target = if delta >= 0 {
            self.target.saturating_add(delta as usize)
        } else {
            self.target.saturating_sub(delta.unsigned_abs() as usize).max(1)
        };

        if new_target != self.target {
            tracing::info!(from = self.target, to = new_target, "Scaling worker pool");
            self.target = new_target;
            self.maintain();
        }
    }

    async fn drain(&mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while self.live_count() > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            match tokio::time::timeout(remaining, self.rx.recv()).await {
                Ok(Some(event)) => self.handle_event(event),
                Err(_) | Ok(None) => return,
            }
        }
    }

    fn signal_live(&self, sig: Signal) {
        for worker in self.workers.values().filter(|w| w.is_live()) {
            if let Err(e) = worker.signal(sig) {
                tracing::debug!(worker_id = worker.id(), error = %e, "Signal failed");
            }
        }
    }

    /// Retire the previous process image's workers once this pool serves.
    fn retire_predecessors(&self) {
        let Ok(list) = std::env::var(PREDECESSOR_ENV) else { return };
        std::env::remove_var(PREDECESSOR_ENV);

        let pids: Vec<Pid> = list
            .split(',')
            .filter_map(|s| s.trim().parse::<i32>().ok())
            .map(Pid::from_raw)
            .collect();
        if pids.is_empty() {
            return;
        }

        tracing::info!(count = pids.len(), "Retiring predecessor workers");
        for &pid in &pids {
            if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
                tracing::debug!(pid = pid.as_raw(), error = %e, "Predecessor already gone");
            }
        }

        // The predecessors are still this process's children (exec keeps the
        // pid); reap them off the async path once they finish draining.
        tokio::task::spawn_blocking(move || {
            for pid in pids {
                let _ = nix::sys::wait::waitpid(pid, None);
            }
        });
    }

    fn live_count(&self) -> usize {
        self.workers.values().filter(|w| w.is_live()).count()
    }

    fn active_count(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.is_live() && !w.is_retiring())
            .count()
    }

    fn initialized_count(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.is_live() && w.state() != WorkerState::Starting)
            .count()
    }
}

/// Per-worker channel task: forward status lines, then report the exit.
async fn worker_channel(
    id: usize,
    mut child: Child,
    status: tokio::net::UnixStream,
    tx: mpsc::UnboundedSender<Event>,
) {
    let mut lines = BufReader::new(status).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match WorkerMessage::parse_line(&line) {
            Ok(message) => {
                if tx.send(Event::Message { id, message }).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(worker_id = id, error = %e, "Unparseable worker status line");
            }
        }
    }

    let status = child.wait().await.ok();
    let _ = tx.send(Event::Exited { id, status });
}

//! Worker handles and per-worker state machine.
//!
//! # State machine
//! ```text
//! Starting → Ready ⇄ Busy → Exited
//! Ready|Busy → TimedOut → Exited      (forced recycle)
//! Ready|Busy → Exited                 (crash or signal)
//! ```
//! `Starting` is the initial state, `Exited` the only terminal one. The
//! supervisor is the sole writer; workers only report events.

use std::process::ExitStatus;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use super::protocol::WorkerMessage;

/// Lifecycle state of one worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, not yet accepting.
    Starting,
    /// Accepting, no connection in flight.
    Ready,
    /// Serving at least one connection.
    Busy,
    /// Marked for forced recycle; kill signal sent, reap pending.
    TimedOut,
    /// Reaped. Terminal.
    Exited,
}

impl WorkerState {
    /// Whether the process still counts against the pool.
    pub fn is_live(self) -> bool {
        self != WorkerState::Exited
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::Starting => "starting",
            WorkerState::Ready => "ready",
            WorkerState::Busy => "busy",
            WorkerState::TimedOut => "timed_out",
            WorkerState::Exited => "exited",
        };
        write!(f, "{}", name)
    }
}

/// Supervisor-side record of one worker process.
#[derive(Debug)]
pub struct WorkerHandle {
    id: usize,
    pid: Pid,
    spawned_at: Instant,
    last_heartbeat: Instant,
    state: WorkerState,
    retiring: bool,
}

impl WorkerHandle {
    pub fn new(id: usize, pid: Pid) -> Self {
        let now = Instant::now();
        Self {
            id,
            pid,
            spawned_at: now,
            last_heartbeat: now,
            state: WorkerState::Starting,
            retiring: false,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn spawned_at(&self) -> Instant {
        self.spawned_at
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    /// Whether this worker was asked to drain for scale-down.
    pub fn is_retiring(&self) -> bool {
        self.retiring
    }

    pub fn mark_retiring(&mut self) {
        self.retiring = true;
    }

    /// Time since the worker last proved liveness.
    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.elapsed()
    }

    /// Fold one status report into the state machine.
    ///
    /// Every report counts as a heartbeat. Reports that do not match a legal
    /// transition (e.g. anything after the kill signal was already sent) are
    /// dropped.
    pub fn apply_message(&mut self, message: WorkerMessage) {
        self.last_heartbeat = Instant::now();
        self.state = match (self.state, message) {
            (WorkerState::Starting, WorkerMessage::Ready) => WorkerState::Ready,
            (WorkerState::Ready, WorkerMessage::Busy) => WorkerState::Busy,
            (WorkerState::Busy, WorkerMessage::Idle) => WorkerState::Ready,
            (state, _) => state,
        };
    }

    /// Transition into `TimedOut` ahead of the kill signal.
    pub fn mark_timed_out(&mut self) {
        if self.state.is_live() {
            self.state = WorkerState::TimedOut;
        }
    }

    /// Terminal transition once the process has been reaped.
    pub fn mark_exited(&mut self) {
        self.state = WorkerState::Exited;
    }

    /// Send a signal to the worker process.
    pub fn signal(&self, signal: Signal) -> nix::Result<()> {
        signal::kill(self.pid, signal)
    }
}

/// Human-readable exit description for log records.
pub fn describe_exit(status: Option<ExitStatus>) -> String {
    use std::os::unix::process::ExitStatusExt;

    match status {
        None => "unknown".to_string(),
        Some(status) => match (status.code(), status.signal()) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(sig)) => format!("signal {}", sig),
            _ => "unknown".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> WorkerHandle {
        WorkerHandle::new(0, Pid::from_raw(1))
    }

    #[test]
    fn boot_transition() {
        let mut worker = handle();
        assert_eq!(worker.state(), WorkerState::Starting);

        worker.apply_message(WorkerMessage::Ready);
        assert_eq!(worker.state(), WorkerState::Ready);
    }

    #[test]
    fn ready_and_busy_alternate() {
        let mut worker = handle();
        worker.apply_message(WorkerMessage::Ready);
        worker.apply_message(WorkerMessage::Busy);
        assert_eq!(worker.state(), WorkerState::Busy);
        worker.apply_message(WorkerMessage::Idle);
        assert_eq!(worker.state(), WorkerState::Ready);
    }

    #[test]
    fn heartbeat_refreshes_without_state_change() {
        let mut worker = handle();
        worker.apply_message(WorkerMessage::Ready);
        let before = worker.heartbeat_age();
        worker.apply_message(WorkerMessage::Heartbeat);
        assert_eq!(worker.state(), WorkerState::Ready);
        assert!(worker.heartbeat_age() <= before);
    }

    #[test]
    fn illegal_transitions_are_dropped() {
        let mut worker = handle();
        // Busy before Ready makes no sense; the worker stays Starting.
        worker.apply_message(WorkerMessage::Busy);
        assert_eq!(worker.state(), WorkerState::Starting);
    }

    #[test]
    fn timed_out_is_sticky_until_exit() {
        let mut worker = handle();
        worker.apply_message(WorkerMessage::Ready);
        worker.mark_timed_out();
        assert_eq!(worker.state(), WorkerState::TimedOut);

        // A late message from the doomed worker must not resurrect it.
        worker.apply_message(WorkerMessage::Idle);
        assert_eq!(worker.state(), WorkerState::TimedOut);

        worker.mark_exited();
        assert_eq!(worker.state(), WorkerState::Exited);
        assert!(!worker.is_live());
    }

    #[test]
    fn exited_is_terminal() {
        let mut worker = handle();
        worker.mark_exited();
        worker.mark_timed_out();
        assert_eq!(worker.state(), WorkerState::Exited);
    }

    #[test]
    fn describe_exit_reports_code_and_signal() {
        use std::process::Command;

        let status = Command::new("sh").arg("-c").arg("exit 3").status().unwrap();
        assert_eq!(describe_exit(Some(status)), "exit code 3");

        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGKILL).unwrap();
        let status = child.wait().unwrap();
        assert_eq!(describe_exit(Some(status)), "signal 9");

        assert_eq!(describe_exit(None), "unknown");
    }
}

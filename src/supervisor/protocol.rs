//! Worker status protocol.
//!
//! Each worker inherits one end of a socketpair and writes JSON lines on it:
//! `ready` once after boot, `heartbeat` while alive, `busy`/`idle` around
//! connection handling. The supervisor derives both the per-worker state
//! machine and timeout enforcement from this stream; EOF means the worker is
//! gone.

use std::io;
use std::os::fd::RawFd;
use std::os::unix::io::FromRawFd;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

/// Environment variable carrying the status descriptor number.
pub const STATUS_FD_ENV: &str = "PREFORK_STATUS_FD";

/// Environment variable carrying the worker's slot number. Its presence is
/// what marks a process as running in the worker role.
pub const WORKER_ID_ENV: &str = "PREFORK_WORKER_ID";

/// Environment variable carrying the resolved configuration as JSON.
pub const CONFIG_ENV: &str = "PREFORK_CONFIG";

/// One status report from a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Boot finished; the worker is accepting.
    Ready,
    /// Periodic liveness proof.
    Heartbeat,
    /// At least one connection is being served.
    Busy,
    /// All connections finished; back to accepting only.
    Idle,
}

impl WorkerMessage {
    pub fn to_line(self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self)
    }

    pub fn parse_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Worker-side writer for the status channel.
pub struct StatusPipe {
    stream: UnixStream,
}

impl StatusPipe {
    /// Adopt the descriptor advertised in the environment.
    pub fn from_env() -> io::Result<Self> {
        let value = std::env::var(STATUS_FD_ENV).map_err(|_| {
            io::Error::new(io::ErrorKind::NotFound, "status descriptor not in environment")
        })?;
        let fd: RawFd = value.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("bad status fd number '{}'", value),
            )
        })?;

        let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
        stream.set_nonblocking(true)?;
        Ok(Self { stream: UnixStream::from_std(stream)? })
    }

    /// Send one status report.
    pub async fn send(&mut self, message: WorkerMessage) -> io::Result<()> {
        let mut line = message.to_line()?;
        line.push('\n');
        self.stream.write_all(line.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_stable() {
        assert_eq!(WorkerMessage::Ready.to_line().unwrap(), r#"{"event":"ready"}"#);
        assert_eq!(
            WorkerMessage::parse_line(r#"{"event":"heartbeat"}"#).unwrap(),
            WorkerMessage::Heartbeat
        );
    }

    #[test]
    fn garbage_lines_are_rejected() {
        assert!(WorkerMessage::parse_line("not json").is_err());
        assert!(WorkerMessage::parse_line(r#"{"event":"reboot"}"#).is_err());
    }
}

//! Worker subprocess spawning.
//!
//! Workers are started by re-executing the server binary with role markers in
//! the environment, rather than bare fork: the child gets a clean address
//! space and the exact configuration the supervisor resolved, serialized into
//! its environment. The listening socket and the status channel ride across
//! the exec on fixed descriptor slots.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::process::Stdio;

use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::stat::Mode;
use nix::unistd::{dup2, Gid, Group, Pid, Uid, User};
use tokio::process::{Child, Command};

use super::protocol::{CONFIG_ENV, STATUS_FD_ENV, WORKER_ID_ENV};
use crate::config::ServerConfig;
use crate::net::{BoundSocket, LISTEN_FD_ENV};

/// Descriptor slot the listener occupies in a worker.
pub const LISTEN_FD_SLOT: RawFd = 3;

/// Descriptor slot the status channel occupies in a worker.
pub const STATUS_FD_SLOT: RawFd = 4;

/// Resolved uid/gid to apply to workers, looked up once at startup so a bad
/// name fails the whole start instead of every individual spawn.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessIdentity {
    pub uid: Option<Uid>,
    pub gid: Option<Gid>,
}

impl ProcessIdentity {
    pub fn resolve(user: Option<&str>, group: Option<&str>) -> io::Result<Self> {
        let uid = match user {
            Some(name) => {
                let entry = User::from_name(name)
                    .map_err(io::Error::from)?
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("user '{}' not found", name),
                        )
                    })?;
                Some(entry.uid)
            }
            None => None,
        };
        let gid = match group {
            Some(name) => {
                let entry = Group::from_name(name)
                    .map_err(io::Error::from)?
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("group '{}' not found", name),
                        )
                    })?;
                Some(entry.gid)
            }
            None => None,
        };
        Ok(Self { uid, gid })
    }
}

/// A freshly spawned worker and the supervisor-side ends of its plumbing.
pub struct SpawnedWorker {
    pub child: Child,
    pub pid: Pid,
    pub status: tokio::net::UnixStream,
}

/// Spawn one worker process.
pub fn spawn_worker(
    config: &ServerConfig,
    socket: &BoundSocket,
    identity: &ProcessIdentity,
    worker_id: usize,
) -> io::Result<SpawnedWorker> {
    let exe = std::env::current_exe()?;

    let (parent_end, child_end) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(io::Error::from)?;

    let mut cmd = Command::new(exe);
    cmd.env(CONFIG_ENV, serde_json::to_string(config)?)
        .env(WORKER_ID_ENV, worker_id.to_string())
        .env(LISTEN_FD_ENV, LISTEN_FD_SLOT.to_string())
        .env(STATUS_FD_ENV, STATUS_FD_SLOT.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    for entry in &config.raw_env {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }

    if let Some(uid) = identity.uid {
        cmd.uid(uid.as_raw());
    }
    if let Some(gid) = identity.gid {
        cmd.gid(gid.as_raw());
    }

    let listen_fd = socket.raw_fd();
    let status_fd = child_end.as_raw_fd();
    let umask_bits = config.umask;

    // Runs in the child between fork and exec; only async-signal-safe calls.
    unsafe {
        cmd.pre_exec(move || {
            // Stage both descriptors above the slot range first so neither
            // dup2 can clobber the other's source.
            let listen_tmp = fcntl(listen_fd, FcntlArg::F_DUPFD_CLOEXEC(10))?;
            let status_tmp = fcntl(status_fd, FcntlArg::F_DUPFD_CLOEXEC(10))?;
            // dup2 clears close-on-exec on the slot copies.
            dup2(listen_tmp, LISTEN_FD_SLOT)?;
            dup2(status_tmp, STATUS_FD_SLOT)?;
            nix::sys::stat::umask(Mode::from_bits_truncate(umask_bits as nix::libc::mode_t));
            Ok(())
        });
    }

    let child = cmd.spawn()?;
    drop(child_end);

    let pid = child
        .id()
        .map(|id| Pid::from_raw(id as i32))
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "spawned worker has no pid"))?;

    let parent_stream = std::os::unix::net::UnixStream::from(parent_end);
    parent_stream.set_nonblocking(true)?;
    let status = tokio::net::UnixStream::from_std(parent_stream)?;

    Ok(SpawnedWorker { child, pid, status })
}

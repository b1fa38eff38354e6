//! Listening socket creation and inheritance.
//!
//! # Responsibilities
//! - Bind the configured address with SO_REUSEADDR and the configured backlog
//! - Keep the socket open in the supervisor for the lifetime of the pool
//! - Export the descriptor to workers (and across reexec) via the environment
//!
//! The supervisor never accepts on the socket itself; workers inherit the
//! descriptor and all call accept on it concurrently, letting the kernel
//! serialize the results.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::io::FromRawFd;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, SockaddrStorage};

/// Environment variable carrying an inherited listener descriptor number.
pub const LISTEN_FD_ENV: &str = "PREFORK_LISTEN_FD";

/// Error type for socket setup.
#[derive(Debug)]
pub enum BindError {
    /// The configured bind address did not parse.
    Parse(std::net::AddrParseError),
    /// A socket syscall failed (create, bind, listen).
    Os(nix::errno::Errno),
    /// Descriptor bookkeeping failed.
    Io(std::io::Error),
    /// The inherited-descriptor environment variable was absent or malformed.
    Inherit(String),
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindError::Parse(e) => write!(f, "Failed to parse bind address: {}", e),
            BindError::Os(e) => write!(f, "Failed to bind: {}", e),
            BindError::Io(e) => write!(f, "Failed to bind: {}", e),
            BindError::Inherit(detail) => {
                write!(f, "Failed to inherit listener descriptor: {}", detail)
            }
        }
    }
}

impl std::error::Error for BindError {}

/// A bound, listening TCP socket.
///
/// Held blocking in the supervisor; converted into a Tokio listener only
/// inside worker processes.
#[derive(Debug)]
pub struct BoundSocket {
    inner: std::net::TcpListener,
    addr: SocketAddr,
}

impl BoundSocket {
    /// Create, bind and listen on `addr_str` with the given backlog.
    ///
    /// The descriptor is created close-on-exec; worker spawn clears the flag
    /// on its duplicated copy only.
    pub fn bind(addr_str: &str, backlog: i32) -> Result<Self, BindError> {
        let addr: SocketAddr = addr_str.parse().map_err(BindError::Parse)?;

        let family = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };

        let fd = socket::socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
            .map_err(BindError::Os)?;
        socket::setsockopt(&fd, socket::sockopt::ReuseAddr, &true).map_err(BindError::Os)?;
        socket::bind(fd.as_raw_fd(), &SockaddrStorage::from(addr)).map_err(BindError::Os)?;

        // listen(2) silently caps the queue at net.core.somaxconn; nix
        // additionally rejects values above its compile-time maximum, so
        // out-of-range configs degrade to that maximum instead of failing.
        let backlog = Backlog::new(backlog).unwrap_or(Backlog::MAXCONN);
        socket::listen(&fd, backlog).map_err(BindError::Os)?;

        let inner = std::net::TcpListener::from(fd);
        let addr = inner.local_addr().map_err(BindError::Io)?;

        tracing::info!(address = %addr, "Listener bound");

        Ok(Self { inner, addr })
    }

    /// Rebuild the socket from a descriptor inherited over spawn or exec.
    pub fn from_inherited(fd: RawFd) -> Result<Self, BindError> {
        let inner = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        let addr = inner.local_addr().map_err(BindError::Io)?;
        Ok(Self { inner, addr })
    }

    /// Rebuild the socket from the descriptor number advertised in the
    /// environment, if any.
    pub fn from_env() -> Result<Option<Self>, BindError> {
        match std::env::var(LISTEN_FD_ENV) {
            Err(_) => Ok(None),
            Ok(value) => {
                let fd: RawFd = value
                    .parse()
                    .map_err(|_| BindError::Inherit(format!("bad fd number '{}'", value)))?;
                Self::from_inherited(fd).map(Some)
            }
        }
    }

    /// The address the socket is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The raw descriptor, for duplication into worker processes.
    pub fn raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    /// Clear close-on-exec so the descriptor survives `reexec`.
    pub fn clear_cloexec(&self) -> Result<(), nix::errno::Errno> {
        fcntl(self.inner.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty())).map(|_| ())
    }

    /// Restore close-on-exec after a failed `reexec`.
    pub fn set_cloexec(&self) -> Result<(), nix::errno::Errno> {
        fcntl(self.inner.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map(|_| ())
    }

    /// Convert into an async listener for a worker's accept loop.
    pub fn into_tokio(self) -> std::io::Result<tokio::net::TcpListener> {
        self.inner.set_nonblocking(true)?;
        tokio::net::TcpListener::from_std(self.inner)
    }
}

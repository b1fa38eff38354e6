//! Process lifecycle utilities.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Signal received → broadcast stop mode → accept loops drain → exit
//!
//! Pid file (pidfile.rs):
//!     Startup → overwrite file with supervisor pid → removed on clean exit
//! ```

pub mod pidfile;
pub mod shutdown;

pub use pidfile::PidFile;
pub use shutdown::{Shutdown, StopMode};

/// Set the process title for operational visibility (`ps`, `top`).
///
/// The kernel truncates titles to 15 bytes. Best-effort: failures are ignored.
#[cfg(target_os = "linux")]
pub fn set_process_title(title: &str) {
    if let Ok(name) = std::ffi::CString::new(title) {
        let _ = nix::sys::prctl::set_name(&name);
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_process_title(_title: &str) {}

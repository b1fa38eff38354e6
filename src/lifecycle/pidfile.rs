//! Supervisor pid file handling.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A written pid file, removed again on drop.
///
/// The file is overwritten unconditionally at startup; a stale file from a
/// crashed previous run must not block a restart.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current process id to `path`.
    pub fn write(path: &Path) -> io::Result<Self> {
        fs::write(path, format!("{}\n", std::process::id()))?;
        tracing::debug!(path = %path.display(), pid = std::process::id(), "Pid file written");
        Ok(Self { path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %e, "Pid file removal failed");
        }
    }
}

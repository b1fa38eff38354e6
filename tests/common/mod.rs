//! Shared utilities for end-to-end server tests.
//!
//! Each test drives the real server binary (supervisor role) with a config
//! file in a scratch directory, then talks to it over HTTP or signals.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// Path to the built server binary.
pub fn server_bin() -> &'static str {
    env!("CARGO_BIN_EXE_prefork-server")
}

/// A running supervisor process plus its scratch directory.
pub struct TestServer {
    pub child: Child,
    pub addr: String,
    pub dir: tempfile::TempDir,
}

impl TestServer {
    /// Write a config file and start the supervisor.
    ///
    /// `extra` is appended to a base config binding `127.0.0.1:port` with a
    /// pid file in the scratch directory; any `{dir}` placeholder in it is
    /// replaced with the scratch directory path.
    pub fn spawn(port: u16, extra: &str) -> Self {
        let dir = tempfile::tempdir().expect("scratch dir");
        let addr = format!("127.0.0.1:{}", port);
        let extra = extra.replace("{dir}", &dir.path().display().to_string());
        let config = format!(
            "bind = \"{}\"\npidfile = \"{}\"\n{}",
            addr,
            dir.path().join("server.pid").display(),
            extra,
        );
        let config_path = dir.path().join("server.toml");
        std::fs::write(&config_path, config).expect("write config");

        let child = Command::new(server_bin())
            .arg("--config")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn server");

        Self { child, addr, dir }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn pidfile(&self) -> PathBuf {
        self.dir.path().join("server.pid")
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn signal(&self, signal: Signal) {
        let _ = signal::kill(Pid::from_raw(self.pid() as i32), signal);
    }

    /// Block until the supervisor exits, or kill it after `timeout`.
    pub fn wait_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        false
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        // Graceful first, so workers go down with the supervisor.
        self.signal(Signal::SIGTERM);
        if !self.wait_exit(Duration::from_secs(10)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Wait until an HTTP GET on `url` succeeds, up to `timeout`.
pub async fn wait_until_serving(url: &str, timeout: Duration) -> bool {
    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap();
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(res) = client.get(url).send().await {
            if res.status().is_success() {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Poll `predicate` until it holds, up to `timeout`.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, predicate: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    predicate()
}

/// Direct children of `parent`, from /proc. These are the worker processes.
#[cfg(target_os = "linux")]
pub fn worker_pids(parent: u32) -> Vec<u32> {
    let parent = parent.to_string();
    let mut pids = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return pids;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            continue;
        };
        // The command name can contain spaces; fields resume after ')'.
        let Some((_, rest)) = stat.rsplit_once(')') else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.get(1).copied() == Some(parent.as_str()) {
            pids.push(pid);
        }
    }
    pids
}

/// Build a client that neither pools nor proxies, for deterministic tests.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

/// Read a file to a string, empty if missing.
pub fn read_or_empty(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

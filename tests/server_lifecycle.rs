//! End-to-end lifecycle tests: startup, serving, logging, shutdown.

use std::process::Command;
use std::time::Duration;

use nix::sys::signal::Signal;

mod common;
use common::{eventually, http_client, read_or_empty, wait_until_serving, TestServer};

#[tokio::test]
async fn serves_health_endpoint_with_sync_workers() {
    let server = TestServer::spawn(29101, "workers = 2\n");
    assert!(
        wait_until_serving(&server.url("/health"), Duration::from_secs(15)).await,
        "server never became ready"
    );

    let res = http_client().get(server.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "OK\n");

    let res = http_client().get(server.url("/nope")).send().await.unwrap();
    assert_eq!(res.status(), 404);
}

#[tokio::test]
async fn serves_with_pool_worker_class() {
    let server = TestServer::spawn(
        29102,
        "workers = 2\nworker_class = \"pool\"\nworker_connections = 64\n",
    );
    assert!(wait_until_serving(&server.url("/health"), Duration::from_secs(15)).await);

    // A handful of concurrent requests against the same pool.
    let client = http_client();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        let url = server.url("/health");
        handles.push(tokio::spawn(async move {
            client.get(url).send().await.unwrap().status().as_u16()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), 200);
    }
}

#[tokio::test]
async fn pidfile_written_on_start_and_removed_on_graceful_shutdown() {
    let mut server = TestServer::spawn(29103, "workers = 1\n");
    assert!(wait_until_serving(&server.url("/health"), Duration::from_secs(15)).await);

    let content = read_or_empty(&server.pidfile());
    assert_eq!(content.trim().parse::<u32>().unwrap(), server.pid());

    server.signal(Signal::SIGTERM);
    assert!(server.wait_exit(Duration::from_secs(15)), "no exit after SIGTERM");
    assert!(!server.pidfile().exists(), "pid file survived clean shutdown");

    // The listener is gone with the supervisor: no new connections.
    assert!(tokio::net::TcpStream::connect(&server.addr).await.is_err());
}

#[tokio::test]
async fn access_log_line_matches_template() {
    let server = TestServer::spawn(
        29104,
        "workers = 1\naccesslog = \"{dir}/access.log\"\n",
    );
    assert!(wait_until_serving(&server.url("/health"), Duration::from_secs(15)).await);

    let _ = http_client()
        .get(server.url("/health"))
        .header("User-Agent", "lifecycle-test/1.0")
        .send()
        .await
        .unwrap();

    let log_path = server.dir.path().join("access.log");
    assert!(
        eventually(Duration::from_secs(5), || {
            read_or_empty(&log_path).contains("GET /health")
        })
        .await,
        "no access record appeared"
    );

    let content = read_or_empty(&log_path);
    let line = content
        .lines()
        .find(|l| l.contains("lifecycle-test/1.0"))
        .expect("tagged request line");

    // %(h)s %(l)s %(u)s %(t)s "%(r)s" %(s)s %(b)s "%(f)s" "%(a)s" %(D)s
    assert!(line.starts_with("127.0.0.1 - - ["), "host/ident/user: {}", line);
    assert!(line.contains("\"GET /health HTTP/1.1\" 200 3"), "request/status/bytes: {}", line);
    assert!(line.contains("\"-\" \"lifecycle-test/1.0\""), "referrer/agent: {}", line);
}

#[test]
fn check_config_accepts_valid_and_rejects_invalid() {
    let dir = tempfile::tempdir().unwrap();

    let good = dir.path().join("good.toml");
    std::fs::write(&good, "bind = \"127.0.0.1:29105\"\nworkers = 1\n").unwrap();
    let output = Command::new(common::server_bin())
        .args(["--config"])
        .arg(&good)
        .arg("--check-config")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("configuration OK"));

    let bad = dir.path().join("bad.toml");
    std::fs::write(&bad, "bind = \"nowhere\"\ntimeout = 0\n").unwrap();
    let output = Command::new(common::server_bin())
        .args(["--config"])
        .arg(&bad)
        .arg("--check-config")
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn cli_overrides_beat_the_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.toml");
    std::fs::write(&path, "bind = \"127.0.0.1:1\"\n").unwrap();

    // The override replaces an address that would fail validation kept as-is.
    let output = Command::new(common::server_bin())
        .args(["--config"])
        .arg(&path)
        .args(["--bind", "not-an-address", "--check-config"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("bind address"));
}

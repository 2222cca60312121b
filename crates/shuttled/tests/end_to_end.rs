//! End-to-end delivery through mission control.
//!
//! A local route's directory is watched; writing a file there must produce
//! one multipart POST at the stub endpoint, delete the source file, and
//! leave the shuttle log empty.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use shuttle_core::ConfigOverrides;
use shuttled::{MissionControl, MissionOptions};

const CERT_PEM: &str = include_str!("../../../testdata/cert.pem");
const KEY_PEM: &str = include_str!("../../../testdata/key.pem");
const HOST_KEY: &str = include_str!("../../../testdata/ssh_host_key");

/// Accepts one connection, reads one full HTTP request, answers with the
/// given status, and hands the raw request back.
async fn stub_endpoint(status_line: &'static str) -> (String, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("http://{}/ingest", listener.local_addr().unwrap());
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 8192];

        let (body_start, body_len) = loop {
            let n = stream.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            if let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&request[..end]);
                let length = headers
                    .lines()
                    .find_map(|l| {
                        l.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().to_string())
                    })
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(0);
                break (end + 4, length);
            }
        };

        while request.len() < body_start + body_len {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }

        let response = format!("{status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.ok();

        let _ = tx.send(request);
    });

    (endpoint, rx)
}

fn write_config(dir: &Path, base: &Path, endpoint: &str) -> std::path::PathBuf {
    let document = serde_json::json!({
        "base": base,
        "routes": [{
            "username": "alice",
            "password": bcrypt::hash("hunter2", 4).unwrap(),
            "endpoint": endpoint,
            "local": true
        }],
        "private_key": HOST_KEY,
        "certificate_public": CERT_PEM,
        "certificate_private": KEY_PEM
    });

    let path = dir.join("config.json");
    std::fs::write(&path, document.to_string()).unwrap();
    path
}

fn options(dir: &Path, config: std::path::PathBuf) -> MissionOptions {
    MissionOptions {
        config,
        shuttles: dir.join("shuttles.bin"),
        retry: Duration::from_secs(1),
        workers: 2,
        overrides: ConfigOverrides::default(),
        ftp_host: "127.0.0.1".into(),
        ftp_port: 0,
        sftp_host: "127.0.0.1".into(),
        sftp_port: 0,
        web_host: "127.0.0.1".into(),
        web_port: 0,
        web_insecure_port: 0,
        web_allow_insecure: false,
    }
}

async fn wait_until(what: &str, mut probe: impl FnMut() -> bool) {
    for _ in 0..100 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn local_write_is_delivered_and_removed() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("data");
    std::fs::create_dir_all(base.join("alice")).unwrap();

    let (endpoint, request_rx) = stub_endpoint("HTTP/1.1 200 OK").await;
    let config = write_config(dir.path(), &base, &endpoint);

    let mut mission = MissionControl::new(options(dir.path(), config)).unwrap();
    mission.start().await.unwrap();

    // The watched directory gets a file; close-write starts the flow.
    let payload = base.join("alice/hello.txt");
    std::fs::write(&payload, b"hello, world!").unwrap();

    // The endpoint sees exactly the contracted multipart POST.
    let request = tokio::time::timeout(Duration::from_secs(5), request_rx)
        .await
        .expect("endpoint never received the upload")
        .unwrap();
    let text = String::from_utf8_lossy(&request);
    assert!(text.starts_with("POST /ingest HTTP/1.1\r\n"), "request: {text}");
    assert!(text.contains("name=\"payload\"; filename=\"hello.txt\""));
    assert!(text.contains("hello, world!"));
    assert!(text.contains("name=\"username\""));
    assert!(text.contains("alice"));

    // Delivered: the source file goes away and nothing is tracked.
    wait_until("payload removal", || !payload.exists()).await;

    mission.stop().await;
    assert!(mission.launchpad().tracked().await.is_empty());
    // The rewritten-on-remove log ends empty too.
    assert!(std::fs::read(dir.path().join("shuttles.bin")).unwrap().len() <= 9);
}

#[tokio::test]
async fn rejected_upload_is_parked_in_failed() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("data");
    std::fs::create_dir_all(base.join("alice")).unwrap();

    let (endpoint, request_rx) = stub_endpoint("HTTP/1.1 400 Bad Request").await;
    let config = write_config(dir.path(), &base, &endpoint);

    let mut mission = MissionControl::new(options(dir.path(), config)).unwrap();
    mission.start().await.unwrap();

    let payload = base.join("alice/bad.txt");
    std::fs::write(&payload, b"rejected").unwrap();

    tokio::time::timeout(Duration::from_secs(5), request_rx)
        .await
        .expect("endpoint never received the upload")
        .unwrap();

    let parked = base.join("alice/failed/bad.txt");
    wait_until("payload parked in failed/", || parked.exists()).await;
    assert!(!payload.exists());

    mission.stop().await;
    assert!(mission.launchpad().tracked().await.is_empty());
}

#[tokio::test]
async fn reload_failure_keeps_the_old_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("data");
    std::fs::create_dir_all(base.join("alice")).unwrap();

    let (endpoint, _request_rx) = stub_endpoint("HTTP/1.1 200 OK").await;
    let config = write_config(dir.path(), &base, &endpoint);

    let mut mission = MissionControl::new(options(dir.path(), config.clone())).unwrap();
    mission.start().await.unwrap();

    std::fs::write(&config, b"{ not json").unwrap();
    assert!(mission.reload().await.is_err());

    mission.stop().await;
}

#[tokio::test]
async fn missing_configuration_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let result = MissionControl::new(options(dir.path(), dir.path().join("absent.json")));
    assert!(result.is_err());
}

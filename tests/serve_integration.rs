//! Purpose: End-to-end tests for the HTTP document server.
//! Exports: None (integration test module).
//! Role: Validate streamed array and single-document responses across TCP.
//! Invariants: Uses loopback-only server with a temp document directory.
//! Invariants: Bounded waits avoid test flakiness.
//! Invariants: Server processes are cleaned up on drop.

use serde_json::Value;
use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::thread::sleep;
use std::time::{Duration, Instant};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

static SERVER_LOCK: Mutex<()> = Mutex::new(());

struct TestServer {
    child: Child,
    base_url: String,
    _server_guard: MutexGuard<'static, ()>,
}

impl TestServer {
    fn start(doc_dir: &Path) -> TestResult<Self> {
        let guard = SERVER_LOCK
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let mut last_err: Option<Box<dyn std::error::Error>> = None;
        for _attempt in 0..3 {
            let port = pick_port()?;
            let bind = format!("127.0.0.1:{port}");
            let base_url = format!("http://{bind}");

            let mut child = Command::new(env!("CARGO_BIN_EXE_docstream"))
                .arg("serve")
                .arg("--dir")
                .arg(doc_dir)
                .arg("--bind")
                .arg(&bind)
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .spawn()?;

            match wait_for_server(&mut child, bind.parse()?) {
                Ok(()) => {
                    return Ok(Self {
                        child,
                        base_url,
                        _server_guard: guard,
                    });
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    last_err = Some(err);
                    sleep(Duration::from_millis(30));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| "server failed to start".into()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn docs_dir() -> TestResult<tempfile::TempDir> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("a.json"), b"\x01{\"id\":\"a\",\"n\":1}")?;
    std::fs::write(dir.path().join("b.json"), br#"{"id":"b","n":2}"#)?;
    Ok(dir)
}

#[test]
fn list_documents_streams_json_array() -> TestResult<()> {
    let dir = docs_dir()?;
    let server = TestServer::start(dir.path())?;

    let response = ureq::get(&server.url("/v0/docs")).call()?;
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("content-type"), Some("application/json"));
    let body = response.into_string()?;
    assert_eq!(body, r#"[{"id":"a","n":1},{"id":"b","n":2}]"#);

    let parsed: Value = serde_json::from_str(&body)?;
    assert_eq!(parsed[1]["n"], 2);
    Ok(())
}

#[test]
fn get_document_streams_bare_payload() -> TestResult<()> {
    let dir = docs_dir()?;
    let server = TestServer::start(dir.path())?;

    let body = ureq::get(&server.url("/v0/docs/a")).call()?.into_string()?;
    assert_eq!(body, r#"{"id":"a","n":1}"#);
    Ok(())
}

#[test]
fn missing_document_is_404_envelope() -> TestResult<()> {
    let dir = docs_dir()?;
    let server = TestServer::start(dir.path())?;

    match ureq::get(&server.url("/v0/docs/zzz")).call() {
        Err(ureq::Error::Status(code, response)) => {
            assert_eq!(code, 404);
            let value: Value = serde_json::from_str(&response.into_string()?)?;
            assert_eq!(value["error"]["kind"], "NotFound");
        }
        other => return Err(format!("expected 404, got {other:?}").into()),
    }
    Ok(())
}

#[test]
fn empty_directory_serves_empty_array() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let server = TestServer::start(dir.path())?;

    let body = ureq::get(&server.url("/v0/docs")).call()?.into_string()?;
    assert_eq!(body, "[]");

    let health: Value = serde_json::from_str(&ureq::get(&server.url("/healthz")).call()?.into_string()?)?;
    assert_eq!(health["ok"], true);
    Ok(())
}

fn pick_port() -> TestResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn wait_for_server(child: &mut Child, addr: SocketAddr) -> TestResult<()> {
    let url = format!("http://{addr}/healthz");
    let start = Instant::now();
    loop {
        if let Ok(resp) = ureq::get(&url).call() {
            if resp.status() == 200 {
                return Ok(());
            }
        }
        if let Some(status) = child.try_wait()? {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            let detail = stderr.trim();
            return Err(format!(
                "server exited before ready (status: {status}, stderr: {})",
                if detail.is_empty() { "<empty>" } else { detail }
            )
            .into());
        }
        if start.elapsed() > Duration::from_secs(8) {
            return Err("server did not start in time".into());
        }
        sleep(Duration::from_millis(20));
    }
}

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use fabric_sandbox::{
    DaemonConfig, DaemonSandbox, ExecOptions, Sandbox, SandboxError, SandboxRequest,
    SandboxStatus, TerminalOptions,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tempfile::TempDir;

struct MockSandbox {
    root: TempDir,
    polls: u32,
    fail: bool,
}

#[derive(Default)]
struct Daemon {
    sandboxes: Mutex<HashMap<String, MockSandbox>>,
    deleted: Mutex<Vec<String>>,
    failing_deletes: Mutex<u32>,
}

type Shared = Arc<Daemon>;

impl Daemon {
    fn root(&self, id: &str) -> Result<PathBuf, StatusCode> {
        self.sandboxes
            .lock()
            .get(id)
            .map(|s| s.root.path().to_path_buf())
            .ok_or(StatusCode::NOT_FOUND)
    }
}

#[derive(Deserialize)]
struct CreateBody {
    name: String,
    env: Vec<Value>,
}

async fn create(State(daemon): State<Shared>, Json(body): Json<CreateBody>) -> Json<Value> {
    assert!(body
        .env
        .iter()
        .any(|v| v["key"] == "FABRIC_WORKSPACE_ID" && v["value"] == body.name.as_str()));
    let mut sandboxes = daemon.sandboxes.lock();
    let index = sandboxes.len();
    let id = format!("sb-{index}");
    sandboxes.insert(
        id.clone(),
        MockSandbox {
            root: TempDir::new().unwrap(),
            polls: 0,
            fail: body.name == "broken",
        },
    );
    Json(json!({ "id": id, "index": index, "status": "starting" }))
}

async fn fetch(
    State(daemon): State<Shared>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<Value>, StatusCode> {
    let mut sandboxes = daemon.sandboxes.lock();
    let sandbox = sandboxes.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
    sandbox.polls += 1;
    let status = match (sandbox.fail, sandbox.polls) {
        (true, _) => "failed",
        (false, 1) => "starting",
        (false, _) => "running",
    };
    Ok(Json(json!({ "id": id, "status": status })))
}

async fn remove(State(daemon): State<Shared>, UrlPath(id): UrlPath<String>) -> StatusCode {
    {
        let mut failing = daemon.failing_deletes.lock();
        if *failing > 0 {
            *failing -= 1;
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    }
    match daemon.sandboxes.lock().remove(&id) {
        Some(_) => {
            daemon.deleted.lock().push(id);
            StatusCode::NO_CONTENT
        }
        None => StatusCode::NOT_FOUND,
    }
}

#[derive(Deserialize)]
struct ExecBody {
    command: Vec<String>,
    workdir: Option<String>,
}

/// Absolute paths that exist under the sandbox root are redirected into it.
fn remap(root: &Path, arg: &str) -> String {
    match arg.strip_prefix('/') {
        Some(rest) if !rest.is_empty() && root.join(rest).exists() => {
            root.join(rest).display().to_string()
        }
        _ => arg.to_string(),
    }
}

async fn exec(
    State(daemon): State<Shared>,
    UrlPath(id): UrlPath<String>,
    Json(body): Json<ExecBody>,
) -> Result<Json<Value>, StatusCode> {
    let root = daemon.root(&id)?;
    let argv: Vec<String> = body.command.iter().map(|a| remap(&root, a)).collect();
    let mut command = tokio::process::Command::new(&argv[0]);
    command.args(&argv[1..]).current_dir(
        body.workdir
            .map(|w| PathBuf::from(remap(&root, &w)))
            .unwrap_or(root),
    );
    let output = command
        .output()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({
        "exit_code": output.status.code().unwrap_or(-1),
        "stdout": String::from_utf8_lossy(&output.stdout),
        "stderr": String::from_utf8_lossy(&output.stderr),
    })))
}

async fn files(
    State(daemon): State<Shared>,
    UrlPath(id): UrlPath<String>,
    body: Bytes,
) -> StatusCode {
    let Ok(root) = daemon.root(&id) else {
        return StatusCode::NOT_FOUND;
    };
    match tar::Archive::new(body.as_ref()).unpack(&root) {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::BAD_REQUEST,
    }
}

async fn pty_session(
    State(daemon): State<Shared>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<Value>, StatusCode> {
    daemon.root(&id)?;
    Ok(Json(json!({ "id": "pty-1", "pid": 42 })))
}

async fn spawn_daemon() -> (SocketAddr, Shared) {
    let daemon = Shared::default();
    let app = Router::new()
        .route("/sandboxes", post(create))
        .route("/sandboxes/{id}", get(fetch).delete(remove))
        .route("/sandboxes/{id}/exec", post(exec))
        .route("/sandboxes/{id}/files", post(files))
        .route("/sandboxes/{id}/pty/sessions", post(pty_session))
        .with_state(daemon.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, daemon)
}

fn sandbox(addr: SocketAddr, workspace: &str) -> DaemonSandbox {
    let mut config = DaemonConfig::new(format!("http://{addr}"));
    config.wait.interval = Duration::from_millis(20);
    config.wait.timeout = Duration::from_secs(5);
    DaemonSandbox::new(config, SandboxRequest::new(workspace)).unwrap()
}

#[tokio::test]
async fn uploaded_file_is_readable_through_exec() {
    let (addr, _daemon) = spawn_daemon().await;
    let sandbox = sandbox(addr, "workspace-7");

    let info = sandbox.start().await.unwrap();
    assert_eq!(info.instance_id, "sb-0");
    assert_eq!(info.url, format!("http://0-39377.localhost:{}", addr.port()));

    sandbox.upload_file("/tmp/x.txt", b"hello").await.unwrap();
    let output = sandbox
        .exec(ExecOptions::new("cat").arg("/tmp/x.txt"))
        .await
        .unwrap();
    assert_eq!(output.exit_code, 0);
    assert_eq!(output.stdout, "hello");

    let instance = sandbox.instance().unwrap();
    assert_eq!(instance.status, SandboxStatus::Running);
    assert_eq!(
        instance.network_identity.unwrap().address.to_string(),
        "127.18.0.7"
    );
}

#[tokio::test]
async fn nonzero_exit_is_not_an_error() {
    let (addr, _daemon) = spawn_daemon().await;
    let sandbox = sandbox(addr, "workspace-1");
    sandbox.start().await.unwrap();

    let output = sandbox
        .exec(ExecOptions::shell("echo oops >&2; exit 3"))
        .await
        .unwrap();
    assert_eq!(output.exit_code, 3);
    assert_eq!(output.stderr, "oops\n");
}

#[tokio::test]
async fn quick_exit_with_timeout_codes_keeps_its_status() {
    let (addr, _daemon) = spawn_daemon().await;
    let sandbox = sandbox(addr, "workspace-6");
    sandbox.start().await.unwrap();

    for code in [124, 137] {
        let output = sandbox
            .exec(ExecOptions::shell(format!("echo partial; exit {code}")).timeout(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(output.exit_code, code);
        assert_eq!(output.stdout, "partial\n");
    }
}

#[tokio::test]
async fn exec_past_deadline_times_out() {
    let (addr, _daemon) = spawn_daemon().await;
    let sandbox = sandbox(addr, "workspace-2");
    sandbox.start().await.unwrap();

    let started = std::time::Instant::now();
    let err = sandbox
        .exec(ExecOptions::new("sleep").arg("10").timeout(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::ExecTimeout { .. }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(8));
}

#[tokio::test]
async fn failed_readiness_rolls_back() {
    let (addr, daemon) = spawn_daemon().await;
    let sandbox = sandbox(addr, "broken");

    let err = sandbox.start().await.unwrap_err();
    assert!(matches!(err, SandboxError::Provisioning { .. }), "{err}");
    assert_eq!(daemon.deleted.lock().as_slice(), ["sb-0"]);
    assert_eq!(sandbox.instance().unwrap().status, SandboxStatus::Failed);

    let err = sandbox.exec(ExecOptions::new("true")).await.unwrap_err();
    assert!(matches!(err, SandboxError::InvalidState { .. }));
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (addr, daemon) = spawn_daemon().await;
    let sandbox = sandbox(addr, "workspace-3");

    sandbox.stop().await.unwrap();
    sandbox.start().await.unwrap();
    sandbox.stop().await.unwrap();
    sandbox.stop().await.unwrap();

    assert_eq!(daemon.deleted.lock().len(), 1);
    assert_eq!(sandbox.instance().unwrap().status, SandboxStatus::Stopped);
    assert!(!sandbox.get_status().await.unwrap().running);
    assert!(sandbox.start().await.is_err());
}

#[tokio::test]
async fn failed_teardown_is_retried_by_next_stop() {
    let (addr, daemon) = spawn_daemon().await;
    let sandbox = sandbox(addr, "workspace-8");
    sandbox.start().await.unwrap();

    *daemon.failing_deletes.lock() = 1;
    assert!(sandbox.stop().await.is_err());
    assert_eq!(sandbox.instance().unwrap().status, SandboxStatus::Failed);
    assert!(daemon.deleted.lock().is_empty());

    sandbox.stop().await.unwrap();
    assert_eq!(daemon.deleted.lock().as_slice(), ["sb-0"]);
    assert_eq!(sandbox.instance().unwrap().status, SandboxStatus::Failed);

    sandbox.stop().await.unwrap();
    assert_eq!(daemon.deleted.lock().len(), 1);
}

#[tokio::test]
async fn tar_upload_and_exposed_ports() {
    let (addr, _daemon) = spawn_daemon().await;
    let sandbox = sandbox(addr, "workspace-4");
    sandbox.start().await.unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(3);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, "srv/app/config.txt", &b"a=1"[..])
        .unwrap();
    sandbox
        .upload_tar(builder.into_inner().unwrap())
        .await
        .unwrap();
    let output = sandbox
        .exec(ExecOptions::new("cat").arg("/srv/app/config.txt"))
        .await
        .unwrap();
    assert_eq!(output.stdout, "a=1");

    let port = sandbox.expose_port("web", 3000).await.unwrap();
    assert_eq!(port.public_url, format!("http://0-3000.localhost:{}", addr.port()));
    assert_eq!(sandbox.instance().unwrap().exposed_ports, vec![port]);

    let status = sandbox.get_status().await.unwrap();
    assert!(status.running);
}

#[tokio::test]
async fn terminal_runs_auth_files_and_startup_commands_first() {
    let (addr, _daemon) = spawn_daemon().await;
    let sandbox = sandbox(addr, "workspace-5");
    sandbox.start().await.unwrap();

    let session = sandbox
        .create_terminal(TerminalOptions {
            auth_files: vec![fabric_sandbox::AuthFile::new(
                "/home/user/.token",
                "secret",
                0o600,
            )],
            startup_commands: vec!["true".into()],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(session.id, "pty-1");
    assert_eq!(session.pid, Some(42));
    assert_eq!(
        session.ws_url,
        format!("ws://127.0.0.1:{}/sandboxes/sb-0/pty/sessions/pty-1/ws", addr.port())
    );

    let output = sandbox
        .exec(ExecOptions::new("cat").arg("/home/user/.token"))
        .await
        .unwrap();
    assert_eq!(output.stdout, "secret");
    let mode = sandbox
        .exec(ExecOptions::new("stat").args(["-c", "%a", "/home/user/.token"]))
        .await
        .unwrap();
    assert_eq!(mode.stdout.trim(), "600");

    let err = sandbox
        .create_terminal(TerminalOptions {
            startup_commands: vec!["exit 9".into()],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::CommandFailed { .. }));
}

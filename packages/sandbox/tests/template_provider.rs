use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use fabric_sandbox::{
    ExecOptions, ProviderConfig, Sandbox, SandboxError, SandboxRequest, SandboxStatus,
    TemplateSandbox,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};

const API_KEY: &str = "template-key";

#[derive(Default)]
struct Service {
    dockerfiles: Mutex<Vec<String>>,
    sandboxes: Mutex<HashMap<String, Value>>,
    files: Mutex<HashMap<String, (Vec<u8>, u32)>>,
    deleted: Mutex<Vec<String>>,
}

type Shared = Arc<Service>;

fn authorized(headers: &HeaderMap) -> Result<(), StatusCode> {
    match headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        Some(API_KEY) => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

#[derive(Deserialize)]
struct BuildBody {
    dockerfile: String,
}

async fn build(
    State(service): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<BuildBody>,
) -> Result<Json<Value>, StatusCode> {
    authorized(&headers)?;
    service.dockerfiles.lock().push(body.dockerfile);
    Ok(Json(json!({ "id": "tpl-1", "status": "building" })))
}

async fn template_status(headers: HeaderMap, Path(id): Path<String>) -> Result<Json<Value>, StatusCode> {
    authorized(&headers)?;
    Ok(Json(json!({ "id": id, "status": "ready" })))
}

async fn create(
    State(service): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    authorized(&headers)?;
    let mut sandboxes = service.sandboxes.lock();
    let id = format!("sb-{}", sandboxes.len());
    sandboxes.insert(id.clone(), body);
    Ok(Json(json!({ "id": id, "status": "starting" })))
}

async fn sandbox_status(
    State(service): State<Shared>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    authorized(&headers)?;
    if !service.sandboxes.lock().contains_key(&id) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({ "id": id, "status": "running" })))
}

async fn delete(
    State(service): State<Shared>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> StatusCode {
    if authorized(&headers).is_err() {
        return StatusCode::UNAUTHORIZED;
    }
    match service.sandboxes.lock().remove(&id) {
        Some(_) => {
            service.deleted.lock().push(id);
            StatusCode::NO_CONTENT
        }
        None => StatusCode::NOT_FOUND,
    }
}

#[derive(Deserialize)]
struct FileBody {
    path: String,
    content_base64: String,
    mode: u32,
}

async fn write_file(
    State(service): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<FileBody>,
) -> Result<StatusCode, StatusCode> {
    authorized(&headers)?;
    let contents = STANDARD
        .decode(body.content_base64)
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    service.files.lock().insert(body.path, (contents, body.mode));
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct CommandBody {
    cmd: String,
}

async fn command(headers: HeaderMap, Json(body): Json<CommandBody>) -> Result<Json<Value>, StatusCode> {
    authorized(&headers)?;
    if body.cmd.starts_with("sleep") {
        return Ok(Json(json!({ "stdout": "partial", "timed_out": true })));
    }
    Ok(Json(json!({ "stdout": format!("ran: {}", body.cmd), "exit_code": 0 })))
}

async fn spawn_service() -> (SocketAddr, Shared) {
    let service = Shared::default();
    let app = Router::new()
        .route("/templates", post(build))
        .route("/templates/{id}", get(template_status))
        .route("/sandboxes", post(create))
        .route("/sandboxes/{id}", get(sandbox_status).delete(delete))
        .route("/sandboxes/{id}/files", post(write_file))
        .route("/sandboxes/{id}/commands", post(command))
        .with_state(service.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, service)
}

fn sandbox(addr: SocketAddr, request: SandboxRequest) -> TemplateSandbox {
    let env: HashMap<&str, String> = HashMap::from([
        ("FABRIC_PROVIDER", "template".to_string()),
        ("FABRIC_TEMPLATE_API_URL", format!("http://{addr}")),
        ("FABRIC_TEMPLATE_API_KEY", API_KEY.to_string()),
        ("FABRIC_SANDBOX_DOMAIN", "sandboxes.test".to_string()),
        (
            "FABRIC_TEMPLATE_STEPS",
            r#"[{"type":"run","command":"apt-get install -y git"}]"#.to_string(),
        ),
    ]);
    let ProviderConfig::Template(mut config) =
        ProviderConfig::from_lookup(|key| env.get(key).cloned()).unwrap()
    else {
        panic!("expected template config");
    };
    config.wait.interval = Duration::from_millis(20);
    config.wait.timeout = Duration::from_secs(5);
    TemplateSandbox::new(config, request).unwrap()
}

#[tokio::test]
async fn builds_template_then_starts_sandbox() {
    let (addr, service) = spawn_service().await;
    let mut request = SandboxRequest::new("workspace-12");
    request.task_run_id = Some("run-1".into());
    let sandbox = sandbox(addr, request);

    let info = sandbox.start().await.unwrap();
    assert_eq!(info.instance_id, "sb-0");
    assert_eq!(info.url, "https://39377-sb-0.sandboxes.test");
    assert_eq!(info.task_run_id.as_deref(), Some("run-1"));
    assert_eq!(
        service.dockerfiles.lock().as_slice(),
        ["FROM ubuntu:22.04\nRUN apt-get install -y git\n"]
    );

    let created = service.sandboxes.lock()["sb-0"].clone();
    assert_eq!(created["template_id"], "tpl-1");
    assert_eq!(created["env"]["FABRIC_WORKSPACE_ID"], "workspace-12");
    assert_eq!(created["metadata"]["task_run_id"], "run-1");
}

#[tokio::test]
async fn existing_snapshot_skips_build() {
    let (addr, service) = spawn_service().await;
    let mut request = SandboxRequest::new("workspace-12");
    request.snapshot_id = Some("tpl-cached".into());
    let sandbox = sandbox(addr, request);

    sandbox.start().await.unwrap();
    assert!(service.dockerfiles.lock().is_empty());
    assert_eq!(service.sandboxes.lock()["sb-0"]["template_id"], "tpl-cached");
}

#[tokio::test]
async fn files_and_commands_round_trip() {
    let (addr, service) = spawn_service().await;
    let sandbox = sandbox(addr, SandboxRequest::new("workspace-12"));
    sandbox.start().await.unwrap();

    sandbox.upload_file("/etc/motd", b"welcome").await.unwrap();
    assert_eq!(
        service.files.lock()["/etc/motd"],
        (b"welcome".to_vec(), 0o644)
    );

    let output = sandbox.exec(ExecOptions::new("ls").arg("-la")).await.unwrap();
    assert_eq!(output.stdout, "ran: ls -la");

    let err = sandbox
        .exec(ExecOptions::new("sleep").arg("100"))
        .await
        .unwrap_err();
    match err {
        SandboxError::ExecTimeout { stdout, .. } => assert_eq!(stdout, "partial"),
        other => panic!("unexpected error: {other}"),
    }

    let port = sandbox.expose_port("docs", 8080).await.unwrap();
    assert_eq!(port.public_url, "https://8080-sb-0.sandboxes.test");
}

#[tokio::test]
async fn stop_deletes_once() {
    let (addr, service) = spawn_service().await;
    let sandbox = sandbox(addr, SandboxRequest::new("workspace-12"));
    sandbox.start().await.unwrap();

    sandbox.stop().await.unwrap();
    sandbox.stop().await.unwrap();
    assert_eq!(service.deleted.lock().as_slice(), ["sb-0"]);
    assert_eq!(sandbox.instance().unwrap().status, SandboxStatus::Stopped);
}

use std::collections::HashMap;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tar::{Builder, Header};
use url::Url;

use crate::errors::{SandboxError, SandboxResult};
use crate::models::{AuthFile, ExecOptions, TerminalOptions, TerminalSession};
use crate::provider::Sandbox;

const DEFAULT_SHELL: &str = "/bin/bash";

/// Body accepted by the terminal server's `POST /sessions`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PtyCreateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub shell: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub env: HashMap<String, String>,
}

impl From<&TerminalOptions> for PtyCreateRequest {
    fn from(options: &TerminalOptions) -> Self {
        Self {
            id: options.terminal_id.clone(),
            shell: options
                .command
                .clone()
                .unwrap_or_else(|| DEFAULT_SHELL.to_string()),
            args: options.args.clone(),
            cwd: options.cwd.clone(),
            cols: options.cols,
            rows: options.rows,
            env: options
                .env
                .iter()
                .map(|var| (var.key.clone(), var.value.clone()))
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PtySessionInfo {
    id: String,
    #[serde(default)]
    pid: Option<u32>,
}

async fn ensure_success<S: Sandbox + ?Sized>(
    sandbox: &S,
    options: ExecOptions,
) -> SandboxResult<()> {
    let description = options.to_shell_line();
    let output = sandbox.exec(options).await?;
    if !output.success() {
        return Err(SandboxError::CommandFailed {
            command: description,
            message: format!("exit {}: {}", output.exit_code, output.stderr.trim()),
        });
    }
    Ok(())
}

/// Pack auth files into one archive rooted at `/`, each entry carrying its own mode.
pub fn auth_archive(files: &[AuthFile]) -> SandboxResult<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    for file in files {
        let relative = file.path.trim_start_matches('/');
        if relative.is_empty() {
            return Err(SandboxError::InvalidRequest(format!(
                "invalid auth file path '{}'",
                file.path
            )));
        }
        let mut header = Header::new_gnu();
        header.set_size(file.contents.len() as u64);
        header.set_mode(file.mode);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
        builder.append_data(&mut header, relative, file.contents.as_slice())?;
    }
    Ok(builder.into_inner()?)
}

/// Files are extracted with their final mode, never readable more widely in between.
pub async fn write_auth_files<S: Sandbox + ?Sized>(
    sandbox: &S,
    files: &[AuthFile],
) -> SandboxResult<()> {
    if files.is_empty() {
        return Ok(());
    }
    sandbox.upload_tar(auth_archive(files)?).await?;
    tracing::debug!(count = files.len(), "wrote auth files");
    Ok(())
}

pub async fn run_startup_commands<S: Sandbox + ?Sized>(
    sandbox: &S,
    commands: &[String],
) -> SandboxResult<()> {
    for command in commands {
        ensure_success(sandbox, ExecOptions::shell(command.clone())).await?;
    }
    Ok(())
}

/// `POST {base}/sessions` on a terminal server and describe the resulting session.
pub async fn create_pty_session(
    client: &Client,
    base_url: &str,
    request: &PtyCreateRequest,
) -> SandboxResult<TerminalSession> {
    let base = base_url.trim_end_matches('/');
    let response = client
        .post(format!("{base}/sessions"))
        .json(request)
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(SandboxError::CommandFailed {
            command: "create terminal session".to_string(),
            message: format!("{status}: {body}"),
        });
    }
    let info: PtySessionInfo = response.json().await?;
    let ws_url = websocket_url(base, &format!("/sessions/{}/ws", info.id))?;
    Ok(TerminalSession {
        id: info.id,
        pid: info.pid,
        ws_url,
    })
}

/// Swap an http(s) base for ws(s) and append `path`.
pub fn websocket_url(base: &str, path: &str) -> SandboxResult<String> {
    let mut url = Url::parse(&format!("{}{}", base.trim_end_matches('/'), path))
        .map_err(|e| SandboxError::InvalidRequest(format!("invalid terminal url {base}: {e}")))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| SandboxError::InvalidRequest(format!("cannot use {scheme} for {base}")))?;
    Ok(url.to_string())
}

/// Auth files, then startup commands, then the session itself.
pub async fn open_terminal<S: Sandbox + ?Sized>(
    sandbox: &S,
    client: &Client,
    pty_base_url: &str,
    options: &TerminalOptions,
) -> SandboxResult<TerminalSession> {
    write_auth_files(sandbox, &options.auth_files).await?;
    run_startup_commands(sandbox, &options.startup_commands).await?;
    let session = create_pty_session(client, pty_base_url, &PtyCreateRequest::from(options)).await?;
    tracing::info!(provider = %sandbox.provider(), session = %session.id, "terminal created");
    Ok(session)
}

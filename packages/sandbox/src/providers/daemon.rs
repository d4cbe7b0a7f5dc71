//! Sandboxes hosted by an always-on sandbox daemon speaking the `/sandboxes` REST API.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tar::{Builder, Header};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{http_client, EnvLookup, InstanceCell, SandboxRequest, WaitSettings};
use crate::errors::{SandboxError, SandboxResult};
use crate::lifecycle::StopAction;
use crate::models::{
    EnvVar, ExecOptions, ExecOutput, ExposedPort, ProviderKind, SandboxInfo, SandboxInstance,
    StatusReport, TerminalOptions, TerminalSession, DEFAULT_WORKER_PORT, DEFAULT_WORKSPACE_PORT,
};
use crate::process::{classify_remote_exit, with_remote_timeout, TRANSPORT_GRACE};
use crate::provider::Sandbox;
use crate::readiness::{wait_until, Probe};
use crate::terminal::open_terminal;
use fabric_identity::WORKSPACE_ENV;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub base_url: String,
    /// Host (and port) used to build `<index>-<port>.<host>` URLs. Derived from
    /// `base_url` when unset.
    pub sandbox_domain: Option<String>,
    pub wait: WaitSettings,
    pub request_timeout: Duration,
}

impl DaemonConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            sandbox_domain: None,
            wait: WaitSettings {
                interval: Duration::from_millis(500),
                timeout: Duration::from_secs(120),
            },
            request_timeout: Duration::from_secs(30),
        }
    }

    pub(crate) fn from_lookup(env: &EnvLookup<'_>) -> SandboxResult<Self> {
        let mut config = Self::new(env.required("FABRIC_DAEMON_URL")?);
        Url::parse(&config.base_url).map_err(|e| {
            SandboxError::Configuration(format!("FABRIC_DAEMON_URL is not a valid url: {e}"))
        })?;
        config.sandbox_domain = env.optional("FABRIC_SANDBOX_DOMAIN");
        Ok(config)
    }

    /// `(scheme, host[:port])` for per-sandbox subdomain URLs.
    fn url_parts(&self) -> SandboxResult<(String, String)> {
        let base = Url::parse(&self.base_url)
            .map_err(|e| SandboxError::Configuration(format!("invalid daemon url: {e}")))?;
        let scheme = base.scheme().to_string();
        if let Some(domain) = &self.sandbox_domain {
            return Ok((scheme, domain.trim_start_matches('.').to_string()));
        }
        let host = match base.host_str() {
            Some(host) if host.parse::<std::net::IpAddr>().is_ok() => "localhost",
            Some(host) => host,
            None => "localhost",
        };
        let authority = match base.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Ok((scheme, authority))
    }
}

#[derive(Debug, Serialize)]
struct CreateSandboxBody<'a> {
    name: &'a str,
    env: Vec<EnvVar>,
}

#[derive(Debug, Clone, Deserialize)]
struct SandboxSummary {
    id: String,
    #[serde(default)]
    index: Option<usize>,
    status: String,
}

#[derive(Debug, Serialize)]
struct ExecBody {
    command: Vec<String>,
    workdir: Option<String>,
    env: Vec<EnvVar>,
}

pub struct DaemonSandbox {
    config: DaemonConfig,
    request: SandboxRequest,
    client: Client,
    state: InstanceCell,
    index: parking_lot::Mutex<Option<String>>,
}

impl DaemonSandbox {
    pub fn new(config: DaemonConfig, request: SandboxRequest) -> SandboxResult<Self> {
        let client = http_client(config.request_timeout)?;
        Ok(Self {
            config,
            request,
            client,
            state: InstanceCell::default(),
            index: parking_lot::Mutex::new(None),
        })
    }

    fn sandbox_url(&self, id: &str) -> String {
        format!("{}/sandboxes/{}", self.config.base_url, id)
    }

    fn port_url(&self, port: u16) -> SandboxResult<String> {
        let (scheme, authority) = self.config.url_parts()?;
        let label = self
            .index
            .lock()
            .clone()
            .or_else(|| self.state.id())
            .ok_or_else(|| SandboxError::InvalidRequest("sandbox has not been started".into()))?;
        Ok(format!("{scheme}://{label}-{port}.{authority}"))
    }

    fn info(&self, id: &str) -> SandboxResult<SandboxInfo> {
        Ok(SandboxInfo {
            url: self.port_url(DEFAULT_WORKER_PORT)?,
            workspace_url: self.port_url(DEFAULT_WORKSPACE_PORT)?,
            instance_id: id.to_string(),
            task_run_id: self.request.task_run_id.clone(),
            provider: ProviderKind::Daemon,
        })
    }

    async fn fetch(&self, id: &str) -> SandboxResult<Option<SandboxSummary>> {
        let response = self.client.get(self.sandbox_url(id)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }

    async fn delete(&self, id: &str) -> SandboxResult<()> {
        let response = self.client.delete(self.sandbox_url(id)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        response.error_for_status()?;
        Ok(())
    }

    async fn provision(&self) -> SandboxResult<SandboxInfo> {
        let mut env = vec![EnvVar::new(WORKSPACE_ENV, self.request.workspace.clone())];
        env.extend(self.request.env.iter().cloned());
        let response = self
            .client
            .post(format!("{}/sandboxes", self.config.base_url))
            .json(&CreateSandboxBody {
                name: &self.request.workspace,
                env,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SandboxError::provisioning(
                ProviderKind::Daemon,
                format!("create returned {status}: {body}"),
            ));
        }
        let created: SandboxSummary = response.json().await?;
        self.state
            .publish(created.id.clone(), ProviderKind::Daemon, &self.request.workspace);
        *self.index.lock() = created.index.map(|i| i.to_string());
        tracing::info!(sandbox = %created.id, workspace = %self.request.workspace, "daemon sandbox created");

        let id = created.id.clone();
        let (this, id_ref) = (self, &id);
        wait_until(
            move || async move {
                Ok::<_, SandboxError>(match this.fetch(id_ref).await? {
                    None => Probe::Failed("sandbox disappeared".to_string()),
                    Some(summary) => match summary.status.to_ascii_lowercase().as_str() {
                        "running" => Probe::Ready(summary),
                        "exited" | "failed" => Probe::Failed(summary.status),
                        _ => Probe::Pending,
                    },
                })
            },
            self.config.wait.interval,
            self.config.wait.timeout,
            &CancellationToken::new(),
        )
        .await
        .into_result(ProviderKind::Daemon, "daemon sandbox")?;

        self.info(&id)
    }

    async fn post_files(&self, id: &str, archive: Vec<u8>) -> SandboxResult<()> {
        let response = self
            .client
            .post(format!("{}/files", self.sandbox_url(id)))
            .header(reqwest::header::CONTENT_TYPE, "application/x-tar")
            .body(archive)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SandboxError::CommandFailed {
                command: "upload files".to_string(),
                message: format!("{status}: {body}"),
            });
        }
        Ok(())
    }
}

/// Wrap one file in a tar archive rooted at `/`.
pub(crate) fn single_file_tar(path: &str, contents: &[u8], mode: u32) -> SandboxResult<Vec<u8>> {
    let relative = path.trim_start_matches('/');
    if relative.is_empty() {
        return Err(SandboxError::InvalidRequest(format!("invalid upload path '{path}'")));
    }
    let mut header = Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(mode);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);

    let mut builder = Builder::new(Vec::new());
    builder.append_data(&mut header, relative, contents)?;
    Ok(builder.into_inner()?)
}

#[async_trait]
impl Sandbox for DaemonSandbox {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Daemon
    }

    fn instance(&self) -> Option<SandboxInstance> {
        self.state.snapshot()
    }

    async fn start(&self) -> SandboxResult<SandboxInfo> {
        let _op = self.state.lifecycle.serialize().await;
        self.state.lifecycle.begin_start()?;
        match self.provision().await {
            Ok(info) => {
                self.state.lifecycle.mark_running()?;
                Ok(info)
            }
            Err(error) => {
                tracing::warn!(%error, "daemon sandbox failed to start; rolling back");
                if let Some(id) = self.state.id() {
                    if let Err(cleanup) = self.delete(&id).await {
                        tracing::warn!(error = %cleanup, sandbox = %id, "rollback delete failed");
                        self.state.lifecycle.mark_teardown_failed();
                    }
                }
                self.state.lifecycle.mark_failed();
                Err(error)
            }
        }
    }

    async fn stop(&self) -> SandboxResult<()> {
        let _op = self.state.lifecycle.serialize().await;
        if self.state.lifecycle.begin_stop() == StopAction::Noop {
            return Ok(());
        }
        let Some(id) = self.state.id() else {
            self.state.lifecycle.mark_stopped();
            return Ok(());
        };
        match self.delete(&id).await {
            Ok(()) => {
                self.state.lifecycle.mark_stopped();
                Ok(())
            }
            Err(error) => {
                self.state.lifecycle.mark_teardown_failed();
                Err(error)
            }
        }
    }

    async fn exec(&self, options: ExecOptions) -> SandboxResult<ExecOutput> {
        let id = self.state.running_id()?;
        let timeout = options.effective_timeout();
        let body = ExecBody {
            command: with_remote_timeout(options.argv(), timeout),
            workdir: options.cwd.clone(),
            env: options.env.clone(),
        };
        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/exec", self.sandbox_url(&id)))
            .timeout(timeout + TRANSPORT_GRACE)
            .json(&body)
            .send()
            .await;
        let response = match response {
            Err(err) if err.is_timeout() => {
                return Err(SandboxError::ExecTimeout {
                    timeout,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            }
            other => other?,
        };
        let output: ExecOutput = response.error_for_status()?.json().await?;
        classify_remote_exit(output, timeout, started.elapsed())
    }

    async fn upload_file(&self, path: &str, contents: &[u8]) -> SandboxResult<()> {
        let id = self.state.running_id()?;
        self.post_files(&id, single_file_tar(path, contents, 0o644)?).await
    }

    async fn upload_tar(&self, archive: Vec<u8>) -> SandboxResult<()> {
        let id = self.state.running_id()?;
        self.post_files(&id, archive).await
    }

    async fn create_terminal(&self, options: TerminalOptions) -> SandboxResult<TerminalSession> {
        let id = self.state.running_id()?;
        let base = format!("{}/pty", self.sandbox_url(&id));
        open_terminal(self, &self.client, &base, &options).await
    }

    async fn get_status(&self) -> SandboxResult<StatusReport> {
        let Some(id) = self.state.id() else {
            return Ok(StatusReport::not_running());
        };
        match self.fetch(&id).await? {
            Some(summary) if summary.status.eq_ignore_ascii_case("running") => Ok(StatusReport {
                running: true,
                info: Some(self.info(&id)?),
            }),
            _ => Ok(StatusReport::not_running()),
        }
    }

    async fn expose_port(&self, name: &str, port: u16) -> SandboxResult<ExposedPort> {
        self.state.running_id()?;
        let exposed = ExposedPort {
            name: name.to_string(),
            target_port: port,
            public_url: self.port_url(port)?,
        };
        self.state.record_port(exposed.clone());
        Ok(exposed)
    }
}

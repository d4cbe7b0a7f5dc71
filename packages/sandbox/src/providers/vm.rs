//! Cloud micro-VMs managed through a control plane's `/api/v1/instances` API.
//!
//! Commands go over the control plane's exec endpoint; files go over `scp` to the SSH
//! target the control plane hands out per instance.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{http_client, EnvLookup, InstanceCell, SandboxRequest, WaitSettings};
use crate::errors::{SandboxError, SandboxResult};
use crate::lifecycle::StopAction;
use crate::models::{
    shell_quote, ExecOptions, ExecOutput, ExposedPort, ProviderKind, SandboxInfo,
    SandboxInstance, StatusReport, TerminalOptions, TerminalSession, DEFAULT_PTY_PORT,
    DEFAULT_WORKER_PORT, DEFAULT_WORKSPACE_PORT,
};
use crate::process::{find_binary, run_checked, TRANSPORT_GRACE};
use crate::provider::Sandbox;
use crate::readiness::{wait_until, Probe};
use crate::terminal::open_terminal;
use fabric_identity::WORKSPACE_ENV;

const SSH_OPTIONS: [&str; 4] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
];
const COPY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
pub struct VmConfig {
    pub api_url: String,
    pub api_key: String,
    pub team: String,
    pub default_snapshot: Option<String>,
    /// Suffix for `port-<port>-<instance>.<domain>` URLs.
    pub http_domain: String,
    pub ttl_seconds: u64,
    pub wait: WaitSettings,
    pub request_timeout: Duration,
}

impl VmConfig {
    pub(crate) fn from_lookup(env: &EnvLookup<'_>) -> SandboxResult<Self> {
        let ttl_seconds = match env.optional("FABRIC_VM_TTL_SECONDS") {
            Some(raw) => raw.parse().map_err(|_| {
                SandboxError::Configuration(format!("FABRIC_VM_TTL_SECONDS is not a number: {raw}"))
            })?,
            None => 3600,
        };
        Ok(Self {
            api_url: env.required("FABRIC_VM_API_URL")?.trim_end_matches('/').to_string(),
            api_key: env.required("FABRIC_VM_API_KEY")?,
            team: env.required("FABRIC_VM_TEAM")?,
            default_snapshot: env.optional("FABRIC_VM_SNAPSHOT"),
            http_domain: env
                .required("FABRIC_VM_HTTP_DOMAIN")?
                .trim_start_matches('.')
                .to_string(),
            ttl_seconds,
            wait: WaitSettings::default(),
            request_timeout: Duration::from_secs(30),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateInstanceBody<'a> {
    team_slug_or_id: &'a str,
    snapshot_id: &'a str,
    name: &'a str,
    ttl_seconds: u64,
    env: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    id: String,
    status: String,
}

#[derive(Debug, Serialize)]
struct ExecBody {
    command: String,
    timeout: f64,
}

#[derive(Debug, Deserialize)]
struct ExecReply {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    timed_out: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SshReply {
    ssh_command: String,
}

/// Where `scp` should copy to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub destination: String,
    pub port: Option<u16>,
}

/// Extract `user@host` and `-p <port>` from an `ssh ...` command line.
pub fn parse_ssh_target(command: &str) -> Option<SshTarget> {
    let mut words = command.split_whitespace();
    if words.next()? != "ssh" {
        return None;
    }
    let mut destination = None;
    let mut port = None;
    while let Some(word) = words.next() {
        match word {
            "-p" => port = words.next().and_then(|p| p.parse().ok()),
            "-o" | "-i" | "-l" => {
                words.next();
            }
            w if w.starts_with('-') => {}
            w => {
                destination = Some(w.to_string());
                break;
            }
        }
    }
    Some(SshTarget {
        destination: destination?,
        port,
    })
}

pub struct VmSandbox {
    config: VmConfig,
    request: SandboxRequest,
    client: Client,
    state: InstanceCell,
}

impl VmSandbox {
    pub fn new(config: VmConfig, request: SandboxRequest) -> SandboxResult<Self> {
        let client = http_client(config.request_timeout)?;
        Ok(Self {
            config,
            request,
            client,
            state: InstanceCell::default(),
        })
    }

    fn instances_url(&self) -> String {
        format!("{}/api/v1/instances", self.config.api_url)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.config.api_key)
    }

    fn port_url(&self, id: &str, port: u16) -> String {
        format!("https://port-{port}-{id}.{}", self.config.http_domain)
    }

    fn info(&self, id: &str) -> SandboxInfo {
        SandboxInfo {
            url: self.port_url(id, DEFAULT_WORKER_PORT),
            workspace_url: self.port_url(id, DEFAULT_WORKSPACE_PORT),
            instance_id: id.to_string(),
            task_run_id: self.request.task_run_id.clone(),
            provider: ProviderKind::Vm,
        }
    }

    async fn get_instance(&self, id: &str) -> SandboxResult<Option<Instance>> {
        let response = self
            .authed(self.client.get(format!("{}/{id}", self.instances_url())))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }

    async fn post_action(&self, id: &str, action: &str) -> SandboxResult<StatusCode> {
        let response = self
            .authed(
                self.client
                    .post(format!("{}/{id}/{action}", self.instances_url())),
            )
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(status);
        }
        response.error_for_status()?;
        Ok(status)
    }

    async fn provision(&self) -> SandboxResult<SandboxInfo> {
        let snapshot = self
            .request
            .snapshot_id
            .as_deref()
            .or(self.config.default_snapshot.as_deref())
            .ok_or_else(|| {
                SandboxError::Configuration(
                    "no snapshot requested and FABRIC_VM_SNAPSHOT is unset".to_string(),
                )
            })?;
        let mut env: std::collections::HashMap<String, String> = self
            .request
            .env
            .iter()
            .map(|v| (v.key.clone(), v.value.clone()))
            .collect();
        env.insert(WORKSPACE_ENV.to_string(), self.request.workspace.clone());

        let response = self
            .authed(self.client.post(self.instances_url()))
            .json(&CreateInstanceBody {
                team_slug_or_id: &self.config.team,
                snapshot_id: snapshot,
                name: &self.request.workspace,
                ttl_seconds: self.config.ttl_seconds,
                env,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SandboxError::provisioning(
                ProviderKind::Vm,
                format!("create instance returned {status}: {body}"),
            ));
        }
        let instance: Instance = response.json().await?;
        self.state
            .publish(instance.id.clone(), ProviderKind::Vm, &self.request.workspace);
        tracing::info!(instance = %instance.id, snapshot, "vm instance created");

        let id = instance.id;
        let (this, id_ref) = (self, id.as_str());
        wait_until(
            move || async move {
                Ok::<_, SandboxError>(match this.get_instance(id_ref).await? {
                    None => Probe::Failed("instance disappeared".to_string()),
                    Some(instance) => match instance.status.as_str() {
                        "running" | "ready" => Probe::Ready(()),
                        "stopped" | "error" | "failed" => Probe::Failed(instance.status.clone()),
                        _ => Probe::Pending,
                    },
                })
            },
            self.config.wait.interval,
            self.config.wait.timeout,
            &CancellationToken::new(),
        )
        .await
        .into_result(ProviderKind::Vm, "vm instance")?;

        Ok(self.info(&id))
    }

    /// Freeze a running instance without tearing it down.
    pub async fn pause(&self) -> SandboxResult<()> {
        let id = self.state.running_id()?;
        self.post_action(&id, "pause").await?;
        Ok(())
    }

    pub async fn resume(&self) -> SandboxResult<()> {
        let id = self.state.running_id()?;
        self.post_action(&id, "resume").await?;
        Ok(())
    }

    async fn ssh_target(&self, id: &str) -> SandboxResult<SshTarget> {
        let reply: SshReply = self
            .authed(self.client.get(format!("{}/{id}/ssh", self.instances_url())))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_ssh_target(&reply.ssh_command).ok_or_else(|| {
            SandboxError::Internal(format!("unrecognized ssh command: {}", reply.ssh_command))
        })
    }

    /// Copy `contents` to `remote_path` over scp.
    async fn copy_to(&self, id: &str, contents: &[u8], remote_path: &str) -> SandboxResult<()> {
        let scp = find_binary("scp")?;
        let target = self.ssh_target(id).await?;

        let mut staged = tempfile::NamedTempFile::new()?;
        staged.write_all(contents)?;
        staged.flush()?;

        let mut command = Command::new(scp);
        command.args(SSH_OPTIONS);
        if let Some(port) = target.port {
            command.arg("-P").arg(port.to_string());
        }
        command
            .arg(staged.path())
            .arg(format!("{}:{}", target.destination, remote_path));
        run_checked(command, COPY_TIMEOUT).await?;
        Ok(())
    }

    async fn run_required(&self, script: String) -> SandboxResult<()> {
        let output = self.exec(ExecOptions::shell(script.clone())).await?;
        if !output.success() {
            return Err(SandboxError::CommandFailed {
                command: script,
                message: output.stderr,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Sandbox for VmSandbox {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Vm
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
                tracing::warn!(%error, "vm instance failed to start; rolling back");
                if let Some(id) = self.state.id() {
                    if let Err(cleanup) = self.post_action(&id, "stop").await {
                        tracing::warn!(error = %cleanup, instance = %id, "rollback stop failed");
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
        match self.post_action(&id, "stop").await {
            Ok(_) => {
                tracing::info!(instance = %id, "vm instance stopped");
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
        let response = self
            .authed(self.client.post(format!("{}/{id}/exec", self.instances_url())))
            .timeout(timeout + TRANSPORT_GRACE)
            .json(&ExecBody {
                command: options.to_shell_line(),
                timeout: timeout.as_secs_f64(),
            })
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
        let reply: ExecReply = response.error_for_status()?.json().await?;
        if reply.timed_out {
            return Err(SandboxError::ExecTimeout {
                timeout,
                stdout: reply.stdout,
                stderr: reply.stderr,
            });
        }
        Ok(ExecOutput {
            exit_code: reply.exit_code,
            stdout: reply.stdout,
            stderr: reply.stderr,
        })
    }

    async fn upload_file(&self, path: &str, contents: &[u8]) -> SandboxResult<()> {
        let id = self.state.running_id()?;
        if let Some((parent, _)) = path.rsplit_once('/').filter(|(p, _)| !p.is_empty()) {
            self.run_required(format!("mkdir -p {}", shell_quote(parent)))
                .await?;
        }
        self.copy_to(&id, contents, path).await
    }

    async fn upload_tar(&self, archive: Vec<u8>) -> SandboxResult<()> {
        let id = self.state.running_id()?;
        let staging = format!("/tmp/fabric-upload-{}.tar", uuid::Uuid::new_v4());
        self.copy_to(&id, &archive, &staging).await?;
        let quoted = shell_quote(&staging);
        self.run_required(format!("tar -xf {quoted} -C / && rm -f {quoted}"))
            .await
    }

    async fn create_terminal(&self, options: TerminalOptions) -> SandboxResult<TerminalSession> {
        let id = self.state.running_id()?;
        let base = self.port_url(&id, DEFAULT_PTY_PORT);
        open_terminal(self, &self.client, &base, &options).await
    }

    async fn get_status(&self) -> SandboxResult<StatusReport> {
        let Some(id) = self.state.id() else {
            return Ok(StatusReport::not_running());
        };
        match self.get_instance(&id).await? {
            Some(instance) if instance.status == "running" || instance.status == "ready" => {
                Ok(StatusReport {
                    running: true,
                    info: Some(self.info(&id)),
                })
            }
            _ => Ok(StatusReport::not_running()),
        }
    }

    async fn expose_port(&self, name: &str, port: u16) -> SandboxResult<ExposedPort> {
        let id = self.state.running_id()?;
        let exposed = ExposedPort {
            name: name.to_string(),
            target_port: port,
            public_url: self.port_url(&id, port),
        };
        self.state.record_port(exposed.clone());
        Ok(exposed)
    }
}

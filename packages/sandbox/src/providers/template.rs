//! Sandboxes booted from a template built by a hosted template service.
//!
//! The template is described as a list of [`BuildStep`]s, rendered into a Dockerfile-style
//! build spec, and built once before the sandbox itself is requested.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{http_client, EnvLookup, InstanceCell, SandboxRequest, WaitSettings};
use crate::errors::{SandboxError, SandboxResult};
use crate::lifecycle::StopAction;
use crate::models::{
    ExecOptions, ExecOutput, ExposedPort, ProviderKind, SandboxInfo, SandboxInstance,
    StatusReport, TerminalOptions, TerminalSession, DEFAULT_PTY_PORT, DEFAULT_WORKER_PORT,
    DEFAULT_WORKSPACE_PORT,
};
use crate::process::TRANSPORT_GRACE;
use crate::provider::Sandbox;
use crate::readiness::{wait_until, Probe};
use crate::terminal::open_terminal;
use fabric_identity::WORKSPACE_ENV;

const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildStep {
    Run { command: String },
    Copy { src: String, dest: String },
    Env { key: String, value: String },
    Workdir { path: String },
}

/// Render `steps` on top of `base_image` as a Dockerfile.
pub fn render_build_spec(base_image: &str, steps: &[BuildStep]) -> String {
    let mut spec = format!("FROM {base_image}\n");
    for step in steps {
        let line = match step {
            BuildStep::Run { command } => format!("RUN {command}"),
            BuildStep::Copy { src, dest } => format!("COPY {src} {dest}"),
            BuildStep::Env { key, value } => {
                format!("ENV {key}={}", serde_json::Value::String(value.clone()))
            }
            BuildStep::Workdir { path } => format!("WORKDIR {path}"),
        };
        spec.push_str(&line);
        spec.push('\n');
    }
    spec
}

#[derive(Clone, Debug)]
pub struct TemplateConfig {
    pub api_url: String,
    pub api_key: String,
    pub base_image: String,
    pub steps: Vec<BuildStep>,
    /// Suffix for `<port>-<sandbox>.<domain>` URLs.
    pub sandbox_domain: String,
    pub wait: WaitSettings,
    pub request_timeout: Duration,
}

impl TemplateConfig {
    pub(crate) fn from_lookup(env: &EnvLookup<'_>) -> SandboxResult<Self> {
        let steps = match env.optional("FABRIC_TEMPLATE_STEPS") {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                SandboxError::Configuration(format!("FABRIC_TEMPLATE_STEPS is not valid: {e}"))
            })?,
            None => Vec::new(),
        };
        Ok(Self {
            api_url: env
                .required("FABRIC_TEMPLATE_API_URL")?
                .trim_end_matches('/')
                .to_string(),
            api_key: env.required("FABRIC_TEMPLATE_API_KEY")?,
            base_image: env.or("FABRIC_TEMPLATE_BASE_IMAGE", "ubuntu:22.04"),
            steps,
            sandbox_domain: env
                .required("FABRIC_SANDBOX_DOMAIN")?
                .trim_start_matches('.')
                .to_string(),
            wait: WaitSettings::default(),
            request_timeout: Duration::from_secs(30),
        })
    }
}

#[derive(Debug, Serialize)]
struct BuildBody<'a> {
    name: &'a str,
    dockerfile: String,
}

#[derive(Debug, Deserialize)]
struct Resource {
    id: String,
    status: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateBody<'a> {
    template_id: &'a str,
    env: HashMap<String, String>,
    metadata: HashMap<&'static str, String>,
}

#[derive(Debug, Serialize)]
struct CommandBody {
    cmd: String,
    timeout: f64,
}

#[derive(Debug, Deserialize)]
struct CommandReply {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    timed_out: bool,
}

#[derive(Debug, Serialize)]
struct FileBody<'a> {
    path: &'a str,
    content_base64: String,
    mode: u32,
}

pub struct TemplateSandbox {
    config: TemplateConfig,
    request: SandboxRequest,
    client: Client,
    state: InstanceCell,
}

impl TemplateSandbox {
    pub fn new(config: TemplateConfig, request: SandboxRequest) -> SandboxResult<Self> {
        let client = http_client(config.request_timeout)?;
        Ok(Self {
            config,
            request,
            client,
            state: InstanceCell::default(),
        })
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header(API_KEY_HEADER, &self.config.api_key)
    }

    fn sandbox_url(&self, id: &str) -> String {
        format!("{}/sandboxes/{id}", self.config.api_url)
    }

    fn port_url(&self, id: &str, port: u16) -> String {
        format!("https://{port}-{id}.{}", self.config.sandbox_domain)
    }

    fn info(&self, id: &str) -> SandboxInfo {
        SandboxInfo {
            url: self.port_url(id, DEFAULT_WORKER_PORT),
            workspace_url: self.port_url(id, DEFAULT_WORKSPACE_PORT),
            instance_id: id.to_string(),
            task_run_id: self.request.task_run_id.clone(),
            provider: ProviderKind::Template,
        }
    }

    async fn get(&self, url: String) -> SandboxResult<Option<Resource>> {
        let response = self.authed(self.client.get(url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }

    async fn post_resource<B: Serialize + ?Sized>(
        &self,
        url: String,
        body: &B,
        what: &str,
    ) -> SandboxResult<Resource> {
        let response = self.authed(self.client.post(url)).json(body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(SandboxError::provisioning(
                ProviderKind::Template,
                format!("{what} returned {status}: {text}"),
            ));
        }
        Ok(response.json().await?)
    }

    /// Poll `url` until the resource reports one of `ready`.
    async fn wait_for(&self, url: String, ready: &[&str], what: &str) -> SandboxResult<()> {
        let (this, url_ref) = (self, &url);
        wait_until(
            move || async move {
                Ok::<_, SandboxError>(match this.get(url_ref.clone()).await? {
                    None => Probe::Failed(format!("{url_ref} disappeared")),
                    Some(resource) if ready.contains(&resource.status.as_str()) => {
                        Probe::Ready(())
                    }
                    Some(resource) if resource.status == "error" || resource.status == "failed" => {
                        Probe::Failed(resource.error.unwrap_or(resource.status))
                    }
                    Some(_) => Probe::Pending,
                })
            },
            self.config.wait.interval,
            self.config.wait.timeout,
            &CancellationToken::new(),
        )
        .await
        .into_result(ProviderKind::Template, what)
    }

    async fn delete(&self, id: &str) -> SandboxResult<()> {
        let response = self
            .authed(self.client.delete(self.sandbox_url(id)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        response.error_for_status()?;
        Ok(())
    }

    async fn build_template(&self) -> SandboxResult<String> {
        let dockerfile = render_build_spec(&self.config.base_image, &self.config.steps);
        let template = self
            .post_resource(
                format!("{}/templates", self.config.api_url),
                &BuildBody {
                    name: &self.request.workspace,
                    dockerfile,
                },
                "template build",
            )
            .await?;
        tracing::info!(template = %template.id, "template build requested");
        self.wait_for(
            format!("{}/templates/{}", self.config.api_url, template.id),
            &["ready"],
            "template build",
        )
        .await?;
        Ok(template.id)
    }

    async fn provision(&self) -> SandboxResult<SandboxInfo> {
        let template_id = match &self.request.snapshot_id {
            Some(existing) => existing.clone(),
            None => self.build_template().await?,
        };
        let mut env: HashMap<String, String> = self
            .request
            .env
            .iter()
            .map(|v| (v.key.clone(), v.value.clone()))
            .collect();
        env.insert(WORKSPACE_ENV.to_string(), self.request.workspace.clone());
        let mut metadata = HashMap::new();
        metadata.insert("workspace", self.request.workspace.clone());
        if let Some(task_run_id) = &self.request.task_run_id {
            metadata.insert("task_run_id", task_run_id.clone());
        }

        let sandbox = self
            .post_resource(
                format!("{}/sandboxes", self.config.api_url),
                &CreateBody {
                    template_id: &template_id,
                    env,
                    metadata,
                },
                "sandbox create",
            )
            .await?;
        self.state
            .publish(sandbox.id.clone(), ProviderKind::Template, &self.request.workspace);
        tracing::info!(sandbox = %sandbox.id, template = %template_id, "template sandbox created");

        self.wait_for(
            self.sandbox_url(&sandbox.id),
            &["running", "ready"],
            "template sandbox",
        )
        .await?;
        Ok(self.info(&sandbox.id))
    }

    async fn write_file(&self, id: &str, path: &str, contents: &[u8], mode: u32) -> SandboxResult<()> {
        let response = self
            .authed(self.client.post(format!("{}/files", self.sandbox_url(id))))
            .json(&FileBody {
                path,
                content_base64: STANDARD.encode(contents),
                mode,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SandboxError::CommandFailed {
                command: format!("write {path}"),
                message: format!("{status}: {body}"),
            });
        }
        Ok(())
    }
}

/// Regular files in a tar archive as `(absolute path, mode, contents)`.
fn archive_files(archive: &[u8]) -> SandboxResult<Vec<(String, u32, Vec<u8>)>> {
    let mut reader = tar::Archive::new(archive);
    let mut files = Vec::new();
    for entry in reader.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = format!("/{}", entry.path()?.to_string_lossy().trim_start_matches('/'));
        let mode = entry.header().mode().unwrap_or(0o644);
        let mut contents = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut contents)?;
        files.push((path, mode, contents));
    }
    Ok(files)
}

#[async_trait]
impl Sandbox for TemplateSandbox {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Template
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
                tracing::warn!(%error, "template sandbox failed to start; rolling back");
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
        let response = self
            .authed(self.client.post(format!("{}/commands", self.sandbox_url(&id))))
            .timeout(timeout + TRANSPORT_GRACE)
            .json(&CommandBody {
                cmd: options.to_shell_line(),
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
        let reply: CommandReply = response.error_for_status()?.json().await?;
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
        self.write_file(&id, path, contents, 0o644).await
    }

    async fn upload_tar(&self, archive: Vec<u8>) -> SandboxResult<()> {
        let id = self.state.running_id()?;
        for (path, mode, contents) in archive_files(&archive)? {
            self.write_file(&id, &path, &contents, mode).await?;
        }
        Ok(())
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
        match self.get(self.sandbox_url(&id)).await? {
            Some(resource) if resource.status == "running" || resource.status == "ready" => {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_steps_in_order() {
        let spec = render_build_spec(
            "ubuntu:22.04",
            &[
                BuildStep::Run {
                    command: "apt-get update".into(),
                },
                BuildStep::Env {
                    key: "LANG".into(),
                    value: "C.UTF-8".into(),
                },
                BuildStep::Workdir {
                    path: "/workspace".into(),
                },
                BuildStep::Copy {
                    src: "bin/".into(),
                    dest: "/usr/local/bin/".into(),
                },
            ],
        );
        assert_eq!(
            spec,
            "FROM ubuntu:22.04\nRUN apt-get update\nENV LANG=\"C.UTF-8\"\nWORKDIR /workspace\nCOPY bin/ /usr/local/bin/\n"
        );
    }

    #[test]
    fn archive_files_skips_directories() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_mode(0o755);
        dir.set_size(0);
        builder.append_data(&mut dir, "etc/app/", std::io::empty()).unwrap();
        let mut file = tar::Header::new_gnu();
        file.set_mode(0o600);
        file.set_size(2);
        builder.append_data(&mut file, "etc/app/key", &b"k1"[..]).unwrap();
        let archive = builder.into_inner().unwrap();

        let files = archive_files(&archive).unwrap();
        assert_eq!(files, vec![("/etc/app/key".to_string(), 0o600, b"k1".to_vec())]);
    }

    #[test]
    fn steps_parse_from_json() {
        let steps: Vec<BuildStep> =
            serde_json::from_str(r#"[{"type":"run","command":"make"},{"type":"workdir","path":"/w"}]"#)
                .unwrap();
        assert_eq!(
            steps,
            vec![
                BuildStep::Run {
                    command: "make".into()
                },
                BuildStep::Workdir { path: "/w".into() }
            ]
        );
    }
}

//! Containers on the local host, driven through the `docker` (or compatible) CLI.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{http_client, EnvLookup, InstanceCell, SandboxRequest, WaitSettings};
use crate::errors::{SandboxError, SandboxResult};
use crate::lifecycle::StopAction;
use crate::models::{
    ExecOptions, ExecOutput, ExposedPort, ProviderKind, SandboxInfo, SandboxInstance,
    StatusReport, TerminalOptions, TerminalSession, DEFAULT_PTY_PORT, DEFAULT_WORKER_PORT,
    DEFAULT_WORKSPACE_PORT,
};
use crate::process::{
    classify_remote_exit, find_binary, run_checked, run_with_timeout, with_remote_timeout,
    TRANSPORT_GRACE,
};
use crate::provider::Sandbox;
use crate::readiness::{wait_until, Probe};
use crate::terminal::open_terminal;
use fabric_identity::WORKSPACE_ENV;

const CLI_TIMEOUT: Duration = Duration::from_secs(60);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
pub struct LocalConfig {
    /// Container CLI; `docker` unless overridden.
    pub runtime: String,
    pub image: String,
    /// Host directory holding per-workspace data, mounted into each container.
    pub data_dir: PathBuf,
    pub mount: String,
    pub published_ports: Vec<u16>,
    /// Overrides the image's default command when non-empty.
    pub command: Vec<String>,
    pub wait: WaitSettings,
}

impl LocalConfig {
    pub fn new(image: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime: "docker".to_string(),
            image: image.into(),
            data_dir: data_dir.into(),
            mount: "/workspace".to_string(),
            published_ports: vec![DEFAULT_WORKER_PORT, DEFAULT_WORKSPACE_PORT, DEFAULT_PTY_PORT],
            command: Vec::new(),
            wait: WaitSettings {
                interval: Duration::from_millis(500),
                timeout: Duration::from_secs(120),
            },
        }
    }

    pub(crate) fn from_lookup(env: &EnvLookup<'_>) -> SandboxResult<Self> {
        let mut config = Self::new(
            env.required("FABRIC_CONTAINER_IMAGE")?,
            env.required("FABRIC_DATA_DIR")?,
        );
        config.runtime = env.or("FABRIC_CONTAINER_RUNTIME", "docker");
        config.mount = env.or("FABRIC_CONTAINER_MOUNT", "/workspace");
        if let Some(extra) = env.optional("FABRIC_CONTAINER_PORTS") {
            for raw in extra.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let port: u16 = raw.parse().map_err(|_| {
                    SandboxError::Configuration(format!("FABRIC_CONTAINER_PORTS has invalid port '{raw}'"))
                })?;
                if !config.published_ports.contains(&port) {
                    config.published_ports.push(port);
                }
            }
        }
        Ok(config)
    }

    fn workspace_dir(&self, workspace: &str) -> PathBuf {
        self.data_dir.join(workspace)
    }
}

/// Translate a host path inside `host_root` to its location under `mount`.
///
/// Paths outside `host_root` are returned unchanged.
pub(crate) fn map_path(host_root: &Path, mount: &str, path: &str) -> String {
    match Path::new(path).strip_prefix(host_root) {
        Ok(rest) if rest.as_os_str().is_empty() => mount.to_string(),
        Ok(rest) => format!("{}/{}", mount.trim_end_matches('/'), rest.display()),
        Err(_) => path.to_string(),
    }
}

/// Arguments for `<runtime> run`.
pub(crate) fn run_args(
    config: &LocalConfig,
    request: &SandboxRequest,
    name: &str,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--label".to_string(),
        format!("fabric.workspace={}", request.workspace),
        "-v".to_string(),
        format!(
            "{}:{}",
            config.workspace_dir(&request.workspace).display(),
            config.mount
        ),
        "-e".to_string(),
        format!("{WORKSPACE_ENV}={}", request.workspace),
    ];
    for var in &request.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", var.key, var.value));
    }
    for port in &config.published_ports {
        args.push("-p".to_string());
        args.push(format!("127.0.0.1::{port}"));
    }
    args.push(
        request
            .snapshot_id
            .clone()
            .unwrap_or_else(|| config.image.clone()),
    );
    args.extend(config.command.iter().cloned());
    args
}

/// Host port from `docker port` output such as `127.0.0.1:49153`.
pub(crate) fn parse_port_mapping(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.parse().ok())
}

fn container_name(workspace: &str) -> String {
    let sanitized: String = workspace
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("fabric-{sanitized}-{}", &suffix[..8])
}

pub struct LocalSandbox {
    config: LocalConfig,
    request: SandboxRequest,
    client: Client,
    state: InstanceCell,
    host_ports: Mutex<HashMap<u16, u16>>,
}

impl LocalSandbox {
    pub fn new(config: LocalConfig, request: SandboxRequest) -> Self {
        let client = http_client(Duration::from_secs(30)).unwrap_or_default();
        Self {
            config,
            request,
            client,
            state: InstanceCell::default(),
            host_ports: Mutex::new(HashMap::new()),
        }
    }

    fn runtime(&self) -> SandboxResult<Command> {
        Ok(Command::new(find_binary(&self.config.runtime)?))
    }

    async fn cli(&self, args: &[&str]) -> SandboxResult<String> {
        let mut command = self.runtime()?;
        command.args(args);
        run_checked(command, CLI_TIMEOUT).await
    }

    fn port_url(&self, port: u16) -> SandboxResult<String> {
        let host_port = self.host_ports.lock().get(&port).copied().ok_or_else(|| {
            SandboxError::InvalidRequest(format!(
                "port {port} is not published; add it to FABRIC_CONTAINER_PORTS"
            ))
        })?;
        Ok(format!("http://127.0.0.1:{host_port}"))
    }

    fn info(&self, id: &str) -> SandboxResult<SandboxInfo> {
        Ok(SandboxInfo {
            url: self.port_url(DEFAULT_WORKER_PORT)?,
            workspace_url: self.port_url(DEFAULT_WORKSPACE_PORT)?,
            instance_id: id.to_string(),
            task_run_id: self.request.task_run_id.clone(),
            provider: ProviderKind::LocalContainer,
        })
    }

    async fn container_state(&self, name: &str) -> SandboxResult<String> {
        Ok(self
            .cli(&["inspect", "-f", "{{.State.Status}}", name])
            .await?
            .trim()
            .to_string())
    }

    async fn remove(&self, name: &str) -> SandboxResult<()> {
        match self.cli(&["rm", "-f", name]).await {
            Err(SandboxError::CommandFailed { message, .. })
                if message.contains("No such container") =>
            {
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn provision(&self) -> SandboxResult<SandboxInfo> {
        let host_dir = self.config.workspace_dir(&self.request.workspace);
        tokio::fs::create_dir_all(&host_dir).await?;

        let name = container_name(&self.request.workspace);
        let args = run_args(&self.config, &self.request, &name);
        let mut command = self.runtime()?;
        command.args(&args);
        if let Err(error) = run_checked(command, CLI_TIMEOUT).await {
            return Err(SandboxError::provisioning(
                ProviderKind::LocalContainer,
                error.to_string(),
            ));
        }
        self.state
            .publish(name.clone(), ProviderKind::LocalContainer, &self.request.workspace);
        tracing::info!(container = %name, image = %self.config.image, "container started");

        let (this, name_ref) = (self, name.as_str());
        wait_until(
            move || async move {
                let state = this.container_state(name_ref).await?;
                Ok::<_, SandboxError>(match state.as_str() {
                    "running" => Probe::Ready(()),
                    "exited" | "dead" => Probe::Failed(format!("container {state}")),
                    _ => Probe::Pending,
                })
            },
            self.config.wait.interval,
            self.config.wait.timeout,
            &CancellationToken::new(),
        )
        .await
        .into_result(ProviderKind::LocalContainer, "container")?;

        let mut ports = HashMap::new();
        for port in &self.config.published_ports {
            let output = self.cli(&["port", &name, &format!("{port}/tcp")]).await?;
            let host_port = parse_port_mapping(&output).ok_or_else(|| {
                SandboxError::provisioning(
                    ProviderKind::LocalContainer,
                    format!("no host mapping for port {port}: {}", output.trim()),
                )
            })?;
            ports.insert(*port, host_port);
        }
        *self.host_ports.lock() = ports;
        self.info(&name)
    }

    fn exec_command(&self, name: &str, options: &ExecOptions, interactive: bool) -> SandboxResult<Command> {
        let host_root = self.config.workspace_dir(&self.request.workspace);
        let mut command = self.runtime()?;
        command.arg("exec");
        if interactive {
            command.arg("-i");
        }
        if let Some(cwd) = &options.cwd {
            command.arg("-w").arg(map_path(&host_root, &self.config.mount, cwd));
        }
        for var in &options.env {
            command.arg("-e").arg(format!("{}={}", var.key, var.value));
        }
        command.arg(name);
        let argv = options
            .argv()
            .iter()
            .map(|arg| map_path(&host_root, &self.config.mount, arg))
            .collect();
        command.args(with_remote_timeout(argv, options.effective_timeout()));
        Ok(command)
    }

    async fn exec_with_stdin(&self, options: ExecOptions, stdin: Vec<u8>) -> SandboxResult<()> {
        let name = self.state.running_id()?;
        let command = self.exec_command(&name, &options, true)?;
        let output = run_with_timeout(command, Some(stdin), UPLOAD_TIMEOUT).await?;
        if !output.success() {
            return Err(SandboxError::CommandFailed {
                command: options.to_shell_line(),
                message: format!("exit {}: {}", output.exit_code, output.stderr.trim()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn provider(&self) -> ProviderKind {
        ProviderKind::LocalContainer
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
                tracing::warn!(%error, "container failed to start; rolling back");
                if let Some(name) = self.state.id() {
                    if let Err(cleanup) = self.remove(&name).await {
                        tracing::warn!(error = %cleanup, container = %name, "rollback remove failed");
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
        let Some(name) = self.state.id() else {
            self.state.lifecycle.mark_stopped();
            return Ok(());
        };
        match self.remove(&name).await {
            Ok(()) => {
                tracing::info!(container = %name, "container removed");
                self.host_ports.lock().clear();
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
        let name = self.state.running_id()?;
        let timeout = options.effective_timeout();
        let command = self.exec_command(&name, &options, false)?;
        let started = Instant::now();
        let output = run_with_timeout(command, None, timeout + TRANSPORT_GRACE).await?;
        classify_remote_exit(output, timeout, started.elapsed())
    }

    async fn upload_file(&self, path: &str, contents: &[u8]) -> SandboxResult<()> {
        let options = ExecOptions::new("sh")
            .arg("-c")
            .arg(r#"mkdir -p "$(dirname "$1")" && cat > "$1""#)
            .arg("sh")
            .arg(path)
            .timeout(UPLOAD_TIMEOUT);
        self.exec_with_stdin(options, contents.to_vec()).await
    }

    async fn upload_tar(&self, archive: Vec<u8>) -> SandboxResult<()> {
        let options = ExecOptions::new("tar")
            .args(["-x", "-C", "/"])
            .timeout(UPLOAD_TIMEOUT);
        self.exec_with_stdin(options, archive).await
    }

    async fn create_terminal(&self, options: TerminalOptions) -> SandboxResult<TerminalSession> {
        self.state.running_id()?;
        let base = self.port_url(DEFAULT_PTY_PORT)?;
        open_terminal(self, &self.client, &base, &options).await
    }

    async fn get_status(&self) -> SandboxResult<StatusReport> {
        let Some(name) = self.state.id() else {
            return Ok(StatusReport::not_running());
        };
        match self.container_state(&name).await {
            Ok(state) if state == "running" => Ok(StatusReport {
                running: true,
                info: Some(self.info(&name)?),
            }),
            Ok(_) => Ok(StatusReport::not_running()),
            Err(SandboxError::CommandFailed { .. }) => Ok(StatusReport::not_running()),
            Err(error) => Err(error),
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

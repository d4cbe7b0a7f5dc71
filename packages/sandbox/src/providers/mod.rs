//! Concrete compute backends behind the [`Sandbox`] trait.

mod daemon;
mod local;
mod template;
mod vm;

pub use daemon::{DaemonConfig, DaemonSandbox};
pub use local::{LocalConfig, LocalSandbox};
pub use template::{render_build_spec, BuildStep, TemplateConfig, TemplateSandbox};
pub use vm::{parse_ssh_target, SshTarget, VmConfig, VmSandbox};

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fabric_identity::WorkspaceIdentity;
use parking_lot::Mutex;

use crate::errors::{SandboxError, SandboxResult};
use crate::lifecycle::Lifecycle;
use crate::models::{
    EnvVar, ExecOptions, ExecOutput, ExposedPort, ProviderKind, SandboxInfo, SandboxInstance,
    SandboxStatus, StatusReport, TerminalOptions, TerminalSession,
};
use crate::provider::Sandbox;

pub const PROVIDER_ENV: &str = "FABRIC_PROVIDER";

/// What to launch. Shared by every provider.
#[derive(Clone, Debug, Default)]
pub struct SandboxRequest {
    /// Workspace name; also the source of the sandbox's network identity.
    pub workspace: String,
    pub task_run_id: Option<String>,
    /// Snapshot or image override for providers that boot from one.
    pub snapshot_id: Option<String>,
    pub env: Vec<EnvVar>,
}

impl SandboxRequest {
    pub fn new(workspace: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            ..Default::default()
        }
    }
}

/// How long to wait for a provider resource and how often to look.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Lifecycle plus the instance record an adapter publishes.
#[derive(Debug, Default)]
pub(crate) struct InstanceCell {
    pub(crate) lifecycle: Lifecycle,
    record: Mutex<Option<SandboxInstance>>,
}

impl InstanceCell {
    pub(crate) fn snapshot(&self) -> Option<SandboxInstance> {
        let mut record = self.record.lock().clone()?;
        if let Some(status) = self.lifecycle.status() {
            record.status = status;
        }
        Some(record)
    }

    pub(crate) fn publish(&self, id: String, provider: ProviderKind, workspace: &str) {
        *self.record.lock() = Some(SandboxInstance {
            id,
            provider,
            status: SandboxStatus::Starting,
            network_identity: WorkspaceIdentity::from_name(workspace),
            exposed_ports: Vec::new(),
            created_at: Utc::now(),
        });
    }

    pub(crate) fn id(&self) -> Option<String> {
        self.record.lock().as_ref().map(|r| r.id.clone())
    }

    /// The id of a running sandbox, or an invalid-state error.
    pub(crate) fn running_id(&self) -> SandboxResult<String> {
        self.lifecycle.ensure_running()?;
        self.id()
            .ok_or_else(|| SandboxError::Internal("running sandbox has no id".to_string()))
    }

    pub(crate) fn record_port(&self, port: ExposedPort) {
        if let Some(record) = self.record.lock().as_mut() {
            record.exposed_ports.retain(|p| p.name != port.name);
            record.exposed_ports.push(port);
        }
    }
}

/// Provider selection and settings, resolved once at startup.
#[derive(Clone, Debug)]
pub enum ProviderConfig {
    Local(LocalConfig),
    Vm(VmConfig),
    Template(TemplateConfig),
    Daemon(DaemonConfig),
}

impl ProviderConfig {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderConfig::Local(_) => ProviderKind::LocalContainer,
            ProviderConfig::Vm(_) => ProviderKind::Vm,
            ProviderConfig::Template(_) => ProviderKind::Template,
            ProviderConfig::Daemon(_) => ProviderKind::Daemon,
        }
    }

    /// Read configuration from the process environment, failing on anything missing.
    pub fn from_env() -> SandboxResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> SandboxResult<Self> {
        let env = EnvLookup(&lookup);
        let kind = match env.optional(PROVIDER_ENV) {
            Some(raw) => raw.parse::<ProviderKind>().map_err(SandboxError::Configuration)?,
            None => ProviderKind::LocalContainer,
        };
        let config = match kind {
            ProviderKind::LocalContainer => ProviderConfig::Local(LocalConfig::from_lookup(&env)?),
            ProviderKind::Vm => ProviderConfig::Vm(VmConfig::from_lookup(&env)?),
            ProviderKind::Template => ProviderConfig::Template(TemplateConfig::from_lookup(&env)?),
            ProviderKind::Daemon => ProviderConfig::Daemon(DaemonConfig::from_lookup(&env)?),
        };
        Ok(config)
    }

    /// A fresh, unstarted adapter for `request`.
    pub fn build(&self, request: SandboxRequest) -> SandboxResult<AnySandbox> {
        if request.workspace.trim().is_empty() {
            return Err(SandboxError::InvalidRequest(
                "workspace name must not be empty".to_string(),
            ));
        }
        Ok(match self {
            ProviderConfig::Local(config) => {
                AnySandbox::Local(LocalSandbox::new(config.clone(), request))
            }
            ProviderConfig::Vm(config) => AnySandbox::Vm(VmSandbox::new(config.clone(), request)?),
            ProviderConfig::Template(config) => {
                AnySandbox::Template(TemplateSandbox::new(config.clone(), request)?)
            }
            ProviderConfig::Daemon(config) => {
                AnySandbox::Daemon(DaemonSandbox::new(config.clone(), request)?)
            }
        })
    }
}

pub(crate) struct EnvLookup<'a>(&'a dyn Fn(&str) -> Option<String>);

impl EnvLookup<'_> {
    pub(crate) fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub(crate) fn required(&self, key: &str) -> SandboxResult<String> {
        self.optional(key)
            .ok_or_else(|| SandboxError::Configuration(format!("{key} must be set")))
    }

    pub(crate) fn or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }
}

pub(crate) fn http_client(timeout: Duration) -> SandboxResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(SandboxError::from)
}

/// One adapter per provider, chosen at runtime from a [`ProviderConfig`].
pub enum AnySandbox {
    Local(LocalSandbox),
    Vm(VmSandbox),
    Template(TemplateSandbox),
    Daemon(DaemonSandbox),
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $call:expr) => {
        match $self {
            AnySandbox::Local($inner) => $call,
            AnySandbox::Vm($inner) => $call,
            AnySandbox::Template($inner) => $call,
            AnySandbox::Daemon($inner) => $call,
        }
    };
}

#[async_trait]
impl Sandbox for AnySandbox {
    fn provider(&self) -> ProviderKind {
        delegate!(self, s => s.provider())
    }

    fn instance(&self) -> Option<SandboxInstance> {
        delegate!(self, s => s.instance())
    }

    async fn start(&self) -> SandboxResult<SandboxInfo> {
        delegate!(self, s => s.start().await)
    }

    async fn stop(&self) -> SandboxResult<()> {
        delegate!(self, s => s.stop().await)
    }

    async fn exec(&self, options: ExecOptions) -> SandboxResult<ExecOutput> {
        delegate!(self, s => s.exec(options).await)
    }

    async fn upload_file(&self, path: &str, contents: &[u8]) -> SandboxResult<()> {
        delegate!(self, s => s.upload_file(path, contents).await)
    }

    async fn upload_tar(&self, archive: Vec<u8>) -> SandboxResult<()> {
        delegate!(self, s => s.upload_tar(archive).await)
    }

    async fn create_terminal(&self, options: TerminalOptions) -> SandboxResult<TerminalSession> {
        delegate!(self, s => s.create_terminal(options).await)
    }

    async fn get_status(&self) -> SandboxResult<StatusReport> {
        delegate!(self, s => s.get_status().await)
    }

    async fn expose_port(&self, name: &str, port: u16) -> SandboxResult<ExposedPort> {
        delegate!(self, s => s.expose_port(name, port).await)
    }
}

pub mod errors;
pub mod lifecycle;
pub mod models;
pub mod process;
pub mod provider;
pub mod providers;
pub mod readiness;
pub mod retry;
pub mod terminal;

pub use errors::{ErrorBody, SandboxError, SandboxResult};
pub use models::{
    AuthFile, EnvVar, ExecOptions, ExecOutput, ExposedPort, ProviderKind, SandboxInfo,
    SandboxInstance, SandboxStatus, StatusReport, TerminalOptions, TerminalSession,
};
pub use provider::Sandbox;
pub use providers::{
    AnySandbox, DaemonConfig, DaemonSandbox, LocalConfig, LocalSandbox, ProviderConfig,
    SandboxRequest, TemplateConfig, TemplateSandbox, VmConfig, VmSandbox, WaitSettings,
};
pub use readiness::{wait_until, Probe, WaitOutcome};
pub use retry::{retry_with_backoff, RetryPolicy};

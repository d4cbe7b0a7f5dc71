use async_trait::async_trait;

use crate::errors::SandboxResult;
use crate::models::{
    ExecOptions, ExecOutput, ExposedPort, ProviderKind, SandboxInfo, SandboxInstance,
    StatusReport, TerminalOptions, TerminalSession,
};

/// Capabilities every compute backend offers for one sandbox.
///
/// An adapter value owns exactly one sandbox. `start` may be called once; everything else
/// requires the sandbox to be running except `stop` and `get_status`, which are safe in any
/// state.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// Snapshot of the instance record, `None` before `start`.
    fn instance(&self) -> Option<SandboxInstance>;

    /// Provision, wait for readiness and return reachable URLs. A failure part way through
    /// removes whatever was created before returning the error.
    async fn start(&self) -> SandboxResult<SandboxInfo>;

    /// Tear down. Succeeds on sandboxes that are already gone or were never started.
    async fn stop(&self) -> SandboxResult<()>;

    async fn exec(&self, options: ExecOptions) -> SandboxResult<ExecOutput>;

    async fn upload_file(&self, path: &str, contents: &[u8]) -> SandboxResult<()>;

    /// Extract a tar archive at the sandbox root.
    async fn upload_tar(&self, archive: Vec<u8>) -> SandboxResult<()>;

    async fn create_terminal(&self, options: TerminalOptions) -> SandboxResult<TerminalSession>;

    async fn get_status(&self) -> SandboxResult<StatusReport>;

    async fn expose_port(&self, name: &str, port: u16) -> SandboxResult<ExposedPort>;
}

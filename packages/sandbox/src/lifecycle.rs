use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::errors::{SandboxError, SandboxResult};
use crate::models::SandboxStatus;

/// Allowed forward moves. `Failed` and `Stopped` are terminal.
pub fn can_transition(from: SandboxStatus, to: SandboxStatus) -> bool {
    use SandboxStatus::*;
    matches!(
        (from, to),
        (Starting, Running)
            | (Starting, Failed)
            | (Starting, Stopping)
            | (Running, Stopping)
            | (Running, Failed)
            | (Stopping, Stopped)
            | (Stopping, Failed)
    )
}

/// What `stop()` should do given the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAction {
    /// Resources may exist; tear them down.
    Teardown,
    /// Nothing to do: never started, already stopped, or failed with nothing left behind.
    Noop,
}

/// Per-sandbox lifecycle state.
///
/// `op` serializes whole lifecycle operations (which await), while `status` guards the
/// state itself and is never held across an await.
#[derive(Debug, Default)]
pub struct Lifecycle {
    status: Mutex<Option<SandboxStatus>>,
    /// Set when a teardown failed and provider resources may still exist.
    teardown_pending: Mutex<bool>,
    op: AsyncMutex<()>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn serialize(&self) -> MutexGuard<'_, ()> {
        self.op.lock().await
    }

    /// `None` until `start()` has been called.
    pub fn status(&self) -> Option<SandboxStatus> {
        *self.status.lock()
    }

    pub fn begin_start(&self) -> SandboxResult<()> {
        let mut status = self.status.lock();
        match *status {
            None => {
                *status = Some(SandboxStatus::Starting);
                Ok(())
            }
            Some(current) => Err(SandboxError::InvalidState {
                status: current,
                expected: "not started",
            }),
        }
    }

    pub fn mark_running(&self) -> SandboxResult<()> {
        self.advance(SandboxStatus::Running)
    }

    pub fn mark_failed(&self) {
        let mut status = self.status.lock();
        if let Some(current) = *status {
            if can_transition(current, SandboxStatus::Failed) {
                *status = Some(SandboxStatus::Failed);
            }
        }
    }

    /// Teardown failed: the sandbox is `Failed`, but `stop()` will try again.
    pub fn mark_teardown_failed(&self) {
        self.mark_failed();
        if self.status() == Some(SandboxStatus::Failed) {
            *self.teardown_pending.lock() = true;
        }
    }

    pub fn begin_stop(&self) -> StopAction {
        let mut status = self.status.lock();
        match *status {
            Some(current) if can_transition(current, SandboxStatus::Stopping) => {
                *status = Some(SandboxStatus::Stopping);
                StopAction::Teardown
            }
            Some(SandboxStatus::Failed) if *self.teardown_pending.lock() => StopAction::Teardown,
            _ => StopAction::Noop,
        }
    }

    /// Teardown succeeded. A failed sandbox stays `Failed`; only the pending flag clears.
    pub fn mark_stopped(&self) {
        let mut status = self.status.lock();
        match *status {
            Some(SandboxStatus::Stopping) => *status = Some(SandboxStatus::Stopped),
            Some(SandboxStatus::Failed) => *self.teardown_pending.lock() = false,
            _ => {}
        }
    }

    pub fn ensure_running(&self) -> SandboxResult<()> {
        match self.status() {
            Some(SandboxStatus::Running) => Ok(()),
            Some(status) => Err(SandboxError::InvalidState {
                status,
                expected: "running",
            }),
            None => Err(SandboxError::InvalidRequest(
                "sandbox has not been started".to_string(),
            )),
        }
    }

    fn advance(&self, to: SandboxStatus) -> SandboxResult<()> {
        let mut status = self.status.lock();
        match *status {
            Some(current) if can_transition(current, to) => {
                *status = Some(to);
                Ok(())
            }
            Some(current) => Err(SandboxError::InvalidState {
                status: current,
                expected: "starting",
            }),
            None => Err(SandboxError::InvalidRequest(
                "sandbox has not been started".to_string(),
            )),
        }
    }
}

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmPoolStatus {
    Provisioning,
    Ready,
    Claimed,
    Failed,
}

impl WarmPoolStatus {
    /// Forward-only moves. `Ready -> Failed` only happens through supersession.
    pub fn can_transition_to(self, next: WarmPoolStatus) -> bool {
        use WarmPoolStatus::*;
        matches!(
            (self, next),
            (Provisioning, Ready) | (Provisioning, Failed) | (Ready, Claimed) | (Ready, Failed)
        )
    }

    /// Provisioning and ready entries still count against a user's single live slot.
    pub fn is_live(self) -> bool {
        matches!(self, WarmPoolStatus::Provisioning | WarmPoolStatus::Ready)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WarmPoolStatus::Provisioning => "provisioning",
            WarmPoolStatus::Ready => "ready",
            WarmPoolStatus::Claimed => "claimed",
            WarmPoolStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for WarmPoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmPoolEntry {
    pub id: String,
    pub status: WarmPoolStatus,
    pub team_id: String,
    pub user_id: String,
    pub snapshot_id: String,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub instance_id: Option<String>,
    pub vscode_url: Option<String>,
    pub worker_url: Option<String>,
    pub claimed_by_task_run_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrewarmRequest {
    pub team_id: String,
    pub user_id: String,
    pub snapshot_id: String,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrewarmOutcome {
    pub id: String,
    pub already_exists: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub team_id: String,
    #[serde(default)]
    pub repo_url: Option<String>,
    pub task_run_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedInstance {
    pub entry_id: String,
    pub instance_id: String,
    pub vscode_url: String,
    pub worker_url: String,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
}

/// What a provisioner reports once the sandbox behind an entry is up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyUpdate {
    pub instance_id: String,
    pub vscode_url: String,
    pub worker_url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedUpdate {
    pub error_message: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub removed_count: usize,
}

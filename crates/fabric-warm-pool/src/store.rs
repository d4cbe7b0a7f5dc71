//! The entry store and the operations that mutate it.
//!
//! Every read-modify-write runs under the single `entries` lock, which is what makes two
//! racing claims for the same entry resolve to exactly one winner.

use std::sync::Arc;

use chrono::Duration;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::entry::{
    ClaimRequest, ClaimedInstance, CleanupReport, PrewarmOutcome, PrewarmRequest, ReadyUpdate,
    WarmPoolEntry, WarmPoolStatus,
};
use crate::errors::{PoolError, PoolResult};

pub const SUPERSEDED_MESSAGE: &str = "superseded by new prewarm request";

/// How long an entry may sit in each state before the reaper deletes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReaperPolicy {
    pub failed_ttl: Duration,
    pub claimed_ttl: Duration,
    pub provisioning_ttl: Duration,
    pub ready_ttl: Duration,
}

impl Default for ReaperPolicy {
    fn default() -> Self {
        Self {
            failed_ttl: Duration::hours(1),
            claimed_ttl: Duration::hours(24),
            provisioning_ttl: Duration::minutes(10),
            ready_ttl: Duration::minutes(50),
        }
    }
}

impl ReaperPolicy {
    pub fn ttl_for(&self, status: WarmPoolStatus) -> Duration {
        match status {
            WarmPoolStatus::Failed => self.failed_ttl,
            WarmPoolStatus::Claimed => self.claimed_ttl,
            WarmPoolStatus::Provisioning => self.provisioning_ttl,
            WarmPoolStatus::Ready => self.ready_ttl,
        }
    }
}

pub struct WarmPool {
    entries: Mutex<Vec<WarmPoolEntry>>,
    clock: Arc<dyn Clock>,
    policy: ReaperPolicy,
}

impl Default for WarmPool {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), ReaperPolicy::default())
    }
}

fn require(field: &str, value: &str) -> PoolResult<()> {
    if value.trim().is_empty() {
        return Err(PoolError::InvalidRequest(format!("{field} must not be empty")));
    }
    Ok(())
}

impl WarmPool {
    pub fn new(clock: Arc<dyn Clock>, policy: ReaperPolicy) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> ReaperPolicy {
        self.policy
    }

    /// Reuse the caller's live entry for the same repo, or supersede it and start a new one.
    pub fn create_prewarm_entry(&self, request: PrewarmRequest) -> PoolResult<PrewarmOutcome> {
        require("team_id", &request.team_id)?;
        require("user_id", &request.user_id)?;
        require("snapshot_id", &request.snapshot_id)?;

        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let is_mine = |e: &WarmPoolEntry| {
            e.status.is_live() && e.team_id == request.team_id && e.user_id == request.user_id
        };
        if let Some(existing) = entries
            .iter()
            .find(|e| is_mine(e) && e.repo_url == request.repo_url)
        {
            tracing::debug!(entry = %existing.id, "prewarm entry already exists");
            return Ok(PrewarmOutcome {
                id: existing.id.clone(),
                already_exists: true,
            });
        }
        let mut superseded = 0usize;
        for entry in entries.iter_mut().filter(|e| is_mine(e)) {
            entry.status = WarmPoolStatus::Failed;
            entry.error_message = Some(SUPERSEDED_MESSAGE.to_string());
            entry.updated_at = now;
            superseded += 1;
        }

        let id = Uuid::new_v4().to_string();
        entries.push(WarmPoolEntry {
            id: id.clone(),
            status: WarmPoolStatus::Provisioning,
            team_id: request.team_id,
            user_id: request.user_id,
            snapshot_id: request.snapshot_id,
            repo_url: request.repo_url,
            branch: request.branch,
            instance_id: None,
            vscode_url: None,
            worker_url: None,
            claimed_by_task_run_id: None,
            claimed_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        });
        tracing::info!(entry = %id, superseded, "prewarm entry created");
        Ok(PrewarmOutcome {
            id,
            already_exists: false,
        })
    }

    /// Take the first ready entry of the team for the requested repo, if any.
    pub fn claim_instance(&self, request: &ClaimRequest) -> Option<ClaimedInstance> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let entry = entries.iter_mut().find(|e| {
            e.status == WarmPoolStatus::Ready
                && e.team_id == request.team_id
                && e.repo_url == request.repo_url
        })?;
        entry.status = WarmPoolStatus::Claimed;
        entry.claimed_by_task_run_id = Some(request.task_run_id.clone());
        entry.claimed_at = Some(now);
        entry.updated_at = now;
        tracing::info!(entry = %entry.id, task_run = %request.task_run_id, "warm instance claimed");
        Some(ClaimedInstance {
            entry_id: entry.id.clone(),
            instance_id: entry.instance_id.clone().unwrap_or_default(),
            vscode_url: entry.vscode_url.clone().unwrap_or_default(),
            worker_url: entry.worker_url.clone().unwrap_or_default(),
            repo_url: entry.repo_url.clone(),
            branch: entry.branch.clone(),
        })
    }

    /// Record a provisioned instance. Returns whether the entry changed.
    pub fn mark_instance_ready(&self, id: &str, update: ReadyUpdate) -> bool {
        self.transition(id, WarmPoolStatus::Ready, |entry| {
            entry.instance_id = Some(update.instance_id);
            entry.vscode_url = Some(update.vscode_url);
            entry.worker_url = Some(update.worker_url);
        })
    }

    pub fn mark_instance_failed(&self, id: &str, error_message: impl Into<String>) -> bool {
        let message = error_message.into();
        self.transition(id, WarmPoolStatus::Failed, |entry| {
            entry.error_message = Some(message);
        })
    }

    /// Apply a provisioner callback; only entries still provisioning accept one.
    fn transition(
        &self,
        id: &str,
        next: WarmPoolStatus,
        apply: impl FnOnce(&mut WarmPoolEntry),
    ) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let Some(entry) = entries.iter_mut().find(|e| e.id == id) else {
            tracing::debug!(entry = %id, %next, "callback for unknown entry ignored");
            return false;
        };
        if entry.status != WarmPoolStatus::Provisioning {
            tracing::debug!(entry = %id, status = %entry.status, %next, "late callback ignored");
            return false;
        }
        entry.status = next;
        entry.updated_at = now;
        apply(entry);
        tracing::info!(entry = %id, status = %next, "warm pool entry updated");
        true
    }

    /// Delete entries older than their state's TTL.
    pub fn cleanup_stale_entries(&self) -> CleanupReport {
        CleanupReport {
            removed_count: self.take_stale_entries().len(),
        }
    }

    /// Remove and return entries older than their state's TTL.
    pub fn take_stale_entries(&self) -> Vec<WarmPoolEntry> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let (stale, kept): (Vec<_>, Vec<_>) = entries
            .drain(..)
            .partition(|entry| now - entry.created_at > self.policy.ttl_for(entry.status));
        *entries = kept;
        if !stale.is_empty() {
            tracing::info!(removed_count = stale.len(), "removed stale warm pool entries");
        }
        stale
    }

    pub fn get(&self, id: &str) -> Option<WarmPoolEntry> {
        self.entries.lock().iter().find(|e| e.id == id).cloned()
    }

    pub fn entries(&self) -> Vec<WarmPoolEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

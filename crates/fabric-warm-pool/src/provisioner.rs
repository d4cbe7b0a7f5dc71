//! Turns prewarm entries into running sandboxes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fabric_sandbox::{
    retry_with_backoff, AnySandbox, EnvVar, ProviderConfig, RetryPolicy, Sandbox, SandboxRequest,
    SandboxResult,
};
use parking_lot::Mutex;

use crate::entry::{
    ClaimRequest, ClaimedInstance, CleanupReport, PrewarmOutcome, PrewarmRequest, ReadyUpdate,
    WarmPoolEntry, WarmPoolStatus,
};
use crate::errors::PoolResult;
use crate::store::WarmPool;

/// Brings up the sandbox behind one entry.
#[async_trait]
pub trait InstanceLauncher: Send + Sync {
    async fn launch(&self, entry: &WarmPoolEntry) -> SandboxResult<ReadyUpdate>;

    /// Stop the instance launched for `entry_id`, if the launcher still holds it.
    async fn release(&self, entry_id: &str);

    /// Forget the instance launched for `entry_id` without stopping it.
    fn hand_off(&self, entry_id: &str);
}

/// Launches through a configured provider and keeps started sandboxes for hand-off.
pub struct SandboxLauncher {
    config: ProviderConfig,
    started: Mutex<HashMap<String, Arc<AnySandbox>>>,
}

impl SandboxLauncher {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            started: Mutex::new(HashMap::new()),
        }
    }

    /// The sandbox started for `entry_id`, removed from the launcher's keeping.
    pub fn take(&self, entry_id: &str) -> Option<Arc<AnySandbox>> {
        self.started.lock().remove(entry_id)
    }
}

fn sandbox_request(entry: &WarmPoolEntry) -> SandboxRequest {
    let mut request = SandboxRequest::new(format!("warm-{}", entry.id));
    request.snapshot_id = Some(entry.snapshot_id.clone());
    if let Some(repo) = &entry.repo_url {
        request.env.push(EnvVar::new("FABRIC_REPO_URL", repo.clone()));
    }
    if let Some(branch) = &entry.branch {
        request.env.push(EnvVar::new("FABRIC_BRANCH", branch.clone()));
    }
    request
}

#[async_trait]
impl InstanceLauncher for SandboxLauncher {
    async fn launch(&self, entry: &WarmPoolEntry) -> SandboxResult<ReadyUpdate> {
        let sandbox = Arc::new(self.config.build(sandbox_request(entry))?);
        let info = sandbox.start().await?;
        self.started.lock().insert(entry.id.clone(), sandbox);
        Ok(ReadyUpdate {
            instance_id: info.instance_id,
            vscode_url: info.workspace_url,
            worker_url: info.url,
        })
    }

    async fn release(&self, entry_id: &str) {
        let Some(sandbox) = self.take(entry_id) else {
            return;
        };
        match sandbox.stop().await {
            Ok(()) => tracing::info!(entry = %entry_id, "warm instance stopped"),
            Err(error) => {
                tracing::warn!(entry = %entry_id, %error, "failed to stop warm instance")
            }
        }
    }

    fn hand_off(&self, entry_id: &str) {
        if self.take(entry_id).is_some() {
            tracing::debug!(entry = %entry_id, "warm instance handed to claimant");
        }
    }
}

#[derive(Clone)]
pub struct Provisioner {
    pool: Arc<WarmPool>,
    launcher: Arc<dyn InstanceLauncher>,
    retry: RetryPolicy,
}

impl Provisioner {
    pub fn new(pool: Arc<WarmPool>, launcher: Arc<dyn InstanceLauncher>, retry: RetryPolicy) -> Self {
        Self {
            pool,
            launcher,
            retry,
        }
    }

    pub fn pool(&self) -> &Arc<WarmPool> {
        &self.pool
    }

    /// Create the entry and, when it is new, provision it in the background.
    pub fn prewarm(&self, request: PrewarmRequest) -> PoolResult<PrewarmOutcome> {
        let outcome = self.pool.create_prewarm_entry(request)?;
        if !outcome.already_exists {
            let this = self.clone();
            let id = outcome.id.clone();
            tokio::spawn(async move {
                this.provision(&id).await;
            });
        }
        Ok(outcome)
    }

    /// Launch the sandbox for entry `id` with retries, then report the result to the pool.
    /// Returns whether the entry became ready.
    pub async fn provision(&self, id: &str) -> bool {
        let Some(entry) = self.pool.get(id) else {
            return false;
        };
        if entry.status != WarmPoolStatus::Provisioning {
            return false;
        }
        let launcher = &self.launcher;
        let entry_ref = &entry;
        let result = retry_with_backoff(self.retry, move |attempt| async move {
            tracing::debug!(entry = %entry_ref.id, attempt, "launching warm instance");
            launcher.launch(entry_ref).await
        })
        .await;
        match result {
            Ok(update) => {
                if self.pool.mark_instance_ready(id, update) {
                    return true;
                }
                // Reaped or superseded while launching; nobody can claim this instance.
                tracing::info!(entry = %id, "entry no longer provisioning; stopping its instance");
                self.launcher.release(id).await;
                false
            }
            Err(error) => {
                tracing::warn!(entry = %id, %error, "warm instance provisioning failed");
                self.pool.mark_instance_failed(id, error.to_string());
                false
            }
        }
    }

    /// Claim a ready entry; its instance leaves the launcher with the claim.
    pub fn claim(&self, request: &ClaimRequest) -> Option<ClaimedInstance> {
        let claimed = self.pool.claim_instance(request)?;
        self.launcher.hand_off(&claimed.entry_id);
        Some(claimed)
    }

    /// Drop stale entries and stop the instances they still hold.
    pub async fn reap(&self) -> CleanupReport {
        let stale = self.pool.take_stale_entries();
        for entry in stale.iter().filter(|e| e.status != WarmPoolStatus::Claimed) {
            self.launcher.release(&entry.id).await;
        }
        CleanupReport {
            removed_count: stale.len(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use fabric_sandbox::{ProviderKind, SandboxError};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Launches fake instances and records what happens to them.
    #[derive(Default)]
    pub(crate) struct RecordingLauncher {
        pub failures_before_success: u32,
        pub calls: AtomicU32,
        /// Runs while a launch is in flight.
        pub during_launch: Option<Box<dyn Fn() + Send + Sync>>,
        pub released: Mutex<Vec<String>>,
        pub handed_off: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl InstanceLauncher for RecordingLauncher {
        async fn launch(&self, entry: &WarmPoolEntry) -> SandboxResult<ReadyUpdate> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures_before_success {
                return Err(SandboxError::provisioning(ProviderKind::Vm, "capacity"));
            }
            if let Some(hook) = &self.during_launch {
                hook();
            }
            Ok(ReadyUpdate {
                instance_id: format!("vm-{}", entry.id),
                vscode_url: "https://vscode".into(),
                worker_url: "https://worker".into(),
            })
        }

        async fn release(&self, entry_id: &str) {
            self.released.lock().push(entry_id.to_string());
        }

        fn hand_off(&self, entry_id: &str) {
            self.handed_off.lock().push(entry_id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingLauncher;
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::store::ReaperPolicy;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn setup(failures: u32) -> (Provisioner, Arc<RecordingLauncher>) {
        let pool = Arc::new(WarmPool::new(Arc::new(SystemClock), ReaperPolicy::default()));
        let launcher = Arc::new(RecordingLauncher {
            failures_before_success: failures,
            ..Default::default()
        });
        (Provisioner::new(pool, launcher.clone(), fast_retry()), launcher)
    }

    fn request() -> PrewarmRequest {
        PrewarmRequest {
            team_id: "t".into(),
            user_id: "u".into(),
            snapshot_id: "snap".into(),
            repo_url: Some("https://github.com/acme/app".into()),
            branch: None,
        }
    }

    fn claim_request() -> ClaimRequest {
        ClaimRequest {
            team_id: "t".into(),
            repo_url: Some("https://github.com/acme/app".into()),
            task_run_id: "run-1".into(),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (provisioner, launcher) = setup(2);
        let outcome = provisioner.pool().create_prewarm_entry(request()).unwrap();
        assert!(provisioner.provision(&outcome.id).await);
        assert_eq!(launcher.calls.load(Ordering::SeqCst), 3);
        let entry = provisioner.pool().get(&outcome.id).unwrap();
        assert_eq!(entry.status, WarmPoolStatus::Ready);
        assert_eq!(entry.instance_id, Some(format!("vm-{}", outcome.id)));
        assert!(launcher.released.lock().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_entry() {
        let (provisioner, launcher) = setup(10);
        let outcome = provisioner.pool().create_prewarm_entry(request()).unwrap();
        assert!(!provisioner.provision(&outcome.id).await);
        assert_eq!(launcher.calls.load(Ordering::SeqCst), 3);
        let entry = provisioner.pool().get(&outcome.id).unwrap();
        assert_eq!(entry.status, WarmPoolStatus::Failed);
        assert!(entry.error_message.unwrap().contains("capacity"));
    }

    #[tokio::test]
    async fn prewarm_provisions_in_background() {
        let (provisioner, _) = setup(0);
        let outcome = provisioner.prewarm(request()).unwrap();
        for _ in 0..100 {
            if provisioner.pool().get(&outcome.id).unwrap().status == WarmPoolStatus::Ready {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("entry never became ready");
    }

    #[tokio::test]
    async fn instance_superseded_mid_launch_is_stopped() {
        let pool = Arc::new(WarmPool::default());
        let superseding = pool.clone();
        let launcher = Arc::new(RecordingLauncher {
            during_launch: Some(Box::new(move || {
                let mut newer = request();
                newer.repo_url = Some("https://github.com/acme/other".into());
                superseding.create_prewarm_entry(newer).unwrap();
            })),
            ..Default::default()
        });
        let provisioner = Provisioner::new(pool.clone(), launcher.clone(), fast_retry());

        let outcome = pool.create_prewarm_entry(request()).unwrap();
        assert!(!provisioner.provision(&outcome.id).await);
        assert_eq!(pool.get(&outcome.id).unwrap().status, WarmPoolStatus::Failed);
        assert_eq!(launcher.released.lock().as_slice(), [outcome.id.clone()]);
    }

    #[tokio::test]
    async fn instance_reaped_mid_launch_is_stopped() {
        let clock = Arc::new(ManualClock::default());
        let pool = Arc::new(WarmPool::new(clock.clone(), ReaperPolicy::default()));
        let reaping = pool.clone();
        let launcher = Arc::new(RecordingLauncher {
            during_launch: Some(Box::new(move || {
                clock.advance(chrono::Duration::minutes(11));
                assert_eq!(reaping.take_stale_entries().len(), 1);
            })),
            ..Default::default()
        });
        let provisioner = Provisioner::new(pool.clone(), launcher.clone(), fast_retry());

        let outcome = pool.create_prewarm_entry(request()).unwrap();
        assert!(!provisioner.provision(&outcome.id).await);
        assert!(pool.is_empty());
        assert_eq!(launcher.released.lock().as_slice(), [outcome.id.clone()]);
    }

    #[tokio::test]
    async fn claim_hands_instance_to_claimant() {
        let (provisioner, launcher) = setup(0);
        let outcome = provisioner.pool().create_prewarm_entry(request()).unwrap();
        assert!(provisioner.provision(&outcome.id).await);

        let claimed = provisioner.claim(&claim_request()).unwrap();
        assert_eq!(claimed.entry_id, outcome.id);
        assert_eq!(launcher.handed_off.lock().as_slice(), [outcome.id.clone()]);
        assert!(provisioner.claim(&claim_request()).is_none());
        assert_eq!(launcher.handed_off.lock().len(), 1);
    }

    #[tokio::test]
    async fn reap_stops_unclaimed_instances_only() {
        let clock = Arc::new(ManualClock::default());
        let pool = Arc::new(WarmPool::new(clock.clone(), ReaperPolicy::default()));
        let launcher = Arc::new(RecordingLauncher::default());
        let provisioner = Provisioner::new(pool.clone(), launcher.clone(), fast_retry());

        let ready = pool.create_prewarm_entry(request()).unwrap();
        assert!(provisioner.provision(&ready.id).await);
        let mut other = request();
        other.user_id = "u2".into();
        other.repo_url = Some("https://github.com/acme/claimed".into());
        let claimed = pool.create_prewarm_entry(other).unwrap();
        assert!(provisioner.provision(&claimed.id).await);
        provisioner
            .claim(&ClaimRequest {
                team_id: "t".into(),
                repo_url: Some("https://github.com/acme/claimed".into()),
                task_run_id: "run-9".into(),
            })
            .unwrap();

        clock.advance(chrono::Duration::hours(1));
        assert_eq!(provisioner.reap().await.removed_count, 1);
        assert_eq!(launcher.released.lock().as_slice(), [ready.id.clone()]);

        clock.advance(chrono::Duration::hours(24));
        assert_eq!(provisioner.reap().await.removed_count, 1);
        assert_eq!(launcher.released.lock().len(), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn sandbox_request_carries_repo_metadata() {
        let pool = WarmPool::default();
        let outcome = pool.create_prewarm_entry(request()).unwrap();
        let entry = pool.get(&outcome.id).unwrap();
        let sandbox_request = sandbox_request(&entry);
        assert_eq!(sandbox_request.workspace, format!("warm-{}", entry.id));
        assert_eq!(sandbox_request.snapshot_id.as_deref(), Some("snap"));
        assert_eq!(
            sandbox_request.env,
            vec![EnvVar::new("FABRIC_REPO_URL", "https://github.com/acme/app")]
        );
    }
}

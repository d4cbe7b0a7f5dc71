use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;

pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Run [`AppState::cleanup`] every `interval` until `cancel` fires.
pub fn spawn_reaper(
    state: AppState,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("warm pool reaper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    state.cleanup().await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::entry::PrewarmRequest;
    use crate::store::{ReaperPolicy, WarmPool};

    #[tokio::test(start_paused = true)]
    async fn reaper_removes_expired_entries_and_stops_on_cancel() {
        let clock = Arc::new(ManualClock::default());
        let pool = Arc::new(WarmPool::new(clock.clone(), ReaperPolicy::default()));
        pool.create_prewarm_entry(PrewarmRequest {
            team_id: "t".into(),
            user_id: "u".into(),
            snapshot_id: "s".into(),
            ..Default::default()
        })
        .unwrap();

        let cancel = CancellationToken::new();
        let handle = spawn_reaper(
            AppState::callbacks_only(pool.clone()),
            Duration::from_secs(30),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(pool.len(), 1);

        clock.advance(chrono::Duration::minutes(11));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(pool.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}

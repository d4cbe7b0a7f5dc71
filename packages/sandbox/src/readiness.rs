use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::{SandboxError, SandboxResult};
use crate::models::ProviderKind;

/// One observation of a resource that is coming up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Ready(T),
    Pending,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Ready(T),
    TimedOut,
    Failed(String),
    Cancelled,
}

impl<T> WaitOutcome<T> {
    /// Collapse into a provisioning error naming what was being waited on.
    pub fn into_result(self, provider: ProviderKind, what: &str) -> SandboxResult<T> {
        match self {
            WaitOutcome::Ready(value) => Ok(value),
            WaitOutcome::TimedOut => Err(SandboxError::provisioning(
                provider,
                format!("timed out waiting for {what}"),
            )),
            WaitOutcome::Failed(reason) => Err(SandboxError::provisioning(
                provider,
                format!("{what} failed: {reason}"),
            )),
            WaitOutcome::Cancelled => Err(SandboxError::provisioning(
                provider,
                format!("wait for {what} cancelled"),
            )),
        }
    }
}

/// Poll `probe` every `interval` until it reports ready or failed, `timeout` elapses, or
/// `cancel` fires. Probe errors are logged and treated as still pending.
pub async fn wait_until<T, F, Fut>(
    mut probe: F,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> WaitOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SandboxResult<Probe<T>>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return WaitOutcome::Cancelled,
            attempt = tokio::time::timeout_at(deadline, probe()) => attempt,
        };

        match attempt {
            Err(_) => return WaitOutcome::TimedOut,
            Ok(Ok(Probe::Ready(value))) => return WaitOutcome::Ready(value),
            Ok(Ok(Probe::Failed(reason))) => return WaitOutcome::Failed(reason),
            Ok(Ok(Probe::Pending)) => {}
            Ok(Err(error)) => tracing::debug!(%error, "readiness probe error"),
        }

        let now = Instant::now();
        if now >= deadline {
            return WaitOutcome::TimedOut;
        }
        tokio::select! {
            _ = cancel.cancelled() => return WaitOutcome::Cancelled,
            _ = tokio::time::sleep_until((now + interval).min(deadline)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const TICK: Duration = Duration::from_millis(5);

    #[tokio::test]
    async fn ready_after_a_few_pending_probes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let outcome = wait_until(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok::<_, SandboxError>(if n < 2 {
                        Probe::Pending
                    } else {
                        Probe::Ready(n)
                    })
                }
            },
            TICK,
            Duration::from_secs(2),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome, WaitOutcome::Ready(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failure_stops_the_wait() {
        let outcome: WaitOutcome<()> = wait_until(
            || async { Ok::<_, SandboxError>(Probe::Failed("error".to_string())) },
            TICK,
            Duration::from_secs(2),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome, WaitOutcome::Failed("error".to_string()));
    }

    #[tokio::test]
    async fn probe_errors_count_as_pending_until_timeout() {
        let outcome: WaitOutcome<()> = wait_until(
            || async { Err::<Probe<()>, _>(SandboxError::Internal("flaky".into())) },
            TICK,
            Duration::from_millis(50),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn cancellation_interrupts_sleep() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let outcome: WaitOutcome<()> = wait_until(
            || async { Ok::<_, SandboxError>(Probe::Pending) },
            Duration::from_secs(5),
            Duration::from_secs(30),
            &cancel,
        )
        .await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
    }

    #[test]
    fn outcome_maps_to_provisioning_errors() {
        let err = WaitOutcome::<()>::TimedOut
            .into_result(ProviderKind::Vm, "instance")
            .unwrap_err();
        assert!(err.to_string().contains("timed out waiting for instance"));
        assert!(err.is_retryable());
    }
}

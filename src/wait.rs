//! Polling until a condition holds

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};

/// Poll `condition` every `interval` until it returns `Ok(true)`.
///
/// `Ok(false)` keeps polling, `Err` aborts immediately. The condition is
/// checked once more after the deadline so a slow final poll still counts.
pub async fn wait_for<F, Fut>(
    label: &str,
    timeout: Duration,
    interval: Duration,
    mut condition: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        if condition().await? {
            debug!(label, attempts, "condition met");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout {
                what: format!("{label} (attempts={attempts})"),
                after: timeout,
            });
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(interval.min(remaining)).await;
    }
}

/// Run `fut` under a deadline, mapping expiry to [`Error::Timeout`].
pub async fn with_timeout<T, Fut>(label: &str, timeout: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::Timeout {
            what: label.to_string(),
            after: timeout,
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn returns_once_condition_holds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        wait_for("third poll", Duration::from_secs(60), Duration::from_secs(5), || {
            let c = c.clone();
            async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 2) }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_never_ready() {
        let err = wait_for("never", Duration::from_secs(30), Duration::from_secs(5), || async {
            Ok(false)
        })
        .await
        .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("never"));
    }

    #[tokio::test(start_paused = true)]
    async fn condition_error_aborts() {
        let err = wait_for("broken", Duration::from_secs(30), Duration::from_secs(5), || async {
            Err::<bool, _>(Error::Verification("boom".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Verification(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_reports_label() {
        let err = with_timeout("slow step", Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "exceeded waiting for slow step after 1s");
    }
}

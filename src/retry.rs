//! Bounded automatic retry with cancellation.
//!
//! Wraps a fetch attempt and re-invokes it after a fixed delay while
//! the failure stays retryable, up to a small cap. The pending backoff
//! sleep is cancellable so teardown never leaves a dangling timer
//! writing into state nobody owns anymore.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{watch, Notify};

use crate::error::DataError;
use crate::refresh::{RefreshPolicy, RefreshSource};

/// Automatic retries after the initial attempt.
pub const MAX_AUTO_RETRIES: u32 = 2;
/// Fixed delay between attempts. Not exponential on purpose: the
/// backend either recovers within seconds or the stale cache serves.
pub const RETRY_DELAY: Duration = Duration::from_secs(3);

/// Outcome of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, DataError>,
    /// Total invocations of the operation, initial attempt included.
    pub attempts: u32,
}

impl<T> RetryOutcome<T> {
    /// Retry invocations beyond the initial attempt.
    pub fn retry_count(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Retries an operation on transient failures.
pub struct RetryController {
    max_retries: u32,
    delay: Duration,
    retrying_tx: watch::Sender<bool>,
    cancelled: AtomicBool,
    cancel_notify: Notify,
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new(MAX_AUTO_RETRIES, RETRY_DELAY)
    }
}

impl RetryController {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        let (retrying_tx, _) = watch::channel(false);
        Self {
            max_retries,
            delay,
            retrying_tx,
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        }
    }

    /// Runs `op`, retrying retryable failures up to the configured cap
    /// with a fixed delay between attempts.
    ///
    /// The is-retrying signal is raised while a backoff sleep is
    /// pending. A call to [`cancel`](Self::cancel) aborts the pending
    /// sleep and surfaces the last error without another attempt.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DataError>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => {
                    self.set_retrying(false);
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(error) => {
                    let retries_done = attempts - 1;
                    if !error.is_retryable()
                        || retries_done >= self.max_retries
                        || self.is_cancelled()
                    {
                        self.set_retrying(false);
                        return RetryOutcome {
                            result: Err(error),
                            attempts,
                        };
                    }

                    tracing::debug!(
                        "attempt {} failed ({}), retrying in {:?}",
                        attempts,
                        error,
                        self.delay
                    );
                    self.set_retrying(true);

                    tokio::select! {
                        _ = tokio::time::sleep(self.delay) => {
                            // A cancel can land before this select
                            // registers for the notification; re-check
                            // so teardown never costs another attempt.
                            if self.is_cancelled() {
                                self.set_retrying(false);
                                return RetryOutcome {
                                    result: Err(error),
                                    attempts,
                                };
                            }
                        }
                        _ = self.cancel_notify.notified() => {
                            self.set_retrying(false);
                            return RetryOutcome {
                                result: Err(error),
                                attempts,
                            };
                        }
                    }
                }
            }
        }
    }

    /// Like [`run`](Self::run), but records a terminal failure with
    /// the refresh policy before surfacing it.
    pub async fn run_reporting<T, F, Fut>(
        &self,
        policy: &RefreshPolicy,
        source: RefreshSource,
        op: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DataError>>,
    {
        let outcome = self.run(op).await;
        if outcome.result.is_err() {
            policy.mark_refresh_failed(source, None).await;
        }
        outcome
    }

    /// Cancels any pending backoff sleep and suppresses further
    /// retries until [`reset`](Self::reset).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
    }

    /// Clears cancellation and the is-retrying signal. A manual retry
    /// calls this first so automatic retry logic runs fresh.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
        self.set_retrying(false);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Observer for the "a retry is pending" UI signal.
    pub fn subscribe_retrying(&self) -> watch::Receiver<bool> {
        self.retrying_tx.subscribe()
    }

    pub fn is_retrying(&self) -> bool {
        *self.retrying_tx.borrow()
    }

    fn set_retrying(&self, retrying: bool) {
        self.retrying_tx.send_replace(retrying);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn counting_op(
        calls: Arc<AtomicU32>,
        results: impl Fn(u32) -> Result<u32, DataError> + Clone + Send + 'static,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<u32, DataError>> + Send>>
    {
        move || {
            let calls = calls.clone();
            let results = results.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                results(n)
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_server_error_attempts_exactly_cap_plus_one() {
        let controller = RetryController::default();
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = controller
            .run(counting_op(calls.clone(), |_| {
                Err(DataError::Http { status: 500 })
            }))
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), MAX_AUTO_RETRIES + 1);
        assert_eq!(outcome.attempts, MAX_AUTO_RETRIES + 1);
        assert_eq!(outcome.retry_count(), MAX_AUTO_RETRIES);
        assert_eq!(outcome.result, Err(DataError::Http { status: 500 }));
        assert!(!controller.is_retrying());
    }

    #[tokio::test]
    async fn test_terminal_error_not_retried() {
        let controller = RetryController::default();
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = controller
            .run(counting_op(calls.clone(), |_| {
                Err(DataError::Http { status: 404 })
            }))
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.result, Err(DataError::Http { status: 404 }));
    }

    #[tokio::test]
    async fn test_success_returns_immediately() {
        let controller = RetryController::default();
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = controller.run(counting_op(calls.clone(), |_| Ok(7))).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.result, Ok(7));
        assert_eq!(outcome.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let controller = RetryController::default();
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = controller
            .run(counting_op(calls.clone(), |n| {
                if n < 2 {
                    Err(DataError::Timeout)
                } else {
                    Ok(99)
                }
            }))
            .await;

        assert_eq!(outcome.result, Ok(99));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.retry_count(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_controller_does_not_retry() {
        let controller = RetryController::default();
        controller.cancel();
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = controller
            .run(counting_op(calls.clone(), |_| Err(DataError::Timeout)))
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.result, Err(DataError::Timeout));
    }

    #[tokio::test]
    async fn test_reset_clears_cancellation() {
        let controller = RetryController::new(1, Duration::from_millis(1));
        controller.cancel();
        assert!(controller.is_cancelled());

        controller.reset();
        assert!(!controller.is_cancelled());

        let calls = Arc::new(AtomicU32::new(0));
        let outcome = controller
            .run(counting_op(calls.clone(), |n| {
                if n == 0 {
                    Err(DataError::Network("reset".into()))
                } else {
                    Ok(1)
                }
            }))
            .await;
        assert_eq!(outcome.result, Ok(1));
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_further_attempts() {
        let controller = Arc::new(RetryController::default());
        let calls = Arc::new(AtomicU32::new(0));
        let mut retrying = controller.subscribe_retrying();

        let task = {
            let controller = controller.clone();
            let op = counting_op(calls.clone(), |_| Err(DataError::Http { status: 500 }));
            tokio::spawn(async move { controller.run(op).await })
        };

        // First attempt failed and the backoff sleep is pending.
        retrying.wait_for(|r| *r).await.unwrap();
        controller.cancel();

        let outcome = task.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result, Err(DataError::Http { status: 500 }));
        assert!(!controller.is_retrying());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrying_signal_raised_during_backoff() {
        let controller = Arc::new(RetryController::default());
        let mut retrying = controller.subscribe_retrying();

        let task = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .run(|| async { Err::<(), _>(DataError::Http { status: 503 }) })
                    .await
            })
        };

        // The signal flips on while a backoff sleep is pending and off
        // once the run settles.
        retrying.wait_for(|r| *r).await.unwrap();
        let outcome = task.await.unwrap();
        assert!(outcome.result.is_err());
        assert!(!controller.is_retrying());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reporting_marks_failure() {
        use crate::refresh::RefreshPolicy;
        use crate::storage::MemoryStore;

        let policy = RefreshPolicy::new(Arc::new(MemoryStore::new()));
        let controller = RetryController::default();

        let outcome = controller
            .run_reporting(&policy, RefreshSource::Auto, || async {
                Err::<(), _>(DataError::Http { status: 502 })
            })
            .await;

        assert!(outcome.result.is_err());
        let history = policy.history().await;
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);

        // Success leaves no failure record behind.
        let outcome = controller
            .run_reporting(&policy, RefreshSource::Auto, || async { Ok(1u32) })
            .await;
        assert_eq!(outcome.result, Ok(1));
        assert_eq!(policy.history().await.len(), 1);
    }
}

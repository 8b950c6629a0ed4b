//! Retry and circuit breaking around vector store calls.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::VectorStoreError;
use crate::models::ResilienceConfig;
use crate::utils::{RetryConfig, RetryResult, Retryable, with_retry};

/// Bounded retry with exponential backoff.
///
/// Exhausting retries on a transient error yields `StoreUnavailable`;
/// permanent errors pass through after the first attempt.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    retry: RetryConfig,
}

impl ConnectionManager {
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry }
    }

    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self::new(
            RetryConfig::new(config.max_retries)
                .with_initial_delay(Duration::from_millis(config.initial_delay_ms))
                .with_max_delay(Duration::from_millis(config.max_delay_ms))
                .with_multiplier(config.backoff_multiplier),
        )
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, VectorStoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VectorStoreError>>,
    {
        match with_retry(&self.retry, operation).await {
            RetryResult::Success(value) => Ok(value),
            RetryResult::Failed {
                last_error,
                attempts,
            } if last_error.is_retryable() => Err(VectorStoreError::StoreUnavailable {
                attempts,
                last_error: last_error.to_string(),
            }),
            RetryResult::Failed { last_error, .. } => Err(last_error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time spent open before a trial call is let through
    pub cooldown: Duration,
}

impl From<&ResilienceConfig> for BreakerConfig {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown(),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Three-state circuit breaker shared by every call to one store.
///
/// Closed counts consecutive failures; at the threshold it opens and rejects
/// calls until the cooldown elapses. Then exactly one trial call is admitted
/// (half-open): success closes the circuit, failure reopens it and restarts
/// the cooldown.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Releases the half-open trial slot if the trial call is dropped mid-flight.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // State stays consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    /// Admit a call or fail fast. Returns true if this call is the half-open trial.
    fn acquire(&self) -> Result<bool, VectorStoreError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map_or(self.config.cooldown, |t| t.elapsed());
                if elapsed >= self.config.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!("circuit breaker half-open, admitting trial call");
                    Ok(true)
                } else {
                    Err(VectorStoreError::CircuitOpen {
                        retry_after: self.config.cooldown - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen if inner.trial_in_flight => Err(VectorStoreError::CircuitOpen {
                retry_after: Duration::ZERO,
            }),
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Ok(true)
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!("circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.trial_in_flight = false;

        let should_open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failures >= self.config.failure_threshold,
            // A call admitted before the circuit opened; keep the original cooldown.
            CircuitState::Open => false,
        };
        if should_open {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            tracing::warn!(
                failures = inner.failures,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "circuit breaker opened"
            );
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// Only unavailability counts as a failure; a permanent error still proves
    /// the store answered.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, VectorStoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, VectorStoreError>>,
    {
        let is_trial = self.acquire()?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: is_trial,
        };

        let result = operation().await;
        guard.armed = false;

        match &result {
            Ok(_) => self.record_success(),
            Err(e) if is_breaker_failure(e) => self.record_failure(),
            Err(_) => self.record_success(),
        }
        result
    }
}

fn is_breaker_failure(error: &VectorStoreError) -> bool {
    matches!(error, VectorStoreError::StoreUnavailable { .. }) || error.is_retryable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, cooldown_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(cooldown_secs),
        })
    }

    fn unavailable() -> VectorStoreError {
        VectorStoreError::StoreUnavailable {
            attempts: 1,
            last_error: "down".into(),
        }
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), VectorStoreError> {
        b.call(|| async { Err::<(), _>(unavailable()) }).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), VectorStoreError> {
        b.call(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let b = breaker(3, 30);
        for _ in 0..2 {
            assert!(fail(&b).await.is_err());
            assert_eq!(b.state(), CircuitState::Closed);
        }
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result = b
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(VectorStoreError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes_and_resets() {
        let b = breaker(2, 30);
        fail(&b).await.ok();
        fail(&b).await.ok();
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_cooldown() {
        let b = breaker(1, 10);
        fail(&b).await.ok();
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        match succeed(&b).await {
            Err(VectorStoreError::CircuitOpen { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(5));
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_trial_in_half_open() {
        let b = breaker(1, 1);
        fail(&b).await.ok();
        tokio::time::advance(Duration::from_secs(2)).await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let trial = b.call(|| async move {
            rx.await.ok();
            Ok(())
        });
        let second = async {
            tokio::task::yield_now().await;
            let r = succeed(&b).await;
            tx.send(()).ok();
            r
        };
        let (trial_result, second_result) = tokio::join!(trial, second);

        assert!(trial_result.is_ok());
        assert!(matches!(
            second_result,
            Err(VectorStoreError::CircuitOpen { .. })
        ));
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_does_not_trip() {
        let b = breaker(1, 30);
        let r = b
            .call(|| async { Err::<(), _>(VectorStoreError::InvalidRequest("bad".into())) })
            .await;
        assert!(matches!(r, Err(VectorStoreError::InvalidRequest(_))));
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let b = breaker(3, 30);
        fail(&b).await.ok();
        fail(&b).await.ok();
        succeed(&b).await.unwrap();
        assert_eq!(b.failure_count(), 0);
        fail(&b).await.ok();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_manager_exhausts_to_store_unavailable() {
        let manager = ConnectionManager::new(RetryConfig::new(2));
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = manager
            .execute(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(VectorStoreError::ConnectionError("refused".into()))
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        match result {
            Err(VectorStoreError::StoreUnavailable {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("refused"));
            }
            other => panic!("expected StoreUnavailable, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_manager_passes_permanent_errors() {
        let manager = ConnectionManager::new(RetryConfig::new(5));
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = manager
            .execute(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(VectorStoreError::CollectionNotFound("kb_x".into()))
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result,
            Err(VectorStoreError::CollectionNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_manager_recovers_from_transient_failure() {
        let manager = ConnectionManager::new(RetryConfig::new(3));
        let attempts = AtomicU32::new(0);
        let result = manager
            .execute(|| async {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(VectorStoreError::Timeout)
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}

//! Consecutive-failure circuit breaker.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::domain::{AppError, BlockchainError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are short-circuited until the cooldown elapses
    Open,
    /// One trial call decides whether to close again
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerInner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Frees the half-open trial slot when a trial call is dropped before it
/// finishes
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    held: bool,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            debug!(breaker = %self.breaker.name, "Trial call abandoned");
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

/// Guards one upstream dependency.
///
/// After `failure_threshold` consecutive failures the circuit opens for
/// `cooldown`; afterwards a single trial call decides whether it closes again.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.opened_at {
            None => CircuitState::Closed,
            Some(opened) if opened.elapsed() >= self.config.cooldown => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
        }
    }

    /// Whether a call may proceed now. Reserves the trial slot when half-open.
    pub fn try_acquire(&self) -> bool {
        self.admit().is_some()
    }

    /// `Some(true)` when the caller holds the trial slot
    fn admit(&self) -> Option<bool> {
        let mut inner = self.lock();
        match inner.opened_at {
            None => Some(false),
            Some(opened) if opened.elapsed() >= self.config.cooldown => {
                if inner.trial_in_flight {
                    None
                } else {
                    inner.trial_in_flight = true;
                    Some(true)
                }
            }
            Some(_) => None,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.opened_at.is_some() {
            info!(breaker = %self.name, "Circuit closed");
        }
        *inner = BreakerInner::default();
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let trial_failed = inner.trial_in_flight;
        inner.trial_in_flight = false;
        if trial_failed || inner.consecutive_failures >= self.config.failure_threshold {
            if inner.opened_at.is_none() || trial_failed {
                warn!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    cooldown_ms = self.config.cooldown.as_millis() as u64,
                    "Circuit opened"
                );
            }
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Run `op` through the breaker; short-circuits with
    /// [`BlockchainError::CircuitOpen`] while open.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let Some(trial) = self.admit() else {
            return Err(AppError::Blockchain(BlockchainError::CircuitOpen(
                self.name.clone(),
            )));
        };
        let mut slot = TrialSlot {
            breaker: self,
            held: trial,
        };
        let outcome = op().await;
        slot.held = false;
        match outcome {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Like [`call`](Self::call) but serves `fallback` on any failure,
    /// including an open circuit.
    pub async fn call_or_fallback<T, F, Fut>(&self, op: F, fallback: impl FnOnce() -> T) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        match self.call(op).await {
            Ok(value) => value,
            Err(e) => {
                warn!(breaker = %self.name, error = %e, "Serving fallback value");
                fallback()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_millis(cooldown_ms),
            },
        )
    }

    fn failure() -> AppError {
        AppError::Blockchain(BlockchainError::Connection("down".to_string()))
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_short_circuits() {
        let cb = breaker(3, 60_000);
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let _: Result<(), _> = cb
                .call(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(failure())
                })
                .await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let result: Result<(), _> = cb
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(AppError::Blockchain(BlockchainError::CircuitOpen(_)))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = breaker(2, 60_000);
        let _: Result<(), _> = cb.call(|| async { Err(failure()) }).await;
        let _: Result<(), _> = cb.call(|| async { Ok(()) }).await;
        let _: Result<(), _> = cb.call(|| async { Err(failure()) }).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_trial_closes_or_reopens() {
        let cb = breaker(1, 20);
        let _: Result<(), _> = cb.call(|| async { Err(failure()) }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Failed trial reopens
        let _: Result<(), _> = cb.call(|| async { Err(failure()) }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let ok: Result<u8, _> = cb.call(|| async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_only_one_trial_while_half_open() {
        let cb = breaker(1, 0);
        cb.record_failure();
        assert!(cb.try_acquire());
        assert!(!cb.try_acquire());
        cb.record_success();
        assert!(cb.try_acquire());
        assert!(cb.try_acquire());
    }

    #[tokio::test]
    async fn test_dropped_trial_call_frees_the_slot() {
        let cb = breaker(1, 0);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            cb.call(|| std::future::pending::<Result<(), AppError>>()),
        )
        .await;
        assert!(abandoned.is_err());

        assert!(cb.try_acquire());
        assert!(!cb.try_acquire());
    }

    #[tokio::test]
    async fn test_dropped_closed_call_keeps_other_trial() {
        let cb = breaker(1, 0);
        let call = cb.call(|| std::future::pending::<Result<(), AppError>>());
        let mut call = Box::pin(call);
        // Admitted while closed
        assert!(
            tokio::time::timeout(Duration::from_millis(5), call.as_mut())
                .await
                .is_err()
        );

        cb.record_failure();
        assert!(cb.try_acquire());
        drop(call);
        assert!(!cb.try_acquire());
    }

    #[tokio::test]
    async fn test_call_or_fallback_serves_fallback() {
        let cb = breaker(1, 60_000);
        let value = cb
            .call_or_fallback(|| async { Err::<u32, _>(failure()) }, || 42)
            .await;
        assert_eq!(value, 42);

        // Open circuit: op is not invoked
        let calls = AtomicU32::new(0);
        let value = cb
            .call_or_fallback(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                },
                || 99,
            )
            .await;
        assert_eq!(value, 99);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

//! Injected clock for retry backoff
//!
//! Retry sleeps go through a [`Clock`] so tests can drive backoff without
//! real time and so cancellation wins races against pending sleeps: a sleep
//! interrupted by cancellation reports [`RuntimeError::Cancelled`], which the
//! executor treats as run cancellation rather than task failure.

use crate::cancel::CancelToken;
use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use std::time::Duration;

/// Time source for backoff sleeps
#[async_trait]
pub trait Clock: Send + Sync {
    /// Sleep for `duration`, losing the race against `cancel`
    async fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<()>;
}

/// Production clock backed by `tokio::time`
#[derive(Debug, Clone, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = cancel.cancelled() => Err(RuntimeError::Cancelled),
        }
    }
}

/// Test clock that completes sleeps instantly and records them
#[derive(Debug, Default)]
pub struct ManualClock {
    slept: std::sync::Mutex<Vec<Duration>>,
}

impl ManualClock {
    /// Create a manual clock
    pub fn new() -> Self {
        Self::default()
    }

    /// Durations requested so far, in order
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().expect("clock mutex").clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    async fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        self.slept.lock().expect("clock mutex").push(duration);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_clock_sleeps() {
        let clock = TokioClock;
        let token = CancelToken::new();
        clock
            .sleep(Duration::from_millis(1), &token)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_wins_sleep_race() {
        let clock = TokioClock;
        let token = CancelToken::new();
        token.cancel();
        let err = clock
            .sleep(Duration::from_secs(60), &token)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_manual_clock_records() {
        let clock = ManualClock::new();
        let token = CancelToken::new();
        clock.sleep(Duration::from_nanos(500), &token).await.unwrap();
        clock.sleep(Duration::from_nanos(1000), &token).await.unwrap();
        assert_eq!(
            clock.slept(),
            vec![Duration::from_nanos(500), Duration::from_nanos(1000)]
        );
    }
}

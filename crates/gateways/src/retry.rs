//! Deadlines and backoff for outbound provider calls.

use std::future::Future;
use std::time::Duration;

use tokio::time::error::Elapsed;

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Deadline for a single outbound call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// No sleeping between attempts.
    pub fn immediate(mut self) -> Self {
        self.initial_delay = Duration::ZERO;
        self.max_delay = Duration::ZERO;
        self
    }

    /// Delay before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Runs `call` under the per-call deadline.
    pub async fn timed<T, E, F>(&self, call: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<Elapsed>,
    {
        tokio::time::timeout(self.call_timeout, call).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GatewayError;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
    }

    #[test]
    fn at_least_one_attempt() {
        assert_eq!(RetryPolicy::default().with_max_attempts(0).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out() {
        let policy = RetryPolicy::default().with_call_timeout(Duration::from_millis(50));
        let result: Result<(), GatewayError> = policy
            .timed(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;
        assert_eq!(result, Err(GatewayError::Timeout));
    }

    #[tokio::test]
    async fn fast_call_passes_through() {
        let policy = RetryPolicy::default();
        let result: Result<u32, GatewayError> = policy.timed(async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }
}

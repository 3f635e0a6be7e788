//! Retry policy for hardware commands.
//
// Device adapters occasionally reject a command while a previous one is still
// being processed. The engine retries every hardware command a fixed number of
// times with a constant delay before treating the failure as fatal.

use crate::error::{AcqError, AcqResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Defines a policy for retrying a hardware command.
///
/// # Example
///
/// ```rust
/// use mda_core::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 2,
///     backoff_delay: Duration::from_millis(10),
/// };
/// assert_eq!(policy.total_attempts(), 3);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial attempt. Zero disables retries.
    pub max_attempts: u32,

    /// Constant delay between attempts.
    #[serde(with = "millis")]
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    /// Six retries, 5 ms apart.
    fn default() -> Self {
        Self {
            max_attempts: 6,
            backoff_delay: Duration::from_millis(5),
        }
    }
}

impl RetryPolicy {
    /// Builds a policy from config-style integers.
    #[must_use]
    pub fn new(max_attempts: u32, backoff_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_delay: Duration::from_millis(backoff_delay_ms),
        }
    }

    /// Initial attempt plus retries.
    #[must_use]
    pub fn total_attempts(&self) -> u32 {
        self.max_attempts.saturating_add(1)
    }

    /// Runs `op` until it succeeds or the policy is exhausted.
    ///
    /// The final failure is returned as [`AcqError::Hardware`] tagged with
    /// `operation`.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> AcqResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts => {
                    attempt += 1;
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "Hardware command failed, retrying"
                    );
                    sleep(self.backoff_delay).await;
                }
                Err(err) => return Err(AcqError::hardware(operation, err)),
            }
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

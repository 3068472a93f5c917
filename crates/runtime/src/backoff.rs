//! Backoff for journal appends
//!
//! Storage trouble is transient by assumption: an append that fails with
//! `StorageFull` or an I/O error is retried a bounded number of times
//! with doubling, jittered delays, and only then does the workflow count
//! as stalled. Anything else the journal rejects is a logic error and
//! surfaces immediately, so the retry schedule lives here and nowhere
//! else.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry schedule for journal appends
///
/// `attempts` counts the first try: a policy with `attempts = 5` yields
/// four delays. Each delay doubles the previous one up to `cap`, then a
/// ±25% jitter spreads concurrent retriers out.
///
/// # Example
///
/// ```
/// use gridflow_runtime::StorageRetry;
/// use std::time::Duration;
///
/// let retry = StorageRetry {
///     attempts: 3,
///     base_delay: Duration::from_millis(50),
///     cap: Duration::from_secs(1),
/// };
/// assert_eq!(retry.delays().count(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRetry {
    /// Total append attempts before the workflow is declared stalled
    pub attempts: u32,

    /// Delay before the first retry; doubles on every further retry
    #[serde(with = "serde_millis")]
    pub base_delay: Duration,

    /// Ceiling on any single delay
    #[serde(with = "serde_millis")]
    pub cap: Duration,
}

impl Default for StorageRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(100),
            cap: Duration::from_secs(5),
        }
    }
}

impl StorageRetry {
    /// A single attempt and no waiting, for tests that want failures loud
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay: Duration::ZERO,
            cap: Duration::ZERO,
        }
    }

    /// The delays to sleep between attempts, in order
    ///
    /// Drain this iterator as retries fail; when it runs dry the append
    /// has used its last attempt.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let base = self.base_delay;
        let cap = self.cap;
        (0..self.attempts.saturating_sub(1)).map(move |retry| {
            // min() keeps the shift in range; the cap takes over long before
            let doubled = base.saturating_mul(1u32 << retry.min(16));
            jittered(doubled.min(cap))
        })
    }
}

/// Spread a delay by ±25% so concurrent retriers do not stampede
fn jittered(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    delay.mul_f64(rand::thread_rng().gen_range(0.75..=1.25))
}

/// Durations cross serde boundaries as integer milliseconds
pub mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

//! Retry engine: exponential backoff for failed agent executions.
//!
//! Decides, from a task's failure count, whether it gets another attempt
//! and after what delay, or whether its retry budget is exhausted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Base delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on the computed delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Add random jitter (±25% of the computed delay). Off by default so
    /// retry timing stays exactly `min(base × 2^n, max)`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: false,
        }
    }
}

/// Outcome of routing a failure through the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    Retry { delay: Duration },
    /// Budget exhausted; unschedule the task and mark it failed.
    Terminal,
}

impl RetryPolicy {
    /// Decide what happens after a failure, given the retry count *before*
    /// this failure. The count itself is incremented by the registry.
    pub fn on_failure(&self, retry_count: u32) -> RetryDecision {
        let attempted_retries = retry_count + 1;
        if attempted_retries > self.max_retries {
            RetryDecision::Terminal
        } else {
            RetryDecision::Retry {
                delay: self.delay_for(retry_count),
            }
        }
    }

    /// Backoff delay for a task that has already failed `retry_count` times:
    /// `min(base × 2^retry_count, max)`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exp = retry_count.min(32);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);

        let delay_ms = if self.jitter {
            let jitter = (delay_ms / 4) as i64;
            let offset: i64 = if jitter > 0 {
                (rand_offset() % (jitter as u64 * 2)) as i64 - jitter
            } else {
                0
            };
            (delay_ms as i64 + offset).max(0) as u64
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms)
    }
}

/// Simple xorshift64 for jitter without pulling in a full rand dep.
fn rand_offset() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEED: AtomicU64 = AtomicU64::new(0x123456789abcdef0);
    let x = SEED.load(Ordering::Relaxed);
    let x = x ^ (x << 13);
    let x = x ^ (x >> 7);
    let x = x ^ (x << 17);
    SEED.store(x, Ordering::Relaxed);
    x
}

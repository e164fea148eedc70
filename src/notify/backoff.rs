//! Exponential backoff with jitter.

use crate::core::RetryPolicy;
use std::time::Duration;

/// Delay before resubscribe attempt `attempt` (1-based).
pub(crate) fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = policy.base_delay_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(policy.max_delay_ms);

    // Up to 10% jitter so peers that lost the same store node spread out.
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        fastrand::u64(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

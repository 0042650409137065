//! Exponential backoff.

use std::time::Duration;

/// Calculate exponential backoff delay: `base * 2^(attempt-1)`, capped at `max`.
///
/// Deterministic so that ejection intervals can be asserted exactly.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponential_base = 2u32.saturating_pow(attempt - 1);
    base.saturating_mul(exponential_base).min(max)
}

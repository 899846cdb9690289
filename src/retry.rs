//! Decorrelated-jitter retry policy (spec §4.1).
//!
//! `next_attempt` is a pure function of `(attempt, previous_delay, now)` plus
//! one call into the process-wide random source — it never reads the clock
//! itself, so callers control `now` and get a deterministic policy under
//! test.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Retry backoff parameters (spec §4.1, §6 "Configuration surface").
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Minimum retry delay, and the seed for the first retry. Default: 500ms.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Upper bound on any jittered retry delay. Default: 60s.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// After this many attempts, transient failures schedule "never retry".
    /// Default: 8.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            max_attempts: 8,
        }
    }
}

/// How long from now we schedule an entry that has exhausted `max_attempts`.
/// Not part of the spec's public numbers, but needed as a concrete sentinel
/// for "never retry" (spec §4.1: "e.g., 365 days").
const NEVER_RETRY_AFTER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

impl RetryPolicy {
    /// Compute the next attempt time for an entry that just failed
    /// transiently.
    ///
    /// `attempt` is the attempt count *after* incrementing (1-based: the
    /// first transient failure calls this with `attempt = 1`). `previous_delay`
    /// is the delay that was used to schedule the attempt that just failed,
    /// or `None` on the first failure.
    pub fn next_attempt(
        &self,
        attempt: u32,
        now: DateTime<Utc>,
        previous_delay: Option<Duration>,
    ) -> DateTime<Utc> {
        if attempt >= self.max_attempts {
            return now + chrono_duration(NEVER_RETRY_AFTER);
        }

        let prev = previous_delay.unwrap_or(self.base_delay);
        let lo = self.base_delay;
        let hi = self.max_delay.min(prev.saturating_mul(3).max(lo));

        let delay = uniform_duration(lo, hi);
        now + chrono_duration(delay)
    }
}

/// Draw a uniform random duration in `[lo, hi]`. Falls back to `lo` if the
/// range is degenerate (`hi <= lo`).
fn uniform_duration(lo: Duration, hi: Duration) -> Duration {
    if hi <= lo {
        return lo;
    }
    let span_ms = (hi.as_millis() - lo.as_millis()) as u64;
    let offset_ms = fastrand::u64(0..=span_ms);
    lo + Duration::from_millis(offset_ms)
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::milliseconds(i64::MAX))
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Should this HTTP status be retried? Advisory helper for transport
/// implementations (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx, or 409 (already processed) — treat as success.
    Success,
    /// 408, 429, 5xx, or an unclassified 3xx — worth retrying.
    Transient,
    /// Any other 4xx — the request itself is wrong; don't retry.
    Permanent,
}

/// Classify an HTTP status code per spec §4.1 / §6.
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        409 => StatusClass::Success,
        300..=399 => StatusClass::Transient,
        408 | 429 => StatusClass::Transient,
        400..=499 => StatusClass::Permanent,
        500..=599 => StatusClass::Transient,
        _ => StatusClass::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_retries_past_max_attempts() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let next = policy.next_attempt(policy.max_attempts, now, Some(Duration::from_secs(1)));
        assert!(next - now > chrono::Duration::days(300));
    }

    #[test]
    fn test_first_retry_is_within_base_and_max() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            max_attempts: 8,
        };
        let now = Utc::now();
        for _ in 0..200 {
            let next = policy.next_attempt(1, now, None);
            let delay = next - now;
            assert!(delay >= chrono::Duration::milliseconds(100));
            assert!(delay <= chrono::Duration::milliseconds(300)); // min(max_delay, base*3)
        }
    }

    #[test]
    fn test_delay_is_capped_by_max_delay() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(150),
            max_attempts: 8,
        };
        let now = Utc::now();
        for _ in 0..200 {
            let next = policy.next_attempt(2, now, Some(Duration::from_secs(10)));
            let delay = next - now;
            assert!(delay <= chrono::Duration::milliseconds(150));
            assert!(delay >= chrono::Duration::milliseconds(100));
        }
    }

    #[test]
    fn test_delay_never_drops_below_base_delay() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            max_attempts: 8,
        };
        let now = Utc::now();
        for prev_ms in [0u64, 1, 50, 499] {
            let next = policy.next_attempt(1, now, Some(Duration::from_millis(prev_ms)));
            let delay = next - now;
            assert!(delay >= chrono::Duration::milliseconds(500));
        }
    }

    #[test]
    fn test_status_classification_matches_table() {
        assert_eq!(classify_status(200), StatusClass::Success);
        assert_eq!(classify_status(201), StatusClass::Success);
        assert_eq!(classify_status(409), StatusClass::Success);
        assert_eq!(classify_status(301), StatusClass::Transient);
        assert_eq!(classify_status(408), StatusClass::Transient);
        assert_eq!(classify_status(429), StatusClass::Transient);
        assert_eq!(classify_status(500), StatusClass::Transient);
        assert_eq!(classify_status(503), StatusClass::Transient);
        assert_eq!(classify_status(400), StatusClass::Permanent);
        assert_eq!(classify_status(404), StatusClass::Permanent);
    }

    #[test]
    fn test_default_policy_matches_spec_numbers() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.max_attempts, 8);
    }
}

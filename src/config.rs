//! Configuration surface (spec §6). Every field here has the documented
//! default; the struct is plain and `Deserialize` so it can be loaded from a
//! TOML file the way the pack's other services load typed config.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Top-level configuration for the [`crate::Outbox`] facade and its
/// scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Retry backoff parameters. See [`RetryPolicy`].
    pub retry: RetryPolicy,
    /// Maximum entries in flight. Default: 3.
    pub concurrency: usize,
    /// If true, `init` starts the scheduler loop and `enqueue` kicks it.
    /// Default: true.
    pub auto_start: bool,
    /// Periodic tick interval. Default: 1s.
    #[serde(with = "duration_millis")]
    pub heartbeat: Duration,
    /// Upper bound on how long an entry may sit in `processing` before being
    /// reclaimed. Default: 5 minutes.
    #[serde(with = "duration_millis")]
    pub lock_timeout: Duration,
    /// Advisory: implementations may subscribe to network state and call
    /// pause/resume accordingly. Default: false. This crate does not
    /// implement the network observer itself (§1: out of scope); it only
    /// exposes [`crate::scheduler::Scheduler::pause`]/`resume` for a caller
    /// to drive.
    pub pause_on_no_network: bool,
    /// Per-call timeout a transport should observe. Default: 15s. This is
    /// advisory to transport implementations; the scheduler does not itself
    /// enforce it (§5: "transport.send should observe a per-call timeout").
    #[serde(with = "duration_millis")]
    pub send_timeout: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            concurrency: 3,
            auto_start: true,
            heartbeat: Duration::from_secs(1),
            lock_timeout: Duration::from_secs(5 * 60),
            pause_on_no_network: false,
            send_timeout: Duration::from_secs(15),
        }
    }
}

impl OutboxConfig {
    /// Parse configuration from a TOML document. Missing fields fall back to
    /// [`OutboxConfig::default`].
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_spec() {
        let cfg = OutboxConfig::default();
        assert_eq!(cfg.concurrency, 3);
        assert!(cfg.auto_start);
        assert_eq!(cfg.heartbeat, Duration::from_secs(1));
        assert_eq!(cfg.lock_timeout, Duration::from_secs(300));
        assert!(!cfg.pause_on_no_network);
        assert_eq!(cfg.send_timeout, Duration::from_secs(15));
        assert_eq!(cfg.retry.base_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_parses_partial_toml_with_fallback_defaults() {
        let cfg = OutboxConfig::from_toml("concurrency = 8\n").unwrap();
        assert_eq!(cfg.concurrency, 8);
        assert!(cfg.auto_start); // untouched field keeps its default
    }

    #[test]
    fn test_parses_nested_retry_section() {
        let toml = r#"
            concurrency = 1

            [retry]
            max_attempts = 3
        "#;
        let cfg = OutboxConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.concurrency, 1);
        assert_eq!(cfg.retry.max_attempts, 3);
        // untouched retry fields keep their defaults
        assert_eq!(cfg.retry.base_delay, Duration::from_millis(500));
    }
}

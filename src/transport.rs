//! The transport contract (spec §4.2 component 5 / §6): map an entry to a
//! delivery outcome. The core never inspects the payload; it only observes
//! the result shape.

use std::time::Duration;

use async_trait::async_trait;

use crate::entry::Entry;

/// The outcome of one delivery attempt.
#[derive(Debug, Clone, Default)]
pub struct SendResult {
    /// The transport delivered the entry (or the server reported it as
    /// already processed).
    pub success: bool,
    /// The transport judges this entry unrecoverable; do not retry.
    pub permanently_failed: bool,
    /// Diagnostic text, recorded on the entry for failures.
    pub error: Option<String>,
    /// Server-suggested minimum wait before the next attempt (e.g. from a
    /// `Retry-After` header). Only meaningful when `success` is false and
    /// `permanently_failed` is false.
    pub retry_after: Option<Duration>,
}

impl SendResult {
    /// A successful delivery.
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    /// A transient failure worth retrying.
    pub fn transient(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// A transient failure with a server-suggested retry delay.
    pub fn rate_limited(error: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            error: Some(error.into()),
            retry_after: Some(retry_after),
            ..Default::default()
        }
    }

    /// An unrecoverable failure.
    pub fn permanent(error: impl Into<String>) -> Self {
        Self {
            permanently_failed: true,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Delivers an [`Entry`] to an external endpoint.
///
/// Implementations should observe a per-call timeout (default 15s, spec
/// §5) and treat a timeout as transient. A panic or `Err` return here is
/// treated by the scheduler the same as [`SendResult::transient`], with the
/// error text taken from the failure.
#[async_trait]
pub trait OutboxTransport: Send + Sync {
    async fn send(&self, entry: &Entry) -> anyhow::Result<SendResult>;
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! Scripted transports for tests: fixed outcomes, N-failures-then-succeed,
    //! and latency injection for concurrency-bound tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::sync::Mutex;

    use super::*;

    /// Always returns the same [`SendResult`].
    pub struct FixedTransport {
        result: SendResult,
    }

    impl FixedTransport {
        pub fn new(result: SendResult) -> Self {
            Self { result }
        }

        pub fn always_success() -> Self {
            Self::new(SendResult::success())
        }

        pub fn always_permanent_failure() -> Self {
            Self::new(SendResult::permanent("permanent"))
        }
    }

    #[async_trait]
    impl OutboxTransport for FixedTransport {
        async fn send(&self, _entry: &Entry) -> anyhow::Result<SendResult> {
            Ok(self.result.clone())
        }
    }

    /// Fails the first `fail_times` sends (per call, not per entry) then
    /// succeeds.
    pub struct FlakyTransport {
        remaining_failures: AtomicUsize,
    }

    impl FlakyTransport {
        pub fn new(fail_times: usize) -> Self {
            Self {
                remaining_failures: AtomicUsize::new(fail_times),
            }
        }
    }

    #[async_trait]
    impl OutboxTransport for FlakyTransport {
        async fn send(&self, _entry: &Entry) -> anyhow::Result<SendResult> {
            let prev = self.remaining_failures.fetch_update(
                Ordering::SeqCst,
                Ordering::SeqCst,
                |n| if n > 0 { Some(n - 1) } else { Some(0) },
            );
            if prev.unwrap_or(0) > 0 {
                Ok(SendResult::transient("flaky: scheduled failure"))
            } else {
                Ok(SendResult::success())
            }
        }
    }

    /// Sleeps `delay` before returning success; used to assert a concurrency
    /// bound by recording the high-water mark of simultaneous calls.
    pub struct SlowTransport {
        delay: std::time::Duration,
        in_flight: AtomicUsize,
        max_observed: Mutex<usize>,
    }

    impl SlowTransport {
        pub fn new(delay: std::time::Duration) -> Self {
            Self {
                delay,
                in_flight: AtomicUsize::new(0),
                max_observed: Mutex::new(0),
            }
        }

        pub async fn max_observed_in_flight(&self) -> usize {
            *self.max_observed.lock().await
        }
    }

    #[async_trait]
    impl OutboxTransport for SlowTransport {
        async fn send(&self, _entry: &Entry) -> anyhow::Result<SendResult> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            {
                let mut max = self.max_observed.lock().await;
                if current > *max {
                    *max = current;
                }
            }
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(SendResult::success())
        }
    }

    /// Records every entry it is handed, always succeeding.
    pub struct RecordingTransport {
        pub received: Arc<Mutex<Vec<Entry>>>,
    }

    impl Default for RecordingTransport {
        fn default() -> Self {
            Self {
                received: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl OutboxTransport for RecordingTransport {
        async fn send(&self, entry: &Entry) -> anyhow::Result<SendResult> {
            self.received.lock().await.push(entry.clone());
            Ok(SendResult::success())
        }
    }
}

#[cfg(feature = "http")]
pub mod http {
    //! Reference HTTP transport (spec §6 "HTTP transport specifics").

    use std::time::Duration;

    use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
    use reqwest::Client;

    use crate::retry::{classify_status, StatusClass};

    use super::*;

    /// Delivers entries as a JSON `POST` to a fixed URL.
    pub struct HttpTransport {
        client: Client,
        url: String,
        timeout: Duration,
    }

    impl HttpTransport {
        /// `timeout` should match [`crate::config::OutboxConfig::send_timeout`].
        pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
            Self {
                client: Client::new(),
                url: url.into(),
                timeout,
            }
        }
    }

    #[async_trait]
    impl OutboxTransport for HttpTransport {
        async fn send(&self, entry: &Entry) -> anyhow::Result<SendResult> {
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

            if let Some(key) = &entry.idempotency_key {
                if !key.is_empty() && key.len() <= 256 {
                    headers.insert(
                        HeaderName::from_static("idempotency-key"),
                        HeaderValue::from_str(key)?,
                    );
                }
            }

            if let Some(extra) = &entry.headers {
                for (name, value) in extra {
                    if let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(name.as_bytes()),
                        HeaderValue::from_str(value),
                    ) {
                        headers.insert(name, value);
                    }
                }
            }

            let response = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .headers(headers)
                .json(&entry.payload)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) if e.is_timeout() => {
                    return Ok(SendResult::transient(format!("request timed out: {e}")))
                }
                Err(e) => return Ok(SendResult::transient(format!("request failed: {e}"))),
            };

            let status = response.status();
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);

            let body_snippet = response.text().await.unwrap_or_default();

            Ok(match classify_status(status.as_u16()) {
                StatusClass::Success => SendResult::success(),
                StatusClass::Permanent => {
                    SendResult::permanent(format!("{status}: {body_snippet}"))
                }
                StatusClass::Transient => {
                    let message = format!("{status}: {body_snippet}");
                    match retry_after {
                        Some(delay) => SendResult::rate_limited(message, delay),
                        None => SendResult::transient(message),
                    }
                }
            })
        }
    }

}

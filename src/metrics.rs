//! Metrics sink: an out-of-scope collaborator per spec §1 ("only its
//! contract is specified"). This module owns just the trait and two small
//! implementations; wiring a sink to a real exporter is the caller's job.

/// Observes outbox events for metrics purposes.
///
/// Implementations must not block or panic — they run inline on the
/// scheduler's hot path (see [`crate::scheduler::Scheduler`]).
pub trait MetricsSink: Send + Sync {
    /// An entry was enqueued.
    fn enqueued(&self, channel: &str) {
        let _ = channel;
    }

    /// A send attempt completed, successfully or not, taking `elapsed_ms`.
    fn send_timing(&self, channel: &str, elapsed_ms: u64, success: bool) {
        let _ = (channel, elapsed_ms, success);
    }

    /// An entry reached a terminal or retry outcome.
    fn settled(&self, channel: &str, outcome: SettleOutcome) {
        let _ = (channel, outcome);
    }
}

/// How a per-entry processing attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// Transport reported success (or 409-already-done).
    Done,
    /// Transport reported a transient failure; entry was requeued.
    Retried,
    /// Transport reported a permanent failure.
    Failed,
}

/// A sink that discards everything. The default for [`crate::Outbox`] when
/// no sink is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {}

/// A sink backed by the `metrics` crate facade (counters/histograms are
/// exported through whatever recorder the host process installs, e.g.
/// `metrics-exporter-prometheus`).
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeMetricsSink;

impl MetricsSink for FacadeMetricsSink {
    fn enqueued(&self, channel: &str) {
        metrics::counter!("outbox_enqueued_total", "channel" => channel.to_string()).increment(1);
    }

    fn send_timing(&self, channel: &str, elapsed_ms: u64, success: bool) {
        metrics::histogram!(
            "outbox_send_duration_ms",
            "channel" => channel.to_string(),
            "success" => success.to_string(),
        )
        .record(elapsed_ms as f64);
    }

    fn settled(&self, channel: &str, outcome: SettleOutcome) {
        let label = match outcome {
            SettleOutcome::Done => "done",
            SettleOutcome::Retried => "retried",
            SettleOutcome::Failed => "failed",
        };
        metrics::counter!(
            "outbox_settled_total",
            "channel" => channel.to_string(),
            "outcome" => label,
        )
        .increment(1);
    }
}

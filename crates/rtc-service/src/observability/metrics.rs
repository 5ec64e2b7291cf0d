//! Metrics definitions.
//!
//! Names use the `rtc_` prefix, `_total` for counters and `_seconds` for
//! duration histograms. Labels are bounded: `actor` has 3 values,
//! `event_type` is bounded by the `ServerEvent` variants, `operation` by the
//! repository statements.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// # Errors
///
/// Returns error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("rtc_db_query".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
                8.000,
            ],
        )
        .map_err(|e| format!("Failed to set DB query buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Metric: `rtc_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rtc_connections_active").set(count as f64);
}

/// Metric: `rtc_events_dropped_total`
/// Labels: `event_type`, `reason` (`queue_full`, `closed`)
pub fn record_event_dropped(event_type: &'static str, reason: &'static str) {
    counter!("rtc_events_dropped_total", "event_type" => event_type, "reason" => reason)
        .increment(1);
}

/// Metrics: `rtc_calls_pending`, `rtc_calls_active`
pub fn set_calls(pending: usize, active: usize) {
    #[allow(clippy::cast_precision_loss)]
    {
        gauge!("rtc_calls_pending").set(pending as f64);
        gauge!("rtc_calls_active").set(active as f64);
    }
}

/// Metric: `rtc_channel_participants`
pub fn set_channel_participants(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rtc_channel_participants").set(count as f64);
}

/// Metric: `rtc_uploads_in_flight`
pub fn set_uploads_in_flight(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rtc_uploads_in_flight").set(count as f64);
}

/// Metric: `rtc_upload_outcomes_total`
/// Labels: `outcome` (`complete`, `failed`, `timed_out`, `deleted`, `disconnected`)
pub fn record_upload_outcome(outcome: &'static str) {
    counter!("rtc_upload_outcomes_total", "outcome" => outcome).increment(1);
}

/// Metric: `rtc_db_query_duration_seconds`
/// Labels: `operation`, `status` (`success`, `error`, `timeout`)
pub fn record_db_query(operation: &'static str, status: &'static str, duration: Duration) {
    histogram!(
        "rtc_db_query_duration_seconds",
        "operation" => operation,
        "status" => status
    )
    .record(duration.as_secs_f64());
}

/// Metric: `rtc_actor_restarts_total`
pub fn record_actor_restart(actor: &'static str) {
    counter!("rtc_actor_restarts_total", "actor" => actor).increment(1);
}

/// Metric: `rtc_actor_panics_total`
pub fn record_actor_panic(actor: &'static str) {
    counter!("rtc_actor_panics_total", "actor" => actor).increment(1);
}

/// Metric: `rtc_actor_mailbox_depth`
pub fn set_actor_mailbox_depth(actor: &'static str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rtc_actor_mailbox_depth", "actor" => actor).set(depth as f64);
}

//! # Pipeline Metrics
//!
//! Emits pipeline counters through the `metrics` crate facade so a hosting
//! process can attach any exporter (Prometheus, StatsD, ...). Components
//! keep their own atomic stats for in-process snapshots; this module only
//! mirrors them outward.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `sluice_cdc_events_enqueued_total` | counter | `entity_type` |
//! | `sluice_cdc_enqueue_blocked_total` | counter | |
//! | `sluice_cdc_queue_depth` | gauge | |
//! | `sluice_cdc_events_completed_total` | counter | `entity_type` |
//! | `sluice_cdc_events_in_flight` | gauge | |
//! | `sluice_cdc_handler_failures_total` | counter | `entity_type`, `handler` |
//! | `sluice_cdc_token_advances_total` | counter | `entity_type` |
//! | `sluice_cdc_token_errors_total` | counter | `entity_type` |
//! | `sluice_cdc_rows_migrated_total` | counter | `entity_type` |
//! | `sluice_cdc_stream_alive` | gauge | `entity_type` |
//! | `sluice_cdc_stream_gaps_total` | counter | `entity_type` |

/// Facade over the `metrics` crate for pipeline events.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineMetrics;

impl PipelineMetrics {
    #[inline]
    pub fn record_enqueued(entity_type: &str) {
        metrics::counter!(
            "sluice_cdc_events_enqueued_total",
            "entity_type" => entity_type.to_string()
        )
        .increment(1);
    }

    #[inline]
    pub fn record_enqueue_blocked() {
        metrics::counter!("sluice_cdc_enqueue_blocked_total").increment(1);
    }

    #[inline]
    pub fn set_queue_depth(depth: usize) {
        metrics::gauge!("sluice_cdc_queue_depth").set(depth as f64);
    }

    #[inline]
    pub fn record_completed(entity_type: &str) {
        metrics::counter!(
            "sluice_cdc_events_completed_total",
            "entity_type" => entity_type.to_string()
        )
        .increment(1);
    }

    #[inline]
    pub fn set_in_flight(active: u64) {
        metrics::gauge!("sluice_cdc_events_in_flight").set(active as f64);
    }

    #[inline]
    pub fn record_handler_failure(entity_type: &str, handler: &str) {
        metrics::counter!(
            "sluice_cdc_handler_failures_total",
            "entity_type" => entity_type.to_string(),
            "handler" => handler.to_string()
        )
        .increment(1);
    }

    #[inline]
    pub fn record_token_advanced(entity_type: &str) {
        metrics::counter!(
            "sluice_cdc_token_advances_total",
            "entity_type" => entity_type.to_string()
        )
        .increment(1);
    }

    #[inline]
    pub fn record_token_error(entity_type: &str) {
        metrics::counter!(
            "sluice_cdc_token_errors_total",
            "entity_type" => entity_type.to_string()
        )
        .increment(1);
    }

    #[inline]
    pub fn record_rows_migrated(entity_type: &str, rows: u64) {
        metrics::counter!(
            "sluice_cdc_rows_migrated_total",
            "entity_type" => entity_type.to_string()
        )
        .increment(rows);
    }

    #[inline]
    pub fn set_stream_alive(entity_type: &str, alive: bool) {
        metrics::gauge!("sluice_cdc_stream_alive", "entity_type" => entity_type.to_string())
            .set(if alive { 1.0 } else { 0.0 });
    }

    #[inline]
    pub fn record_stream_gap(entity_type: &str) {
        metrics::counter!(
            "sluice_cdc_stream_gaps_total",
            "entity_type" => entity_type.to_string()
        )
        .increment(1);
    }
}

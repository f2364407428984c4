//! Single sink for pipeline outcomes: structured logs plus metrics.
//!
//! Every failure branch in the poller and workers reports here instead
//! of scattering bare log lines, preserving the never-fatal semantics
//! while keeping outcomes countable.

use crate::models::item::ImageQueueItem;

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "pipeline_items_completed",
        "Items classified with row and blob cleaned up"
    );
    metrics::describe_counter!(
        "pipeline_items_recovered",
        "Items returned to pending after a transient failure"
    );
    metrics::describe_counter!(
        "pipeline_items_dead",
        "Items parked in the dead state after exhausting attempts"
    );
    metrics::describe_counter!(
        "pipeline_poll_failures",
        "Poll cycles skipped because the queue store query failed"
    );
    metrics::describe_counter!(
        "pipeline_rows_orphaned",
        "Rows whose delete failed after successful classification"
    );
    metrics::describe_counter!(
        "pipeline_blobs_leaked",
        "Blobs whose delete failed after successful classification"
    );
    metrics::describe_gauge!(
        "pipeline_in_flight",
        "Items currently held by a worker"
    );
}

pub(super) fn item_completed(item: &ImageQueueItem) {
    metrics::counter!("pipeline_items_completed").increment(1);
    tracing::debug!(item_id = %item.item_id, "item completed");
}

pub(super) fn item_recovered(
    item: &ImageQueueItem,
    stage: &'static str,
    error: &dyn std::fmt::Display,
) {
    metrics::counter!("pipeline_items_recovered").increment(1);
    tracing::warn!(
        item_id = %item.item_id,
        attempts = item.attempts + 1,
        stage,
        error = %error,
        "item returned to pending"
    );
}

pub(super) fn item_dead(item: &ImageQueueItem, stage: &'static str, error: &dyn std::fmt::Display) {
    metrics::counter!("pipeline_items_dead").increment(1);
    tracing::warn!(
        item_id = %item.item_id,
        stage,
        error = %error,
        "item exhausted its attempts and was marked dead"
    );
}

pub(super) fn poll_failed(error: &dyn std::fmt::Display) {
    metrics::counter!("pipeline_poll_failures").increment(1);
    tracing::error!(error = %error, "queue poll failed; skipping cycle");
}

pub(super) fn row_orphaned(item: &ImageQueueItem, error: &dyn std::fmt::Display) {
    metrics::counter!("pipeline_rows_orphaned").increment(1);
    tracing::warn!(
        item_id = %item.item_id,
        error = %error,
        "row delete failed after classification; lease sweep may redeliver it"
    );
}

pub(super) fn blob_leaked(item: &ImageQueueItem, error: &dyn std::fmt::Display) {
    metrics::counter!("pipeline_blobs_leaked").increment(1);
    tracing::warn!(
        item_id = %item.item_id,
        error = %error,
        "blob delete failed; blob leaked"
    );
}

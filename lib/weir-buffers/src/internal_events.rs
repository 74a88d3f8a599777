//! Metrics emitted by the buffering layer.

use metrics::counter;

pub(crate) fn emit_discarded(queue_id: &str, severity: u8) {
    counter!(
        "queue_discarded_messages_total",
        "queue_id" => queue_id.to_string(),
        "severity" => severity.to_string(),
    )
    .increment(1);
}

pub(crate) fn emit_dropped_full(queue_id: &str) {
    counter!(
        "queue_dropped_full_total",
        "queue_id" => queue_id.to_string(),
    )
    .increment(1);
}

pub(crate) fn emit_consumer_error(queue_id: &str) {
    counter!(
        "queue_consumer_errors_total",
        "queue_id" => queue_id.to_string(),
    )
    .increment(1);
}

pub(crate) fn emit_persist_error(queue_id: &str) {
    counter!(
        "queue_persist_errors_total",
        "queue_id" => queue_id.to_string(),
    )
    .increment(1);
}

pub(crate) fn emit_messages_lost(queue_id: &str, count: u64) {
    counter!(
        "queue_messages_lost_total",
        "queue_id" => queue_id.to_string(),
    )
    .increment(count);
}

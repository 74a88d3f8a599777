//! Metrics emitted by the daemon's ingestion and routing layers.

use metrics::counter;

pub fn emit_received(input: &str) {
    counter!("messages_received_total", "input" => input.to_string()).increment(1);
}

pub fn emit_parse_failure(input: &str) {
    counter!("parse_failures_total", "input" => input.to_string()).increment(1);
}

pub fn emit_acl_denied(input: &str) {
    counter!("acl_denied_total", "input" => input.to_string()).increment(1);
}

pub fn emit_ratelimit_drop(input: &str, count: u64) {
    counter!("ratelimit_dropped_total", "input" => input.to_string()).increment(count);
}

pub fn emit_submit_failure(target: &str) {
    counter!("submit_failures_total", "target" => target.to_string()).increment(1);
}

pub fn emit_session_expired(input: &str) {
    counter!("sessions_expired_total", "input" => input.to_string()).increment(1);
}

//! Metrics collection for `PromptStrike`.
//!
//! Typed convenience functions over the `metrics` facade with label
//! cardinality protection. Installing a recorder/exporter is the
//! embedding application's concern; without one these calls no-op.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Length cap for operator-controlled label values.
///
/// Provider ids and campaign names come from configuration and end up
/// as label values; the cap keeps a pathological id from minting
/// unbounded label storage.
const LABEL_VALUE_CAP: usize = 48;

/// Registers metric descriptions with the global recorder.
pub fn describe_metrics() {
    describe_counter!(
        "promptstrike_probes_total",
        "Total number of terminal probes by provider and verdict"
    );
    describe_histogram!(
        "promptstrike_probe_duration_ms",
        "Probe duration in milliseconds, retries included"
    );
    describe_counter!(
        "promptstrike_retries_total",
        "Probe retries scheduled, by error kind"
    );
    describe_counter!(
        "promptstrike_dead_letters_total",
        "Jobs moved to the dead-letter partition, by error kind"
    );
    describe_counter!(
        "promptstrike_breaker_transitions_total",
        "Circuit breaker state transitions by provider"
    );
    describe_histogram!(
        "promptstrike_governor_wait_ms",
        "Time spent waiting on rate-governor buckets"
    );
    describe_gauge!("promptstrike_queue_depth", "Jobs currently queued");
    describe_gauge!(
        "promptstrike_workers_busy",
        "Workers currently executing a probe"
    );
    describe_counter!(
        "promptstrike_campaigns_total",
        "Campaigns by terminal status"
    );
    describe_histogram!(
        "promptstrike_detection_duration_us",
        "Detection evaluation duration in microseconds"
    );
}

/// Records one terminal probe.
pub fn record_probe(provider: &str, verdict: &str) {
    counter!(
        "promptstrike_probes_total",
        "provider" => provider_label(provider),
        "verdict" => verdict.to_owned(),
    )
    .increment(1);
}

/// Records a probe's end-to-end duration.
pub fn record_probe_duration(provider: &str, duration_ms: u64) {
    #[allow(clippy::cast_precision_loss)]
    histogram!("promptstrike_probe_duration_ms", "provider" => provider_label(provider))
        .record(duration_ms as f64);
}

/// Records one scheduled retry.
pub fn record_retry(error_kind: &str) {
    counter!("promptstrike_retries_total", "error_kind" => error_kind.to_owned()).increment(1);
}

/// Records one dead-lettered job.
pub fn record_dead_letter(error_kind: &str) {
    counter!("promptstrike_dead_letters_total", "error_kind" => error_kind.to_owned()).increment(1);
}

/// Records a circuit breaker transition.
pub fn record_breaker_transition(provider: &str, to_state: &str) {
    counter!(
        "promptstrike_breaker_transitions_total",
        "provider" => provider_label(provider),
        "to" => to_state.to_owned(),
    )
    .increment(1);
}

/// Records time spent blocked on the rate governor.
pub fn record_governor_wait(provider: &str, wait: Duration) {
    histogram!("promptstrike_governor_wait_ms", "provider" => provider_label(provider))
        .record(wait.as_secs_f64() * 1000.0);
}

/// Sets the queue depth gauge.
pub fn set_queue_depth(depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("promptstrike_queue_depth").set(depth as f64);
}

/// Sets the busy-worker gauge.
pub fn set_workers_busy(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("promptstrike_workers_busy").set(count as f64);
}

/// Records a campaign reaching a terminal status.
pub fn record_campaign(status: &str) {
    counter!("promptstrike_campaigns_total", "status" => status.to_owned()).increment(1);
}

/// Records a detection evaluation duration.
pub fn record_detection_duration(duration: Duration) {
    histogram!("promptstrike_detection_duration_us").record(duration.as_secs_f64() * 1_000_000.0);
}

/// Normalizes an operator-controlled value into canonical label form:
/// lowercase, with every run of characters outside `[a-z0-9_-]`
/// collapsed to a single `_`, capped at [`LABEL_VALUE_CAP`] bytes.
///
/// Values already canonical skip the rewrite walk, which is the
/// steady state for well-named providers.
fn provider_label(raw: &str) -> String {
    if is_canonical_label(raw) {
        return raw.to_owned();
    }

    let mut out = String::with_capacity(raw.len().min(LABEL_VALUE_CAP));
    let mut in_gap = false;
    for c in raw.chars().flat_map(char::to_lowercase) {
        if out.len() >= LABEL_VALUE_CAP {
            break;
        }
        if matches!(c, 'a'..='z' | '0'..='9' | '_' | '-') {
            out.push(c);
            in_gap = false;
        } else if !in_gap {
            out.push('_');
            in_gap = true;
        }
    }
    out
}

fn is_canonical_label(raw: &str) -> bool {
    raw.len() <= LABEL_VALUE_CAP
        && !raw.is_empty()
        && raw
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_' | '-'))
}

//! Probe data model.
//!
//! A probe is one rendered prompt sent to one provider+model. Jobs are
//! the scheduled form; results are the append-only record of what came
//! back.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

use crate::detection::DetectionRecord;
use crate::error::ErrorKind;

// ============================================================================
// Verdict
// ============================================================================

/// Classification of a probe's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The probe elicited a policy violation
    Vulnerable,
    /// The target resisted the probe
    Defended,
    /// Detection could not decide
    Inconclusive,
    /// The probe failed before detection could run
    Error,
}

impl Verdict {
    /// Stable string form used for indices and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Vulnerable => "vulnerable",
            Self::Defended => "defended",
            Self::Inconclusive => "inconclusive",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Probe Job
// ============================================================================

/// One scheduled invocation of one (template, variation, binding)
/// against one provider+model.
///
/// `rendered_prompt` is byte-for-byte the string sent over the wire;
/// rendering happens once, at materialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeJob {
    /// Unique, monotonically generated job id; never reused
    pub job_id: Ulid,

    /// Owning campaign
    pub campaign_id: Uuid,

    /// Source template id
    pub template_id: String,

    /// Source template version at materialization time
    pub template_version: String,

    /// Index into the template's variations, if this probes a variation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation_index: Option<usize>,

    /// Target provider id
    pub provider_id: String,

    /// Target model id
    pub model_id: String,

    /// Final prompt string sent to the provider
    pub rendered_prompt: String,

    /// Snapshot of substituted variable values
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub variable_binding: IndexMap<String, String>,

    /// Optional system preamble forwarded to the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// Scheduling priority; higher runs first
    pub priority: i32,

    /// Absolute time after which the job is abandoned
    pub deadline: DateTime<Utc>,

    /// Remaining retries for transient failures
    pub retry_budget: u32,

    /// Tokens charged against the rate governor before the real count
    /// is known
    pub token_estimate: u64,

    /// Creation time, used for causal ordering checks
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Probe Result
// ============================================================================

/// Token accounting reported by the provider, when known.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    /// Prompt-side tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u64>,
    /// Completion-side tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u64>,
}

impl TokenUsage {
    /// Total of both sides, treating unknown as zero.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.tokens_in.unwrap_or(0) + self.tokens_out.unwrap_or(0)
    }
}

/// Outcome of one terminal probe job.
///
/// Exactly one result exists per terminal job; results are append-only
/// and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Unique result id
    pub result_id: Ulid,

    /// The job this result terminates
    pub job_id: Ulid,

    /// Owning campaign, copied for query locality
    pub campaign_id: Uuid,

    /// Source template id, copied for query locality
    pub template_id: String,

    /// Source template version
    pub template_version: String,

    /// Variation index, if a variation was probed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation_index: Option<usize>,

    /// Target provider id
    pub provider_id: String,

    /// Target model id
    pub model_id: String,

    /// When the probe was first dispatched (covers retries)
    pub sent_at: DateTime<Utc>,

    /// When the terminal response (or failure) was observed
    pub received_at: DateTime<Utc>,

    /// Milliseconds between `sent_at` and `received_at`
    pub duration_ms: u64,

    /// Full provider response body, possibly truncated at the
    /// configured cap
    pub raw_response: String,

    /// Whether `raw_response` was truncated
    #[serde(default)]
    pub truncated: bool,

    /// Token accounting, when the provider reported it
    #[serde(default)]
    pub usage: TokenUsage,

    /// HTTP status or provider-native equivalent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<u16>,

    /// Detection classification
    pub detection: DetectionRecord,

    /// Failure classification; set iff the verdict is `Error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ProbeResult {
    /// The verdict recorded by detection.
    #[must_use]
    pub const fn verdict(&self) -> Verdict {
        self.detection.verdict
    }

    /// Compares the fields that define result identity for idempotent
    /// re-insertion: a re-sent job may legally produce a second result
    /// with fresh timestamps and id, as long as the observable outcome
    /// matches.
    #[must_use]
    pub fn same_body(&self, other: &Self) -> bool {
        self.job_id == other.job_id
            && self.detection.verdict == other.detection.verdict
            && self.error_kind == other.error_kind
            && self.raw_response == other.raw_response
    }
}

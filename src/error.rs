//! Error types for `PromptStrike`
//!
//! Domain error enums plus the probe-level error taxonomy carried on
//! terminal results.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// Top-Level Error
// ============================================================================

/// Top-level error type for `PromptStrike` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Catalog loading or validation error
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Provider adapter error
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Job queue error
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Result store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Campaign error
    #[error(transparent)]
    Campaign(#[from] CampaignError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for `PromptStrike` operations.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Catalog Errors
// ============================================================================

/// Template catalog loading and validation errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// YAML parsing failed
    #[error("parse error in {path}{}: {message}", line.map_or_else(String::new, |l| format!(" (line {l})")))]
    ParseError {
        /// Path to the template file
        path: PathBuf,
        /// Line number where the error occurred (if available)
        line: Option<usize>,
        /// Error message from the parser
        message: String,
    },

    /// Template validation failed
    #[error("validation failed for {path}")]
    ValidationError {
        /// Path to the template file
        path: String,
        /// List of validation issues found
        errors: Vec<ValidationIssue>,
    },

    /// The same template id was defined by more than one source
    #[error("duplicate template id '{id}': defined in {first} and {second}")]
    DuplicateId {
        /// The conflicting template id
        id: String,
        /// File that defined the id first
        first: PathBuf,
        /// File that attempted to redefine it
        second: PathBuf,
    },

    /// A manifest pinned a version the file does not carry
    #[error("manifest pins '{id}' to {pinned} but {path} declares {declared}")]
    PinMismatch {
        /// Pinned template id
        id: String,
        /// Version required by the manifest
        pinned: String,
        /// Version declared by the file
        declared: String,
        /// Path to the offending file
        path: PathBuf,
    },

    /// Referenced catalog source not found
    #[error("catalog source not found: {path}")]
    MissingSource {
        /// Path to the missing source
        path: PathBuf,
    },

    /// No template survived loading
    #[error("no templates loaded ({failed} file(s) failed)")]
    EmptyCatalog {
        /// Number of files that failed to load
        failed: usize,
    },

    /// One or more template files failed and partial loads were not allowed
    #[error("{count} template file(s) failed to load")]
    PartialLoadRejected {
        /// Number of files that failed
        count: usize,
    },
}

// ============================================================================
// Validation Types
// ============================================================================

/// A single validation issue found during template or spec validation.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the problematic field (e.g., `"variations[1].detection"`)
    pub path: String,
    /// Description of the validation issue
    pub message: String,
    /// Severity level of the issue
    pub severity: IssueSeverity,
}

impl ValidationIssue {
    /// Creates an error-severity issue.
    #[must_use]
    pub fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            severity: IssueSeverity::Error,
        }
    }

    /// Creates a warning-severity issue.
    #[must_use]
    pub fn warning(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            severity: IssueSeverity::Warning,
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.severity {
            IssueSeverity::Error => "error",
            IssueSeverity::Warning => "warning",
        };
        write!(f, "{}: {} at {}", prefix, self.message, self.path)
    }
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Validation failure that prevents the template or spec from being used
    Error,
    /// Potential issue that does not prevent loading
    Warning,
}

// ============================================================================
// Provider Errors
// ============================================================================

/// Errors surfaced by provider adapters and the registry guarding them.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network-level failure before a provider response was received
    #[error("transport failure: {message}")]
    Transport {
        /// Underlying transport error description
        message: String,
    },

    /// Provider signalled rate limiting or server-side failure (429/5xx)
    #[error("provider overloaded (status {status}): {message}")]
    Overloaded {
        /// HTTP status or provider-native equivalent
        status: u16,
        /// Provider error message
        message: String,
    },

    /// Provider rejected the request (4xx: bad request, auth, quota)
    #[error("provider rejected request (status {status}): {message}")]
    ClientError {
        /// HTTP status or provider-native equivalent
        status: u16,
        /// Provider error message
        message: String,
    },

    /// The circuit breaker for this provider is open
    #[error("circuit open for provider '{provider}', retry in {retry_after:?}")]
    CircuitOpen {
        /// Provider id
        provider: String,
        /// Remaining cooldown
        retry_after: std::time::Duration,
    },

    /// The request was cancelled before completing
    #[error("request cancelled")]
    Cancelled,

    /// No adapter registered under the given id
    #[error("unknown provider '{id}'{}", suggestion.as_ref().map_or_else(String::new, |s| format!(" (did you mean '{s}'?)")))]
    UnknownProvider {
        /// The id that failed to resolve
        id: String,
        /// Closest registered id, if any
        suggestion: Option<String>,
    },

    /// Provider response could not be decoded
    #[error("malformed provider response: {message}")]
    MalformedResponse {
        /// Decoder error description
        message: String,
    },
}

impl ProviderError {
    /// Maps the provider error onto the probe error taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Overloaded { .. } | Self::CircuitOpen { .. } => ErrorKind::ProviderOverload,
            Self::ClientError { .. }
            | Self::UnknownProvider { .. }
            | Self::MalformedResponse { .. } => ErrorKind::ProviderClientError,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether this failure class should trip the circuit breaker.
    #[must_use]
    pub const fn trips_breaker(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Overloaded { .. })
    }
}

// ============================================================================
// Queue Errors
// ============================================================================

/// Job queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No job with the given id exists in the queue
    #[error("unknown job {job_id}")]
    UnknownJob {
        /// The job id that failed to resolve
        job_id: ulid::Ulid,
    },

    /// The job exists but is not currently leased
    #[error("job {job_id} is not leased")]
    NotLeased {
        /// The job id
        job_id: ulid::Ulid,
    },

    /// The queue has been closed and no longer accepts operations
    #[error("queue closed")]
    Closed,
}

// ============================================================================
// Store Errors
// ============================================================================

/// Result store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A result for the job already exists with a different body
    #[error("conflicting duplicate result for job {job_id}")]
    ConflictingDuplicate {
        /// The job id with conflicting results
        job_id: ulid::Ulid,
    },

    /// Persistence I/O failed
    #[error("persistence error: {0}")]
    Io(#[from] std::io::Error),

    /// Result serialization failed
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ============================================================================
// Campaign Errors
// ============================================================================

/// Campaign controller errors.
#[derive(Debug, Error)]
pub enum CampaignError {
    /// No campaign with the given id
    #[error("unknown campaign {id}")]
    UnknownCampaign {
        /// The campaign id
        id: uuid::Uuid,
    },

    /// The campaign spec failed validation
    #[error("invalid campaign spec ({} issue(s))", errors.len())]
    InvalidSpec {
        /// Validation issues found in the spec
        errors: Vec<ValidationIssue>,
    },

    /// The requested status transition is not allowed
    #[error("cannot transition campaign from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// The template filter matched nothing in the active snapshot
    #[error("no templates matched the campaign filter")]
    NoTemplatesMatched,
}

// ============================================================================
// Probe Error Taxonomy
// ============================================================================

/// Classification of a probe failure, carried on terminal results.
///
/// `Validation` never appears on a result: malformed templates and specs
/// are rejected at load/submit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed template or spec, surfaced at load/submit
    Validation,
    /// Network failure to the provider
    Transport,
    /// Provider-indicated rate limit or 5xx
    ProviderOverload,
    /// Provider-indicated 4xx (bad request, auth)
    ProviderClientError,
    /// Detection exceeded its evaluation budget
    DetectorTimeout,
    /// Job deadline expired before completion
    Deadline,
    /// Explicit cancellation
    Cancelled,
    /// Unexpected internal failure
    WorkerFault,
}

impl ErrorKind {
    /// Whether a probe failing with this kind may be retried.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transport | Self::ProviderOverload)
    }

    /// Stable string form used for dead-letter partitioning and labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Transport => "transport",
            Self::ProviderOverload => "provider_overload",
            Self::ProviderClientError => "provider_client_error",
            Self::DetectorTimeout => "detector_timeout",
            Self::Deadline => "deadline",
            Self::Cancelled => "cancelled",
            Self::WorkerFault => "worker_fault",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

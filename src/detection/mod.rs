//! Detection pipeline.
//!
//! Turns a raw provider response into a verdict by evaluating the
//! template's detection tree under three-valued logic.

mod eval;
mod rules;
mod semantic;

pub use eval::{
    CompiledDetection, DetectionRecord, EvalOptions, TraceEntry, REASON_DETECTOR_TIMEOUT,
    REASON_SEMANTIC_UNAVAILABLE,
};
pub use rules::{
    DetectionRule, LengthOp, RegexCondition, StringCondition, TokenMode, Truth,
};
pub use semantic::{KeywordMatcher, SemanticMatcher};

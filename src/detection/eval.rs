//! Detection tree compilation and evaluation.
//!
//! Regexes are compiled once when a template loads; invalid patterns
//! fail validation instead of surfacing at probe time. Evaluation is
//! pure: the same (response, tree) pair always produces the same
//! record, modulo the wall-clock budget.

use std::time::{Duration, Instant};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use super::rules::{
    DetectionRule, LengthOp, RegexCondition, StringCondition, TokenMode, Truth,
};
use super::semantic::SemanticMatcher;
use crate::probe::Verdict;

/// Upper bound on a compiled regex's internal size.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Trace reason recorded when the evaluation budget ran out.
pub const REASON_DETECTOR_TIMEOUT: &str = "detector_timeout";

/// Trace reason recorded when no semantic matcher was configured.
pub const REASON_SEMANTIC_UNAVAILABLE: &str = "semantic_unavailable";

// ============================================================================
// Compiled Form
// ============================================================================

/// A detection tree with regexes pre-compiled.
#[derive(Debug, Clone)]
pub struct CompiledDetection {
    root: CompiledRule,
    leaf_count: usize,
}

#[derive(Debug, Clone)]
enum CompiledRule {
    StringMatch {
        substr: String,
        substr_lower: String,
        condition: StringCondition,
        case_sensitive: bool,
        label: String,
    },
    RegexMatch {
        regex: Regex,
        condition: RegexCondition,
        label: String,
    },
    Semantic {
        criteria: String,
        label: String,
    },
    Length {
        op: LengthOp,
        n: usize,
        label: String,
    },
    TokenPresence {
        tokens: Vec<String>,
        mode: TokenMode,
        label: String,
    },
    AllOf(Vec<CompiledRule>),
    AnyOf(Vec<CompiledRule>),
    Not(Box<CompiledRule>),
}

impl CompiledDetection {
    /// Compiles a rule tree, validating every regex leaf.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid pattern or flag
    /// encountered, suitable for a validation issue message.
    pub fn compile(rule: &DetectionRule) -> std::result::Result<Self, String> {
        let mut leaf_count = 0;
        let root = compile_rule(rule, &mut leaf_count)?;
        Ok(Self { root, leaf_count })
    }

    /// Number of leaf rules in the tree.
    #[must_use]
    pub const fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Evaluates the tree against a raw response.
    ///
    /// Leaves short-circuit: `all_of` stops at the first `False`,
    /// `any_of` at the first `True`. A leaf reached after the budget is
    /// exhausted evaluates to `Unknown` with a timeout reason; the root
    /// verdict is `Inconclusive` only when that `Unknown` is decisive.
    #[must_use]
    pub fn evaluate(&self, response: &str, opts: &EvalOptions<'_>) -> DetectionRecord {
        let mut cx = EvalContext {
            response,
            tokens: None,
            started: Instant::now(),
            budget: opts.budget,
            semantic: opts.semantic,
            trace: Vec::new(),
            matched: Vec::new(),
            timed_out: false,
            known_leaves: 0,
            seen_leaves: 0,
        };

        let truth = eval_rule(&self.root, &mut cx);
        let verdict = match truth {
            Truth::True => Verdict::Vulnerable,
            Truth::False => Verdict::Defended,
            Truth::Unknown => Verdict::Inconclusive,
        };

        let confidence = if cx.seen_leaves == 0 {
            1.0
        } else {
            f64::from(cx.known_leaves) / f64::from(cx.seen_leaves)
        };

        DetectionRecord {
            verdict,
            matched_rules: cx.matched,
            confidence,
            trace: cx.trace,
            timed_out: cx.timed_out,
        }
    }
}

fn compile_rule(
    rule: &DetectionRule,
    leaf_count: &mut usize,
) -> std::result::Result<CompiledRule, String> {
    Ok(match rule {
        DetectionRule::StringMatch {
            substr,
            condition,
            case_sensitive,
        } => {
            *leaf_count += 1;
            CompiledRule::StringMatch {
                substr_lower: substr.to_lowercase(),
                substr: substr.clone(),
                condition: *condition,
                case_sensitive: *case_sensitive,
                label: rule.label(),
            }
        }
        DetectionRule::RegexMatch {
            pattern,
            condition,
            flags,
        } => {
            *leaf_count += 1;
            let regex = build_regex(pattern, flags.as_deref())?;
            CompiledRule::RegexMatch {
                regex,
                condition: *condition,
                label: rule.label(),
            }
        }
        DetectionRule::SemanticMatch { criteria } => {
            *leaf_count += 1;
            CompiledRule::Semantic {
                criteria: criteria.clone(),
                label: rule.label(),
            }
        }
        DetectionRule::Length { op, n } => {
            *leaf_count += 1;
            CompiledRule::Length {
                op: *op,
                n: *n,
                label: rule.label(),
            }
        }
        DetectionRule::TokenPresence { tokens, mode } => {
            *leaf_count += 1;
            if tokens.is_empty() {
                return Err("token_presence requires at least one token".to_string());
            }
            CompiledRule::TokenPresence {
                tokens: tokens.iter().map(|t| t.to_lowercase()).collect(),
                mode: *mode,
                label: rule.label(),
            }
        }
        DetectionRule::AllOf { rules } => {
            if rules.is_empty() {
                return Err("all_of requires at least one rule".to_string());
            }
            CompiledRule::AllOf(
                rules
                    .iter()
                    .map(|r| compile_rule(r, leaf_count))
                    .collect::<std::result::Result<_, _>>()?,
            )
        }
        DetectionRule::AnyOf { rules } => {
            if rules.is_empty() {
                return Err("any_of requires at least one rule".to_string());
            }
            CompiledRule::AnyOf(
                rules
                    .iter()
                    .map(|r| compile_rule(r, leaf_count))
                    .collect::<std::result::Result<_, _>>()?,
            )
        }
        DetectionRule::Not { rule } => CompiledRule::Not(Box::new(compile_rule(rule, leaf_count)?)),
    })
}

/// Builds a regex with the supported inline flags applied.
fn build_regex(pattern: &str, flags: Option<&str>) -> std::result::Result<Regex, String> {
    let mut builder = RegexBuilder::new(pattern);
    builder.size_limit(REGEX_SIZE_LIMIT);
    if let Some(flags) = flags {
        for flag in flags.chars() {
            match flag {
                'i' => {
                    builder.case_insensitive(true);
                }
                'm' => {
                    builder.multi_line(true);
                }
                's' => {
                    builder.dot_matches_new_line(true);
                }
                other => return Err(format!("unsupported regex flag '{other}'")),
            }
        }
    }
    builder
        .build()
        .map_err(|e| format!("invalid pattern {pattern:?}: {e}"))
}

// ============================================================================
// Evaluation
// ============================================================================

/// Options threaded through one evaluation.
pub struct EvalOptions<'a> {
    /// Wall-clock budget for the whole tree.
    pub budget: Duration,
    /// Optional semantic matcher; `None` makes semantic leaves unknown.
    pub semantic: Option<&'a dyn SemanticMatcher>,
}

impl Default for EvalOptions<'_> {
    fn default() -> Self {
        Self {
            budget: Duration::from_millis(200),
            semantic: None,
        }
    }
}

struct EvalContext<'a> {
    response: &'a str,
    tokens: Option<Vec<String>>,
    started: Instant,
    budget: Duration,
    semantic: Option<&'a dyn SemanticMatcher>,
    trace: Vec<TraceEntry>,
    matched: Vec<String>,
    timed_out: bool,
    known_leaves: u32,
    seen_leaves: u32,
}

impl EvalContext<'_> {
    fn over_budget(&self) -> bool {
        self.started.elapsed() > self.budget
    }

    fn tokens(&mut self) -> &[String] {
        if self.tokens.is_none() {
            self.tokens = Some(
                self.response
                    .split_whitespace()
                    .map(str::to_lowercase)
                    .collect(),
            );
        }
        self.tokens.as_deref().unwrap_or_default()
    }

    fn record_leaf(
        &mut self,
        label: &str,
        outcome: Truth,
        offset: Option<usize>,
        reason: Option<&'static str>,
    ) -> Truth {
        self.seen_leaves += 1;
        if outcome != Truth::Unknown {
            self.known_leaves += 1;
        }
        if outcome == Truth::True {
            self.matched.push(label.to_string());
        }
        self.trace.push(TraceEntry {
            rule: label.to_string(),
            outcome,
            offset,
            reason: reason.map(str::to_string),
        });
        outcome
    }
}

fn eval_rule(rule: &CompiledRule, cx: &mut EvalContext<'_>) -> Truth {
    match rule {
        CompiledRule::AllOf(children) => {
            let mut acc = Truth::True;
            for child in children {
                acc = acc.and(eval_rule(child, cx));
                if acc == Truth::False {
                    break;
                }
            }
            acc
        }
        CompiledRule::AnyOf(children) => {
            let mut acc = Truth::False;
            for child in children {
                acc = acc.or(eval_rule(child, cx));
                if acc == Truth::True {
                    break;
                }
            }
            acc
        }
        CompiledRule::Not(child) => eval_rule(child, cx).negate(),
        leaf => eval_leaf(leaf, cx),
    }
}

fn eval_leaf(rule: &CompiledRule, cx: &mut EvalContext<'_>) -> Truth {
    let label = match rule {
        CompiledRule::StringMatch { label, .. }
        | CompiledRule::RegexMatch { label, .. }
        | CompiledRule::Semantic { label, .. }
        | CompiledRule::Length { label, .. }
        | CompiledRule::TokenPresence { label, .. } => label.clone(),
        _ => return Truth::Unknown,
    };

    if cx.over_budget() {
        cx.timed_out = true;
        return cx.record_leaf(&label, Truth::Unknown, None, Some(REASON_DETECTOR_TIMEOUT));
    }

    match rule {
        CompiledRule::StringMatch {
            substr,
            substr_lower,
            condition,
            case_sensitive,
            ..
        } => {
            let offset = if *case_sensitive {
                cx.response.find(substr.as_str())
            } else {
                cx.response.to_lowercase().find(substr_lower.as_str())
            };
            let hit = match condition {
                StringCondition::Contains => offset.is_some(),
                StringCondition::NotContains => offset.is_none(),
            };
            cx.record_leaf(&label, Truth::from_bool(hit), offset, None)
        }
        CompiledRule::RegexMatch {
            regex, condition, ..
        } => {
            let found = regex.find(cx.response);
            // Pathological pattern/input pairs are caught after the fact:
            // the next leaf (or the post-check here) sees the exhausted budget.
            if cx.over_budget() {
                cx.timed_out = true;
                return cx.record_leaf(
                    &label,
                    Truth::Unknown,
                    None,
                    Some(REASON_DETECTOR_TIMEOUT),
                );
            }
            let offset = found.as_ref().map(regex::Match::start);
            let hit = match condition {
                RegexCondition::Matches => found.is_some(),
                RegexCondition::NotMatches => found.is_none(),
            };
            cx.record_leaf(&label, Truth::from_bool(hit), offset, None)
        }
        CompiledRule::Semantic { criteria, .. } => match cx.semantic {
            Some(matcher) => match matcher.judge(criteria, cx.response) {
                Some(hit) => cx.record_leaf(&label, Truth::from_bool(hit), None, None),
                None => cx.record_leaf(
                    &label,
                    Truth::Unknown,
                    None,
                    Some(REASON_SEMANTIC_UNAVAILABLE),
                ),
            },
            None => cx.record_leaf(
                &label,
                Truth::Unknown,
                None,
                Some(REASON_SEMANTIC_UNAVAILABLE),
            ),
        },
        CompiledRule::Length { op, n, .. } => {
            let hit = op.apply(cx.response.len(), *n);
            cx.record_leaf(&label, Truth::from_bool(hit), None, None)
        }
        CompiledRule::TokenPresence { tokens, mode, .. } => {
            let response_tokens = cx.tokens().to_vec();
            let present = tokens
                .iter()
                .filter(|t| response_tokens.iter().any(|rt| rt == *t))
                .count();
            let hit = match mode {
                TokenMode::Any => present > 0,
                TokenMode::All => present == tokens.len(),
                TokenMode::None => present == 0,
            };
            cx.record_leaf(&label, Truth::from_bool(hit), None, None)
        }
        _ => Truth::Unknown,
    }
}

// ============================================================================
// Record
// ============================================================================

/// Outcome of evaluating one detection tree against one response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionRecord {
    /// Overall classification
    pub verdict: Verdict,
    /// Labels of leaves that evaluated true
    pub matched_rules: Vec<String>,
    /// Fraction of evaluated leaves with a known outcome
    pub confidence: f64,
    /// Per-leaf evaluation trace in evaluation order
    pub trace: Vec<TraceEntry>,
    /// Whether the evaluation budget was exhausted
    pub timed_out: bool,
}

impl DetectionRecord {
    /// A record for probes that never reached detection.
    #[must_use]
    pub fn error() -> Self {
        Self {
            verdict: Verdict::Error,
            matched_rules: Vec::new(),
            confidence: 0.0,
            trace: Vec::new(),
            timed_out: false,
        }
    }
}

/// One leaf evaluation in a detection trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEntry {
    /// Leaf label
    pub rule: String,
    /// Three-valued outcome
    pub outcome: Truth,
    /// Byte offset of the match, for substring and regex hits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    /// Why the outcome is unknown, when it is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

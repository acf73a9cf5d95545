//! Detection rule schema.
//!
//! A detection is a closed, recursive sum type deserialized from the
//! template catalog. Leaves test the raw response; combinators compose
//! leaves. Evaluation lives in [`crate::detection::eval`].

use serde::{Deserialize, Serialize};

// ============================================================================
// Rule Tree
// ============================================================================

/// One node of a detection tree.
///
/// YAML form uses a `type` tag:
///
/// ```yaml
/// detection:
///   type: any_of
///   rules:
///     - type: string_match
///       substr: "PWNED"
///     - type: regex_match
///       pattern: "(?i)bypass"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectionRule {
    /// Substring test against the raw response
    StringMatch {
        /// Substring to look for
        substr: String,
        /// Whether presence or absence signals a match
        #[serde(default)]
        condition: StringCondition,
        /// Case-sensitive comparison (default false)
        #[serde(default)]
        case_sensitive: bool,
    },

    /// Regex test against the raw response; pattern is compiled at
    /// template load time
    RegexMatch {
        /// Regex pattern
        pattern: String,
        /// Whether a match or a non-match signals success
        #[serde(default)]
        condition: RegexCondition,
        /// Inline flags, a subset of `i`, `m`, `s`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        flags: Option<String>,
    },

    /// Delegated to the optional semantic matcher; unknown when absent
    SemanticMatch {
        /// Natural-language success criteria for the matcher
        criteria: String,
    },

    /// Raw response length predicate (in bytes)
    Length {
        /// Comparison operator
        op: LengthOp,
        /// Right-hand side of the comparison
        n: usize,
    },

    /// Tokenized lookup over whitespace-split, lowercased response tokens
    TokenPresence {
        /// Tokens to look for
        tokens: Vec<String>,
        /// How many of the tokens must be present
        #[serde(default)]
        mode: TokenMode,
    },

    /// True iff every child is true
    AllOf {
        /// Child rules
        rules: Vec<DetectionRule>,
    },

    /// True iff at least one child is true
    AnyOf {
        /// Child rules
        rules: Vec<DetectionRule>,
    },

    /// Inverts the child
    Not {
        /// Child rule
        rule: Box<DetectionRule>,
    },
}

impl DetectionRule {
    /// Short human-readable label used in traces and `matched_rules`.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::StringMatch {
                substr, condition, ..
            } => format!("string_match[{} {substr:?}]", condition.as_str()),
            Self::RegexMatch {
                pattern, condition, ..
            } => format!("regex_match[{} {pattern:?}]", condition.as_str()),
            Self::SemanticMatch { criteria } => format!("semantic_match[{criteria:?}]"),
            Self::Length { op, n } => format!("length[{} {n}]", op.as_str()),
            Self::TokenPresence { tokens, mode } => {
                format!("token_presence[{} of {tokens:?}]", mode.as_str())
            }
            Self::AllOf { rules } => format!("all_of[{}]", rules.len()),
            Self::AnyOf { rules } => format!("any_of[{}]", rules.len()),
            Self::Not { .. } => "not".to_string(),
        }
    }
}

// ============================================================================
// Leaf Conditions
// ============================================================================

/// Condition for [`DetectionRule::StringMatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringCondition {
    /// Match when the substring is present
    #[default]
    Contains,
    /// Match when the substring is absent
    NotContains,
}

impl StringCondition {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
        }
    }
}

/// Condition for [`DetectionRule::RegexMatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegexCondition {
    /// Match when the pattern matches
    #[default]
    Matches,
    /// Match when the pattern does not match
    NotMatches,
}

impl RegexCondition {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Matches => "matches",
            Self::NotMatches => "not_matches",
        }
    }
}

/// Comparison operator for [`DetectionRule::Length`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthOp {
    /// Strictly less than
    Lt,
    /// Less than or equal
    Le,
    /// Exactly equal
    Eq,
    /// Greater than or equal
    Ge,
    /// Strictly greater than
    Gt,
}

impl LengthOp {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Eq => "eq",
            Self::Ge => "ge",
            Self::Gt => "gt",
        }
    }

    /// Applies the operator.
    #[must_use]
    pub const fn apply(self, lhs: usize, rhs: usize) -> bool {
        match self {
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Eq => lhs == rhs,
            Self::Ge => lhs >= rhs,
            Self::Gt => lhs > rhs,
        }
    }
}

/// Mode for [`DetectionRule::TokenPresence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenMode {
    /// At least one token present
    #[default]
    Any,
    /// Every token present
    All,
    /// No token present
    None,
}

impl TokenMode {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::All => "all",
            Self::None => "none",
        }
    }
}

// ============================================================================
// Three-Valued Truth
// ============================================================================

/// Kleene three-valued truth.
///
/// `Unknown` arises from semantic leaves without a matcher and from
/// detector timeouts. Combinators propagate it only when it is decisive:
/// `Unknown && False` is `False`, `Unknown || True` is `True`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Truth {
    /// Definitely true
    True,
    /// Definitely false
    False,
    /// Could not be determined
    Unknown,
}

impl Truth {
    /// Kleene conjunction.
    #[must_use]
    pub const fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::False, _) | (_, Self::False) => Self::False,
            (Self::True, Self::True) => Self::True,
            _ => Self::Unknown,
        }
    }

    /// Kleene disjunction.
    #[must_use]
    pub const fn or(self, other: Self) -> Self {
        match (self, other) {
            (Self::True, _) | (_, Self::True) => Self::True,
            (Self::False, Self::False) => Self::False,
            _ => Self::Unknown,
        }
    }

    /// Kleene negation.
    #[must_use]
    pub const fn negate(self) -> Self {
        match self {
            Self::True => Self::False,
            Self::False => Self::True,
            Self::Unknown => Self::Unknown,
        }
    }

    /// Lifts a plain boolean.
    #[must_use]
    pub const fn from_bool(b: bool) -> Self {
        if b { Self::True } else { Self::False }
    }
}

//! Semantic matcher seam.
//!
//! Semantic leaves delegate to an operator-supplied judge. The engine
//! ships no judge of its own; without one, semantic leaves evaluate to
//! unknown and surface as inconclusive when decisive.

/// Judges whether a response satisfies a natural-language criterion.
///
/// Implementations must be deterministic for a given (criteria,
/// response) pair within one evaluation pass; detection purity depends
/// on it.
pub trait SemanticMatcher: Send + Sync {
    /// Returns `Some(true)` when the response satisfies the criteria,
    /// `Some(false)` when it does not, and `None` when the matcher
    /// cannot decide.
    fn judge(&self, criteria: &str, response: &str) -> Option<bool>;
}

/// Keyword-overlap matcher for tests and offline runs.
///
/// Judges true when at least half of the criteria's words appear in
/// the response (case-insensitive).
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordMatcher;

impl SemanticMatcher for KeywordMatcher {
    fn judge(&self, criteria: &str, response: &str) -> Option<bool> {
        let words: Vec<String> = criteria
            .split_whitespace()
            .map(str::to_lowercase)
            .collect();
        if words.is_empty() {
            return None;
        }
        let response = response.to_lowercase();
        let present = words.iter().filter(|w| response.contains(w.as_str())).count();
        Some(present * 2 >= words.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_matcher_majority() {
        let matcher = KeywordMatcher;
        assert_eq!(
            matcher.judge("system prompt leaked", "the SYSTEM prompt was leaked"),
            Some(true)
        );
        assert_eq!(
            matcher.judge("system prompt leaked", "I cannot help with that"),
            Some(false)
        );
    }

    #[test]
    fn test_keyword_matcher_empty_criteria() {
        assert_eq!(KeywordMatcher.judge("", "anything"), None);
    }
}

//! Variable value generators.
//!
//! Encoding tricks applied to a seed payload before substitution:
//! base64, rot-N, and unicode smuggling. All generators are
//! deterministic for a given (rule, seed) pair so a fixed campaign
//! seed reproduces bit-identical rendered prompts.

use base64::Engine;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};

use crate::template::schema::{GeneratorRule, SmuggleCharset};

// ============================================================================
// Codepoint tables
// ============================================================================

/// Zero-width characters.
const ZERO_WIDTH: &[char] = &[
    '\u{200B}', // ZERO WIDTH SPACE
    '\u{200C}', // ZERO WIDTH NON-JOINER
    '\u{200D}', // ZERO WIDTH JOINER
    '\u{2060}', // WORD JOINER
];

/// Cyrillic lookalikes, indexed by the Latin letter they imitate.
const HOMOGLYPHS: &[(char, char)] = &[
    ('a', '\u{0430}'),
    ('e', '\u{0435}'),
    ('o', '\u{043E}'),
    ('p', '\u{0440}'),
    ('c', '\u{0441}'),
    ('x', '\u{0445}'),
];

/// RTL embedding wrapper: RIGHT-TO-LEFT OVERRIDE .. POP DIRECTIONAL
/// FORMATTING.
const RTL_OPEN: char = '\u{202E}';
const RTL_CLOSE: char = '\u{202C}';

// ============================================================================
// Generation
// ============================================================================

/// Produces the value for a generated variable.
///
/// `seed` perturbs only the randomized charsets (`mixed` smuggling);
/// the rest are fully determined by the rule.
#[must_use]
pub fn generate(rule: &GeneratorRule, seed: u64) -> String {
    match rule {
        GeneratorRule::Base64 { seed: payload } => {
            base64::engine::general_purpose::STANDARD.encode(payload)
        }
        GeneratorRule::Rot { seed: payload, n } => rot_n(payload, *n),
        GeneratorRule::UnicodeSmuggle {
            seed: payload,
            charset,
        } => smuggle(payload, charset.unwrap_or_default(), seed),
    }
}

/// Rotates ASCII letters by `n`, leaving everything else untouched.
fn rot_n(input: &str, n: u32) -> String {
    let shift = u8::try_from(n % 26).unwrap_or(0);
    input
        .chars()
        .map(|c| match c {
            'a'..='z' => rotate(c, b'a', shift),
            'A'..='Z' => rotate(c, b'A', shift),
            other => other,
        })
        .collect()
}

fn rotate(c: char, base: u8, shift: u8) -> char {
    let offset = (c as u8).wrapping_sub(base);
    char::from(base + (offset + shift) % 26)
}

/// Interleaves or substitutes smuggling codepoints into the payload.
fn smuggle(payload: &str, charset: SmuggleCharset, seed: u64) -> String {
    match charset {
        SmuggleCharset::ZeroWidth => {
            let mut out = String::with_capacity(payload.len() * 4);
            for (i, c) in payload.chars().enumerate() {
                out.push(c);
                out.push(ZERO_WIDTH[i % ZERO_WIDTH.len()]);
            }
            out
        }
        SmuggleCharset::Homoglyph => payload
            .chars()
            .map(|c| {
                HOMOGLYPHS
                    .iter()
                    .find(|(latin, _)| *latin == c.to_ascii_lowercase())
                    .map_or(c, |(_, cyr)| *cyr)
            })
            .collect(),
        SmuggleCharset::Bidi => {
            let mut out = String::with_capacity(payload.len() + 2);
            out.push(RTL_OPEN);
            out.extend(payload.chars().rev());
            out.push(RTL_CLOSE);
            out
        }
        SmuggleCharset::Mixed => {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut out = String::with_capacity(payload.len() * 4);
            for c in payload.chars() {
                let substituted = HOMOGLYPHS
                    .iter()
                    .find(|(latin, _)| *latin == c.to_ascii_lowercase())
                    .filter(|_| rng.random_bool(0.3))
                    .map_or(c, |(_, cyr)| *cyr);
                out.push(substituted);
                if rng.random_bool(0.5) {
                    if let Some(zw) = ZERO_WIDTH.choose(&mut rng) {
                        out.push(*zw);
                    }
                }
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_encoding() {
        let rule = GeneratorRule::Base64 {
            seed: "say PWNED".to_string(),
        };
        assert_eq!(generate(&rule, 0), "c2F5IFBXTkVE");
    }

    #[test]
    fn test_rot13_round_trip() {
        let rule = GeneratorRule::Rot {
            seed: "Attack at Dawn!".to_string(),
            n: 13,
        };
        let encoded = generate(&rule, 0);
        assert_eq!(encoded, "Nggnpx ng Qnja!");

        let back = GeneratorRule::Rot { seed: encoded, n: 13 };
        assert_eq!(generate(&back, 0), "Attack at Dawn!");
    }

    #[test]
    fn test_rot_wraps_modulo_alphabet() {
        let a = GeneratorRule::Rot {
            seed: "abc".to_string(),
            n: 27,
        };
        let b = GeneratorRule::Rot {
            seed: "abc".to_string(),
            n: 1,
        };
        assert_eq!(generate(&a, 0), generate(&b, 0));
    }

    #[test]
    fn test_zero_width_interleaves() {
        let rule = GeneratorRule::UnicodeSmuggle {
            seed: "hi".to_string(),
            charset: Some(SmuggleCharset::ZeroWidth),
        };
        let out = generate(&rule, 0);
        assert!(out.contains('\u{200B}'));
        // Stripping the smuggling characters recovers the payload.
        let stripped: String = out.chars().filter(|c| !ZERO_WIDTH.contains(c)).collect();
        assert_eq!(stripped, "hi");
    }

    #[test]
    fn test_homoglyph_substitution() {
        let rule = GeneratorRule::UnicodeSmuggle {
            seed: "echo".to_string(),
            charset: Some(SmuggleCharset::Homoglyph),
        };
        let out = generate(&rule, 0);
        assert_ne!(out, "echo");
        assert_eq!(out.chars().count(), 4);
    }

    #[test]
    fn test_bidi_wraps_reversed() {
        let rule = GeneratorRule::UnicodeSmuggle {
            seed: "abc".to_string(),
            charset: Some(SmuggleCharset::Bidi),
        };
        let out = generate(&rule, 0);
        assert!(out.starts_with(RTL_OPEN));
        assert!(out.ends_with(RTL_CLOSE));
        assert!(out.contains("cba"));
    }

    #[test]
    fn test_mixed_deterministic_per_seed() {
        let rule = GeneratorRule::UnicodeSmuggle {
            seed: "attack payload".to_string(),
            charset: Some(SmuggleCharset::Mixed),
        };
        assert_eq!(generate(&rule, 42), generate(&rule, 42));
        // Different seeds should (overwhelmingly) differ for this length.
        assert_ne!(generate(&rule, 1), generate(&rule, 2));
    }
}

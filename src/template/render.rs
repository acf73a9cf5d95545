//! Prompt rendering and variable expansion.
//!
//! Performs single-pass `{{name}}` substitution. `{{{{` escapes to a
//! literal `{{`. An unresolved placeholder is an error; validation
//! catches it at load time so rendering failures at materialization
//! indicate a template/spec mismatch.

use indexmap::IndexMap;
use regex::Regex;
use std::sync::LazyLock;

use crate::template::generator;
use crate::template::schema::VariableSpec;

/// Regex for `{{name}}` placeholders.
static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_][A-Za-z0-9_.-]*)\s*\}\}").expect("valid regex"));

/// Sentinel marker for escaped `{{{{` sequences.
const ESCAPE_SENTINEL: &str = "\x00ESC_BRACE\x00";

/// Rendering failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    /// A placeholder had no binding
    #[error("unresolved placeholder '{{{{{name}}}}}'")]
    Unresolved {
        /// Placeholder name
        name: String,
    },
}

/// Resolves all `{{name}}` placeholders in a prompt.
///
/// - `{{{{` is treated as a literal `{{` (escape syntax).
/// - Substitution is left-to-right and single-pass: substituted values
///   are never re-interpolated.
///
/// # Errors
///
/// Returns [`RenderError::Unresolved`] for a placeholder missing from
/// the binding.
pub fn render_prompt(
    template: &str,
    binding: &IndexMap<String, String>,
) -> Result<String, RenderError> {
    let working = template.replace("{{{{", ESCAPE_SENTINEL);

    let mut missing: Option<String> = None;
    let result = PLACEHOLDER_RE
        .replace_all(&working, |caps: &regex::Captures| {
            let name = &caps[1];
            binding.get(name).cloned().unwrap_or_else(|| {
                if missing.is_none() {
                    missing = Some(name.to_string());
                }
                String::new()
            })
        })
        .to_string();

    if let Some(name) = missing {
        return Err(RenderError::Unresolved { name });
    }

    Ok(result.replace(ESCAPE_SENTINEL, "{{"))
}

/// Returns the placeholder names referenced by a prompt, in order of
/// first appearance.
#[must_use]
pub fn placeholder_names(template: &str) -> Vec<String> {
    let working = template.replace("{{{{", ESCAPE_SENTINEL);
    let mut seen = Vec::new();
    for caps in PLACEHOLDER_RE.captures_iter(&working) {
        let name = caps[1].to_string();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

// ============================================================================
// Binding Expansion
// ============================================================================

/// Lazy cartesian product over a template's variables.
///
/// Literal and generated variables contribute one value; list variables
/// contribute each entry. The iterator yields bindings in file order of
/// the variables, rightmost varying fastest. Callers bound it with the
/// campaign's expansion cap.
pub struct BindingIter {
    names: Vec<String>,
    values: Vec<Vec<String>>,
    cursor: Vec<usize>,
    done: bool,
}

impl BindingIter {
    /// Builds the expansion for a variable map.
    ///
    /// `seed` feeds generated variables; each variable derives its own
    /// stream from (seed, position) so reordering unrelated variables
    /// does not perturb values.
    #[must_use]
    pub fn new(variables: &IndexMap<String, VariableSpec>, seed: u64) -> Self {
        let mut names = Vec::with_capacity(variables.len());
        let mut values = Vec::with_capacity(variables.len());

        for (index, (name, spec)) in variables.iter().enumerate() {
            let expanded = match spec {
                VariableSpec::Literal(value) => vec![value.clone()],
                VariableSpec::List(list) => {
                    if list.is_empty() {
                        vec![String::new()]
                    } else {
                        list.clone()
                    }
                }
                VariableSpec::Generated { generate } => {
                    vec![generator::generate(generate, seed.wrapping_add(index as u64))]
                }
            };
            names.push(name.clone());
            values.push(expanded);
        }

        Self {
            cursor: vec![0; names.len()],
            done: false,
            names,
            values,
        }
    }

    /// Total number of bindings the full expansion would produce.
    #[must_use]
    pub fn cardinality(&self) -> usize {
        self.values.iter().map(Vec::len).product()
    }
}

impl Iterator for BindingIter {
    type Item = IndexMap<String, String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let binding: IndexMap<String, String> = self
            .names
            .iter()
            .zip(&self.values)
            .zip(&self.cursor)
            .map(|((name, values), &i)| (name.clone(), values[i].clone()))
            .collect();

        // Advance the cursor, rightmost fastest.
        let mut pos = self.cursor.len();
        loop {
            if pos == 0 {
                self.done = true;
                break;
            }
            pos -= 1;
            self.cursor[pos] += 1;
            if self.cursor[pos] < self.values[pos].len() {
                break;
            }
            self.cursor[pos] = 0;
        }

        Some(binding)
    }
}

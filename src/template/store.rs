//! Interned templates and the snapshot store.
//!
//! Templates are frozen after load. A refresh builds a whole new
//! snapshot and swaps the pointer atomically; in-flight readers keep
//! the snapshot they resolved.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use semver::{Version, VersionReq};

use crate::detection::CompiledDetection;
use crate::template::schema::{Category, Severity, TemplateInfo, VariableSpec, Variation};

// ============================================================================
// Interned Template
// ============================================================================

/// A validated, immutable template with detection trees pre-compiled.
#[derive(Debug, Clone)]
pub struct Template {
    /// Globally unique id
    pub id: String,
    /// Parsed semantic version
    pub version: Version,
    /// Attack category
    pub category: Category,
    /// Impact severity
    pub severity: Severity,
    /// Provider ids this template applies to; empty = any
    pub compatibility: Vec<String>,
    /// Prompt body with placeholders
    pub prompt: String,
    /// Variable specs in file order
    pub variables: IndexMap<String, VariableSpec>,
    /// Variations in file order
    pub variations: Vec<Variation>,
    /// Descriptive metadata
    pub info: TemplateInfo,
    /// Root detection expression as authored
    pub detection: crate::detection::DetectionRule,
    /// Compiled root detection
    pub(crate) compiled_root: CompiledDetection,
    /// Compiled per-variation overrides; `None` inherits the root
    pub(crate) compiled_variations: Vec<Option<CompiledDetection>>,
    /// File the template was loaded from
    pub source: PathBuf,
}

impl Template {
    /// The prompt for a variation, or the base prompt.
    #[must_use]
    pub fn prompt_for(&self, variation: Option<usize>) -> Option<&str> {
        match variation {
            None => Some(&self.prompt),
            Some(i) => self.variations.get(i).map(|v| v.prompt.as_str()),
        }
    }

    /// The compiled detection for a variation, falling back to the
    /// root tree when the variation carries no override.
    #[must_use]
    pub fn detection_for(&self, variation: Option<usize>) -> &CompiledDetection {
        variation
            .and_then(|i| self.compiled_variations.get(i))
            .and_then(Option::as_ref)
            .unwrap_or(&self.compiled_root)
    }

    /// Variables for a variation: the parent's map with per-variation
    /// overrides applied key-by-key.
    #[must_use]
    pub fn variables_for(&self, variation: Option<usize>) -> IndexMap<String, VariableSpec> {
        let mut merged = self.variables.clone();
        if let Some(v) = variation.and_then(|i| self.variations.get(i)) {
            for (name, spec) in &v.variables {
                merged.insert(name.clone(), spec.clone());
            }
        }
        merged
    }

    /// Whether the template applies to the given provider.
    #[must_use]
    pub fn applies_to(&self, provider_id: &str) -> bool {
        self.compatibility.is_empty() || self.compatibility.iter().any(|p| p == provider_id)
    }
}

// ============================================================================
// Query Filter
// ============================================================================

/// Filter for snapshot queries.
#[derive(Debug, Clone, Default)]
pub struct TemplateFilter {
    /// Restrict to these ids (empty = no restriction)
    pub ids: Vec<String>,
    /// Restrict to these categories (empty = no restriction)
    pub categories: Vec<Category>,
    /// Minimum severity
    pub min_severity: Option<Severity>,
    /// Only templates compatible with this provider
    pub provider: Option<String>,
    /// Version requirement, e.g. `">=1.2"`
    pub version_req: Option<VersionReq>,
}

impl TemplateFilter {
    /// Whether a template passes the filter.
    #[must_use]
    pub fn matches(&self, template: &Template) -> bool {
        if !self.ids.is_empty() && !self.ids.iter().any(|id| id == &template.id) {
            return false;
        }
        if !self.categories.is_empty() && !self.categories.contains(&template.category) {
            return false;
        }
        if let Some(min) = self.min_severity {
            if template.severity < min {
                return false;
            }
        }
        if let Some(provider) = &self.provider {
            if !template.applies_to(provider) {
                return false;
            }
        }
        if let Some(req) = &self.version_req {
            if !req.matches(&template.version) {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// An immutable view of the loaded catalog.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    templates: HashMap<String, Arc<Template>>,
    order: Vec<String>,
}

impl CatalogSnapshot {
    /// Builds a snapshot from interned templates in load order.
    #[must_use]
    pub fn new(templates: Vec<Arc<Template>>) -> Self {
        let order = templates.iter().map(|t| t.id.clone()).collect();
        let templates = templates.into_iter().map(|t| (t.id.clone(), t)).collect();
        Self { templates, order }
    }

    /// Looks up a template by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Template>> {
        self.templates.get(id).cloned()
    }

    /// Returns templates passing the filter, in load order.
    #[must_use]
    pub fn query(&self, filter: &TemplateFilter) -> Vec<Arc<Template>> {
        self.order
            .iter()
            .filter_map(|id| self.templates.get(id))
            .filter(|t| filter.matches(t))
            .cloned()
            .collect()
    }

    /// Number of templates in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Whether the snapshot holds no templates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Ids in load order.
    #[must_use]
    pub fn ids(&self) -> &[String] {
        &self.order
    }
}

// ============================================================================
// Store
// ============================================================================

/// Source-of-truth for templates in memory.
///
/// Readers call [`TemplateStore::snapshot`] and keep the returned `Arc`
/// for the duration of their work; a concurrent refresh never affects
/// a snapshot already resolved.
#[derive(Debug)]
pub struct TemplateStore {
    current: ArcSwap<CatalogSnapshot>,
}

impl TemplateStore {
    /// Creates a store seeded with an initial snapshot.
    #[must_use]
    pub fn new(snapshot: CatalogSnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Resolves the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current.load_full()
    }

    /// Atomically replaces the current snapshot.
    pub fn refresh(&self, snapshot: CatalogSnapshot) {
        self.current.store(Arc::new(snapshot));
    }
}

impl Default for TemplateStore {
    fn default() -> Self {
        Self::new(CatalogSnapshot::default())
    }
}

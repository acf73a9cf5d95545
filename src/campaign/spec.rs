//! Campaign specs.
//!
//! A spec is the immutable description of one campaign: which
//! templates, against which targets, under which budgets. Specs are
//! validated at submit time; nothing invalid ever reaches the queue.

use serde::{Deserialize, Serialize};

use crate::error::ValidationIssue;
use crate::provider::{GenerationParams, ProviderRegistry};
use crate::selector::Strategy;
use crate::template::{closest_id, CatalogSnapshot, Category, Severity, TemplateFilter};

// ============================================================================
// Spec
// ============================================================================

/// Immutable description of one campaign.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CampaignSpec {
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Opaque operator identity for audit trails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_id: Option<String>,

    /// Which templates to run
    #[serde(default)]
    pub templates: TemplateSelector,

    /// Which providers and models to probe
    pub targets: Vec<TargetSpec>,

    /// Exhaustive enumeration or adaptive selection
    #[serde(default)]
    pub mode: ScheduleMode,

    /// Bandit strategy override for adaptive mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,

    /// Budget caps
    #[serde(default)]
    pub budget: BudgetSpec,

    /// Starting priority for this campaign's jobs
    #[serde(default)]
    pub priority: i32,

    /// Stop probing a (provider, model) after its first client error
    /// and fail the campaign on the first terminal failure
    #[serde(default)]
    pub fail_fast: bool,

    /// Accept catalogs where some files failed validation
    #[serde(default)]
    pub allow_partial_catalog: bool,

    /// Seed for variable generators and the adaptive selector;
    /// fixing it makes rendered prompts bit-identical across runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Per-job deadline as a humantime string (e.g. `"2m"`);
    /// engine default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_deadline: Option<String>,

    /// Cap on variable-expansion bindings per template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expansion_cap: Option<usize>,

    /// Generation parameters forwarded to every probe
    #[serde(default)]
    pub generation: GenerationParams,

    /// System preamble forwarded to every probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// Share one selector across campaigns instead of learning
    /// per-campaign
    #[serde(default)]
    pub global_learning: bool,
}

/// Template restriction: explicit ids and/or predicates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TemplateSelector {
    /// Explicit template ids (empty = no id restriction)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,

    /// Category restriction
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<Category>,

    /// Minimum severity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<Severity>,

    /// Version requirement (semver range)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_req: Option<String>,
}

impl TemplateSelector {
    /// Converts the selector into a store filter for one provider.
    ///
    /// # Errors
    ///
    /// Returns an issue when `version_req` is not a valid semver range.
    pub fn to_filter(&self, provider: Option<String>) -> Result<TemplateFilter, ValidationIssue> {
        let version_req = match &self.version_req {
            Some(raw) => Some(semver::VersionReq::parse(raw).map_err(|e| {
                ValidationIssue::error(
                    "templates.version_req",
                    format!("'{raw}' is not a semver requirement: {e}"),
                )
            })?),
            None => None,
        };
        Ok(TemplateFilter {
            ids: self.ids.clone(),
            categories: self.categories.clone(),
            min_severity: self.min_severity,
            provider,
            version_req,
        })
    }
}

/// One probe target: a provider and the models to fan out over.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TargetSpec {
    /// Provider id (must be registered)
    pub provider: String,

    /// Models to probe; empty = every model the adapter advertises
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,

    /// Credential label for rate-limit partitioning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,

    /// Requests-per-minute override for this target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,

    /// Tokens-per-minute override for this target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_minute: Option<u64>,
}

/// Scheduling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    /// Enumerate every (template, variation, binding, target) up front
    #[default]
    Exhaustive,
    /// Let the bandit choose what to probe next
    Adaptive,
}

/// Budget caps. A campaign terminates when any cap is reached.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BudgetSpec {
    /// Maximum probe jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_jobs: Option<u64>,

    /// Wall-clock budget as a humantime string (e.g. `"10m"`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_clock: Option<String>,

    /// Token spend cap across all probes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,

    /// Stop once this many vulnerable verdicts are recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_vulnerable: Option<u64>,
}

// ============================================================================
// Validation
// ============================================================================

/// Validates a spec against the registry and the pinned snapshot.
///
/// Returned issues of error severity make the submit fail.
#[must_use]
pub fn validate_spec(
    spec: &CampaignSpec,
    snapshot: &CatalogSnapshot,
    registry: &ProviderRegistry,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if spec.targets.is_empty() {
        issues.push(ValidationIssue::error(
            "targets",
            "campaign needs at least one target",
        ));
    }

    let known_providers = registry.names();
    for (index, target) in spec.targets.iter().enumerate() {
        if !registry.contains(&target.provider) {
            let suggestion = closest_id(
                &target.provider,
                known_providers.iter().map(String::as_str),
            );
            let hint =
                suggestion.map_or_else(String::new, |s| format!(" (did you mean '{s}'?)"));
            issues.push(ValidationIssue::error(
                format!("targets[{index}].provider"),
                format!("unknown provider '{}'{hint}", target.provider),
            ));
        }
    }

    for (index, id) in spec.templates.ids.iter().enumerate() {
        if snapshot.get(id).is_none() {
            let suggestion = closest_id(id, snapshot.ids().iter().map(String::as_str));
            let hint =
                suggestion.map_or_else(String::new, |s| format!(" (did you mean '{s}'?)"));
            issues.push(ValidationIssue::error(
                format!("templates.ids[{index}]"),
                format!("unknown template '{id}'{hint}"),
            ));
        }
    }

    if let Err(issue) = spec.templates.to_filter(None) {
        issues.push(issue);
    }

    if let Some(raw) = &spec.job_deadline {
        if humantime::parse_duration(raw).is_err() {
            issues.push(ValidationIssue::error(
                "job_deadline",
                format!("'{raw}' is not a duration"),
            ));
        }
    }
    if let Some(raw) = &spec.budget.wall_clock {
        if humantime::parse_duration(raw).is_err() {
            issues.push(ValidationIssue::error(
                "budget.wall_clock",
                format!("'{raw}' is not a duration"),
            ));
        }
    }

    if spec.budget.max_jobs == Some(0) {
        issues.push(ValidationIssue::warning(
            "budget.max_jobs",
            "a zero job budget runs nothing",
        ));
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::IssueSeverity;
    use crate::provider::ScriptedAdapter;
    use std::sync::Arc;

    fn registry() -> ProviderRegistry {
        let reg = ProviderRegistry::new(&EngineConfig::default());
        reg.register(Arc::new(ScriptedAdapter::always("stub", "ok")));
        reg
    }

    fn minimal_spec() -> CampaignSpec {
        CampaignSpec {
            targets: vec![TargetSpec {
                provider: "stub".to_string(),
                models: vec!["m".to_string()],
                credential: None,
                requests_per_minute: None,
                tokens_per_minute: None,
            }],
            ..CampaignSpec::default()
        }
    }

    #[test]
    fn test_spec_deserialize_minimal() {
        let yaml = r#"
targets:
  - provider: stub
    models: [stub-model]
"#;
        let spec: CampaignSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.mode, ScheduleMode::Exhaustive);
        assert_eq!(spec.targets.len(), 1);
        assert!(!spec.fail_fast);
    }

    #[test]
    fn test_spec_deserialize_adaptive_with_budget() {
        let yaml = r#"
mode: adaptive
strategy:
  type: thompson_sampling
templates:
  categories: [prompt_injection, jailbreak]
  min_severity: medium
targets:
  - provider: stub
budget:
  max_jobs: 100
  wall_clock: "10m"
  target_vulnerable: 5
"#;
        let spec: CampaignSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.mode, ScheduleMode::Adaptive);
        assert_eq!(spec.budget.max_jobs, Some(100));
        assert_eq!(spec.templates.categories.len(), 2);
    }

    #[test]
    fn test_validate_ok() {
        let issues = validate_spec(&minimal_spec(), &CatalogSnapshot::default(), &registry());
        assert!(
            issues
                .iter()
                .all(|i| i.severity != IssueSeverity::Error),
            "{issues:?}"
        );
    }

    #[test]
    fn test_validate_unknown_provider_suggests() {
        let mut spec = minimal_spec();
        spec.targets[0].provider = "stob".to_string();
        let issues = validate_spec(&spec, &CatalogSnapshot::default(), &registry());
        assert!(issues.iter().any(|i| i.message.contains("did you mean 'stub'")));
    }

    #[test]
    fn test_validate_empty_targets() {
        let spec = CampaignSpec::default();
        let issues = validate_spec(&spec, &CatalogSnapshot::default(), &registry());
        assert!(issues.iter().any(|i| i.path == "targets"));
    }

    #[test]
    fn test_validate_bad_durations() {
        let mut spec = minimal_spec();
        spec.job_deadline = Some("not-a-duration".to_string());
        spec.budget.wall_clock = Some("also wrong".to_string());
        let issues = validate_spec(&spec, &CatalogSnapshot::default(), &registry());
        assert!(issues.iter().any(|i| i.path == "job_deadline"));
        assert!(issues.iter().any(|i| i.path == "budget.wall_clock"));
    }

    #[test]
    fn test_validate_bad_version_req() {
        let mut spec = minimal_spec();
        spec.templates.version_req = Some("not semver!!".to_string());
        let issues = validate_spec(&spec, &CatalogSnapshot::default(), &registry());
        assert!(issues.iter().any(|i| i.path == "templates.version_req"));
    }
}

//! Adaptive selector.
//!
//! A multi-armed bandit over (template, provider, model) arms. Rewards
//! are binary: vulnerable = 1, defended = 0. Inconclusive and error
//! outcomes count a pull with cost but leave the posterior untouched,
//! so a broken arm still loses ground to working ones.

use std::sync::Mutex;

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::probe::Verdict;
use crate::template::{Category, Severity};

// ============================================================================
// Arms
// ============================================================================

/// One element of the selector's action space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArmKey {
    /// Template id
    pub template_id: String,
    /// Provider id
    pub provider_id: String,
    /// Model id
    pub model_id: String,
}

/// Sufficient statistics for one arm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ArmStats {
    /// Total pulls, all outcomes included
    pub pulls: u64,
    /// Pulls that came back vulnerable
    pub vulnerable: u64,
    /// Pulls that came back defended
    pub defended: u64,
    /// Pulls that came back inconclusive
    pub inconclusive: u64,
    /// Pulls that terminated in error
    pub errors: u64,
    /// Beta posterior alpha (successes + 1)
    pub alpha: f64,
    /// Beta posterior beta (failures + 1)
    pub beta: f64,
    /// Accumulated cost (token spend or wall time, campaign-defined)
    pub cost: f64,
}

impl Default for ArmStats {
    fn default() -> Self {
        Self {
            pulls: 0,
            vulnerable: 0,
            defended: 0,
            inconclusive: 0,
            errors: 0,
            alpha: 1.0,
            beta: 1.0,
            cost: 0.0,
        }
    }
}

impl ArmStats {
    /// Observed success mean from decisive pulls; 0.5 before any
    /// decisive outcome.
    #[must_use]
    pub fn mean(&self) -> f64 {
        let decisive = self.vulnerable + self.defended;
        if decisive == 0 {
            0.5
        } else {
            #[allow(clippy::cast_precision_loss)]
            let mean = self.vulnerable as f64 / decisive as f64;
            mean
        }
    }
}

#[derive(Debug)]
struct ArmState {
    stats: ArmStats,
    category: Category,
    severity: Severity,
}

// ============================================================================
// Strategy and Context
// ============================================================================

/// Bandit strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Strategy {
    /// Explore with probability epsilon, exploit otherwise
    EpsilonGreedy {
        /// Exploration probability
        epsilon: f64,
    },
    /// Upper confidence bound
    Ucb1,
    /// Thompson sampling over a Beta(alpha, beta) posterior
    ThompsonSampling,
}

impl Default for Strategy {
    fn default() -> Self {
        Self::ThompsonSampling
    }
}

/// Restriction on the eligible arms for one `next` call.
#[derive(Debug, Clone, Default)]
pub struct SelectorContext {
    /// Eligible categories (empty = all)
    pub categories: Vec<Category>,
    /// Minimum severity
    pub min_severity: Option<Severity>,
    /// Restrict to one provider
    pub provider: Option<String>,
}

impl SelectorContext {
    fn admits(&self, state: &ArmState, key: &ArmKey) -> bool {
        if !self.categories.is_empty() && !self.categories.contains(&state.category) {
            return false;
        }
        if let Some(min) = self.min_severity {
            if state.severity < min {
                return false;
            }
        }
        if let Some(provider) = &self.provider {
            if &key.provider_id != provider {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// Selector
// ============================================================================

/// Multi-armed-bandit chooser over (template, provider, model) arms.
///
/// Per-arm updates serialize on the arm's map entry; `next` takes a
/// read pass over all arms.
pub struct AdaptiveSelector {
    arms: DashMap<ArmKey, ArmState>,
    strategy: Strategy,
    cold_start_pulls: u64,
    rng: Mutex<StdRng>,
}

impl AdaptiveSelector {
    /// Creates a selector. A fixed `seed` makes arm choice
    /// reproducible.
    #[must_use]
    pub fn new(strategy: Strategy, cold_start_pulls: u64, seed: Option<u64>) -> Self {
        let rng = seed.map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);
        Self {
            arms: DashMap::new(),
            strategy,
            cold_start_pulls,
            rng: Mutex::new(rng),
        }
    }

    /// Registers an arm with the metadata the context filter needs.
    /// Re-registering an existing arm keeps its statistics.
    pub fn register_arm(&self, key: ArmKey, category: Category, severity: Severity) {
        self.arms.entry(key).or_insert_with(|| ArmState {
            stats: ArmStats::default(),
            category,
            severity,
        });
    }

    /// Number of registered arms.
    #[must_use]
    pub fn arm_count(&self) -> usize {
        self.arms.len()
    }

    /// Chooses the next arm to pull.
    ///
    /// Arms below the cold-start pull floor are chosen uniformly at
    /// random before any exploitation; with zero history everywhere
    /// this degenerates to a uniform choice over all eligible arms.
    #[must_use]
    pub fn next(&self, context: &SelectorContext) -> Option<ArmKey> {
        let eligible: Vec<(ArmKey, ArmStats)> = self
            .arms
            .iter()
            .filter(|entry| context.admits(entry.value(), entry.key()))
            .map(|entry| (entry.key().clone(), entry.value().stats))
            .collect();

        if eligible.is_empty() {
            return None;
        }

        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Cold start: forced pulls before exploitation.
        let cold: Vec<&(ArmKey, ArmStats)> = eligible
            .iter()
            .filter(|(_, stats)| stats.pulls < self.cold_start_pulls)
            .collect();
        if !cold.is_empty() {
            return cold.choose(&mut *rng).map(|(key, _)| key.clone());
        }

        let chosen = match self.strategy {
            Strategy::EpsilonGreedy { epsilon } => {
                if rng.random_bool(epsilon.clamp(0.0, 1.0)) {
                    eligible.choose(&mut *rng).map(|(key, _)| key.clone())
                } else {
                    best_by(&eligible, |stats| stats.mean())
                }
            }
            Strategy::Ucb1 => {
                #[allow(clippy::cast_precision_loss)]
                let total: f64 = eligible.iter().map(|(_, s)| s.pulls as f64).sum();
                best_by(&eligible, |stats| {
                    if stats.pulls == 0 {
                        f64::INFINITY
                    } else {
                        #[allow(clippy::cast_precision_loss)]
                        let bonus = (2.0 * total.max(1.0).ln() / stats.pulls as f64).sqrt();
                        stats.mean() + bonus
                    }
                })
            }
            Strategy::ThompsonSampling => best_by(&eligible, |stats| {
                Beta::new(stats.alpha, stats.beta)
                    .map_or(stats.mean(), |dist| dist.sample(&mut *rng))
            }),
        };

        trace!(?chosen, "selector chose arm");
        chosen
    }

    /// Records the outcome of one pull.
    ///
    /// `cost` is charged regardless of outcome; the Beta posterior
    /// moves only on decisive verdicts.
    pub fn update(&self, key: &ArmKey, verdict: Verdict, cost: f64) {
        let Some(mut entry) = self.arms.get_mut(key) else {
            return;
        };
        let stats = &mut entry.stats;
        stats.pulls += 1;
        stats.cost += cost;
        match verdict {
            Verdict::Vulnerable => {
                stats.vulnerable += 1;
                stats.alpha += 1.0;
            }
            Verdict::Defended => {
                stats.defended += 1;
                stats.beta += 1.0;
            }
            Verdict::Inconclusive => stats.inconclusive += 1,
            Verdict::Error => stats.errors += 1,
        }
    }

    /// Copies out every arm's statistics for reporting.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(ArmKey, ArmStats)> {
        self.arms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats))
            .collect()
    }
}

/// Argmax with the selector's RNG-free tie behavior (first wins).
fn best_by<F>(eligible: &[(ArmKey, ArmStats)], mut score: F) -> Option<ArmKey>
where
    F: FnMut(&ArmStats) -> f64,
{
    eligible
        .iter()
        .map(|(key, stats)| (key, score(stats)))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(key, _)| key.clone())
}

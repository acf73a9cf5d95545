//! Campaigns.
//!
//! A campaign groups probe jobs under one spec and budget. The handle
//! tracks live state (status, counters, blocked targets); the
//! controller composes everything into user-facing operations.

mod controller;
mod spec;

pub use controller::CampaignController;
pub use spec::{
    validate_spec, BudgetSpec, CampaignSpec, ScheduleMode, TargetSpec, TemplateSelector,
};

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::error::CampaignError;
use crate::probe::ProbeResult;
use crate::selector::AdaptiveSelector;
use crate::store::CampaignCounters;
use crate::template::CatalogSnapshot;

// ============================================================================
// Status
// ============================================================================

/// Campaign lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    /// Created, nothing dispatched yet
    Pending,
    /// Jobs are dispatching
    Running,
    /// Dispatch suspended; leased jobs return to the queue
    Paused,
    /// All work finished or a budget cap was reached
    Completed,
    /// Operator cancel
    Cancelled,
    /// Spec-level failure or persistent client errors on all targets
    Failed,
}

impl CampaignStatus {
    /// Whether the status is terminal (immutable thereafter).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Cancelled | Self::Failed)
                | (
                    Self::Running,
                    Self::Paused | Self::Completed | Self::Cancelled | Self::Failed
                )
                | (Self::Paused, Self::Running | Self::Cancelled | Self::Failed)
        )
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Public Snapshot
// ============================================================================

/// Point-in-time view of a campaign for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct Campaign {
    /// Campaign id
    pub campaign_id: Uuid,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Display name from the spec
    pub name: Option<String>,
    /// Operator identity from the spec
    pub operator_id: Option<String>,
    /// Current status
    pub status: CampaignStatus,
    /// Verdict totals so far
    pub counters: CampaignCounters,
    /// Jobs enqueued so far
    pub jobs_enqueued: u64,
}

// ============================================================================
// Handle
// ============================================================================

/// Live state of one campaign, shared between the controller and the
/// executor's workers.
pub struct CampaignHandle {
    /// Campaign id
    pub id: Uuid,
    /// The immutable spec
    pub spec: CampaignSpec,
    /// Catalog snapshot pinned at start; a store refresh never
    /// affects a running campaign
    pub snapshot: Arc<CatalogSnapshot>,
    /// Bandit state for adaptive mode
    pub selector: Option<Arc<AdaptiveSelector>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Cancellation scope for this campaign's probes
    pub cancel: CancellationToken,
    /// Wall-clock cutoff derived from the budget
    pub wall_deadline: Option<Instant>,

    status: RwLock<CampaignStatus>,
    counters: Mutex<CampaignCounters>,
    jobs_enqueued: AtomicU64,
    blocked_targets: Mutex<HashSet<(String, String)>>,
}

impl CampaignHandle {
    pub(crate) fn new(
        spec: CampaignSpec,
        snapshot: Arc<CatalogSnapshot>,
        selector: Option<Arc<AdaptiveSelector>>,
        cancel: CancellationToken,
        wall_deadline: Option<Instant>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            spec,
            snapshot,
            selector,
            created_at: Utc::now(),
            cancel,
            wall_deadline,
            status: RwLock::new(CampaignStatus::Pending),
            counters: Mutex::new(CampaignCounters::default()),
            jobs_enqueued: AtomicU64::new(0),
            blocked_targets: Mutex::new(HashSet::new()),
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> CampaignStatus {
        *self
            .status
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Attempts a status transition; terminal states are immutable.
    pub(crate) fn transition(&self, next: CampaignStatus) -> Result<(), CampaignError> {
        let mut status = self
            .status
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !status.can_transition_to(next) {
            return Err(CampaignError::InvalidTransition {
                from: status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        info!(campaign = %self.id, from = %*status, to = %next, "campaign status change");
        *status = next;
        Ok(())
    }

    /// Whether workers should return this campaign's jobs unprocessed.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.status() == CampaignStatus::Paused
    }

    /// Whether the campaign was cancelled or hit its wall clock.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.status() == CampaignStatus::Cancelled
    }

    /// Folds one terminal result into the counters and returns the
    /// updated totals.
    pub(crate) fn record_result(&self, result: &ProbeResult) -> CampaignCounters {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        counters.record(result);
        *counters
    }

    /// Current verdict totals.
    #[must_use]
    pub fn counters(&self) -> CampaignCounters {
        *self
            .counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Records one enqueued job and returns the running total.
    pub(crate) fn note_enqueued(&self) -> u64 {
        self.jobs_enqueued.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Jobs enqueued so far.
    #[must_use]
    pub fn jobs_enqueued(&self) -> u64 {
        self.jobs_enqueued.load(Ordering::SeqCst)
    }

    /// Whether the job budget admits another enqueue.
    #[must_use]
    pub fn job_budget_remaining(&self) -> bool {
        self.spec
            .budget
            .max_jobs
            .is_none_or(|cap| self.jobs_enqueued() < cap)
    }

    /// Marks a (provider, model) as dead after a client error. Returns
    /// whether every target of the campaign is now blocked.
    pub(crate) fn block_target(&self, provider: &str, model: &str) -> bool {
        let mut blocked = self
            .blocked_targets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        blocked.insert((provider.to_string(), model.to_string()));

        self.spec.targets.iter().all(|target| {
            let models: Vec<&str> = if target.models.is_empty() {
                // Unknown fan-out; a single block cannot prove the
                // whole provider dead.
                return false;
            } else {
                target.models.iter().map(String::as_str).collect()
            };
            models
                .iter()
                .all(|m| blocked.contains(&(target.provider.clone(), (*m).to_string())))
        })
    }

    /// Whether a (provider, model) has been blocked for this campaign.
    #[must_use]
    pub fn target_blocked(&self, provider: &str, model: &str) -> bool {
        self.blocked_targets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(&(provider.to_string(), model.to_string()))
    }

    /// Whether any budget cap is exhausted given the current totals.
    #[must_use]
    pub fn budget_exhausted(&self, counters: &CampaignCounters) -> bool {
        if let Some(cap) = self.spec.budget.max_tokens {
            if counters.tokens_in + counters.tokens_out >= cap {
                return true;
            }
        }
        if let Some(target) = self.spec.budget.target_vulnerable {
            if counters.vulnerable >= target {
                return true;
            }
        }
        if let Some(deadline) = self.wall_deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        false
    }

    /// Public snapshot for status queries.
    #[must_use]
    pub fn view(&self) -> Campaign {
        Campaign {
            campaign_id: self.id,
            created_at: self.created_at,
            name: self.spec.name.clone(),
            operator_id: self.spec.operator_id.clone(),
            status: self.status(),
            counters: self.counters(),
            jobs_enqueued: self.jobs_enqueued(),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// All campaigns known to the engine.
#[derive(Default)]
pub struct CampaignRegistry {
    campaigns: DashMap<Uuid, Arc<CampaignHandle>>,
}

impl CampaignRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, handle: Arc<CampaignHandle>) {
        self.campaigns.insert(handle.id, handle);
    }

    /// Looks up a campaign.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Arc<CampaignHandle>> {
        self.campaigns.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// All campaign ids.
    #[must_use]
    pub fn ids(&self) -> Vec<Uuid> {
        self.campaigns.iter().map(|e| *e.key()).collect()
    }
}

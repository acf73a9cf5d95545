//! Campaign controller.
//!
//! The user-facing composition point: wires the template store,
//! provider registry, governor, queue, executor, result store, and
//! selector into campaign operations.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;
use uuid::Uuid;

use crate::campaign::{
    validate_spec, Campaign, CampaignHandle, CampaignRegistry, CampaignSpec, CampaignStatus,
    ScheduleMode,
};
use crate::config::EngineConfig;
use crate::detection::SemanticMatcher;
use crate::error::{CampaignError, CatalogError, IssueSeverity, ValidationIssue};
use crate::executor::{Executor, ExecutorContext};
use crate::governor::{RateGovernor, RateKey, RateLimits};
use crate::observability::metrics;
use crate::probe::{ProbeJob, ProbeResult};
use crate::provider::ProviderRegistry;
use crate::queue::{MemoryQueue, QueueDriver};
use crate::selector::{AdaptiveSelector, ArmKey, ArmStats, SelectorContext, Strategy};
use crate::store::{Page, ResultFilter, ResultStore};
use crate::template::{
    BindingIter, CatalogLoader, CatalogSource, LoadReport, LoaderOptions, Template, TemplateStore,
};

/// Monitor poll interval; a backstop for wall-clock budgets when the
/// result feed is quiet.
const MONITOR_TICK: Duration = Duration::from_millis(250);

// ============================================================================
// Controller
// ============================================================================

/// Composes the engine's components into user-facing campaign runs.
pub struct CampaignController {
    ctx: Arc<ExecutorContext>,
    executor: Arc<Executor>,
    templates: Arc<TemplateStore>,
    global_selector: Arc<AdaptiveSelector>,
    cancel: CancellationToken,
    monitors: std::sync::Mutex<Vec<JoinHandle<()>>>,
    /// Whether the active snapshot came from a load with per-file
    /// failures; campaigns must opt in to run against it.
    partial_catalog: std::sync::atomic::AtomicBool,
}

impl CampaignController {
    /// Builds a controller over the given template store and provider
    /// registry, with an in-memory queue and result store, and spawns
    /// the worker pool.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        templates: Arc<TemplateStore>,
        providers: Arc<ProviderRegistry>,
    ) -> Self {
        let store = Arc::new(ResultStore::new(config.subscription_capacity));
        Self::with_parts(config, templates, providers, store, None)
    }

    /// Builds a controller with a custom result store (e.g. persistent)
    /// and an optional semantic matcher.
    #[must_use]
    pub fn with_parts(
        config: EngineConfig,
        templates: Arc<TemplateStore>,
        providers: Arc<ProviderRegistry>,
        store: Arc<ResultStore>,
        semantic: Option<Arc<dyn SemanticMatcher>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let queue: Arc<dyn QueueDriver> = Arc::new(MemoryQueue::new(&config));
        let governor = Arc::new(RateGovernor::new(&config));
        let campaigns = Arc::new(CampaignRegistry::new());
        let global_selector = Arc::new(AdaptiveSelector::new(
            Strategy::default(),
            config.cold_start_pulls,
            None,
        ));

        let worker_count = config.worker_count(providers.names().len().max(1));
        let ctx = Arc::new(ExecutorContext {
            config,
            queue,
            providers,
            governor,
            store,
            campaigns,
            semantic,
        });
        let executor = Arc::new(Executor::new(Arc::clone(&ctx), cancel.child_token()));
        executor.spawn_workers(worker_count);
        info!(workers = worker_count, "execution engine started");

        Self {
            ctx,
            executor,
            templates,
            global_selector,
            cancel,
            monitors: std::sync::Mutex::new(Vec::new()),
            partial_catalog: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// The result store, for queries and subscriptions.
    #[must_use]
    pub fn store(&self) -> &Arc<ResultStore> {
        &self.ctx.store
    }

    /// Depth of the job queue.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.ctx.queue.depth()
    }

    /// Loads catalog sources and atomically swaps the template
    /// snapshot. Running campaigns keep their pinned snapshots.
    ///
    /// # Errors
    ///
    /// Propagates loader failures; the current snapshot stays in place
    /// when the load fails.
    pub fn refresh_catalog(
        &self,
        sources: &[CatalogSource],
        options: LoaderOptions,
    ) -> Result<LoadReport, CatalogError> {
        let loader = CatalogLoader::new(options);
        let (snapshot, report) = loader.load(sources)?;
        self.templates.refresh(snapshot);
        self.partial_catalog
            .store(!report.failed.is_empty(), std::sync::atomic::Ordering::SeqCst);
        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "catalog refreshed"
        );
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Campaign operations
    // ------------------------------------------------------------------

    /// Starts a campaign and returns its id.
    ///
    /// # Errors
    ///
    /// - [`CampaignError::InvalidSpec`] when validation fails
    /// - [`CampaignError::NoTemplatesMatched`] when the filter selects
    ///   nothing for any target
    pub async fn start(&self, spec: CampaignSpec) -> Result<Uuid, CampaignError> {
        let snapshot = self.templates.snapshot();

        let issues = validate_spec(&spec, &snapshot, &self.ctx.providers);
        if issues.iter().any(|i| i.severity == IssueSeverity::Error) {
            return Err(CampaignError::InvalidSpec { errors: issues });
        }

        // A snapshot that loaded with failures only serves campaigns
        // that opted into partial catalogs.
        if self
            .partial_catalog
            .load(std::sync::atomic::Ordering::SeqCst)
            && !spec.allow_partial_catalog
        {
            return Err(CampaignError::InvalidSpec {
                errors: vec![ValidationIssue::error(
                    "allow_partial_catalog",
                    "the active catalog loaded with failures; set allow_partial_catalog to run against it",
                )],
            });
        }

        // Resolve the (provider, model) fan-out up front.
        let mut targets: Vec<(String, String)> = Vec::new();
        for target in &spec.targets {
            let models = if target.models.is_empty() {
                self.ctx
                    .providers
                    .supported_models(&target.provider)
                    .unwrap_or_default()
            } else {
                target.models.clone()
            };
            for model in models {
                if let (Some(rpm), Some(tpm)) =
                    (target.requests_per_minute, target.tokens_per_minute)
                {
                    self.ctx.governor.configure(
                        RateKey {
                            provider: target.provider.clone(),
                            model: model.clone(),
                            credential: target.credential.clone(),
                        },
                        RateLimits {
                            requests_per_minute: rpm,
                            tokens_per_minute: tpm,
                        },
                    );
                }
                targets.push((target.provider.clone(), model));
            }
        }
        if targets.is_empty() {
            return Err(CampaignError::InvalidSpec {
                errors: vec![ValidationIssue::error(
                    "targets",
                    "no (provider, model) pairs resolved",
                )],
            });
        }

        // Per-target template sets, honoring compatibility.
        let mut plans: Vec<(Arc<Template>, String, String)> = Vec::new();
        for (provider, model) in &targets {
            let filter = spec
                .templates
                .to_filter(Some(provider.clone()))
                .map_err(|issue| CampaignError::InvalidSpec {
                    errors: vec![issue],
                })?;
            for template in snapshot.query(&filter) {
                plans.push((template, provider.clone(), model.clone()));
            }
        }
        if plans.is_empty() {
            return Err(CampaignError::NoTemplatesMatched);
        }

        let wall_deadline = spec
            .budget
            .wall_clock
            .as_deref()
            .and_then(|raw| humantime::parse_duration(raw).ok())
            .map(|d| Instant::now() + d);

        let selector = match spec.mode {
            ScheduleMode::Exhaustive => None,
            ScheduleMode::Adaptive => {
                let selector = if spec.global_learning {
                    Arc::clone(&self.global_selector)
                } else {
                    Arc::new(AdaptiveSelector::new(
                        spec.strategy.unwrap_or_default(),
                        self.ctx.config.cold_start_pulls,
                        spec.seed,
                    ))
                };
                for (template, provider, model) in &plans {
                    selector.register_arm(
                        ArmKey {
                            template_id: template.id.clone(),
                            provider_id: provider.clone(),
                            model_id: model.clone(),
                        },
                        template.category,
                        template.severity,
                    );
                }
                Some(selector)
            }
        };

        let handle = Arc::new(CampaignHandle::new(
            spec,
            Arc::clone(&snapshot),
            selector,
            self.cancel.child_token(),
            wall_deadline,
        ));
        self.ctx.campaigns.insert(Arc::clone(&handle));
        info!(campaign = %handle.id, mode = ?handle.spec.mode, targets = targets.len(), "campaign created");

        match handle.spec.mode {
            ScheduleMode::Exhaustive => {
                let enqueued = materialize_exhaustive(&self.ctx, &handle, &plans).await?;
                if enqueued == 0 {
                    handle.transition(CampaignStatus::Failed)?;
                    return Err(CampaignError::NoTemplatesMatched);
                }
            }
            ScheduleMode::Adaptive => {
                // Seed the pipeline; the monitor refills per result.
                let batch = handle
                    .spec
                    .budget
                    .max_jobs
                    .map_or(4, |cap| cap.min(8))
                    .max(1);
                for _ in 0..batch {
                    if !enqueue_adaptive_probe(&self.ctx, &handle).await? {
                        break;
                    }
                }
            }
        }

        handle.transition(CampaignStatus::Running)?;
        self.spawn_monitor(Arc::clone(&handle));
        Ok(handle.id)
    }

    /// Pauses a running campaign. Leased jobs return to the queue;
    /// nothing new dispatches until resume.
    ///
    /// # Errors
    ///
    /// Fails for unknown campaigns and invalid transitions.
    pub fn pause(&self, id: Uuid) -> Result<(), CampaignError> {
        let handle = self.handle(id)?;
        handle.transition(CampaignStatus::Paused)
    }

    /// Resumes a paused campaign.
    ///
    /// # Errors
    ///
    /// Fails for unknown campaigns and invalid transitions.
    pub fn resume(&self, id: Uuid) -> Result<(), CampaignError> {
        let handle = self.handle(id)?;
        handle.transition(CampaignStatus::Running)
    }

    /// Cancels a campaign. Queued and in-flight jobs terminate with
    /// `error_kind = cancelled`.
    ///
    /// # Errors
    ///
    /// Fails for unknown campaigns and invalid transitions.
    pub fn cancel(&self, id: Uuid) -> Result<(), CampaignError> {
        let handle = self.handle(id)?;
        handle.transition(CampaignStatus::Cancelled)?;
        handle.cancel.cancel();
        metrics::record_campaign(CampaignStatus::Cancelled.as_str());
        Ok(())
    }

    /// Point-in-time campaign status.
    ///
    /// # Errors
    ///
    /// Fails for unknown campaigns.
    pub fn status(&self, id: Uuid) -> Result<Campaign, CampaignError> {
        Ok(self.handle(id)?.view())
    }

    /// Pull-based result access for one campaign.
    #[must_use]
    pub fn results(&self, id: Uuid, page: Page) -> Vec<Arc<ProbeResult>> {
        self.ctx.store.query(
            &ResultFilter {
                campaign_id: Some(id),
                ..ResultFilter::default()
            },
            page,
        )
    }

    /// Push-based result feed across all campaigns. At-least-once;
    /// consumers de-dupe by `result_id`.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ProbeResult>> {
        self.ctx.store.subscribe()
    }

    /// Streaming view of one campaign's results as they land.
    pub fn result_stream(
        &self,
        id: Uuid,
    ) -> impl futures_util::Stream<Item = Arc<ProbeResult>> + Send {
        self.ctx.store.stream(Some(id))
    }

    /// Bandit statistics for an adaptive campaign.
    ///
    /// # Errors
    ///
    /// Fails for unknown campaigns; returns an empty vec for
    /// exhaustive campaigns.
    pub fn selector_snapshot(&self, id: Uuid) -> Result<Vec<(ArmKey, ArmStats)>, CampaignError> {
        let handle = self.handle(id)?;
        Ok(handle
            .selector
            .as_ref()
            .map(|s| s.snapshot())
            .unwrap_or_default())
    }

    /// Cancels everything and drains the worker pool.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.executor.shutdown().await;
        let monitors = {
            let mut guard = self
                .monitors
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        for monitor in monitors {
            let _ = monitor.await;
        }
    }

    fn handle(&self, id: Uuid) -> Result<Arc<CampaignHandle>, CampaignError> {
        self.ctx
            .campaigns
            .get(id)
            .ok_or(CampaignError::UnknownCampaign { id })
    }

    /// Watches one campaign to terminal state: refills adaptive
    /// pipelines, enforces budgets, and flips the status when the last
    /// result lands.
    fn spawn_monitor(&self, handle: Arc<CampaignHandle>) {
        let ctx = Arc::clone(&self.ctx);
        let cancel = self.cancel.clone();

        let task = tokio::spawn(async move {
            let mut feed = ctx.store.subscribe();
            loop {
                if cancel.is_cancelled() || handle.status().is_terminal() {
                    break;
                }

                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(MONITOR_TICK) => {}
                    received = feed.recv() => {
                        match received {
                            Ok(result) if result.campaign_id == handle.id => {}
                            Ok(_) => continue,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                debug!(campaign = %handle.id, skipped, "monitor feed lagged; resynchronizing");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }

                let counters = handle.counters();

                // fail_fast promotes the first terminal error to a
                // campaign failure instead of carrying on.
                if handle.spec.fail_fast
                    && counters.error > 0
                    && handle.status() == CampaignStatus::Running
                {
                    warn!(campaign = %handle.id, "terminal probe error with fail_fast set");
                    if handle.transition(CampaignStatus::Failed).is_ok() {
                        metrics::record_campaign(CampaignStatus::Failed.as_str());
                    }
                    handle.cancel.cancel();
                    break;
                }

                // Budget caps stop further work; in-flight probes get
                // cancelled and drain as `cancelled` results.
                if handle.budget_exhausted(&counters)
                    && handle.status() == CampaignStatus::Running
                {
                    debug!(campaign = %handle.id, "budget exhausted; stopping dispatch");
                    handle.cancel.cancel();
                }

                // Adaptive refill: one new probe per observed result
                // while budgets remain.
                if handle.spec.mode == ScheduleMode::Adaptive
                    && handle.status() == CampaignStatus::Running
                    && !handle.cancel.is_cancelled()
                {
                    let _ = enqueue_adaptive_probe(&ctx, &handle).await;
                }

                // Terminal condition: every enqueued job has reached a
                // terminal result and nothing more will be enqueued.
                let drained = counters.total() >= handle.jobs_enqueued();
                let no_more = match handle.spec.mode {
                    ScheduleMode::Exhaustive => true,
                    ScheduleMode::Adaptive => {
                        handle.cancel.is_cancelled()
                            || !handle.job_budget_remaining()
                            || handle.budget_exhausted(&counters)
                    }
                };
                if drained && no_more && handle.jobs_enqueued() > 0 {
                    if handle.status() == CampaignStatus::Running
                        && handle.transition(CampaignStatus::Completed).is_ok()
                    {
                        metrics::record_campaign(CampaignStatus::Completed.as_str());
                        info!(
                            campaign = %handle.id,
                            vulnerable = counters.vulnerable,
                            defended = counters.defended,
                            inconclusive = counters.inconclusive,
                            errors = counters.error,
                            "campaign completed"
                        );
                        break;
                    }
                }
            }
        });

        self.monitors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(task);
    }
}

// ============================================================================
// Materialization
// ============================================================================

/// Enumerates and enqueues the full probe set for an exhaustive
/// campaign: template × (base + variations) × bindings × targets.
async fn materialize_exhaustive(
    ctx: &Arc<ExecutorContext>,
    handle: &Arc<CampaignHandle>,
    plans: &[(Arc<Template>, String, String)],
) -> Result<u64, CampaignError> {
    let seed = handle.spec.seed.unwrap_or(0);
    let cap = handle
        .spec
        .expansion_cap
        .unwrap_or(ctx.config.expansion_cap);
    let mut enqueued = 0_u64;

    'plans: for (template, provider, model) in plans {
        let mut variants: Vec<Option<usize>> = vec![None];
        variants.extend((0..template.variations.len()).map(Some));

        for variation in variants {
            let variables = template.variables_for(variation);
            let bindings = BindingIter::new(&variables, seed);
            if bindings.cardinality() > cap {
                warn!(
                    template = %template.id,
                    cardinality = bindings.cardinality(),
                    cap,
                    "variable expansion truncated at campaign cap"
                );
            }
            for binding in bindings.take(cap) {
                if !handle.job_budget_remaining() {
                    break 'plans;
                }
                let Some(prompt) = template.prompt_for(variation) else {
                    continue;
                };
                let rendered =
                    crate::template::render_prompt(prompt, &binding).map_err(|e| {
                        CampaignError::InvalidSpec {
                            errors: vec![ValidationIssue::error(
                                format!("templates.{}", template.id),
                                e.to_string(),
                            )],
                        }
                    })?;
                enqueue_probe(ctx, handle, template, variation, rendered, binding, provider, model)
                    .await?;
                enqueued += 1;
            }
        }
    }

    debug!(campaign = %handle.id, jobs = enqueued, "exhaustive probe set enqueued");
    Ok(enqueued)
}

/// Asks the selector for the next arm and enqueues one probe. Returns
/// false when no eligible arm remains or budgets are spent.
async fn enqueue_adaptive_probe(
    ctx: &Arc<ExecutorContext>,
    handle: &Arc<CampaignHandle>,
) -> Result<bool, CampaignError> {
    if !handle.job_budget_remaining() || handle.is_cancelled() {
        return Ok(false);
    }
    let Some(selector) = &handle.selector else {
        return Ok(false);
    };

    let context = SelectorContext {
        categories: handle.spec.templates.categories.clone(),
        min_severity: handle.spec.templates.min_severity,
        provider: None,
    };
    let Some(arm) = selector.next(&context) else {
        return Ok(false);
    };
    let Some(template) = handle.snapshot.get(&arm.template_id) else {
        return Ok(false);
    };

    // Rotate deterministically through the binding space.
    let seed = handle.spec.seed.unwrap_or(0);
    let variables = template.variables_for(None);
    let cardinality = BindingIter::new(&variables, seed).cardinality().max(1);
    let index = usize::try_from(handle.jobs_enqueued()).unwrap_or(0) % cardinality;
    let Some(binding) = BindingIter::new(&variables, seed).nth(index) else {
        return Ok(false);
    };

    let rendered = crate::template::render_prompt(&template.prompt, &binding).map_err(|e| {
        CampaignError::InvalidSpec {
            errors: vec![ValidationIssue::error(
                format!("templates.{}", template.id),
                e.to_string(),
            )],
        }
    })?;

    enqueue_probe(
        ctx,
        handle,
        &template,
        None,
        rendered,
        binding,
        &arm.provider_id,
        &arm.model_id,
    )
    .await?;
    Ok(true)
}

#[allow(clippy::too_many_arguments)]
async fn enqueue_probe(
    ctx: &Arc<ExecutorContext>,
    handle: &Arc<CampaignHandle>,
    template: &Arc<Template>,
    variation: Option<usize>,
    rendered_prompt: String,
    binding: indexmap::IndexMap<String, String>,
    provider: &str,
    model: &str,
) -> Result<(), CampaignError> {
    let deadline = handle
        .spec
        .job_deadline
        .as_deref()
        .and_then(|raw| humantime::parse_duration(raw).ok())
        .unwrap_or(ctx.config.default_job_deadline);

    let job = ProbeJob {
        job_id: Ulid::new(),
        campaign_id: handle.id,
        template_id: template.id.clone(),
        template_version: template.version.to_string(),
        variation_index: variation,
        provider_id: provider.to_string(),
        model_id: model.to_string(),
        rendered_prompt,
        variable_binding: binding,
        system: handle.spec.system.clone(),
        priority: handle.spec.priority,
        deadline: Utc::now()
            + chrono::Duration::from_std(deadline)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
        retry_budget: ctx.config.default_retry_budget,
        token_estimate: ctx.config.default_token_estimate,
        created_at: Utc::now(),
    };

    ctx.queue
        .enqueue(job)
        .await
        .map_err(|_| CampaignError::UnknownCampaign { id: handle.id })?;
    handle.note_enqueued();
    Ok(())
}

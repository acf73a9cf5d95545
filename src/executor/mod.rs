//! Executor.
//!
//! A pool of workers that lease jobs and drive them through the rate
//! governor, the provider adapter, and the detection pipeline, then
//! append the outcome and feed the selector.
//!
//! Workers never sleep for retries: failed jobs go back through the
//! queue's visibility timer. A worker that hits an unexpected fault
//! records it and keeps serving.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::campaign::{CampaignHandle, CampaignRegistry};
use crate::config::EngineConfig;
use crate::detection::{DetectionRecord, EvalOptions, SemanticMatcher};
use crate::error::{ErrorKind, ProviderError};
use crate::governor::{RateGovernor, RateKey};
use crate::observability::metrics;
use crate::probe::{ProbeJob, ProbeResult, TokenUsage};
use crate::provider::{GenerationParams, ProviderRegistry, ProviderRequest, ProviderResponse};
use crate::queue::{LeasedJob, QueueDriver};
use crate::selector::ArmKey;
use crate::store::ResultStore;

/// Visibility delay applied when a worker returns a paused campaign's
/// job to the queue.
const PAUSE_RELEASE_DELAY: Duration = Duration::from_millis(500);

// ============================================================================
// Context
// ============================================================================

/// Shared dependencies for the worker pool.
pub struct ExecutorContext {
    /// Engine configuration
    pub config: EngineConfig,
    /// Job queue driver
    pub queue: Arc<dyn QueueDriver>,
    /// Provider adapters and breakers
    pub providers: Arc<ProviderRegistry>,
    /// Rate governor
    pub governor: Arc<RateGovernor>,
    /// Result log
    pub store: Arc<ResultStore>,
    /// Campaign registry
    pub campaigns: Arc<CampaignRegistry>,
    /// Optional semantic matcher for detection
    pub semantic: Option<Arc<dyn SemanticMatcher>>,
}

// ============================================================================
// Executor
// ============================================================================

/// Worker pool driving Queue → Provider → Detection → Result.
pub struct Executor {
    ctx: Arc<ExecutorContext>,
    cancel: CancellationToken,
    semaphores: Arc<DashMap<(String, String), Arc<Semaphore>>>,
    busy: Arc<AtomicUsize>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    /// Creates an executor; workers start with [`Self::spawn_workers`].
    #[must_use]
    pub fn new(ctx: Arc<ExecutorContext>, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            cancel,
            semaphores: Arc::new(DashMap::new()),
            busy: Arc::new(AtomicUsize::new(0)),
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawns `count` workers.
    pub fn spawn_workers(&self, count: usize) {
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for index in workers.len()..workers.len() + count.max(1) {
            let ctx = Arc::clone(&self.ctx);
            let cancel = self.cancel.clone();
            let semaphores = Arc::clone(&self.semaphores);
            let busy = Arc::clone(&self.busy);
            let worker_id = format!("worker-{index}");
            workers.push(tokio::spawn(async move {
                worker_loop(ctx, semaphores, busy, cancel, worker_id).await;
            }));
        }
    }

    /// Cancels the pool and waits for every worker to drain.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers = {
            let mut guard = self
                .workers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Workers currently processing a job.
    #[must_use]
    pub fn busy_workers(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Worker Loop
// ============================================================================

async fn worker_loop(
    ctx: Arc<ExecutorContext>,
    semaphores: Arc<DashMap<(String, String), Arc<Semaphore>>>,
    busy: Arc<AtomicUsize>,
    cancel: CancellationToken,
    worker_id: String,
) {
    debug!(worker = %worker_id, "worker started");
    loop {
        let leased = match ctx
            .queue
            .lease(&worker_id, ctx.config.lease_duration, &cancel)
            .await
        {
            Ok(Some(leased)) => leased,
            Ok(None) => break, // cancelled while waiting
            Err(e) => {
                error!(worker = %worker_id, error = %e, "lease failed");
                break;
            }
        };

        busy.fetch_add(1, Ordering::SeqCst);
        metrics::set_workers_busy(busy.load(Ordering::SeqCst));

        if let Err(fault) = process(&ctx, &semaphores, &leased).await {
            // The job failed in the machinery, not against the target.
            warn!(
                worker = %worker_id,
                job_id = %leased.job.job_id,
                error = %fault,
                "worker fault"
            );
            let _ = ctx
                .queue
                .nack(leased.job.job_id, false, ErrorKind::WorkerFault)
                .await;
            let result = error_result(&leased, ErrorKind::WorkerFault, None, String::new());
            match ctx.campaigns.get(leased.job.campaign_id) {
                Some(campaign) => finish_with_campaign(&ctx, &campaign, &leased.job, result),
                None => finish(&ctx, &leased.job, result),
            }
        }

        busy.fetch_sub(1, Ordering::SeqCst);
        metrics::set_workers_busy(busy.load(Ordering::SeqCst));
    }
    debug!(worker = %worker_id, "worker stopped");
}

/// Drives one leased job to a terminal or retryable outcome.
///
/// Returns `Err` only for unexpected internal failures; expected
/// outcomes (including provider errors) are handled inside.
async fn process(
    ctx: &ExecutorContext,
    semaphores: &DashMap<(String, String), Arc<Semaphore>>,
    leased: &LeasedJob,
) -> Result<(), crate::error::Error> {
    let job = &leased.job;

    let Some(campaign) = ctx.campaigns.get(job.campaign_id) else {
        // Orphaned job: its campaign is gone, nothing can own the
        // result. Terminal fault.
        ctx.queue
            .nack(job.job_id, false, ErrorKind::WorkerFault)
            .await?;
        finish(
            ctx,
            job,
            error_result(leased, ErrorKind::WorkerFault, None, String::new()),
        );
        return Ok(());
    };

    // Paused campaigns keep their jobs queued, untouched.
    if campaign.is_paused() {
        ctx.queue.release(job.job_id, PAUSE_RELEASE_DELAY).await?;
        return Ok(());
    }

    if campaign.is_cancelled() {
        ctx.queue
            .nack(job.job_id, false, ErrorKind::Cancelled)
            .await?;
        finish_with_campaign(
            ctx,
            &campaign,
            job,
            error_result(leased, ErrorKind::Cancelled, None, String::new()),
        );
        return Ok(());
    }

    // A target dead from client errors fails its remaining probes
    // immediately.
    if campaign.target_blocked(&job.provider_id, &job.model_id) {
        ctx.queue
            .nack(job.job_id, false, ErrorKind::ProviderClientError)
            .await?;
        finish_with_campaign(
            ctx,
            &campaign,
            job,
            error_result(leased, ErrorKind::ProviderClientError, None, String::new()),
        );
        return Ok(());
    }

    let now = Utc::now();
    if now >= job.deadline {
        ctx.queue
            .nack(job.job_id, false, ErrorKind::Deadline)
            .await?;
        finish_with_campaign(
            ctx,
            &campaign,
            job,
            error_result(leased, ErrorKind::Deadline, None, String::new()),
        );
        return Ok(());
    }

    // Concurrency cap per (provider, model); independent of the token
    // buckets, which regulate arrival rate.
    let semaphore = semaphores
        .entry((job.provider_id.clone(), job.model_id.clone()))
        .or_insert_with(|| Arc::new(Semaphore::new(ctx.config.per_target_concurrency)))
        .clone();
    let Ok(_permit) = semaphore.acquire_owned().await else {
        return Err(crate::error::QueueError::Closed.into());
    };

    // Rate-governor acquisition, bounded by the deadline and the
    // per-request cap.
    let remaining = remaining_time(job);
    let wait_cap = Instant::now() + remaining.min(ctx.config.per_request_timeout);
    let key = RateKey {
        provider: job.provider_id.clone(),
        model: job.model_id.clone(),
        credential: campaign
            .spec
            .targets
            .iter()
            .find(|t| t.provider == job.provider_id)
            .and_then(|t| t.credential.clone()),
    };

    if ctx
        .governor
        .acquire(&key, job.priority, job.token_estimate, wait_cap)
        .await
        .is_err()
    {
        if Utc::now() >= job.deadline {
            ctx.queue
                .nack(job.job_id, false, ErrorKind::Deadline)
                .await?;
            finish_with_campaign(
                ctx,
                &campaign,
                job,
                error_result(leased, ErrorKind::Deadline, None, String::new()),
            );
        } else {
            // Bucket contention without a blown deadline: retry later.
            let outcome = ctx
                .queue
                .nack(job.job_id, true, ErrorKind::ProviderOverload)
                .await?;
            if outcome == crate::queue::NackOutcome::DeadLettered {
                finish_with_campaign(
                    ctx,
                    &campaign,
                    job,
                    error_result(leased, ErrorKind::ProviderOverload, None, String::new()),
                );
            }
        }
        return Ok(());
    }

    // Provider round trip under a derived timeout.
    let request = ProviderRequest {
        prompt: job.rendered_prompt.clone(),
        model: job.model_id.clone(),
        params: campaign_params(&campaign),
        system: job.system.clone(),
        extra: None,
    };
    let request_timeout = remaining_time(job).min(ctx.config.per_request_timeout);
    let call = tokio::time::timeout(
        request_timeout,
        ctx.providers
            .send_guarded(&job.provider_id, &campaign.cancel, request),
    )
    .await;

    let outcome = match call {
        Ok(outcome) => outcome,
        Err(_elapsed) => Err(ProviderError::Transport {
            message: format!("request exceeded {request_timeout:?}"),
        }),
    };

    match outcome {
        Ok(response) => {
            ctx.governor
                .reconcile(&key, job.token_estimate, response_tokens(&response));
            let result = classify_response(ctx, &campaign, leased, response)?;
            ctx.queue.ack(job.job_id).await?;
            finish_with_campaign(ctx, &campaign, job, result);
        }
        Err(provider_error) => {
            handle_provider_error(ctx, &campaign, leased, provider_error).await?;
        }
    }

    Ok(())
}

/// Runs detection and composes the terminal result for a successful
/// provider round trip.
fn classify_response(
    ctx: &ExecutorContext,
    campaign: &CampaignHandle,
    leased: &LeasedJob,
    response: ProviderResponse,
) -> Result<ProbeResult, crate::error::Error> {
    let job = &leased.job;
    let template = campaign.snapshot.get(&job.template_id).ok_or_else(|| {
        crate::error::CampaignError::NoTemplatesMatched
    })?;

    let opts = EvalOptions {
        budget: ctx.config.detector_budget,
        semantic: ctx.semantic.as_deref(),
    };
    let detection_started = Instant::now();
    let record = template
        .detection_for(job.variation_index)
        .evaluate(&response.text, &opts);
    metrics::record_detection_duration(detection_started.elapsed());

    let (raw_response, truncated) = truncate_response(response.text, ctx.config.max_response_bytes);
    let received_at = Utc::now();
    let sent_at = leased.first_leased_at;

    Ok(ProbeResult {
        result_id: Ulid::new(),
        job_id: job.job_id,
        campaign_id: job.campaign_id,
        template_id: job.template_id.clone(),
        template_version: job.template_version.clone(),
        variation_index: job.variation_index,
        provider_id: job.provider_id.clone(),
        model_id: job.model_id.clone(),
        sent_at,
        received_at,
        duration_ms: u64::try_from((received_at - sent_at).num_milliseconds().max(0))
            .unwrap_or(u64::MAX),
        raw_response,
        truncated,
        usage: TokenUsage {
            tokens_in: response.tokens_in,
            tokens_out: response.tokens_out,
        },
        provider_status: response.status,
        detection: record,
        error_kind: None,
    })
}

/// Handles a failed provider round trip: retryable kinds go back
/// through the queue, terminal kinds produce an error result.
async fn handle_provider_error(
    ctx: &ExecutorContext,
    campaign: &Arc<CampaignHandle>,
    leased: &LeasedJob,
    provider_error: ProviderError,
) -> Result<(), crate::error::Error> {
    let job = &leased.job;
    let kind = provider_error.kind();
    let status = provider_status(&provider_error);

    debug!(
        job_id = %job.job_id,
        provider = %job.provider_id,
        error = %provider_error,
        kind = %kind,
        "probe attempt failed"
    );

    let outcome = ctx
        .queue
        .nack(job.job_id, kind.is_retryable(), kind)
        .await?;

    if outcome == crate::queue::NackOutcome::DeadLettered {
        if kind == ErrorKind::ProviderClientError {
            let all_blocked = campaign.block_target(&job.provider_id, &job.model_id);
            if all_blocked {
                warn!(
                    campaign = %campaign.id,
                    "every target is rejecting requests; campaign will fail"
                );
                let _ = campaign.transition(crate::campaign::CampaignStatus::Failed);
            }
        }
        finish_with_campaign(
            ctx,
            campaign,
            job,
            error_result(leased, kind, status, String::new()),
        );
    }

    Ok(())
}

/// Appends the result, updates counters, selector, and metrics.
fn finish_with_campaign(
    ctx: &ExecutorContext,
    campaign: &CampaignHandle,
    job: &ProbeJob,
    result: ProbeResult,
) {
    if let Some(selector) = &campaign.selector {
        #[allow(clippy::cast_precision_loss)]
        let cost = result.usage.total() as f64;
        selector.update(
            &ArmKey {
                template_id: job.template_id.clone(),
                provider_id: job.provider_id.clone(),
                model_id: job.model_id.clone(),
            },
            result.verdict(),
            cost.max(1.0),
        );
    }
    campaign.record_result(&result);
    finish(ctx, job, result);
}

/// Appends the result to the store and records metrics. Duplicate
/// results from at-least-once re-delivery are dropped silently.
fn finish(ctx: &ExecutorContext, job: &ProbeJob, result: ProbeResult) {
    metrics::record_probe(&job.provider_id, result.verdict().as_str());
    metrics::record_probe_duration(&job.provider_id, result.duration_ms);
    match ctx.store.append(result) {
        Ok(_) => {}
        Err(e) => {
            // A conflicting duplicate means a re-sent job produced a
            // different outcome; keep the first, surface the anomaly.
            warn!(job_id = %job.job_id, error = %e, "result append rejected");
        }
    }
}

/// Composes a terminal error result for a job that never produced a
/// classifiable response.
fn error_result(
    leased: &LeasedJob,
    kind: ErrorKind,
    provider_status: Option<u16>,
    raw_response: String,
) -> ProbeResult {
    let job = &leased.job;
    let received_at = Utc::now();
    let sent_at = leased.first_leased_at;
    ProbeResult {
        result_id: Ulid::new(),
        job_id: job.job_id,
        campaign_id: job.campaign_id,
        template_id: job.template_id.clone(),
        template_version: job.template_version.clone(),
        variation_index: job.variation_index,
        provider_id: job.provider_id.clone(),
        model_id: job.model_id.clone(),
        sent_at,
        received_at,
        duration_ms: u64::try_from((received_at - sent_at).num_milliseconds().max(0))
            .unwrap_or(u64::MAX),
        raw_response,
        truncated: false,
        usage: TokenUsage::default(),
        provider_status,
        detection: DetectionRecord::error(),
        error_kind: Some(kind),
    }
}

fn campaign_params(campaign: &CampaignHandle) -> GenerationParams {
    campaign.spec.generation.clone()
}

/// Truncates a response at the configured cap, on a char boundary.
fn truncate_response(text: String, cap: usize) -> (String, bool) {
    if text.len() <= cap {
        return (text, false);
    }
    let mut cut = cap;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    (text[..cut].to_string(), true)
}

fn remaining_time(job: &ProbeJob) -> Duration {
    (job.deadline - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO)
}

fn response_tokens(response: &ProviderResponse) -> u64 {
    response.tokens_in.unwrap_or(0) + response.tokens_out.unwrap_or(0)
}

const fn provider_status(error: &ProviderError) -> Option<u16> {
    match error {
        ProviderError::Overloaded { status, .. } | ProviderError::ClientError { status, .. } => {
            Some(*status)
        }
        _ => None,
    }
}

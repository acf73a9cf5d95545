//! Result store.
//!
//! Append-only log of probe outcomes with secondary indices for query,
//! derived per-campaign counters, a broadcast feed for push consumers,
//! and optional JSONL persistence with replay.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use ulid::Ulid;
use uuid::Uuid;

use crate::error::StoreError;
use crate::probe::{ProbeResult, Verdict};

// ============================================================================
// Query Types
// ============================================================================

/// Filter for result queries. All set fields must match.
#[derive(Debug, Clone, Default)]
pub struct ResultFilter {
    /// Restrict to one campaign
    pub campaign_id: Option<Uuid>,
    /// Restrict to one template
    pub template_id: Option<String>,
    /// Restrict to one provider
    pub provider_id: Option<String>,
    /// Restrict to one verdict
    pub verdict: Option<Verdict>,
}

/// Pagination window.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    /// Results to skip
    pub offset: usize,
    /// Maximum results to return
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Per-campaign verdict totals, derived from the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignCounters {
    /// Probes classified vulnerable
    pub vulnerable: u64,
    /// Probes classified defended
    pub defended: u64,
    /// Probes classified inconclusive
    pub inconclusive: u64,
    /// Probes that terminated in error
    pub error: u64,
    /// Total prompt-side tokens, where known
    pub tokens_in: u64,
    /// Total completion-side tokens, where known
    pub tokens_out: u64,
}

impl CampaignCounters {
    /// Sum of all verdict counters.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.vulnerable + self.defended + self.inconclusive + self.error
    }

    /// Adds one result to the totals.
    pub fn record(&mut self, result: &ProbeResult) {
        match result.verdict() {
            Verdict::Vulnerable => self.vulnerable += 1,
            Verdict::Defended => self.defended += 1,
            Verdict::Inconclusive => self.inconclusive += 1,
            Verdict::Error => self.error += 1,
        }
        self.tokens_in += result.usage.tokens_in.unwrap_or(0);
        self.tokens_out += result.usage.tokens_out.unwrap_or(0);
    }
}

/// What an append did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The result is new and was appended
    Appended,
    /// A result with the same `job_id` and identical body already
    /// exists; the duplicate was dropped
    Deduplicated,
}

// ============================================================================
// Store
// ============================================================================

#[derive(Default)]
struct Indexed {
    log: Vec<Arc<ProbeResult>>,
    by_result: HashMap<Ulid, usize>,
    by_job: HashMap<Ulid, usize>,
    by_campaign: HashMap<Uuid, Vec<usize>>,
    by_template: HashMap<String, Vec<usize>>,
    by_provider: HashMap<String, Vec<usize>>,
    by_verdict: HashMap<Verdict, Vec<usize>>,
}

/// Append-only log of probe outcomes.
pub struct ResultStore {
    inner: RwLock<Indexed>,
    feed: broadcast::Sender<Arc<ProbeResult>>,
    persist: Option<mpsc::UnboundedSender<Arc<ProbeResult>>>,
    persist_closed: AtomicBool,
}

impl ResultStore {
    /// Creates an in-memory store.
    #[must_use]
    pub fn new(subscription_capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(subscription_capacity.max(16));
        Self {
            inner: RwLock::new(Indexed::default()),
            feed,
            persist: None,
            persist_closed: AtomicBool::new(false),
        }
    }

    /// Creates a store that appends every result as one JSON line to
    /// `path`. Writes happen on a background task so durability is off
    /// the probe hot path.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the file cannot be opened.
    pub fn with_persistence(
        subscription_capacity: usize,
        path: impl AsRef<Path>,
    ) -> Result<Self, StoreError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<ProbeResult>>();
        tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                match serde_json::to_string(&*result) {
                    Ok(line) => {
                        if let Err(e) = writeln!(file, "{line}") {
                            warn!(error = %e, path = %path.display(), "result persistence write failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "result serialization failed"),
                }
            }
            let _ = file.flush();
        });

        let mut store = Self::new(subscription_capacity);
        store.persist = Some(tx);
        Ok(store)
    }

    /// Reads a JSONL result log back, e.g. to replay counters after a
    /// restart. Lines that fail to parse are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the file cannot be read.
    pub fn replay(path: impl AsRef<Path>) -> Result<Vec<ProbeResult>, StoreError> {
        let raw = std::fs::read_to_string(path)?;
        let mut results = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ProbeResult>(line) {
                Ok(result) => results.push(result),
                Err(e) => warn!(line = index + 1, error = %e, "skipping unparseable result line"),
            }
        }
        Ok(results)
    }

    /// Appends a result.
    ///
    /// Re-inserting the same `job_id` with an identical body is
    /// idempotent (at-least-once execution makes this normal).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConflictingDuplicate`] when a result for
    /// the job exists with a different body.
    pub fn append(&self, result: ProbeResult) -> Result<AppendOutcome, StoreError> {
        let result = Arc::new(result);
        {
            let mut inner = self
                .inner
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);

            if let Some(&existing_index) = inner.by_job.get(&result.job_id) {
                let existing = &inner.log[existing_index];
                if existing.same_body(&result) {
                    debug!(job_id = %result.job_id, "duplicate result deduplicated");
                    return Ok(AppendOutcome::Deduplicated);
                }
                return Err(StoreError::ConflictingDuplicate {
                    job_id: result.job_id,
                });
            }

            let index = inner.log.len();
            inner.by_result.insert(result.result_id, index);
            inner.by_job.insert(result.job_id, index);
            inner
                .by_campaign
                .entry(result.campaign_id)
                .or_default()
                .push(index);
            inner
                .by_template
                .entry(result.template_id.clone())
                .or_default()
                .push(index);
            inner
                .by_provider
                .entry(result.provider_id.clone())
                .or_default()
                .push(index);
            inner
                .by_verdict
                .entry(result.verdict())
                .or_default()
                .push(index);
            inner.log.push(Arc::clone(&result));
        }

        if let Some(persist) = &self.persist {
            if persist.send(Arc::clone(&result)).is_err()
                && !self.persist_closed.swap(true, Ordering::SeqCst)
            {
                warn!("result persistence task stopped; further results stay in memory only");
            }
        }

        // Push feed is best-effort at-least-once; lagging consumers
        // resynchronize through query().
        let _ = self.feed.send(result);
        Ok(AppendOutcome::Appended)
    }

    /// Looks up a result by id.
    #[must_use]
    pub fn get(&self, result_id: Ulid) -> Option<Arc<ProbeResult>> {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner
            .by_result
            .get(&result_id)
            .map(|&index| Arc::clone(&inner.log[index]))
    }

    /// Looks up the result terminating a job.
    #[must_use]
    pub fn get_by_job(&self, job_id: Ulid) -> Option<Arc<ProbeResult>> {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner
            .by_job
            .get(&job_id)
            .map(|&index| Arc::clone(&inner.log[index]))
    }

    /// Queries the log in append order.
    #[must_use]
    pub fn query(&self, filter: &ResultFilter, page: Page) -> Vec<Arc<ProbeResult>> {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Drive iteration from the most selective available index.
        let candidates: Vec<usize> = if let Some(campaign_id) = filter.campaign_id {
            inner
                .by_campaign
                .get(&campaign_id)
                .cloned()
                .unwrap_or_default()
        } else if let Some(template_id) = &filter.template_id {
            inner
                .by_template
                .get(template_id)
                .cloned()
                .unwrap_or_default()
        } else if let Some(provider_id) = &filter.provider_id {
            inner
                .by_provider
                .get(provider_id)
                .cloned()
                .unwrap_or_default()
        } else if let Some(verdict) = filter.verdict {
            inner.by_verdict.get(&verdict).cloned().unwrap_or_default()
        } else {
            (0..inner.log.len()).collect()
        };

        candidates
            .into_iter()
            .map(|index| &inner.log[index])
            .filter(|r| {
                filter.campaign_id.is_none_or(|c| r.campaign_id == c)
                    && filter
                        .template_id
                        .as_ref()
                        .is_none_or(|t| &r.template_id == t)
                    && filter
                        .provider_id
                        .as_ref()
                        .is_none_or(|p| &r.provider_id == p)
                    && filter.verdict.is_none_or(|v| r.verdict() == v)
            })
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect()
    }

    /// Derives verdict totals for a campaign from the log.
    #[must_use]
    pub fn aggregate_by_campaign(&self, campaign_id: Uuid) -> CampaignCounters {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut counters = CampaignCounters::default();
        if let Some(indices) = inner.by_campaign.get(&campaign_id) {
            for &index in indices {
                counters.record(&inner.log[index]);
            }
        }
        counters
    }

    /// Number of results in the log.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .log
            .len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribes to the push feed. Delivery is at-least-once across
    /// re-sends; consumers de-dupe by `result_id`. A lagging consumer
    /// may miss results and should resynchronize with [`Self::query`].
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ProbeResult>> {
        self.feed.subscribe()
    }

    /// The push feed as a stream, optionally filtered to one campaign.
    /// Lagged gaps are dropped silently; pull consumers needing the
    /// complete log use [`Self::query`].
    pub fn stream(
        &self,
        campaign_id: Option<Uuid>,
    ) -> impl futures_util::Stream<Item = Arc<ProbeResult>> + Send {
        use futures_util::StreamExt;
        tokio_stream::wrappers::BroadcastStream::new(self.subscribe()).filter_map(
            move |received| async move {
                received
                    .ok()
                    .filter(|r| campaign_id.is_none_or(|id| r.campaign_id == id))
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::DetectionRecord;
    use crate::error::ErrorKind;
    use crate::probe::TokenUsage;
    use chrono::Utc;

    fn result(campaign: Uuid, verdict: Verdict) -> ProbeResult {
        let now = Utc::now();
        ProbeResult {
            result_id: Ulid::new(),
            job_id: Ulid::new(),
            campaign_id: campaign,
            template_id: "inj-1".to_string(),
            template_version: "1.0.0".to_string(),
            variation_index: None,
            provider_id: "stub".to_string(),
            model_id: "m".to_string(),
            sent_at: now,
            received_at: now,
            duration_ms: 5,
            raw_response: "PWNED".to_string(),
            truncated: false,
            usage: TokenUsage {
                tokens_in: Some(10),
                tokens_out: Some(2),
            },
            provider_status: Some(200),
            detection: DetectionRecord {
                verdict,
                matched_rules: vec![],
                confidence: 1.0,
                trace: vec![],
                timed_out: false,
            },
            error_kind: (verdict == Verdict::Error).then_some(ErrorKind::Transport),
        }
    }

    #[tokio::test]
    async fn test_append_and_get() {
        let store = ResultStore::new(16);
        let r = result(Uuid::new_v4(), Verdict::Vulnerable);
        let id = r.result_id;
        assert_eq!(store.append(r).unwrap(), AppendOutcome::Appended);
        assert!(store.get(id).is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_identical_body_dedupes() {
        let store = ResultStore::new(16);
        let r = result(Uuid::new_v4(), Verdict::Vulnerable);
        let mut dup = r.clone();
        dup.result_id = Ulid::new();
        dup.duration_ms = 99;

        store.append(r).unwrap();
        assert_eq!(store.append(dup).unwrap(), AppendOutcome::Deduplicated);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_duplicate_rejected() {
        let store = ResultStore::new(16);
        let r = result(Uuid::new_v4(), Verdict::Vulnerable);
        let mut conflict = r.clone();
        conflict.result_id = Ulid::new();
        conflict.detection.verdict = Verdict::Defended;

        store.append(r).unwrap();
        assert!(matches!(
            store.append(conflict),
            Err(StoreError::ConflictingDuplicate { .. })
        ));
    }

    #[tokio::test]
    async fn test_query_by_campaign_and_verdict() {
        let store = ResultStore::new(16);
        let campaign_a = Uuid::new_v4();
        let campaign_b = Uuid::new_v4();
        store.append(result(campaign_a, Verdict::Vulnerable)).unwrap();
        store.append(result(campaign_a, Verdict::Defended)).unwrap();
        store.append(result(campaign_b, Verdict::Vulnerable)).unwrap();

        let hits = store.query(
            &ResultFilter {
                campaign_id: Some(campaign_a),
                ..ResultFilter::default()
            },
            Page::default(),
        );
        assert_eq!(hits.len(), 2);

        let hits = store.query(
            &ResultFilter {
                campaign_id: Some(campaign_a),
                verdict: Some(Verdict::Vulnerable),
                ..ResultFilter::default()
            },
            Page::default(),
        );
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_query_pagination() {
        let store = ResultStore::new(16);
        let campaign = Uuid::new_v4();
        for _ in 0..5 {
            store.append(result(campaign, Verdict::Defended)).unwrap();
        }
        let page = store.query(
            &ResultFilter::default(),
            Page {
                offset: 2,
                limit: 2,
            },
        );
        assert_eq!(page.len(), 2);
    }

    #[tokio::test]
    async fn test_aggregate_counters_match_log() {
        let store = ResultStore::new(16);
        let campaign = Uuid::new_v4();
        store.append(result(campaign, Verdict::Vulnerable)).unwrap();
        store.append(result(campaign, Verdict::Vulnerable)).unwrap();
        store.append(result(campaign, Verdict::Defended)).unwrap();
        store.append(result(campaign, Verdict::Error)).unwrap();

        let counters = store.aggregate_by_campaign(campaign);
        assert_eq!(counters.vulnerable, 2);
        assert_eq!(counters.defended, 1);
        assert_eq!(counters.error, 1);
        assert_eq!(counters.total(), 4);
        assert_eq!(counters.tokens_in, 40);
    }

    #[tokio::test]
    async fn test_subscription_delivers_appends() {
        let store = ResultStore::new(16);
        let mut feed = store.subscribe();
        let r = result(Uuid::new_v4(), Verdict::Vulnerable);
        let id = r.result_id;
        store.append(r).unwrap();

        let delivered = feed.recv().await.unwrap();
        assert_eq!(delivered.result_id, id);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let campaign = Uuid::new_v4();

        {
            let store = ResultStore::with_persistence(16, &path).unwrap();
            store.append(result(campaign, Verdict::Vulnerable)).unwrap();
            store.append(result(campaign, Verdict::Defended)).unwrap();
            // Give the writer task a moment to drain.
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        let replayed = ResultStore::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        let mut counters = CampaignCounters::default();
        for r in &replayed {
            counters.record(r);
        }
        assert_eq!(counters.vulnerable, 1);
        assert_eq!(counters.defended, 1);
    }
}

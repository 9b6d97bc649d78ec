// src/aggregator.rs
//! # Aggregator
//! Fans one keyword bucket out over every (keyword, source kind) pair.
//!
//! Per pair: fresh cache hit, else rotate through untried endpoints until
//! one succeeds or the kind is exhausted, else the last cached payload
//! (stale), else no data. Fetches from all pairs run concurrently, bounded
//! by a semaphore, and are consumed in completion order. Mentions are
//! counted through a [`MentionLedger`] so an item seen through another
//! endpoint, another kind or an earlier cycle is counted once.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::activity::ActivityTracker;
use crate::bucket::KeywordBucket;
use crate::cache::{request_key, CacheStore, FEED_TTL};
use crate::error::FetchError;
use crate::ingest::types::{FeedItem, Fetcher, MentionEvent};
use crate::ingest::{MentionDeduper, MentionLedger};
use crate::sources::rotation::RotationManager;
use crate::sources::SourceKind;
use crate::Clock;

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_MAX_KEYWORDS: usize = 5;
pub const DEFAULT_SAMPLE_MENTIONS: usize = 5;

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub feed_ttl: Duration,
    pub max_concurrency: usize,
    /// Keywords beyond this are ignored for the cycle.
    pub max_keywords_per_bucket: usize,
    pub sample_mentions: usize,
    /// How long an item's identity is remembered for mention counting.
    pub ledger_retention: Duration,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            feed_ttl: FEED_TTL,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_keywords_per_bucket: DEFAULT_MAX_KEYWORDS,
            sample_mentions: DEFAULT_SAMPLE_MENTIONS,
            ledger_retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Where a pair's data came from this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KindStatus {
    Fresh,
    Cached,
    /// Past TTL, served because no endpoint could answer.
    Stale,
    NoData,
}

impl KindStatus {
    fn rank(self) -> u8 {
        match self {
            KindStatus::Fresh => 3,
            KindStatus::Cached => 2,
            KindStatus::Stale => 1,
            KindStatus::NoData => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub kind: SourceKind,
    pub endpoint: String,
    pub keyword: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordReport {
    pub keyword: String,
    /// Newly counted mentions this cycle, after deduplication.
    pub fresh_mentions: u64,
    /// Merged across kinds, deduplicated, newest first.
    pub samples: Vec<FeedItem>,
    pub kinds: BTreeMap<SourceKind, KindStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketReport {
    pub bucket_key: String,
    pub keywords: Vec<KeywordReport>,
    /// Best status per kind across the bucket's keywords.
    pub kind_status: BTreeMap<SourceKind, KindStatus>,
    pub failures: Vec<FetchFailure>,
    /// Pairs still running when the deadline hit.
    pub abandoned: usize,
}

/// What a pair has done so far, visible after its future is dropped.
#[derive(Default)]
struct PairProgress {
    inflight: Option<(SourceKind, usize, String)>,
    failures: Vec<FetchFailure>,
}

type Progress = Mutex<HashMap<usize, PairProgress>>;

struct PairOutcome {
    id: usize,
    status: KindStatus,
    items: Vec<FeedItem>,
    fresh_mentions: u64,
    failures: Vec<FetchFailure>,
}

pub struct Aggregator {
    cache: Arc<CacheStore>,
    rotation: Arc<RotationManager>,
    fetcher: Arc<dyn Fetcher>,
    tracker: Arc<ActivityTracker>,
    ledger: MentionLedger,
    permits: Semaphore,
    settings: AggregatorSettings,
    clock: Clock,
    cancelled: AtomicBool,
}

impl Aggregator {
    pub fn new(
        cache: Arc<CacheStore>,
        rotation: Arc<RotationManager>,
        fetcher: Arc<dyn Fetcher>,
        tracker: Arc<ActivityTracker>,
        settings: AggregatorSettings,
        clock: Clock,
    ) -> Self {
        Self {
            ledger: MentionLedger::new(settings.ledger_retention),
            permits: Semaphore::new(settings.max_concurrency.max(1)),
            cache,
            rotation,
            fetcher,
            tracker,
            settings,
            clock,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    pub fn tracker(&self) -> &Arc<ActivityTracker> {
        &self.tracker
    }

    pub fn rotation(&self) -> &Arc<RotationManager> {
        &self.rotation
    }

    /// Drop mention identities past retention, including keywords no
    /// longer configured.
    pub fn prune_ledger(&self, now: chrono::DateTime<chrono::Utc>) -> usize {
        self.ledger.prune(now)
    }

    /// Stop issuing fetches. Pairs waiting for a permit give up immediately.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.permits.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cache key for a pair. Endpoint identity is not part of it.
    pub fn cache_key(kind: SourceKind, keyword: &str, bucket_key: &str) -> String {
        request_key(&[kind.label(), keyword, bucket_key])
    }

    /// Refresh one bucket. Returns when every pair has a result or
    /// `deadline` passes; fetches still in flight then are abandoned and
    /// counted as timeouts against their endpoints.
    pub async fn refresh_bucket(&self, bucket: &KeywordBucket, deadline: Instant) -> BucketReport {
        let keywords: Vec<&str> = bucket
            .keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .take(self.settings.max_keywords_per_bucket.max(1))
            .collect();
        let kinds = self.rotation.registry().active_kinds();

        let pairs: Vec<(&str, SourceKind)> = keywords
            .iter()
            .flat_map(|kw| kinds.iter().map(move |k| (*kw, *k)))
            .collect();

        let progress: Progress = Mutex::new(HashMap::new());
        let mut pending: FuturesUnordered<_> = pairs
            .iter()
            .enumerate()
            .map(|(id, (kw, kind))| self.run_pair(id, &bucket.key, kw, *kind, &progress))
            .collect();

        let mut outcomes: Vec<Option<PairOutcome>> = (0..pairs.len()).map(|_| None).collect();
        let mut timed_out = false;
        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some(o)) => {
                    let id = o.id;
                    outcomes[id] = Some(o);
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }
        drop(pending);

        let mut abandoned = 0;
        if timed_out {
            let mut stuck: HashMap<usize, PairProgress> =
                std::mem::take(&mut *progress.lock().expect("progress mutex poisoned"));
            let now = (self.clock)();
            for (id, slot) in outcomes.iter_mut().enumerate() {
                if slot.is_some() {
                    continue;
                }
                abandoned += 1;
                let (kw, kind) = pairs[id];
                let PairProgress { inflight, mut failures } = stuck.remove(&id).unwrap_or_default();
                if let Some((kind, index, address)) = inflight {
                    let err = FetchError::Timeout;
                    counter!("pulse_fetch_total", "kind" => kind.label(), "outcome" => err.label())
                        .increment(1);
                    self.rotation.report_failure(kind, index, &err, now);
                    failures.push(FetchFailure {
                        kind,
                        endpoint: address,
                        keyword: kw.to_string(),
                        error: err.to_string(),
                    });
                }
                *slot = Some(self.stale_fallback(id, kind, &Self::cache_key(kind, kw, &bucket.key), failures));
            }
            tracing::warn!(bucket = %bucket.key, abandoned, "cycle deadline reached; in-flight fetches abandoned");
        }

        self.assemble(bucket, &keywords, &pairs, outcomes, abandoned)
    }

    async fn run_pair(
        &self,
        id: usize,
        bucket_key: &str,
        keyword: &str,
        kind: SourceKind,
        progress: &Progress,
    ) -> PairOutcome {
        let key = Self::cache_key(kind, keyword, bucket_key);
        if let Some(items) = self.cache.get_json::<Vec<FeedItem>>(&key, (self.clock)()) {
            return PairOutcome {
                id,
                status: KindStatus::Cached,
                items,
                fresh_mentions: 0,
                failures: Vec::new(),
            };
        }

        let mut tried = HashSet::new();
        loop {
            if self.is_cancelled() {
                break;
            }
            let Some(sel) = self.rotation.select_untried(kind, &tried, (self.clock)()) else {
                break;
            };
            if sel.all_cooling {
                tracing::debug!(%kind, keyword, until = ?sel.cooldown_until, "all endpoints cooling");
                break;
            }
            let Ok(_permit) = self.permits.acquire().await else {
                break;
            };
            if self.is_cancelled() {
                break;
            }

            progress.lock().expect("progress mutex poisoned").entry(id).or_default().inflight =
                Some((kind, sel.index, sel.target.address.clone()));
            let result = self.fetcher.fetch(&sel.target, keyword).await;
            let done_at = (self.clock)();

            match result {
                Ok(items) => {
                    counter!("pulse_fetch_total", "kind" => kind.label(), "outcome" => "ok").increment(1);
                    self.rotation.report_success(kind, sel.index, done_at);
                    if !items.is_empty() {
                        self.cache.put_json(&key, &items, self.settings.feed_ttl, done_at);
                    }
                    let admitted = self.ledger.admit(keyword, &items, done_at);
                    self.tracker.record(&MentionEvent {
                        keyword: keyword.to_string(),
                        source_kind: kind,
                        observed_at: done_at,
                        count: admitted,
                    });
                    tracing::debug!(%kind, keyword, endpoint = %sel.target.address, items = items.len(), admitted, "fetch ok");
                    return PairOutcome {
                        id,
                        status: KindStatus::Fresh,
                        items,
                        fresh_mentions: admitted,
                        failures: take_failures(progress, id),
                    };
                }
                Err(err) => {
                    counter!("pulse_fetch_total", "kind" => kind.label(), "outcome" => err.label())
                        .increment(1);
                    self.rotation.report_failure(kind, sel.index, &err, done_at);
                    tracing::debug!(%kind, keyword, endpoint = %sel.target.address, error = %err, "fetch failed");
                    {
                        let mut map = progress.lock().expect("progress mutex poisoned");
                        let entry = map.entry(id).or_default();
                        entry.inflight = None;
                        entry.failures.push(FetchFailure {
                            kind,
                            endpoint: sel.target.address.clone(),
                            keyword: keyword.to_string(),
                            error: err.to_string(),
                        });
                    }
                    tried.insert(sel.index);
                    // payload shape problems are not retried mid-cycle
                    if matches!(err, FetchError::Parse(_)) {
                        break;
                    }
                }
            }
        }
        self.stale_fallback(id, kind, &key, take_failures(progress, id))
    }

    fn stale_fallback(&self, id: usize, kind: SourceKind, key: &str, failures: Vec<FetchFailure>) -> PairOutcome {
        let items = self
            .cache
            .get_stale(key)
            .and_then(|e| serde_json::from_value::<Vec<FeedItem>>(e.payload).ok());
        let (status, items) = match items {
            Some(items) => (KindStatus::Stale, items),
            None => (KindStatus::NoData, Vec::new()),
        };
        tracing::debug!(%kind, ?status, "kind unavailable this cycle");
        PairOutcome {
            id,
            status,
            items,
            fresh_mentions: 0,
            failures,
        }
    }

    fn assemble(
        &self,
        bucket: &KeywordBucket,
        keywords: &[&str],
        pairs: &[(&str, SourceKind)],
        outcomes: Vec<Option<PairOutcome>>,
        abandoned: usize,
    ) -> BucketReport {
        let mut per_keyword: BTreeMap<&str, (u64, Vec<FeedItem>, BTreeMap<SourceKind, KindStatus>)> =
            BTreeMap::new();
        let mut kind_status: BTreeMap<SourceKind, KindStatus> = BTreeMap::new();
        let mut failures = Vec::new();

        for o in outcomes.into_iter().flatten() {
            let (kw, kind) = pairs[o.id];
            let entry = per_keyword.entry(kw).or_default();
            entry.0 += o.fresh_mentions;
            entry.1.extend(o.items);
            entry.2.insert(kind, o.status);
            kind_status
                .entry(kind)
                .and_modify(|s| {
                    if o.status.rank() > s.rank() {
                        *s = o.status;
                    }
                })
                .or_insert(o.status);
            failures.extend(o.failures);
        }

        let reports = keywords
            .iter()
            .map(|kw| {
                let (fresh, items, kinds) = per_keyword.remove(kw).unwrap_or_default();
                KeywordReport {
                    keyword: kw.to_string(),
                    fresh_mentions: fresh,
                    samples: merge_samples(items, self.settings.sample_mentions),
                    kinds,
                }
            })
            .collect();

        BucketReport {
            bucket_key: bucket.key.clone(),
            keywords: reports,
            kind_status,
            failures,
            abandoned,
        }
    }
}

fn take_failures(progress: &Progress, id: usize) -> Vec<FetchFailure> {
    progress
        .lock()
        .expect("progress mutex poisoned")
        .remove(&id)
        .map(|p| p.failures)
        .unwrap_or_default()
}

/// Deduplicate across kinds and endpoints, newest first, at most `cap`.
pub fn merge_samples(mut items: Vec<FeedItem>, cap: usize) -> Vec<FeedItem> {
    items.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    let mut dedup = MentionDeduper::new();
    items.retain(|it| dedup.insert(it));
    items.truncate(cap);
    items
}

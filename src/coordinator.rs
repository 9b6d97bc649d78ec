// src/coordinator.rs
//! # Pipeline Coordinator
//! Drives refresh cycles and publishes the read model.
//!
//! One task owns the loop: a tick every `refresh_secs`, or earlier when a
//! refresh is requested. A cycle refreshes positions into buckets, fans all
//! buckets out through the aggregator under one deadline, asks the tracker
//! for each keyword's spike signal and swaps in the finished snapshot. The
//! previous snapshot stays readable until then.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::activity::{Classification, SpikeSignal};
use crate::aggregator::{Aggregator, FetchFailure, KindStatus};
use crate::bucket::{partition_valid, KeywordBucket};
use crate::cache::CacheStore;
use crate::error::{CacheError, ConfigError};
use crate::ingest::positions::{derive_buckets, PositionSource};
use crate::ingest::types::FeedItem;
use crate::sources::{SourceEndpoint, SourceKind};
use crate::Clock;

pub const MIN_REFRESH_SECS: u64 = 5;
pub const MAX_REFRESH_SECS: u64 = 300;
pub const REFRESH_STEP_SECS: u64 = 5;

pub fn clamp_refresh(secs: u64) -> u64 {
    secs.clamp(MIN_REFRESH_SECS, MAX_REFRESH_SECS)
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub refresh_secs: u64,
    pub cycle_deadline: Duration,
    pub wallet: Option<String>,
    pub custom_keyword_buckets: BTreeMap<String, Vec<String>>,
    /// Buckets used when no wallet positions are available.
    pub topics: Vec<KeywordBucket>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            refresh_secs: 15,
            cycle_deadline: Duration::from_secs(20),
            wallet: None,
            custom_keyword_buckets: BTreeMap::new(),
            topics: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordSignal {
    pub keyword: String,
    pub signal: SpikeSignal,
    pub fresh_mentions: u64,
    pub samples: Vec<FeedItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketSnapshot {
    pub key: String,
    pub title: String,
    pub keywords: Vec<KeywordSignal>,
    pub kind_status: BTreeMap<SourceKind, KindStatus>,
    pub failures: Vec<FetchFailure>,
    pub abandoned: usize,
    pub refreshed_at: DateTime<Utc>,
}

/// Read model handed to the display layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineSnapshot {
    pub refreshed_at: Option<DateTime<Utc>>,
    pub buckets: BTreeMap<String, BucketSnapshot>,
    /// Actionable configuration and position errors from the last cycle.
    pub errors: Vec<String>,
    pub endpoints: Vec<SourceEndpoint>,
}

impl PipelineSnapshot {
    pub fn signal(&self, bucket: &str, keyword: &str) -> Option<&SpikeSignal> {
        self.buckets
            .get(bucket)?
            .keywords
            .iter()
            .find(|k| k.keyword.eq_ignore_ascii_case(keyword))
            .map(|k| &k.signal)
    }
}

pub struct Coordinator {
    aggregator: Arc<Aggregator>,
    cache: Arc<CacheStore>,
    positions: Option<Arc<dyn PositionSource>>,
    settings: CoordinatorSettings,
    clock: Clock,

    buckets: RwLock<Arc<Vec<KeywordBucket>>>,
    overrides: Mutex<BTreeMap<String, Vec<String>>>,
    bucket_errors: Mutex<Vec<ConfigError>>,

    snapshot_tx: watch::Sender<Arc<PipelineSnapshot>>,
    refresh_secs: AtomicU64,

    in_flight: Mutex<HashSet<String>>,
    cycle_running: AtomicBool,
    pending_all: AtomicBool,
    pending: Mutex<HashSet<String>>,
    wake: Notify,

    stopped: AtomicBool,
    stop: Notify,
}

impl Coordinator {
    pub fn new(
        aggregator: Arc<Aggregator>,
        cache: Arc<CacheStore>,
        positions: Option<Arc<dyn PositionSource>>,
        settings: CoordinatorSettings,
        clock: Clock,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(PipelineSnapshot::default()));
        let (initial, errors) = partition_valid(derive_buckets(
            &[],
            &settings.custom_keyword_buckets,
            &settings.topics,
        ));
        Self {
            refresh_secs: AtomicU64::new(clamp_refresh(settings.refresh_secs)),
            overrides: Mutex::new(settings.custom_keyword_buckets.clone()),
            buckets: RwLock::new(Arc::new(initial)),
            bucket_errors: Mutex::new(errors),
            aggregator,
            cache,
            positions,
            settings,
            clock,
            snapshot_tx,
            in_flight: Mutex::new(HashSet::new()),
            cycle_running: AtomicBool::new(false),
            pending_all: AtomicBool::new(false),
            pending: Mutex::new(HashSet::new()),
            wake: Notify::new(),
            stopped: AtomicBool::new(false),
            stop: Notify::new(),
        }
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<PipelineSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Receiver that changes every time a snapshot is published.
    pub fn subscribe(&self) -> watch::Receiver<Arc<PipelineSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    pub fn buckets(&self) -> Arc<Vec<KeywordBucket>> {
        self.buckets.read().expect("buckets lock poisoned").clone()
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs.load(Ordering::Relaxed))
    }

    pub fn set_refresh_interval(&self, secs: u64) -> u64 {
        let secs = clamp_refresh(secs);
        let prev = self.refresh_secs.swap(secs, Ordering::Relaxed);
        if prev != secs {
            tracing::info!(refresh_secs = secs, "refresh interval changed");
            // restart the loop's wait with the new interval
            self.wake.notify_one();
        }
        secs
    }

    pub fn faster(&self) -> u64 {
        let cur = self.refresh_secs.load(Ordering::Relaxed);
        self.set_refresh_interval(cur.saturating_sub(REFRESH_STEP_SECS))
    }

    pub fn slower(&self) -> u64 {
        let cur = self.refresh_secs.load(Ordering::Relaxed);
        self.set_refresh_interval(cur + REFRESH_STEP_SECS)
    }

    /// Replace a bucket's keyword list. The change survives position
    /// refreshes and is picked up by the next cycle.
    pub fn set_bucket_keywords(&self, key: &str, keywords: Vec<String>) -> Result<(), ConfigError> {
        let mut guard = self.buckets.write().expect("buckets lock poisoned");
        let idx = guard
            .iter()
            .position(|b| b.key == key)
            .ok_or_else(|| ConfigError::UnknownBucket(key.to_string()))?;
        let updated = guard[idx].with_keywords(keywords)?;

        self.overrides
            .lock()
            .expect("overrides mutex poisoned")
            .insert(key.to_string(), updated.keywords.clone());
        let mut next = guard.as_ref().clone();
        next[idx] = updated;
        *guard = Arc::new(next);
        tracing::info!(bucket = key, "bucket keywords replaced");
        Ok(())
    }

    /// Ask for a full refresh without waiting for the next tick. Ignored
    /// (returns `false`) while a cycle is running.
    pub fn request_refresh(&self) -> bool {
        if self.cycle_running.load(Ordering::SeqCst) {
            tracing::debug!("refresh request coalesced with running cycle");
            return false;
        }
        self.pending_all.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        true
    }

    /// Ask for one bucket's refresh. Ignored when that bucket is already
    /// being refreshed or already queued.
    pub fn request_bucket_refresh(&self, key: &str) -> bool {
        if self.in_flight.lock().expect("in-flight mutex poisoned").contains(key) {
            tracing::debug!(bucket = key, "bucket refresh coalesced with in-flight cycle");
            return false;
        }
        if !self.pending.lock().expect("pending mutex poisoned").insert(key.to_string()) {
            return false;
        }
        self.wake.notify_one();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the loop, cancel outstanding fetches and flush the cache.
    pub fn shutdown(&self) -> Result<(), CacheError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("coordinator shutting down");
        self.aggregator.cancel();
        self.stop.notify_one();
        self.cache.flush()
    }

    /// Cycle loop. Runs one cycle immediately, then until [`shutdown`](Self::shutdown).
    pub async fn run(self: Arc<Self>) {
        tracing::info!(refresh_secs = self.refresh_interval().as_secs(), "coordinator started");
        if !self.is_stopped() {
            self.run_cycle().await;
        }
        while !self.is_stopped() {
            tokio::select! {
                _ = tokio::time::sleep(self.refresh_interval()) => {
                    self.run_cycle().await;
                }
                _ = self.wake.notified() => {
                    self.run_pending().await;
                }
                _ = self.stop.notified() => break,
            }
        }
        tracing::info!("coordinator stopped");
    }

    async fn run_pending(&self) {
        if self.is_stopped() {
            return;
        }
        if self.pending_all.swap(false, Ordering::SeqCst) {
            self.pending.lock().expect("pending mutex poisoned").clear();
            self.run_cycle().await;
            return;
        }
        let keys: HashSet<String> = std::mem::take(&mut *self.pending.lock().expect("pending mutex poisoned"));
        if !keys.is_empty() {
            self.refresh_buckets(Some(&keys)).await;
        }
    }

    /// One full cycle: positions, every bucket, publish.
    pub async fn run_cycle(&self) -> Arc<PipelineSnapshot> {
        self.refresh_positions().await;
        self.refresh_buckets(None).await
    }

    async fn refresh_positions(&self) {
        let (Some(source), Some(wallet)) = (self.positions.as_ref(), self.settings.wallet.as_deref()) else {
            return;
        };
        match source.positions(wallet).await {
            Ok(positions) => {
                let overrides = self.overrides.lock().expect("overrides mutex poisoned").clone();
                let (buckets, errors) =
                    partition_valid(derive_buckets(&positions, &overrides, &self.settings.topics));
                for e in &errors {
                    tracing::warn!(error = %e, "keyword bucket skipped");
                }
                tracing::debug!(positions = positions.len(), buckets = buckets.len(), "buckets derived");
                *self.buckets.write().expect("buckets lock poisoned") = Arc::new(buckets);
                *self.bucket_errors.lock().expect("bucket errors mutex poisoned") = errors;
            }
            Err(e) => {
                tracing::warn!(error = %e, "positions unavailable; keeping current buckets");
            }
        }
    }

    /// Refresh `only` (or every bucket) and publish the merged snapshot.
    pub async fn refresh_buckets(&self, only: Option<&HashSet<String>>) -> Arc<PipelineSnapshot> {
        let started = std::time::Instant::now();
        let buckets = self.buckets();
        let selected: Vec<&KeywordBucket> = buckets
            .iter()
            .filter(|b| only.map_or(true, |keys| keys.contains(&b.key)))
            .collect();

        if only.is_none() {
            self.cycle_running.store(true, Ordering::SeqCst);
        }
        self.in_flight
            .lock()
            .expect("in-flight mutex poisoned")
            .extend(selected.iter().map(|b| b.key.clone()));

        let deadline = Instant::now() + self.settings.cycle_deadline;
        let reports = join_all(
            selected
                .iter()
                .map(|b| self.aggregator.refresh_bucket(b, deadline)),
        )
        .await;

        let now = (self.clock)();
        let previous = self.snapshot();
        let mut next = PipelineSnapshot {
            refreshed_at: Some(now),
            buckets: BTreeMap::new(),
            errors: self
                .bucket_errors
                .lock()
                .expect("bucket errors mutex poisoned")
                .iter()
                .map(ToString::to_string)
                .collect(),
            endpoints: SourceKind::ALL
                .iter()
                .flat_map(|k| self.aggregator.rotation().registry().endpoints(*k))
                .collect(),
        };
        // buckets outside this refresh keep their last published state
        for b in buckets.iter() {
            if let Some(prev) = previous.buckets.get(&b.key) {
                next.buckets.insert(b.key.clone(), prev.clone());
            }
        }

        let tracker = self.aggregator.tracker();
        for (bucket, report) in selected.iter().zip(reports) {
            let keywords = report
                .keywords
                .into_iter()
                .map(|kr| {
                    let signal = tracker.spike_at(&kr.keyword, now);
                    if signal.classification == Classification::Spike {
                        counter!("pulse_spikes_total").increment(1);
                        tracing::info!(
                            bucket = %bucket.key,
                            keyword = %kr.keyword,
                            pct = signal.pct_delta.round() as i64,
                            count = signal.current_bucket_count,
                            "spike detected"
                        );
                    }
                    KeywordSignal {
                        keyword: kr.keyword,
                        signal,
                        fresh_mentions: kr.fresh_mentions,
                        samples: kr.samples,
                    }
                })
                .collect();
            next.buckets.insert(
                bucket.key.clone(),
                BucketSnapshot {
                    key: bucket.key.clone(),
                    title: bucket.label().to_string(),
                    keywords,
                    kind_status: report.kind_status,
                    failures: report.failures,
                    abandoned: report.abandoned,
                    refreshed_at: now,
                },
            );
        }

        {
            let mut inflight = self.in_flight.lock().expect("in-flight mutex poisoned");
            for b in &selected {
                inflight.remove(&b.key);
            }
        }
        if only.is_none() {
            self.cycle_running.store(false, Ordering::SeqCst);
            tracker.evict_idle(now);
            let dropped = self.aggregator.prune_ledger(now);
            if dropped > 0 {
                tracing::debug!(dropped, "mention ledger pruned");
            }
        }

        let snapshot = Arc::new(next);
        self.snapshot_tx.send_replace(Arc::clone(&snapshot));
        histogram!("pulse_cycle_ms").record(started.elapsed().as_secs_f64() * 1_000.0);
        gauge!("pulse_cycle_last_run_ts").set(now.timestamp() as f64);
        tracing::info!(
            buckets = selected.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "snapshot published"
        );
        snapshot
    }
}

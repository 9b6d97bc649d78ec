// src/activity.rs
//! # Activity Tracker
//! Per-keyword mention histograms over a trailing window, and the spike
//! classification derived from them.
//!
//! Each keyword owns an [`ActivityWindow`] of fixed-width buckets aligned to
//! multiples of `bucket_secs`. Buckets are created on first record and
//! dropped (not zeroed) once they fall out of the window; this happens
//! lazily whenever the window is touched. Windows sit behind their own
//! mutex so concurrent fetch tasks only contend on the same keyword.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ingest::keyword_key;
use crate::ingest::types::MentionEvent;

pub const DEFAULT_BUCKET_SECS: u64 = 3600;
pub const DEFAULT_WINDOW_SECS: u64 = 24 * 3600;
pub const DEFAULT_RISING_PCT: f64 = 50.0;
pub const DEFAULT_SPIKE_PCT: f64 = 150.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    pub bucket_secs: u64,
    pub window_secs: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            bucket_secs: DEFAULT_BUCKET_SECS,
            window_secs: DEFAULT_WINDOW_SECS,
        }
    }
}

impl ActivityConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_secs == 0 || self.window_secs < self.bucket_secs {
            return Err(ConfigError::Invalid(format!(
                "activity bucket {}s does not fit window {}s",
                self.bucket_secs, self.window_secs
            )));
        }
        if self.window_secs % self.bucket_secs != 0 {
            return Err(ConfigError::Invalid(format!(
                "activity window {}s is not a multiple of bucket {}s",
                self.window_secs, self.bucket_secs
            )));
        }
        Ok(())
    }
}

/// Percent-delta cut-offs for `Rising` and `Spike`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpikeThresholds {
    pub rising_pct: f64,
    pub spike_pct: f64,
}

impl Default for SpikeThresholds {
    fn default() -> Self {
        Self {
            rising_pct: DEFAULT_RISING_PCT,
            spike_pct: DEFAULT_SPIKE_PCT,
        }
    }
}

impl SpikeThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.rising_pct < self.spike_pct) {
            return Err(ConfigError::Invalid(format!(
                "rising threshold {} must be below spike threshold {}",
                self.rising_pct, self.spike_pct
            )));
        }
        Ok(())
    }

    pub fn classify(&self, pct_delta: f64) -> Classification {
        if pct_delta >= self.spike_pct {
            Classification::Spike
        } else if pct_delta >= self.rising_pct {
            Classification::Rising
        } else {
            Classification::Stable
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    Stable,
    Rising,
    Spike,
}

/// How much history backs a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    fn from_retained(n: usize) -> Self {
        match n {
            0 | 1 => Confidence::Low,
            2..=10 => Confidence::Medium,
            _ => Confidence::High,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeSignal {
    pub keyword: String,
    pub current_bucket_count: u64,
    pub trailing_baseline_avg: f64,
    pub pct_delta: f64,
    pub classification: Classification,
    pub confidence: Confidence,
    pub retained_buckets: usize,
}

impl SpikeSignal {
    fn quiet(keyword: &str) -> Self {
        Self {
            keyword: keyword.to_string(),
            current_bucket_count: 0,
            trailing_baseline_avg: 0.0,
            pct_delta: 0.0,
            classification: Classification::Stable,
            confidence: Confidence::Low,
            retained_buckets: 0,
        }
    }
}

/// Sparse, ordered buckets `(start_unix, count)` for one keyword.
#[derive(Debug, Default)]
pub struct ActivityWindow {
    buckets: VecDeque<(i64, u64)>,
}

impl ActivityWindow {
    fn add(&mut self, start: i64, count: u64) {
        match self.buckets.binary_search_by_key(&start, |(s, _)| *s) {
            Ok(i) => self.buckets[i].1 += count,
            Err(i) => self.buckets.insert(i, (start, count)),
        }
    }

    /// Drop buckets that start at or before `oldest_excluded`.
    fn evict(&mut self, oldest_excluded: i64) {
        while let Some(&(s, _)) = self.buckets.front() {
            if s <= oldest_excluded {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

pub struct ActivityTracker {
    windows: DashMap<String, Arc<Mutex<ActivityWindow>>>,
    config: ActivityConfig,
    thresholds: SpikeThresholds,
}

impl ActivityTracker {
    pub fn new(config: ActivityConfig, thresholds: SpikeThresholds) -> Self {
        Self {
            windows: DashMap::new(),
            config,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> SpikeThresholds {
        self.thresholds
    }

    fn bucket_start(&self, at: DateTime<Utc>) -> i64 {
        let width = self.config.bucket_secs.max(1) as i64;
        at.timestamp().div_euclid(width) * width
    }

    /// Buckets starting at or before this are outside the window ending at `now`.
    fn horizon(&self, now: DateTime<Utc>) -> i64 {
        self.bucket_start(now) - self.config.window_secs as i64
    }

    fn window(&self, keyword: &str) -> Option<Arc<Mutex<ActivityWindow>>> {
        self.windows.get(&keyword_key(keyword)).map(|w| Arc::clone(w.value()))
    }

    /// Add `event.count` to the bucket covering `event.observed_at`. A
    /// zero-count event still materializes the bucket, so observed quiet
    /// periods weigh into the baseline.
    pub fn record(&self, event: &MentionEvent) {
        let key = keyword_key(&event.keyword);
        if key.is_empty() {
            return;
        }
        let window = Arc::clone(self.windows.entry(key).or_default().value());
        let start = self.bucket_start(event.observed_at);
        let mut w = window.lock().expect("activity window mutex poisoned");
        w.evict(self.horizon(event.observed_at));
        if start > self.horizon(event.observed_at) {
            w.add(start, event.count);
        }
        counter!("pulse_mentions_recorded_total").increment(event.count);
    }

    /// Spike signal for `keyword` as of `now`.
    ///
    /// Baseline is the mean of retained buckets other than the current one;
    /// `pct_delta = (current - baseline) / max(baseline, 1) * 100`.
    pub fn spike_at(&self, keyword: &str, now: DateTime<Utc>) -> SpikeSignal {
        let Some(window) = self.window(keyword) else {
            return SpikeSignal::quiet(keyword);
        };
        let current_start = self.bucket_start(now);

        let (current, others_sum, others_n, retained) = {
            let mut w = window.lock().expect("activity window mutex poisoned");
            w.evict(self.horizon(now));
            let mut current = 0u64;
            let mut sum = 0u64;
            let mut n = 0usize;
            for &(start, count) in &w.buckets {
                if start == current_start {
                    current = count;
                } else if start < current_start {
                    sum += count;
                    n += 1;
                }
            }
            (current, sum, n, w.len())
        };

        let baseline = if others_n == 0 {
            0.0
        } else {
            others_sum as f64 / others_n as f64
        };
        let pct_delta = (current as f64 - baseline) / baseline.max(1.0) * 100.0;

        SpikeSignal {
            keyword: keyword.to_string(),
            current_bucket_count: current,
            trailing_baseline_avg: baseline,
            pct_delta,
            classification: self.thresholds.classify(pct_delta),
            confidence: Confidence::from_retained(retained),
            retained_buckets: retained,
        }
    }

    /// Drop windows that no longer hold any bucket.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let horizon = self.horizon(now);
        let before = self.windows.len();
        self.windows.retain(|_, w| {
            let mut w = w.lock().expect("activity window mutex poisoned");
            w.evict(horizon);
            !w.is_empty()
        });
        before - self.windows.len()
    }

    pub fn tracked_keywords(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::SourceKind;
    use chrono::{Duration, TimeZone};

    fn ev(keyword: &str, at: DateTime<Utc>, count: u64) -> MentionEvent {
        MentionEvent {
            keyword: keyword.into(),
            source_kind: SourceKind::MirrorFeed,
            observed_at: at,
            count,
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 3, 12, 10, 0).unwrap()
    }

    #[test]
    fn classification_boundaries() {
        let t = SpikeThresholds::default();
        assert_eq!(t.classify(49.9), Classification::Stable);
        assert_eq!(t.classify(50.0), Classification::Rising);
        assert_eq!(t.classify(150.0), Classification::Spike);
        assert!(SpikeThresholds { rising_pct: 150.0, spike_pct: 150.0 }.validate().is_err());
    }

    #[test]
    fn same_bucket_accumulates_case_insensitively() {
        let tr = ActivityTracker::new(ActivityConfig::default(), SpikeThresholds::default());
        tr.record(&ev("Maduro", noon(), 2));
        tr.record(&ev("maduro ", noon() + Duration::minutes(20), 1));
        let s = tr.spike_at("MADURO", noon() + Duration::minutes(30));
        assert_eq!(s.current_bucket_count, 3);
        assert_eq!(s.retained_buckets, 1);
        assert_eq!(s.confidence, Confidence::Low);
    }

    #[test]
    fn old_buckets_are_dropped_not_zeroed() {
        let tr = ActivityTracker::new(ActivityConfig::default(), SpikeThresholds::default());
        tr.record(&ev("fed", noon() - Duration::hours(30), 100));
        tr.record(&ev("fed", noon() - Duration::hours(2), 4));
        let s = tr.spike_at("fed", noon());
        assert_eq!(s.retained_buckets, 1);
        assert_eq!(s.trailing_baseline_avg, 4.0);
        assert_eq!(s.current_bucket_count, 0);
        assert_eq!(s.pct_delta, -100.0);

        assert_eq!(tr.evict_idle(noon() + Duration::hours(25)), 1);
        assert_eq!(tr.tracked_keywords(), 0);
    }

    #[test]
    fn confidence_grows_with_history() {
        let tr = ActivityTracker::new(ActivityConfig::default(), SpikeThresholds::default());
        for h in 0..12 {
            tr.record(&ev("oil", noon() - Duration::hours(h), 1));
        }
        let s = tr.spike_at("oil", noon());
        assert_eq!(s.retained_buckets, 12);
        assert_eq!(s.confidence, Confidence::High);
        assert_eq!(s.classification, Classification::Stable);
    }
}

// tests/activity_spike.rs
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use polyterm_pulse::activity::{
    ActivityConfig, ActivityTracker, Classification, Confidence, SpikeThresholds,
};
use polyterm_pulse::ingest::types::MentionEvent;
use polyterm_pulse::sources::SourceKind;
use std::sync::Arc;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 11, 3, 12, 30, 0).unwrap()
}

fn tracker() -> ActivityTracker {
    ActivityTracker::new(ActivityConfig::default(), SpikeThresholds::default())
}

fn record(t: &ActivityTracker, kw: &str, hours_ago: i64, count: u64) {
    t.record(&MentionEvent {
        keyword: kw.to_string(),
        source_kind: SourceKind::NewsSearch,
        observed_at: now() - ChronoDuration::hours(hours_ago),
        count,
    });
}

#[test]
fn unknown_keyword_is_stable_with_zero_baseline() {
    let s = tracker().spike_at("Greenland", now());
    assert_eq!(s.classification, Classification::Stable);
    assert_eq!(s.trailing_baseline_avg, 0.0);
    assert_eq!(s.current_bucket_count, 0);
    assert_eq!(s.pct_delta, 0.0);
}

#[test]
fn quiet_day_is_stable() {
    let t = tracker();
    for h in 0..24 {
        record(&t, "tariffs", h, 0);
    }
    let s = t.spike_at("tariffs", now());
    assert_eq!(s.classification, Classification::Stable);
    assert_eq!(s.trailing_baseline_avg, 0.0);
    assert_eq!(s.retained_buckets, 24);
}

#[test]
fn triple_the_trailing_average_is_a_spike() {
    let t = tracker();
    for h in 1..=6 {
        record(&t, "Venezuela", h, 2);
    }
    record(&t, "Venezuela", 0, 6);
    let s = t.spike_at("venezuela", now());
    assert_eq!(s.trailing_baseline_avg, 2.0);
    assert_eq!(s.current_bucket_count, 6);
    assert_eq!(s.pct_delta, 200.0);
    assert_eq!(s.classification, Classification::Spike);
    assert_eq!(s.confidence, Confidence::Medium);
}

#[test]
fn rising_band_and_custom_thresholds() {
    let t = tracker();
    for h in 1..=4 {
        record(&t, "fed", h, 10);
    }
    record(&t, "fed", 0, 16);
    assert_eq!(t.spike_at("fed", now()).classification, Classification::Rising);

    let strict = ActivityTracker::new(
        ActivityConfig::default(),
        SpikeThresholds {
            rising_pct: 80.0,
            spike_pct: 300.0,
        },
    );
    for h in 1..=4 {
        record(&strict, "fed", h, 10);
    }
    record(&strict, "fed", 0, 16);
    assert_eq!(strict.spike_at("fed", now()).classification, Classification::Stable);
}

#[test]
fn window_slides_with_now() {
    let t = tracker();
    record(&t, "oil", 23, 50);
    record(&t, "oil", 1, 5);
    assert_eq!(t.spike_at("oil", now()).retained_buckets, 2);

    let later = now() + ChronoDuration::hours(2);
    let s = t.spike_at("oil", later);
    assert_eq!(s.retained_buckets, 1);
    assert_eq!(s.trailing_baseline_avg, 5.0);
}

#[test]
fn concurrent_records_on_one_keyword_add_up() {
    let t = Arc::new(tracker());
    std::thread::scope(|s| {
        for _ in 0..8 {
            let t = Arc::clone(&t);
            s.spawn(move || {
                for _ in 0..100 {
                    record(&t, "Maduro", 0, 1);
                }
            });
        }
    });
    assert_eq!(t.spike_at("maduro", now()).current_bucket_count, 800);
}

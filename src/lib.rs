// src/lib.rs
// Public library surface for the binary and integration tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub mod activity;
pub mod aggregator;
pub mod bucket;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ingest;
pub mod sources;
pub mod telemetry;

// ---- Re-exports for stable public API ----
pub use crate::activity::{ActivityTracker, Classification, SpikeSignal};
pub use crate::aggregator::{Aggregator, BucketReport, KindStatus};
pub use crate::bucket::KeywordBucket;
pub use crate::cache::CacheStore;
pub use crate::config::PulseConfig;
pub use crate::coordinator::{Coordinator, PipelineSnapshot};
pub use crate::error::{CacheError, ConfigError, FetchError};
pub use crate::sources::{rotation::RotationManager, SourceKind, SourceRegistry};

/// Wall-clock source injected into time-dependent services.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

// src/ingest/types.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::sources::{EndpointTarget, SourceKind};

/// One normalized upstream item (social post, headline, feed entry).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedItem {
    pub kind: SourceKind,
    pub source: String, // e.g., "Twitter/X", "Google News", feed title
    pub title: String,  // normalized text
    pub link: Option<String>,
    pub post_id: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Normalized result of one successful fetch.
pub type RawPayload = Vec<FeedItem>;

/// Mention volume observed for a keyword. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionEvent {
    pub keyword: String,
    pub source_kind: SourceKind,
    pub observed_at: DateTime<Utc>,
    pub count: u64,
}

/// Single-attempt transport: one endpoint, one query, no internal retries.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, endpoint: &EndpointTarget, query: &str) -> Result<RawPayload, FetchError>;
}

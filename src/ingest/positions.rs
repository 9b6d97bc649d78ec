// src/ingest/positions.rs
//! Wallet positions and the keyword buckets derived from them.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bucket::{bucket_key_for, display_title, KeywordBucket};
use crate::cache::{request_key, CacheStore};
use crate::error::FetchError;
use crate::ingest::fetcher::{classify_status, USER_AGENT};
use crate::ingest::providers::json::{find_list, pick_string};
use crate::Clock;

pub const DEFAULT_POSITIONS_URL: &str = "https://data-api.polymarket.com/positions";
/// Only the largest positions get a bucket.
pub const MAX_POSITION_BUCKETS: usize = 10;
pub const MAX_DERIVED_KEYWORDS: usize = 8;
const SIGNIFICANT_WORDS: usize = 5;
const FALLBACK_KEYWORD_CHARS: usize = 30;

pub const POSITION_CONTAINERS: &[&str] = &["data", "positions"];
pub const QUESTION_FIELDS: &[&str] = &["question", "title", "description"];
pub const MARKET_ID_FIELDS: &[&str] = &["slug", "conditionId", "questionID"];

const STOPWORDS: &[&str] = &[
    "will", "be", "the", "a", "an", "is", "are", "was", "were", "have", "has", "had", "do",
    "does", "did", "can", "could", "would", "should", "may", "might", "must", "shall", "by",
    "before", "after", "on", "in", "at", "to", "for", "of", "with", "from", "as", "into",
    "through", "during", "or", "and", "but", "if", "than", "more", "less", "this", "that",
    "these", "those", "end", "year",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub market_question: String,
    pub market_id: String,
}

#[async_trait]
pub trait PositionSource: Send + Sync {
    async fn positions(&self, wallet: &str) -> Result<Vec<Position>, FetchError>;
}

/// Data API client. Responses go through the cache with the market TTL.
pub struct HttpPositionSource {
    client: reqwest::Client,
    url: String,
    cache: Arc<CacheStore>,
    ttl: Duration,
    clock: Clock,
}

impl HttpPositionSource {
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        cache: Arc<CacheStore>,
        ttl: Duration,
        clock: Clock,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            cache,
            ttl,
            clock,
        })
    }
}

#[async_trait]
impl PositionSource for HttpPositionSource {
    async fn positions(&self, wallet: &str) -> Result<Vec<Position>, FetchError> {
        let key = request_key(&["positions", wallet]);
        if let Some(cached) = self.cache.get_json::<Vec<Position>>(&key, (self.clock)()) {
            tracing::debug!(positions = cached.len(), "positions served from cache");
            return Ok(cached);
        }

        let resp = self
            .client
            .get(&self.url)
            .query(&[
                ("user", wallet),
                ("limit", "100"),
                ("sortBy", "CASHPNL"),
                ("sortDirection", "DESC"),
            ])
            .send()
            .await?;
        if let Some(err) = classify_status(resp.status().as_u16(), None, (self.clock)()) {
            return Err(err);
        }
        let body: Value = resp.json().await?;
        let positions = parse_positions(&body)?;
        tracing::info!(positions = positions.len(), "wallet positions fetched");
        self.cache.put_json(&key, &positions, self.ttl, (self.clock)());
        Ok(positions)
    }
}

/// Position list from any known response shape. Entries without a question
/// are skipped; a body with no list at all is a parse error.
pub fn parse_positions(body: &Value) -> Result<Vec<Position>, FetchError> {
    let list = find_list(body, POSITION_CONTAINERS).ok_or_else(|| {
        let keys = body
            .as_object()
            .map(|o| o.keys().cloned().collect::<Vec<_>>().join(","))
            .unwrap_or_default();
        FetchError::Parse(format!("positions payload without a list (keys: {keys})"))
    })?;

    Ok(list
        .iter()
        .filter_map(|el| {
            let market = el.get("market").filter(|m| m.is_object());
            let lookup = |fields: &[&str]| {
                market
                    .and_then(|m| pick_string(m, fields))
                    .or_else(|| pick_string(el, fields))
            };
            let question = lookup(QUESTION_FIELDS)?;
            Some(Position {
                market_id: lookup(MARKET_ID_FIELDS).unwrap_or_default(),
                market_question: question.trim().to_string(),
            })
        })
        .collect())
}

/// Deterministic search terms for a market question: quoted phrases,
/// capitalized phrases, then a few significant lowercase words.
pub fn extract_keywords(question: &str) -> Vec<String> {
    static YEAR: OnceCell<Regex> = OnceCell::new();
    static MONTH_DAY: OnceCell<Regex> = OnceCell::new();
    static QUOTED: OnceCell<Regex> = OnceCell::new();
    static PROPER: OnceCell<Regex> = OnceCell::new();
    static WORD: OnceCell<Regex> = OnceCell::new();

    let year = YEAR.get_or_init(|| Regex::new(r"\b20\d{2}\b").expect("year regex"));
    let month_day = MONTH_DAY.get_or_init(|| {
        Regex::new(
            r"(?i)\b(January|February|March|April|May|June|July|August|September|October|November|December)\s+\d{1,2}\b",
        )
        .expect("date regex")
    });
    let quoted = QUOTED.get_or_init(|| Regex::new(r#""([^"]+)""#).expect("quote regex"));
    let proper = PROPER.get_or_init(|| Regex::new(r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\b").expect("proper regex"));
    let word = WORD.get_or_init(|| Regex::new(r"\b[A-Za-z]+\b").expect("word regex"));

    let stripped = year.replace_all(question, "");
    let stripped = month_day.replace_all(&stripped, "");

    let mut candidates: Vec<String> = Vec::new();
    candidates.extend(quoted.captures_iter(&stripped).map(|c| c[1].to_string()));
    candidates.extend(proper.find_iter(&stripped).map(|m| m.as_str().to_string()));
    let lower = stripped.to_lowercase();
    candidates.extend(
        word.find_iter(&lower)
            .map(|m| m.as_str())
            .filter(|w| w.len() > 3 && !STOPWORDS.contains(w))
            .take(SIGNIFICANT_WORDS)
            .map(str::to_string),
    );

    let mut seen = HashSet::new();
    let mut out: Vec<String> = candidates
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .filter(|c| {
            let k = c.to_lowercase();
            !STOPWORDS.contains(&k.as_str()) && seen.insert(k)
        })
        .take(MAX_DERIVED_KEYWORDS)
        .collect();

    if out.is_empty() {
        let fallback: String = question.trim().chars().take(FALLBACK_KEYWORD_CHARS).collect();
        if !fallback.is_empty() {
            out.push(fallback);
        }
    }
    out
}

/// Buckets for the top positions, with custom keyword lists applied.
///
/// A custom entry matches a bucket by key or by market id and replaces its
/// derived keywords. Custom entries matching nothing become buckets of their
/// own. With no positions at all, `topics` are used instead.
pub fn derive_buckets(
    positions: &[Position],
    custom: &BTreeMap<String, Vec<String>>,
    topics: &[KeywordBucket],
) -> Vec<KeywordBucket> {
    let mut buckets: Vec<KeywordBucket> = if positions.is_empty() {
        topics.to_vec()
    } else {
        positions
            .iter()
            .take(MAX_POSITION_BUCKETS)
            .filter_map(|p| {
                let key = bucket_key_for(&p.market_question);
                if key.is_empty() {
                    return None;
                }
                let bucket = KeywordBucket::new(
                    key,
                    display_title(&p.market_question),
                    extract_keywords(&p.market_question),
                );
                Some(if p.market_id.is_empty() {
                    bucket
                } else {
                    bucket.with_market_id(p.market_id.clone())
                })
            })
            .collect()
    };

    let mut used = HashSet::new();
    for b in buckets.iter_mut() {
        let hit = custom.get_key_value(&b.key).or_else(|| {
            b.source_market_id
                .as_ref()
                .and_then(|id| custom.get_key_value(id))
        });
        if let Some((custom_key, keywords)) = hit {
            tracing::debug!(bucket = %b.key, "custom keyword bucket applied");
            b.keywords = keywords.clone();
            used.insert(custom_key.clone());
        }
    }
    for (key, keywords) in custom {
        if used.contains(key) || buckets.iter().any(|b| &b.key == key) {
            continue;
        }
        buckets.push(KeywordBucket::new(key.clone(), key.clone(), keywords.clone()));
    }
    buckets
}

// src/ingest/fetcher.rs
//! HTTP transport for feed endpoints. One call is one attempt: retries and
//! rotation belong to the aggregator and the rotation manager.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;

use crate::error::FetchError;
use crate::ingest::providers::parse_feed_mentioning;
use crate::ingest::types::{Fetcher, RawPayload};
use crate::sources::{EndpointTarget, SourceKind};

pub const USER_AGENT: &str = "Mozilla/5.0 (compatible; polyterm-pulse/0.1)";
pub const DEFAULT_MAX_ITEMS: usize = 50;

pub struct HttpFetcher {
    client: reqwest::Client,
    max_items: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            max_items: DEFAULT_MAX_ITEMS,
        })
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items.max(1);
        self
    }

    fn request_for(&self, endpoint: &EndpointTarget, query: &str) -> reqwest::RequestBuilder {
        match endpoint.kind {
            SourceKind::MirrorFeed => self
                .client
                .get(format!("{}/search/rss", endpoint.address))
                .query(&[("f", "tweets"), ("q", query)]),
            SourceKind::NewsSearch => self.client.get(&endpoint.address).query(&[
                ("q", query),
                ("hl", "en-US"),
                ("gl", "US"),
                ("ceid", "US:en"),
            ]),
            SourceKind::DirectRss => self.client.get(&endpoint.address),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, endpoint: &EndpointTarget, query: &str) -> Result<RawPayload, FetchError> {
        let resp = self.request_for(endpoint, query).send().await?;
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(err) = classify_status(resp.status().as_u16(), retry_after.as_deref(), Utc::now()) {
            return Err(err);
        }

        let body = resp.text().await?;
        // plain feeds are not searched upstream, so filter them here
        let keyword = (endpoint.kind == SourceKind::DirectRss).then_some(query);
        let mut items = match parse_feed_mentioning(&body, endpoint.kind, keyword) {
            Ok(items) => items,
            Err(e) if looks_rate_limited(&body) => {
                tracing::debug!(endpoint = %endpoint.address, error = %e, "rate-limit page served with 2xx");
                return Err(FetchError::RateLimited { retry_after: None });
            }
            Err(e) => return Err(e),
        };

        items.truncate(self.max_items);
        Ok(items)
    }
}

/// Map a non-success status to the fetch taxonomy; `None` for 2xx.
pub fn classify_status(status: u16, retry_after: Option<&str>, now: DateTime<Utc>) -> Option<FetchError> {
    match status {
        200..=299 => None,
        429 => Some(FetchError::RateLimited {
            retry_after: retry_after.and_then(|r| parse_retry_after(r, now)),
        }),
        401 | 403 | 451 => Some(FetchError::Blocked(status)),
        408 | 504 => Some(FetchError::Timeout),
        _ => Some(FetchError::Unreachable(format!("http status {status}"))),
    }
}

/// `Retry-After` as delta-seconds or an HTTP-date.
pub fn parse_retry_after(raw: &str, now: DateTime<Utc>) -> Option<Duration> {
    let s = raw.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(s).ok()?.with_timezone(&Utc);
    let delta = at.signed_duration_since(now).to_std().unwrap_or(Duration::ZERO);
    Some(delta)
}

/// Mirror instances often answer 200 with an HTML "rate limited" page.
fn looks_rate_limited(body: &str) -> bool {
    let head: String = body.chars().take(2048).collect::<String>().to_lowercase();
    head.contains("rate limit") || head.contains("too many requests")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 3, 12, 0, 0).unwrap()
    }

    #[test]
    fn statuses_map_to_fetch_errors() {
        assert_eq!(classify_status(200, None, t0()), None);
        assert_eq!(
            classify_status(429, Some("120"), t0()),
            Some(FetchError::RateLimited {
                retry_after: Some(Duration::from_secs(120))
            })
        );
        assert_eq!(
            classify_status(429, None, t0()),
            Some(FetchError::RateLimited { retry_after: None })
        );
        assert_eq!(classify_status(403, None, t0()), Some(FetchError::Blocked(403)));
        assert_eq!(classify_status(504, None, t0()), Some(FetchError::Timeout));
        assert!(matches!(classify_status(502, None, t0()), Some(FetchError::Unreachable(_))));
    }

    #[test]
    fn retry_after_http_date() {
        let d = parse_retry_after("Mon, 03 Nov 2025 12:10:00 GMT", t0()).unwrap();
        assert_eq!(d, Duration::from_secs(600));
        // dates in the past mean "now"
        let d = parse_retry_after("Mon, 03 Nov 2025 11:00:00 GMT", t0()).unwrap();
        assert_eq!(d, Duration::ZERO);
        assert!(parse_retry_after("soon", t0()).is_none());
    }

    #[test]
    fn rate_limit_page_detection() {
        assert!(looks_rate_limited("<html><h1>Instance has been rate limited.</h1></html>"));
        assert!(!looks_rate_limited("<html><h1>Not found</h1></html>"));
    }
}

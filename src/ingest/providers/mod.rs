// src/ingest/providers/mod.rs
//! Payload shapes accepted from feed upstreams.
//!
//! Each shape is a matcher returning `Some(entries)` when the body has its
//! structure (possibly with zero entries) and `None` otherwise. Shapes are
//! tried in table order and the first match wins; supporting a new upstream
//! format means adding a row to [`FEED_SHAPES`].

pub mod json;
pub mod rss;

use chrono::{DateTime, Utc};
use metrics::histogram;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use crate::error::FetchError;
use crate::ingest::types::FeedItem;
use crate::ingest::{extract_post_id, mentions_keyword, normalize_text};
use crate::sources::SourceKind;

/// Shape-independent entry before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEntry {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub link: Option<String>,
    pub guid: Option<String>,
    pub published: Option<String>,
    pub source: Option<String>,
}

pub struct FeedShape {
    pub name: &'static str,
    pub parse: fn(&str) -> Option<Vec<RawEntry>>,
}

pub const FEED_SHAPES: &[FeedShape] = &[
    FeedShape {
        name: "rss2",
        parse: rss::parse_rss2,
    },
    FeedShape {
        name: "atom",
        parse: rss::parse_atom,
    },
    FeedShape {
        name: "json",
        parse: json::parse_json_items,
    },
];

/// Parse a feed body into normalized items using the first matching shape.
pub fn parse_feed(body: &str, kind: SourceKind) -> Result<Vec<FeedItem>, FetchError> {
    parse_feed_mentioning(body, kind, None)
}

/// Like [`parse_feed`], keeping only entries whose title or summary mentions
/// `keyword` (when given). Runs before normalization drops the summary.
pub fn parse_feed_mentioning(
    body: &str,
    kind: SourceKind,
    keyword: Option<&str>,
) -> Result<Vec<FeedItem>, FetchError> {
    let t0 = std::time::Instant::now();
    for shape in FEED_SHAPES {
        if let Some(entries) = (shape.parse)(body) {
            let items: Vec<FeedItem> = entries
                .into_iter()
                .filter(|e| keyword.map_or(true, |k| entry_mentions(e, k)))
                .filter_map(|e| normalize_entry(e, kind))
                .collect();
            histogram!("pulse_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
            tracing::trace!(shape = shape.name, %kind, items = items.len(), "payload parsed");
            return Ok(items);
        }
    }
    let head: String = body.trim().chars().take(80).collect();
    Err(FetchError::Parse(format!("{kind} payload: {head}")))
}

fn entry_mentions(e: &RawEntry, keyword: &str) -> bool {
    [&e.title, &e.summary]
        .into_iter()
        .flatten()
        .any(|text| mentions_keyword(&normalize_text(text), keyword))
}

fn normalize_entry(e: RawEntry, kind: SourceKind) -> Option<FeedItem> {
    let title = e
        .title
        .as_deref()
        .map(normalize_text)
        .filter(|t| !t.is_empty())
        .or_else(|| e.summary.as_deref().map(normalize_text))
        .filter(|t| !t.is_empty())?;

    let link = e.link.map(|l| l.trim().to_string()).filter(|l| !l.is_empty());
    let guid = e.guid.map(|g| g.trim().to_string()).filter(|g| !g.is_empty());

    let post_id = link
        .as_deref()
        .and_then(extract_post_id)
        .or_else(|| guid.as_deref().and_then(extract_post_id))
        .or_else(|| guid.filter(|g| !g.contains("://")));

    let source = e
        .source
        .map(|s| normalize_text(&s))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| kind.display_source().to_string());

    Some(FeedItem {
        kind,
        source,
        title,
        link,
        post_id,
        published_at: e.published.as_deref().and_then(parse_timestamp),
    })
}

/// RFC 2822 (RSS), RFC 3339 (Atom/JSON) or unix seconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc2822) {
        return DateTime::from_timestamp(dt.unix_timestamp(), 0);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    s.parse::<i64>().ok().and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// Replace HTML-only entities that are not valid XML.
pub(crate) fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
        .replace("&hellip;", "...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_in_common_formats() {
        let a = parse_timestamp("Mon, 03 Nov 2025 12:00:00 GMT").unwrap();
        let b = parse_timestamp("2025-11-03T12:00:00Z").unwrap();
        let c = parse_timestamp("1762171200").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn html_page_matches_no_shape() {
        let err = parse_feed("<html><body>Instance has been rate limited</body></html>", SourceKind::MirrorFeed)
            .unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
    }

    #[test]
    fn keyword_filter_reads_the_summary() {
        let xml = r#"<rss><channel><title>World</title>
            <item><title>Oil markets wobble</title><description>Maduro signals new export terms</description></item>
            <item><title>Weather</title><description>Rain in Lisbon</description></item>
        </channel></rss>"#;
        let items = parse_feed_mentioning(xml, SourceKind::DirectRss, Some("maduro")).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Oil markets wobble");
        assert_eq!(parse_feed(xml, SourceKind::DirectRss).unwrap().len(), 2);
    }

    #[test]
    fn guid_urls_are_not_post_ids() {
        let e = RawEntry {
            title: Some("Headline".into()),
            guid: Some("https://news.example/x".into()),
            ..Default::default()
        };
        let it = normalize_entry(e, SourceKind::NewsSearch).unwrap();
        assert_eq!(it.post_id, None);
        assert_eq!(it.source, "Google News");
    }
}

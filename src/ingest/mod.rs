// src/ingest/mod.rs
//! Upstream retrieval: item types, the HTTP fetcher, payload shapes, and
//! the identity rules used to count each logical item once.

pub mod fetcher;
pub mod positions;
pub mod providers;
pub mod types;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use regex::Regex;

use crate::ingest::types::FeedItem;

const MAX_TEXT_CHARS: usize = 500;

/// Normalize text: decode entities, strip tags, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
    out = re_tags.replace_all(&out, "").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("ws regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    if out.chars().count() > MAX_TEXT_CHARS {
        out = out.chars().take(MAX_TEXT_CHARS).collect();
    }
    out
}

/// Social post id from a mirror permalink (`.../status/<id>`).
pub fn extract_post_id(link: &str) -> Option<String> {
    static RE_STATUS: OnceCell<Regex> = OnceCell::new();
    let re = RE_STATUS.get_or_init(|| Regex::new(r"/status(?:es)?/(\d+)").expect("status regex"));
    re.captures(link)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Scheme-less, lowercase-host link without query, fragment or trailing
/// slash, so `https://X.com/a/?utm=1` and `http://x.com/a` compare equal.
pub fn canonical_link(link: &str) -> Option<String> {
    let l = link.trim();
    if l.is_empty() {
        return None;
    }
    let no_scheme = l.split_once("://").map(|(_, rest)| rest).unwrap_or(l);
    let no_frag = no_scheme.split('#').next().unwrap_or_default();
    let no_query = no_frag.split('?').next().unwrap_or_default();
    let (host, path) = no_query.split_once('/').unwrap_or((no_query, ""));
    let host = host.trim_start_matches("www.").to_ascii_lowercase();
    let path = path.trim_end_matches('/');
    if path.is_empty() {
        Some(host)
    } else {
        Some(format!("{host}/{path}"))
    }
}

/// Every identity under which an item may reappear: post id, permalink,
/// headline. Two items sharing any key are the same logical item.
pub fn identity_keys(item: &FeedItem) -> Vec<String> {
    let mut keys = Vec::with_capacity(3);
    if let Some(id) = item.post_id.as_deref().filter(|s| !s.is_empty()) {
        keys.push(format!("post:{id}"));
    }
    if let Some(link) = item.link.as_deref().and_then(canonical_link) {
        keys.push(format!("link:{link}"));
    }
    let title = item.title.trim().to_lowercase();
    if !title.is_empty() {
        keys.push(format!("title:{title}"));
    }
    keys
}

/// Case-insensitive containment, used to filter plain RSS feeds by keyword.
pub fn mentions_keyword(text: &str, keyword: &str) -> bool {
    let k = keyword.trim().to_lowercase();
    !k.is_empty() && text.to_lowercase().contains(&k)
}

/// Per-pass merge of items arriving from several kinds and endpoints.
#[derive(Debug, Default)]
pub struct MentionDeduper {
    seen: HashSet<String>,
}

impl MentionDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if the item is new; its keys are remembered either way.
    pub fn insert(&mut self, item: &FeedItem) -> bool {
        let keys = identity_keys(item);
        if keys.is_empty() {
            return false;
        }
        let fresh = !keys.iter().any(|k| self.seen.contains(k));
        self.seen.extend(keys);
        fresh
    }
}

/// Cross-cycle record of which items were already counted per keyword, so
/// re-fetching the same post through another endpoint (or after the cache
/// expires) never counts it twice. Entries older than `retention` are
/// forgotten lazily.
#[derive(Debug)]
pub struct MentionLedger {
    seen: DashMap<String, HashMap<String, DateTime<Utc>>>,
    retention: chrono::Duration,
}

impl MentionLedger {
    pub fn new(retention: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            retention: chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::days(1)),
        }
    }

    /// Count `items` not yet seen for `keyword` and remember them.
    pub fn admit(&self, keyword: &str, items: &[FeedItem], now: DateTime<Utc>) -> u64 {
        let cutoff = now - self.retention;
        let mut entry = self.seen.entry(keyword_key(keyword)).or_default();
        entry.retain(|_, at| *at > cutoff);

        let mut fresh = 0u64;
        for item in items {
            let keys = identity_keys(item);
            if keys.is_empty() || keys.iter().any(|k| entry.contains_key(k)) {
                continue;
            }
            for k in keys {
                entry.insert(k, now);
            }
            fresh += 1;
        }
        fresh
    }

    /// Forget identities older than the retention window for every
    /// keyword, dropping keywords left empty. Returns keywords dropped.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let before = self.seen.len();
        self.seen.retain(|_, ids| {
            ids.retain(|_, at| *at > cutoff);
            !ids.is_empty()
        });
        before.saturating_sub(self.seen.len())
    }

    pub fn keywords(&self) -> usize {
        self.seen.len()
    }
}

/// Keywords are tracked case-insensitively.
pub fn keyword_key(keyword: &str) -> String {
    keyword.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::SourceKind;

    fn item(title: &str, link: Option<&str>, post_id: Option<&str>) -> FeedItem {
        FeedItem {
            kind: SourceKind::MirrorFeed,
            source: "Twitter/X".into(),
            title: title.into(),
            link: link.map(Into::into),
            post_id: post_id.map(Into::into),
            published_at: None,
        }
    }

    #[test]
    fn normalize_text_strips_tags_and_entities() {
        let out = normalize_text("  <b>Maduro</b>&nbsp;&nbsp; speaks &ldquo;today&rdquo; ");
        assert_eq!(out, r#"Maduro speaks "today""#);
    }

    #[test]
    fn post_id_from_mirror_permalink() {
        assert_eq!(
            extract_post_id("https://nitter.net/someone/status/1850000000000000001#m"),
            Some("1850000000000000001".to_string())
        );
        assert_eq!(extract_post_id("https://news.example/article/5"), None);
    }

    #[test]
    fn canonical_link_ignores_scheme_query_and_slash() {
        assert_eq!(
            canonical_link("https://WWW.Example.com/a/b/?utm=1#top"),
            canonical_link("http://example.com/a/b")
        );
    }

    #[test]
    fn deduper_merges_on_any_shared_identity() {
        let mut d = MentionDeduper::new();
        assert!(d.insert(&item("Headline A", Some("https://x.com/1"), None)));
        // same link, different title
        assert!(!d.insert(&item("Headline A (updated)", Some("https://x.com/1"), None)));
        // same title, different link
        assert!(!d.insert(&item("headline a", Some("https://y.com/2"), None)));
        assert!(d.insert(&item("Other", None, Some("42"))));
        assert!(!d.insert(&item("Other again", None, Some("42"))));
    }

    #[test]
    fn ledger_counts_once_per_keyword_until_retention() {
        use chrono::TimeZone;
        let t0 = Utc.with_ymd_and_hms(2025, 11, 3, 12, 0, 0).unwrap();
        let l = MentionLedger::new(Duration::from_secs(3600));
        let items = vec![item("p1", None, Some("1")), item("p2", None, Some("2"))];
        assert_eq!(l.admit("Maduro", &items, t0), 2);
        assert_eq!(l.admit("maduro", &items, t0), 0);
        // a different keyword counts independently
        assert_eq!(l.admit("Venezuela", &items[..1], t0), 1);
        // forgotten after retention
        assert_eq!(l.admit("Maduro", &items, t0 + chrono::Duration::seconds(3601)), 2);
    }

    #[test]
    fn prune_drops_keywords_no_longer_admitted() {
        use chrono::TimeZone;
        let t0 = Utc.with_ymd_and_hms(2025, 11, 3, 12, 0, 0).unwrap();
        let l = MentionLedger::new(Duration::from_secs(3600));
        l.admit("Maduro", &[item("p1", None, Some("1"))], t0);
        l.admit("Venezuela", &[item("p2", None, Some("2"))], t0 + chrono::Duration::minutes(40));
        assert_eq!(l.keywords(), 2);

        assert_eq!(l.prune(t0 + chrono::Duration::minutes(30)), 0);
        assert_eq!(l.prune(t0 + chrono::Duration::minutes(61)), 1);
        assert_eq!(l.keywords(), 1);
        // the surviving keyword still remembers its item
        let again = [item("p2", None, Some("2"))];
        assert_eq!(l.admit("venezuela", &again, t0 + chrono::Duration::minutes(61)), 0);
        assert_eq!(l.prune(t0 + chrono::Duration::hours(3)), 1);
        assert_eq!(l.keywords(), 0);
    }
}

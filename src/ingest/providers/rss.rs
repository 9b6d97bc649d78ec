// src/ingest/providers/rss.rs
//! RSS 2.0 and Atom shapes.

use quick_xml::de::from_str;
use serde::Deserialize;

use super::{scrub_html_entities_for_xml, RawEntry};

/// Element text regardless of attributes (`<title type="html">`, `<guid isPermaLink>`).
#[derive(Debug, Default, Deserialize)]
struct TextNode {
    #[serde(rename = "$text", default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<TextNode>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    source: Option<TextNode>,
}

pub fn parse_rss2(body: &str) -> Option<Vec<RawEntry>> {
    let xml = scrub_html_entities_for_xml(body);
    let rss: Rss = from_str(&xml).ok()?;
    Some(
        rss.channel
            .item
            .into_iter()
            .map(|it| RawEntry {
                title: it.title,
                summary: it.description,
                link: it.link,
                guid: it.guid.map(|g| g.text),
                published: it.pub_date,
                source: it.source.map(|s| s.text),
            })
            .collect(),
    )
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    // required: distinguishes a feed document from arbitrary XML
    #[allow(dead_code)]
    title: TextNode,
    #[serde(rename = "entry", default)]
    entry: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    title: Option<TextNode>,
    id: Option<String>,
    published: Option<String>,
    updated: Option<String>,
    summary: Option<TextNode>,
    #[serde(rename = "link", default)]
    link: Vec<AtomLink>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

pub fn parse_atom(body: &str) -> Option<Vec<RawEntry>> {
    let xml = scrub_html_entities_for_xml(body);
    let feed: AtomFeed = from_str(&xml).ok()?;
    Some(
        feed.entry
            .into_iter()
            .map(|e| {
                let link = e
                    .link
                    .iter()
                    .find(|l| l.rel.as_deref().map_or(true, |r| r == "alternate"))
                    .or_else(|| e.link.first())
                    .and_then(|l| l.href.clone());
                RawEntry {
                    title: e.title.map(|t| t.text),
                    summary: e.summary.map(|s| s.text),
                    link,
                    guid: e.id,
                    published: e.published.or(e.updated),
                    source: None,
                }
            })
            .collect(),
    )
}

// src/ingest/providers/json.rs
//! JSON list shapes. Upstreams disagree on container and field names, so
//! both are looked up through alias tables.

use serde_json::Value;

use super::RawEntry;

/// Keys that may hold the item list when the body is an object.
pub const CONTAINER_KEYS: &[&str] = &["items", "data", "results", "entries", "statuses", "posts"];
pub const TITLE_FIELDS: &[&str] = &["title", "text", "full_text", "headline", "content"];
pub const SUMMARY_FIELDS: &[&str] = &["summary", "description", "content_text"];
pub const LINK_FIELDS: &[&str] = &["url", "link", "permalink", "external_url", "href"];
pub const ID_FIELDS: &[&str] = &["id_str", "id", "guid", "post_id"];
pub const DATE_FIELDS: &[&str] = &[
    "date_published",
    "published_at",
    "published",
    "created_at",
    "pubDate",
    "timestamp",
    "date",
];
pub const SOURCE_FIELDS: &[&str] = &["source", "site", "author"];

pub fn parse_json_items(body: &str) -> Option<Vec<RawEntry>> {
    let v: Value = serde_json::from_str(body.trim()).ok()?;
    let list = find_list(&v, CONTAINER_KEYS)?;
    let mut out = Vec::with_capacity(list.len());
    for el in list {
        if !el.is_object() {
            return None;
        }
        out.push(RawEntry {
            title: pick_string(el, TITLE_FIELDS),
            summary: pick_string(el, SUMMARY_FIELDS),
            link: pick_string(el, LINK_FIELDS),
            guid: pick_string(el, ID_FIELDS),
            published: pick_string(el, DATE_FIELDS),
            source: pick_string(el, SOURCE_FIELDS),
        });
    }
    Some(out)
}

/// Top-level array, or the first container key holding an array. One level
/// of `{"data": {"items": [...]}}` nesting is followed.
pub fn find_list<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a Vec<Value>> {
    if let Some(arr) = v.as_array() {
        return Some(arr);
    }
    let obj = v.as_object()?;
    for k in keys {
        match obj.get(*k) {
            Some(Value::Array(arr)) => return Some(arr),
            Some(inner @ Value::Object(_)) => {
                if let Some(arr) = keys
                    .iter()
                    .find_map(|k2| inner.get(*k2).and_then(Value::as_array))
                {
                    return Some(arr);
                }
            }
            _ => {}
        }
    }
    None
}

/// First alias present as a non-empty string or number. Objects with a
/// `name` (e.g. `"source": {"name": "Reuters"}`) are unwrapped.
pub fn pick_string(v: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|f| match v.get(*f)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(o) => o
            .get("name")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string),
        _ => None,
    })
}

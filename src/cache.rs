// src/cache.rs
//! # Cache Store
//! Disk-backed key/value store with per-entry TTL and a hard entry limit.
//!
//! - Keys are derived from the request signature (kind, query, bucket) and
//!   never include the endpoint, so rotating endpoints reuses the cache.
//! - The store is TTL-agnostic: callers pick the TTL class per `put`.
//! - Inserting over `max_entries` evicts the entry with the oldest
//!   `fetched_at`.
//! - Each entry is written through to `<dir>/<key>.json`. A failed write is
//!   logged and the entry dropped, so the next read is a miss.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CacheError;

pub const DEFAULT_MAX_ENTRIES: usize = 200;
/// Market/position data.
pub const MARKET_TTL: Duration = Duration::from_secs(120);
/// Feed/news data.
pub const FEED_TTL: Duration = Duration::from_secs(1800);

/// A single stored payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.fetched_at).num_milliseconds();
        let ttl_ms = i64::try_from(self.ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        age < ttl_ms
    }
}

/// Deterministic key for a request signature. Parts are joined with a unit
/// separator so `("ab", "c")` and `("a", "bc")` differ.
pub fn request_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, p) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(p.trim().as_bytes());
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for b in digest.iter().take(16) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[derive(Debug)]
pub struct CacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
    dir: Option<PathBuf>,
    max_entries: usize,
}

impl CacheStore {
    /// Memory-only store (tests, `--once` dry runs).
    pub fn in_memory(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            dir: None,
            max_entries: max_entries.max(1),
        }
    }

    /// Open (or create) a disk-backed store and load surviving entries.
    /// Unreadable files are deleted; the oldest entries are dropped if the
    /// directory holds more than `max_entries`.
    pub fn open(dir: impl AsRef<Path>, max_entries: usize) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut loaded = HashMap::new();
        for e in fs::read_dir(&dir)?.flatten() {
            let path = e.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match read_entry(&path) {
                Some(entry) => {
                    loaded.insert(entry.key.clone(), entry);
                }
                None => {
                    tracing::warn!(path = %path.display(), "dropping unreadable cache file");
                    let _ = fs::remove_file(&path);
                }
            }
        }

        let store = Self {
            entries: Mutex::new(loaded),
            dir: Some(dir),
            max_entries: max_entries.max(1),
        };
        let evicted = {
            let mut map = store.entries.lock().expect("cache mutex poisoned");
            let mut out = Vec::new();
            while map.len() > store.max_entries {
                match evict_oldest(&mut map, None) {
                    Some(k) => out.push(k),
                    None => break,
                }
            }
            out
        };
        for k in evicted {
            store.remove_file(&k);
        }
        tracing::info!(entries = store.len(), "cache store opened");
        Ok(store)
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fresh payload for `key`, or `None` when missing or past its TTL.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<serde_json::Value> {
        let map = self.entries.lock().expect("cache mutex poisoned");
        match map.get(key) {
            Some(e) if e.is_fresh(now) => {
                counter!("pulse_cache_hits_total").increment(1);
                Some(e.payload.clone())
            }
            _ => {
                counter!("pulse_cache_misses_total").increment(1);
                None
            }
        }
    }

    /// Entry regardless of TTL. Used to serve last-known data when every
    /// endpoint of a kind is unavailable.
    pub fn get_stale(&self, key: &str) -> Option<CacheEntry> {
        self.entries
            .lock()
            .expect("cache mutex poisoned")
            .get(key)
            .cloned()
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str, now: DateTime<Utc>) -> Option<T> {
        let v = self.get(key, now)?;
        match serde_json::from_value(v) {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::warn!(key, error = %e, "cached payload has unexpected shape");
                None
            }
        }
    }

    /// Insert or overwrite `key`. Evicts the oldest entry if the store is now
    /// over capacity, then writes through to disk.
    pub fn put(&self, key: &str, payload: serde_json::Value, ttl: Duration, now: DateTime<Utc>) {
        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            fetched_at: now,
            ttl_secs: ttl.as_secs(),
        };

        let evicted = {
            let mut map = self.entries.lock().expect("cache mutex poisoned");
            map.insert(key.to_string(), entry.clone());
            if map.len() > self.max_entries {
                evict_oldest(&mut map, Some(key))
            } else {
                None
            }
        };
        if let Some(k) = evicted {
            tracing::debug!(key = %k, "cache eviction");
            self.remove_file(&k);
        }

        if let Err(e) = self.persist(&entry) {
            tracing::warn!(key, error = %e, "cache write failed; entry dropped");
            counter!("pulse_cache_write_errors_total").increment(1);
            let mut map = self.entries.lock().expect("cache mutex poisoned");
            if map.get(key).map(|cur| cur.fetched_at) == Some(entry.fetched_at) {
                map.remove(key);
            }
        }
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration, now: DateTime<Utc>) {
        match serde_json::to_value(value) {
            Ok(v) => self.put(key, v, ttl, now),
            Err(e) => {
                tracing::warn!(key, error = %e, "cache payload not serializable");
                counter!("pulse_cache_write_errors_total").increment(1);
            }
        }
    }

    pub fn delete(&self, key: &str) {
        self.entries.lock().expect("cache mutex poisoned").remove(key);
        self.remove_file(key);
    }

    pub fn clear(&self) {
        let keys: Vec<String> = {
            let mut map = self.entries.lock().expect("cache mutex poisoned");
            map.drain().map(|(k, _)| k).collect()
        };
        for k in keys {
            self.remove_file(&k);
        }
    }

    /// Teardown: rewrite every live entry. Attempts all entries and returns
    /// the first error, if any.
    pub fn flush(&self) -> Result<(), CacheError> {
        let snapshot: Vec<CacheEntry> = self
            .entries
            .lock()
            .expect("cache mutex poisoned")
            .values()
            .cloned()
            .collect();
        let mut first_err = None;
        for e in &snapshot {
            if let Err(err) = self.persist(e) {
                tracing::warn!(key = %e.key, error = %err, "cache flush failed");
                first_err.get_or_insert(err);
            }
        }
        tracing::info!(entries = snapshot.len(), "cache flushed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn persist(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = entry_path(dir, &entry.key);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec(entry)?;
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&json)?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn remove_file(&self, key: &str) {
        if let Some(dir) = &self.dir {
            let _ = fs::remove_file(entry_path(dir, key));
        }
    }
}

/// Drop the entry with the oldest `fetched_at`, never `keep`.
fn evict_oldest(map: &mut HashMap<String, CacheEntry>, keep: Option<&str>) -> Option<String> {
    let oldest = map
        .values()
        .filter(|e| Some(e.key.as_str()) != keep)
        .min_by_key(|e| e.fetched_at)
        .map(|e| e.key.clone())?;
    map.remove(&oldest);
    counter!("pulse_cache_evictions_total").increment(1);
    Some(oldest)
}

fn entry_path(dir: &Path, key: &str) -> PathBuf {
    let safe: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    dir.join(format!("{safe}.json"))
}

fn read_entry(path: &Path) -> Option<CacheEntry> {
    let s = fs::read_to_string(path).ok()?;
    serde_json::from_str(&s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 3, 12, 0, 0).unwrap()
    }

    #[test]
    fn request_key_is_deterministic_and_separated() {
        assert_eq!(request_key(&["mirror", "Maduro", "vz"]), request_key(&["mirror", "Maduro", "vz"]));
        assert_ne!(request_key(&["ab", "c"]), request_key(&["a", "bc"]));
        assert_eq!(request_key(&["x"]).len(), 32);
    }

    #[test]
    fn hit_until_ttl_then_miss() {
        let c = CacheStore::in_memory(10);
        c.put("k", json!([1, 2]), Duration::from_secs(120), t0());
        assert_eq!(c.get("k", t0() + chrono::Duration::seconds(119)), Some(json!([1, 2])));
        assert_eq!(c.get("k", t0() + chrono::Duration::seconds(120)), None);
        // stale view survives expiry
        assert!(c.get_stale("k").is_some());
    }

    #[test]
    fn overwrite_does_not_evict() {
        let c = CacheStore::in_memory(2);
        c.put("a", json!(1), FEED_TTL, t0());
        c.put("b", json!(2), FEED_TTL, t0() + chrono::Duration::seconds(1));
        c.put("a", json!(3), FEED_TTL, t0() + chrono::Duration::seconds(2));
        assert_eq!(c.len(), 2);
        assert!(c.get_stale("b").is_some());
    }

    #[test]
    fn fresh_put_survives_eviction_with_older_clock_or_ties() {
        let c = CacheStore::in_memory(2);
        c.put("a", json!(1), FEED_TTL, t0());
        c.put("b", json!(2), FEED_TTL, t0());
        // clock stepped back: the new entry is the oldest by timestamp
        let earlier = t0() - chrono::Duration::minutes(5);
        c.put("c", json!(3), FEED_TTL, earlier);
        assert_eq!(c.len(), 2);
        assert_eq!(c.get("c", earlier), Some(json!(3)));

        // all timestamps tie
        for i in 0..20 {
            let key = format!("tie{i}");
            c.put(&key, json!(i), FEED_TTL, t0());
            assert_eq!(c.get(&key, t0()), Some(json!(i)));
            assert_eq!(c.len(), 2);
        }
    }

    #[test]
    fn delete_and_clear() {
        let c = CacheStore::in_memory(5);
        c.put("a", json!(1), FEED_TTL, t0());
        c.put("b", json!(2), FEED_TTL, t0());
        c.delete("a");
        assert!(c.get_stale("a").is_none());
        c.clear();
        assert!(c.is_empty());
    }
}

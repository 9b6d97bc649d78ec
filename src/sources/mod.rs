// src/sources/mod.rs
//! Source kinds and the per-kind endpoint registry.
//!
//! The registry owns the endpoint list and each endpoint's health. Health is
//! guarded per endpoint, so concurrent fetch tasks only contend when they
//! touch the same endpoint. All state transitions go through
//! [`rotation::RotationManager`].

pub mod rotation;

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upstream family. Endpoints of one kind are interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Privacy proxy for a social firehose (nitter-style instances).
    MirrorFeed,
    /// News search RSS.
    NewsSearch,
    /// Plain RSS/Atom feed, filtered client-side by keyword.
    DirectRss,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [
        SourceKind::MirrorFeed,
        SourceKind::NewsSearch,
        SourceKind::DirectRss,
    ];

    pub fn label(self) -> &'static str {
        match self {
            SourceKind::MirrorFeed => "mirror",
            SourceKind::NewsSearch => "news",
            SourceKind::DirectRss => "rss",
        }
    }

    /// Display name attached to items from this kind.
    pub fn display_source(self) -> &'static str {
        match self {
            SourceKind::MirrorFeed => "Twitter/X",
            SourceKind::NewsSearch => "Google News",
            SourceKind::DirectRss => "RSS",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointState {
    Healthy,
    Degraded,
    Cooling,
}

/// Mutable health record of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointHealth {
    pub state: EndpointState,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        Self {
            state: EndpointState::Healthy,
            cooldown_until: None,
            consecutive_failures: 0,
        }
    }
}

impl EndpointHealth {
    /// Selectable unless cooling with a cooldown still running.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        match (self.state, self.cooldown_until) {
            (EndpointState::Cooling, Some(until)) => now >= until,
            _ => true,
        }
    }
}

/// Read-only view of an endpoint, for the snapshot and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceEndpoint {
    pub kind: SourceKind,
    pub address: String,
    pub state: EndpointState,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// What the fetcher needs to know about an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTarget {
    pub kind: SourceKind,
    pub address: String,
}

#[derive(Debug)]
pub(crate) struct EndpointSlot {
    pub(crate) address: String,
    pub(crate) health: Mutex<EndpointHealth>,
}

#[derive(Debug, Default)]
pub(crate) struct KindEndpoints {
    pub(crate) slots: Vec<EndpointSlot>,
    pub(crate) cursor: AtomicUsize,
}

/// Endpoint variants per source kind, built once at startup.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    kinds: HashMap<SourceKind, KindEndpoints>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the ordered endpoint list for `kind`. Blank and repeated
    /// addresses are skipped.
    pub fn with_endpoints<I, S>(mut self, kind: SourceKind, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self.kinds.entry(kind).or_default();
        for a in addresses {
            let a: String = a.into();
            let a = a.trim().trim_end_matches('/').to_string();
            if a.is_empty() || entry.slots.iter().any(|s| s.address == a) {
                continue;
            }
            entry.slots.push(EndpointSlot {
                address: a,
                health: Mutex::new(EndpointHealth::default()),
            });
        }
        self
    }

    pub fn endpoint_count(&self, kind: SourceKind) -> usize {
        self.kinds.get(&kind).map(|k| k.slots.len()).unwrap_or(0)
    }

    /// Kinds with at least one endpoint, in `SourceKind::ALL` order.
    pub fn active_kinds(&self) -> Vec<SourceKind> {
        SourceKind::ALL
            .into_iter()
            .filter(|k| self.endpoint_count(*k) > 0)
            .collect()
    }

    pub fn address(&self, kind: SourceKind, index: usize) -> Option<&str> {
        self.kinds
            .get(&kind)
            .and_then(|k| k.slots.get(index))
            .map(|s| s.address.as_str())
    }

    pub fn health(&self, kind: SourceKind, index: usize) -> Option<EndpointHealth> {
        self.slot(kind, index)
            .map(|s| s.health.lock().expect("endpoint mutex poisoned").clone())
    }

    /// Point-in-time copy of every endpoint of `kind`.
    pub fn endpoints(&self, kind: SourceKind) -> Vec<SourceEndpoint> {
        let Some(k) = self.kinds.get(&kind) else {
            return Vec::new();
        };
        k.slots
            .iter()
            .map(|s| {
                let h = s.health.lock().expect("endpoint mutex poisoned");
                SourceEndpoint {
                    kind,
                    address: s.address.clone(),
                    state: h.state,
                    cooldown_until: h.cooldown_until,
                    consecutive_failures: h.consecutive_failures,
                }
            })
            .collect()
    }

    pub(crate) fn kind(&self, kind: SourceKind) -> Option<&KindEndpoints> {
        self.kinds.get(&kind)
    }

    pub(crate) fn slot(&self, kind: SourceKind, index: usize) -> Option<&EndpointSlot> {
        self.kinds.get(&kind).and_then(|k| k.slots.get(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_dedups_and_trims_addresses() {
        let r = SourceRegistry::new().with_endpoints(
            SourceKind::MirrorFeed,
            ["https://nitter.net/", " https://nitter.net", "", "https://nitter.it"],
        );
        assert_eq!(r.endpoint_count(SourceKind::MirrorFeed), 2);
        assert_eq!(r.address(SourceKind::MirrorFeed, 0), Some("https://nitter.net"));
        assert_eq!(r.endpoint_count(SourceKind::NewsSearch), 0);
        assert_eq!(r.active_kinds(), vec![SourceKind::MirrorFeed]);
    }

    #[test]
    fn new_endpoints_start_healthy() {
        let r = SourceRegistry::new().with_endpoints(SourceKind::DirectRss, ["https://a/feed"]);
        let eps = r.endpoints(SourceKind::DirectRss);
        assert_eq!(eps.len(), 1);
        assert_eq!(eps[0].state, EndpointState::Healthy);
        assert_eq!(eps[0].consecutive_failures, 0);
    }
}

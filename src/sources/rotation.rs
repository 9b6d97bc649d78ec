// src/sources/rotation.rs
//! Endpoint selection, backoff and cooldown.
//!
//! Per-endpoint state machine:
//! - `Healthy -> Degraded` on any failure.
//! - `Degraded -> Cooling` once `consecutive_failures >= failure_threshold`,
//!   with `cooldown_until = now + backoff(failures)`.
//! - Rate limits go straight to `Cooling`, for at least the Retry-After hint
//!   (or the standard backoff), never less than `rate_limit_floor` and never
//!   more than `rate_limit_cap`.
//! - Any success resets to `Healthy` with zero failures. A cooling endpoint
//!   becomes selectable again once its cooldown passes.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};

use super::{EndpointHealth, EndpointState, EndpointTarget, SourceKind, SourceRegistry};
use crate::error::FetchError;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(15);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_RATE_LIMIT_FLOOR: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_RATE_LIMIT_CAP: Duration = Duration::from_secs(6 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationPolicy {
    pub failure_threshold: u32,
    #[serde(with = "secs")]
    pub backoff_base: Duration,
    #[serde(with = "secs")]
    pub backoff_cap: Duration,
    #[serde(with = "secs")]
    pub rate_limit_floor: Duration,
    /// Upper bound for upstream Retry-After hints.
    #[serde(with = "secs")]
    pub rate_limit_cap: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            rate_limit_floor: DEFAULT_RATE_LIMIT_FLOOR,
            rate_limit_cap: DEFAULT_RATE_LIMIT_CAP,
        }
    }
}

impl RotationPolicy {
    /// `base * 2^failures`, capped.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.min(20);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }

    fn rate_limit_cooldown(&self, failures: u32, retry_after: Option<Duration>) -> Duration {
        retry_after
            .unwrap_or_else(|| self.backoff(failures))
            .min(self.rate_limit_cap)
            .max(self.rate_limit_floor)
    }
}

/// An endpoint chosen for one fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub target: EndpointTarget,
    pub index: usize,
    /// Every endpoint of the kind is cooling; this is the one that recovers
    /// first. Results through it may be stale or unavailable.
    pub all_cooling: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RotationManager {
    registry: Arc<SourceRegistry>,
    policy: RotationPolicy,
}

impl RotationManager {
    pub fn new(registry: Arc<SourceRegistry>, policy: RotationPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    /// First non-cooling endpoint in round-robin order, or the earliest
    /// recovering one when all are cooling. `None` if the kind has no
    /// endpoints.
    pub fn select(&self, kind: SourceKind, now: DateTime<Utc>) -> Option<Selection> {
        self.select_untried(kind, &HashSet::new(), now)
    }

    /// Like [`select`](Self::select) but skips endpoints already tried in the
    /// current cycle. Once at least one endpoint was tried, returns `None`
    /// instead of falling back to a cooling endpoint: the kind is exhausted.
    pub fn select_untried(
        &self,
        kind: SourceKind,
        tried: &HashSet<usize>,
        now: DateTime<Utc>,
    ) -> Option<Selection> {
        let k = self.registry.kind(kind)?;
        let n = k.slots.len();
        if n == 0 {
            return None;
        }

        let start = k.cursor.load(Ordering::Relaxed) % n;
        for step in 0..n {
            let idx = (start + step) % n;
            if tried.contains(&idx) {
                continue;
            }
            let slot = &k.slots[idx];
            let available = slot
                .health
                .lock()
                .expect("endpoint mutex poisoned")
                .is_available(now);
            if available {
                k.cursor.store((idx + 1) % n, Ordering::Relaxed);
                return Some(Selection {
                    target: EndpointTarget {
                        kind,
                        address: slot.address.clone(),
                    },
                    index: idx,
                    all_cooling: false,
                    cooldown_until: None,
                });
            }
        }

        if !tried.is_empty() {
            return None;
        }

        // Graceful degradation: everyone is cooling.
        let (idx, until) = k
            .slots
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let h = s.health.lock().expect("endpoint mutex poisoned");
                (i, h.cooldown_until)
            })
            .min_by_key(|(_, until)| *until)?;
        Some(Selection {
            target: EndpointTarget {
                kind,
                address: k.slots[idx].address.clone(),
            },
            index: idx,
            all_cooling: true,
            cooldown_until: until,
        })
    }

    pub fn report_success(&self, kind: SourceKind, index: usize, _now: DateTime<Utc>) {
        let Some(slot) = self.registry.slot(kind, index) else {
            return;
        };
        let mut h = slot.health.lock().expect("endpoint mutex poisoned");
        if h.state != EndpointState::Healthy {
            tracing::info!(%kind, endpoint = %slot.address, previous = ?h.state, "endpoint recovered");
        }
        *h = EndpointHealth::default();
    }

    /// Record a failed attempt and return the endpoint's new state.
    pub fn report_failure(
        &self,
        kind: SourceKind,
        index: usize,
        err: &FetchError,
        now: DateTime<Utc>,
    ) -> Option<EndpointState> {
        let slot = self.registry.slot(kind, index)?;
        let mut h = slot.health.lock().expect("endpoint mutex poisoned");
        h.consecutive_failures = h.consecutive_failures.saturating_add(1);

        let cooldown = match err {
            FetchError::RateLimited { retry_after } => Some(
                self.policy
                    .rate_limit_cooldown(h.consecutive_failures, *retry_after),
            ),
            _ if h.consecutive_failures >= self.policy.failure_threshold => {
                Some(self.policy.backoff(h.consecutive_failures))
            }
            _ => None,
        };

        match cooldown {
            Some(d) => {
                let until = now
                    .checked_add_signed(to_chrono(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                h.state = EndpointState::Cooling;
                h.cooldown_until = Some(until);
                counter!("pulse_endpoint_cooldowns_total", "kind" => kind.label()).increment(1);
                tracing::warn!(
                    %kind,
                    endpoint = %slot.address,
                    failures = h.consecutive_failures,
                    cooldown_secs = d.as_secs(),
                    reason = err.label(),
                    "endpoint cooling"
                );
            }
            None => {
                h.state = EndpointState::Degraded;
                tracing::debug!(
                    %kind,
                    endpoint = %slot.address,
                    failures = h.consecutive_failures,
                    reason = err.label(),
                    "endpoint degraded"
                );
            }
        }
        Some(h.state)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(1))
}

/// Durations as whole seconds in config files.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

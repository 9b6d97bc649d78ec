// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::activity::{ActivityConfig, SpikeThresholds};
use crate::aggregator::{AggregatorSettings, DEFAULT_MAX_CONCURRENCY, DEFAULT_MAX_KEYWORDS, DEFAULT_SAMPLE_MENTIONS};
use crate::bucket::KeywordBucket;
use crate::cache::DEFAULT_MAX_ENTRIES;
use crate::coordinator::{clamp_refresh, CoordinatorSettings};
use crate::error::ConfigError;
use crate::ingest::positions::DEFAULT_POSITIONS_URL;
use crate::sources::rotation::RotationPolicy;
use crate::sources::{SourceKind, SourceRegistry};

pub const ENV_PATH: &str = "PULSE_CONFIG_PATH";
pub const ENV_WALLET: &str = "PULSE_WALLET";
pub const ENV_REFRESH: &str = "PULSE_REFRESH_SECS";

pub const DEFAULT_MIRRORS: &[&str] = &[
    "https://nitter.net",
    "https://nitter.it",
    "https://nitter.poast.org",
];
pub const DEFAULT_NEWS: &[&str] = &["https://news.google.com/rss/search"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    pub wallet_address: Option<String>,
    pub positions_url: String,
    pub refresh_seconds: u64,
    pub cache_dir: PathBuf,
    pub cache_limit: usize,
    pub cache_ttl_markets: u64,
    pub cache_ttl_feeds: u64,
    pub mirror_urls: Vec<String>,
    pub news_urls: Vec<String>,
    pub rss_urls: Vec<String>,
    pub custom_keyword_buckets: BTreeMap<String, Vec<String>>,
    pub topics: Vec<KeywordBucket>,
    pub rotation: RotationPolicy,
    pub spike: SpikeThresholds,
    pub activity: ActivityConfig,
    pub max_concurrency: usize,
    pub cycle_deadline_secs: u64,
    pub request_timeout_secs: u64,
    pub max_keywords_per_bucket: usize,
    pub sample_mentions: usize,
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            wallet_address: None,
            positions_url: DEFAULT_POSITIONS_URL.to_string(),
            refresh_seconds: 15,
            cache_dir: PathBuf::from("cache"),
            cache_limit: DEFAULT_MAX_ENTRIES,
            cache_ttl_markets: 120,
            cache_ttl_feeds: 1800,
            mirror_urls: DEFAULT_MIRRORS.iter().map(|s| s.to_string()).collect(),
            news_urls: DEFAULT_NEWS.iter().map(|s| s.to_string()).collect(),
            rss_urls: Vec::new(),
            custom_keyword_buckets: BTreeMap::new(),
            topics: Vec::new(),
            rotation: RotationPolicy::default(),
            spike: SpikeThresholds::default(),
            activity: ActivityConfig::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            cycle_deadline_secs: 20,
            request_timeout_secs: 15,
            max_keywords_per_bucket: DEFAULT_MAX_KEYWORDS,
            sample_mentions: DEFAULT_SAMPLE_MENTIONS,
            metrics_listen: None,
        }
    }
}

impl PulseConfig {
    /// Load from an explicit path. Supports TOML or JSON formats.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        parse_config(&content, ext.as_str())
            .with_context(|| format!("parsing config {}", path.display()))
    }

    /// Load using env var + fallbacks, then apply env overrides:
    /// 1) $PULSE_CONFIG_PATH
    /// 2) config/pulse.toml
    /// 3) config/pulse.json
    /// 4) built-in defaults
    pub fn load_default() -> Result<Self> {
        let mut cfg = if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_PATH} points to non-existent path"));
            }
            Self::load_from(&pb)?
        } else {
            let toml_p = PathBuf::from("config/pulse.toml");
            let json_p = PathBuf::from("config/pulse.json");
            if toml_p.exists() {
                Self::load_from(&toml_p)?
            } else if json_p.exists() {
                Self::load_from(&json_p)?
            } else {
                Self::default()
            }
        };
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(w) = std::env::var(ENV_WALLET) {
            let w = w.trim();
            self.wallet_address = (!w.is_empty()).then(|| w.to_string());
        }
        if let Ok(r) = std::env::var(ENV_REFRESH) {
            self.refresh_seconds = r
                .trim()
                .parse()
                .with_context(|| format!("{ENV_REFRESH} must be a number of seconds"))?;
        }
        self.refresh_seconds = clamp_refresh(self.refresh_seconds);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_limit == 0 {
            return Err(ConfigError::Invalid("cache_limit must be at least 1".into()));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid("max_concurrency must be at least 1".into()));
        }
        if self.max_keywords_per_bucket == 0 {
            return Err(ConfigError::Invalid("max_keywords_per_bucket must be at least 1".into()));
        }
        if self.cycle_deadline_secs == 0 || self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        if self.rotation.failure_threshold == 0 {
            return Err(ConfigError::Invalid("rotation.failure_threshold must be at least 1".into()));
        }
        self.activity.validate()?;
        // malformed topics are skipped and reported by the coordinator
        self.spike.validate()
    }

    pub fn registry(&self) -> SourceRegistry {
        SourceRegistry::new()
            .with_endpoints(SourceKind::MirrorFeed, self.mirror_urls.iter().map(String::as_str))
            .with_endpoints(SourceKind::NewsSearch, self.news_urls.iter().map(String::as_str))
            .with_endpoints(SourceKind::DirectRss, self.rss_urls.iter().map(String::as_str))
    }

    pub fn market_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_markets)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn aggregator_settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            feed_ttl: Duration::from_secs(self.cache_ttl_feeds),
            max_concurrency: self.max_concurrency,
            max_keywords_per_bucket: self.max_keywords_per_bucket,
            sample_mentions: self.sample_mentions,
            ledger_retention: Duration::from_secs(self.activity.window_secs),
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            refresh_secs: self.refresh_seconds,
            cycle_deadline: Duration::from_secs(self.cycle_deadline_secs),
            wallet: self.wallet_address.clone(),
            custom_keyword_buckets: self.custom_keyword_buckets.clone(),
            topics: self.topics.clone(),
        }
    }
}

fn parse_config(s: &str, hint_ext: &str) -> Result<PulseConfig> {
    match hint_ext {
        "toml" => Ok(toml::from_str(s)?),
        "json" => Ok(serde_json::from_str(s)?),
        // no usable extension: try JSON, then TOML
        _ => serde_json::from_str(s).or_else(|_| toml::from_str(s).map_err(Into::into)),
    }
}

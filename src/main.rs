//! polyterm-pulse: binary entrypoint
//! Loads configuration, wires the pipeline services and prints one line per
//! bucket every time a snapshot is published.
//!
//! Flags: `--once` runs a single cycle and exits, `--check` validates the
//! configuration and exits.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use polyterm_pulse::activity::{ActivityTracker, Classification};
use polyterm_pulse::aggregator::Aggregator;
use polyterm_pulse::cache::CacheStore;
use polyterm_pulse::config::PulseConfig;
use polyterm_pulse::coordinator::{Coordinator, PipelineSnapshot};
use polyterm_pulse::ingest::fetcher::HttpFetcher;
use polyterm_pulse::ingest::positions::{HttpPositionSource, PositionSource};
use polyterm_pulse::sources::rotation::RotationManager;
use polyterm_pulse::{system_clock, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    telemetry::init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let once = args.iter().any(|a| a == "--once");
    let check = args.iter().any(|a| a == "--check");

    let cfg = PulseConfig::load_default().context("loading configuration")?;
    cfg.validate().context("invalid configuration")?;
    if check {
        println!(
            "config ok: {} mirror, {} news, {} rss endpoints; refresh {}s",
            cfg.mirror_urls.len(),
            cfg.news_urls.len(),
            cfg.rss_urls.len(),
            cfg.refresh_seconds
        );
        return Ok(());
    }

    match cfg.metrics_listen {
        Some(listen) => telemetry::install_prometheus(listen)?,
        None => telemetry::ensure_metrics_described(),
    }

    let clock = system_clock();
    let cache = Arc::new(
        CacheStore::open(&cfg.cache_dir, cfg.cache_limit)
            .with_context(|| format!("opening cache at {}", cfg.cache_dir.display()))?,
    );
    let rotation = Arc::new(RotationManager::new(Arc::new(cfg.registry()), cfg.rotation));
    let fetcher = Arc::new(HttpFetcher::new(cfg.request_timeout()).context("building http client")?);
    let tracker = Arc::new(ActivityTracker::new(cfg.activity, cfg.spike));
    let aggregator = Arc::new(Aggregator::new(
        Arc::clone(&cache),
        rotation,
        fetcher,
        tracker,
        cfg.aggregator_settings(),
        Arc::clone(&clock),
    ));

    let positions: Option<Arc<dyn PositionSource>> = match cfg.wallet_address {
        Some(_) => Some(Arc::new(
            HttpPositionSource::new(
                cfg.positions_url.clone(),
                cfg.request_timeout(),
                Arc::clone(&cache),
                cfg.market_ttl(),
                Arc::clone(&clock),
            )
            .context("building positions client")?,
        )),
        None => {
            tracing::info!("no wallet configured; using configured topics");
            None
        }
    };

    let coordinator = Arc::new(Coordinator::new(
        aggregator,
        cache,
        positions,
        cfg.coordinator_settings(),
        clock,
    ));

    if once {
        let snap = coordinator.run_cycle().await;
        print_summary(&snap);
        coordinator.shutdown().context("flushing cache")?;
        return Ok(());
    }

    let mut rx = coordinator.subscribe();
    let runner = tokio::spawn(Arc::clone(&coordinator).run());
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snap = rx.borrow_and_update().clone();
                print_summary(&snap);
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                break;
            }
        }
    }

    if let Err(e) = coordinator.shutdown() {
        tracing::warn!(error = %e, "cache flush failed during shutdown");
    }
    if let Err(e) = runner.await {
        tracing::warn!(error = %e, "coordinator task ended abnormally");
    }
    Ok(())
}

fn print_summary(snap: &PipelineSnapshot) {
    let at = snap
        .refreshed_at
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "-".into());
    for b in snap.buckets.values() {
        let mut line = format!("{at} [{}] {}", b.key, b.title);
        for k in &b.keywords {
            let mark = match k.signal.classification {
                Classification::Spike => " SPIKE",
                Classification::Rising => " rising",
                Classification::Stable => "",
            };
            let _ = write!(
                line,
                " | {} {} ({:+.0}%){mark}",
                k.keyword, k.signal.current_bucket_count, k.signal.pct_delta
            );
        }
        for (kind, status) in &b.kind_status {
            let _ = write!(line, " {kind}={status:?}");
        }
        println!("{line}");
    }
    for e in &snap.errors {
        println!("{at} config: {e}");
    }
}

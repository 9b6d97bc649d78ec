// src/telemetry.rs
//! Tracing subscriber setup and metric registration.

use std::net::SocketAddr;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const ENV_LOG_FORMAT: &str = "PULSE_LOG_FORMAT";
const DEFAULT_FILTER: &str = "polyterm_pulse=info,warn";

/// One-time metrics registration (so series show up on the exporter).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "pulse_fetch_total",
            "Fetch attempts by source kind and outcome."
        );
        describe_counter!("pulse_cache_hits_total", "Cache lookups that were fresh.");
        describe_counter!(
            "pulse_cache_misses_total",
            "Cache lookups that were missing or expired."
        );
        describe_counter!(
            "pulse_cache_write_errors_total",
            "Cache entries that could not be persisted."
        );
        describe_counter!(
            "pulse_cache_evictions_total",
            "Entries evicted to respect the cache limit."
        );
        describe_counter!(
            "pulse_endpoint_cooldowns_total",
            "Endpoints moved into cooldown."
        );
        describe_counter!(
            "pulse_mentions_recorded_total",
            "Deduplicated mentions recorded into activity windows."
        );
        describe_counter!("pulse_spikes_total", "Keywords classified as Spike.");
        describe_histogram!("pulse_parse_ms", "Payload parse time in milliseconds.");
        describe_histogram!("pulse_cycle_ms", "Refresh cycle duration in milliseconds.");
        describe_gauge!(
            "pulse_cycle_last_run_ts",
            "Unix ts when the last snapshot was published."
        );
    });
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `polyterm_pulse=info,warn`.
/// `PULSE_LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let json = std::env::var(ENV_LOG_FORMAT)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let res = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    if let Err(e) = res {
        eprintln!("tracing already initialised: {e}");
    }
}

/// Install the Prometheus recorder with its own HTTP listener.
/// Must be called from inside a tokio runtime.
pub fn install_prometheus(listen: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .map_err(|e| anyhow::anyhow!("prometheus exporter: {e}"))?;
    ensure_metrics_described();
    tracing::info!(%listen, "prometheus exporter listening");
    Ok(())
}

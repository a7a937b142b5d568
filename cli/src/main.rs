//! tickmux CLI — run the feed pipeline from a config file.
//!
//! # Commands
//! ```text
//! tickmux run   --config tickmux.yaml
//! tickmux check --config tickmux.yaml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use tickmux_core::{system_clock, AppConfig, BackoffConfig, EventBus, Signal};
use tickmux_detect::{ActivityProbe, Detector, DetectorSettings, HttpActivityProbe};
use tickmux_enrich::{Batcher, Enricher, HttpLookup, QuotaGovernor};
use tickmux_shadow::{HttpShadowSource, Normalizer, ShadowLoop};
use tickmux_ws::{Multiplexer, WsConnector};

mod logging;
mod pipeline;

#[derive(Parser)]
#[command(
    name = "tickmux",
    about = "Real-time feed multiplexer with dual-channel activity detection",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until interrupted
    Run {
        /// Path to the YAML or JSON config file
        #[arg(short, long, default_value = "tickmux.yaml")]
        config: PathBuf,
        /// Seconds between status log lines
        #[arg(long, default_value_t = 60)]
        status_every: u64,
    },

    /// Validate a config file and print what would run
    Check {
        #[arg(short, long, default_value = "tickmux.yaml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, status_every } => run(&config, status_every).await,
        Commands::Check { config } => check(&config),
    }
}

fn load(path: &Path) -> Result<AppConfig> {
    AppConfig::from_file(path).with_context(|| format!("loading config {}", path.display()))
}

fn check(path: &Path) -> Result<()> {
    let cfg = load(path)?;
    println!("config OK: {}", path.display());
    for feed in &cfg.feeds {
        println!("  feed {:<8} : {} (rooms {}*)", feed.name, feed.endpoint, feed.topic_prefix);
    }
    println!("  subjects      : {}", cfg.enabled_subjects().len());
    println!("  quota         : {}/min", cfg.quota.ceiling_per_minute);
    println!("  poll probe    : {}", cfg.detector.probe_url.as_deref().unwrap_or("(push only)"));
    println!("  enrichment    : {}", cfg.enrichment.base_url.as_deref().unwrap_or("(disabled)"));
    println!("  shadow loop   : {}", if cfg.shadow.is_configured() { "enabled" } else { "disabled" });
    println!("{}", serde_json::to_string_pretty(&cfg.enabled_subjects())?);
    Ok(())
}

async fn run(path: &Path, status_every: u64) -> Result<()> {
    let cfg = load(path)?;
    logging::init_tracing(&cfg.log);

    let clock = system_clock();
    let bus = EventBus::new();
    let root = CancellationToken::new();

    bus.on_connection_state(|c| {
        tracing::info!(endpoint = %c.endpoint, state = %c.state, reconnects = c.reconnects, "connection state");
    });
    bus.on_tick(|t| {
        tracing::debug!(subject = %t.subject_id, symbol = ?t.symbol, market_cap = ?t.market_cap, "tick");
    });

    let mux = Arc::new(
        build_multiplexer(&cfg)
            .with_event_bus(bus.clone())
            .with_clock(clock.clone())
            .with_parent_token(&root),
    );

    let governor = Arc::new(QuotaGovernor::new(cfg.quota.clone(), clock.clone()));
    let enricher = match &cfg.enrichment.base_url {
        Some(_) => {
            let service = Arc::new(HttpLookup::new(&cfg.enrichment)?);
            Some(Arc::new(Enricher::new(governor.clone(), service)))
        }
        None => None,
    };

    let worker = Arc::new(pipeline::SignalWorker::new(enricher, cfg.filter.clone()));
    let batcher = Arc::new(Batcher::<Signal>::with_token(worker, cfg.batch.clone(), root.child_token()));
    {
        let batcher = batcher.clone();
        bus.on_signal(move |s| {
            if let Err(e) = batcher.submit(s.clone()) {
                tracing::debug!(target_id = %s.target_id, error = %e, "signal not queued");
            }
        });
    }

    let probe = HttpActivityProbe::from_config(&cfg.detector)?.map(|p| Arc::new(p) as Arc<dyn ActivityProbe>);
    let detector = Detector::new(
        DetectorSettings {
            config: cfg.detector.clone(),
            feeds: cfg.feeds.clone(),
            subjects: cfg.enabled_subjects(),
        },
        mux.clone(),
        probe,
        bus.clone(),
        clock.clone(),
    );
    detector.start()?;

    let shadow = if cfg.shadow.is_configured() {
        let source = Arc::new(HttpShadowSource::new(&cfg.shadow)?);
        let shadow = ShadowLoop::new(
            source,
            Normalizer::new(Some(governor.clone())),
            bus.clone(),
            clock.clone(),
            cfg.shadow.cadence,
        )
        .with_parent_token(&root);
        shadow.start()?;
        Some(shadow)
    } else {
        None
    };

    tracing::info!(
        feeds = cfg.feeds.len(),
        connections = mux.connection_count(),
        subjects = cfg.enabled_subjects().len(),
        shadow = shadow.is_some(),
        "tickmux running"
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut status = tokio::time::interval(Duration::from_secs(status_every.max(1)));
    status.tick().await;
    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res.context("waiting for ctrl-c")?;
                break;
            }
            _ = status.tick() => {
                let swept = governor.sweep();
                let quota = governor.status();
                let det = detector.stats();
                let batches = batcher.stats();
                let budget = governor.budget_report_today();
                tracing::info!(
                    calls_last_minute = quota.calls_last_minute,
                    minute_remaining = quota.minute_remaining,
                    cache_len = quota.cache_len,
                    swept,
                    signals = det.signals_recorded,
                    duplicates = det.duplicates,
                    poll_errors = det.poll_errors,
                    processed = batches.processed,
                    "status"
                );
                if cfg.quota.daily_budget_units > 0.0 {
                    tracing::info!(
                        day = budget.day_of_month,
                        consumed = budget.consumed_units,
                        projected = budget.projected_units,
                        remaining = budget.remaining_units,
                        on_track = budget.on_track,
                        "budget"
                    );
                }
                for health in mux.health() {
                    tracing::info!(
                        endpoint = %health.endpoint,
                        state = %health.state,
                        topics = health.active_topics,
                        frames = health.frames_received,
                        "connection health"
                    );
                }
            }
        }
    }

    tracing::info!("shutting down");
    detector.stop();
    if let Some(shadow) = &shadow {
        shadow.stop();
    }
    batcher.shutdown();
    governor.clear();
    mux.shutdown();
    // connection tasks send their leave frames on the way out
    tokio::time::sleep(Duration::from_millis(250)).await;
    root.cancel();
    Ok(())
}

/// One shared connection per feed endpoint, each with its own handshake
/// headers and backoff.
fn build_multiplexer(cfg: &AppConfig) -> Multiplexer {
    let connector = cfg.feeds.iter().fold(WsConnector::new(), |c, feed| {
        c.with_endpoint_headers(feed.endpoint.clone(), feed.headers.clone())
    });
    cfg.feeds.iter().fold(
        Multiplexer::new(Arc::new(connector), BackoffConfig::default()),
        |mux, feed| mux.with_endpoint_backoff(feed.endpoint.clone(), feed.backoff.clone()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_is_valid() {
        let cfg = AppConfig::from_yaml_str(include_str!("../tickmux.example.yaml")).unwrap();
        assert_eq!(cfg.enabled_subjects().len(), 2);
        assert_eq!(cfg.feeds.len(), 2);
        assert_eq!(cfg.enabled_subjects()[0].feed.as_deref(), Some("main"));
        assert!(cfg.enrichment.api_key.as_deref().is_some_and(|k| !k.contains('$')));
        assert!(cfg.shadow.is_configured());
        assert_eq!(cfg.quota.ttl_for("token_info"), Duration::from_secs(30));
    }

    #[test]
    fn cli_parses_run_and_check() {
        let cli = Cli::parse_from(["tickmux", "run", "--config", "x.yaml", "--status-every", "5"]);
        assert!(matches!(cli.command, Commands::Run { status_every: 5, .. }));
        let cli = Cli::parse_from(["tickmux", "check"]);
        assert!(matches!(cli.command, Commands::Check { .. }));
    }
}

//! WISE Gateway - Main Entry Point

use anyhow::Context;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wise_core::EngineStats;
use wise_gateway::{AppState, GatewayConfig};

const STATS_PERIOD: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "wise-gateway")]
#[command(version)]
#[command(about = "Indicator lookup broker", long_about = None)]
struct Cli {
    /// Config file
    #[arg(long, short, env = "WISE_CONFIG", default_value = "/etc/wise/wise.json")]
    config: PathBuf,

    /// More logging, repeat for trace
    #[arg(long, short, action = ArgAction::Count)]
    debug: u8,
}

fn log_stats(stats: &EngineStats) {
    for t in stats.types.iter().filter(|t| t.request > 0) {
        tracing::info!(
            "{:>7} req:{} found:{} cache hit:{} src hit:{} miss:{} refresh:{}",
            t.name,
            t.request,
            t.found,
            t.cache_hit,
            t.cache_src_hit,
            t.cache_src_miss,
            t.cache_src_refresh
        );
    }
    for s in &stats.sources {
        tracing::info!(
            "{} req:{} hit:{} miss:{} refresh:{} direct:{} dropped:{} error:{} avg:{:.2}ms",
            s.source,
            s.request,
            s.cache_hit,
            s.cache_miss,
            s.cache_refresh,
            s.direct_hit,
            s.request_dropped,
            s.error,
            s.average_ms
        );
    }
    tracing::info!("cache entries:{} in flight:{}", stats.cache_entries, stats.in_flight);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("WISE Gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = if cli.config.exists() {
        GatewayConfig::load(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        tracing::warn!("Config {} not found, using defaults", cli.config.display());
        GatewayConfig::default()
    };

    let state = Arc::new(
        AppState::from_config(&config)
            .await
            .context("building sources and cache")?,
    );

    if cli.debug > 0 {
        let engine = state.engine.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_PERIOD);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                log_stats(&engine.stats());
            }
        });
    }

    let addr = config.service.addr()?;
    wise_gateway::serve(state, addr)
        .await
        .with_context(|| format!("serving on {addr}"))?;

    Ok(())
}

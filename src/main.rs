//! News Digest Pusher — Binary Entrypoint
//! Boots the Axum admin surface, wires the coordinator, and optionally
//! starts the in-process push ticker.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use news_digest_pusher::api::{self, AppState};
use news_digest_pusher::config::AppConfig;
use news_digest_pusher::coordinator::{Coordinator, PushService};
use news_digest_pusher::dedup::DedupStore;
use news_digest_pusher::item::ContentProducer;
use news_digest_pusher::metrics::Metrics;
use news_digest_pusher::outcome::OutcomeRecorder;
use news_digest_pusher::produce::SpoolProducer;
use news_digest_pusher::scheduler;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("news_digest_pusher=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let config_path =
        std::env::var("PUSHER_CONFIG").unwrap_or_else(|_| "config/pusher.toml".to_string());
    let cfg = AppConfig::load_from_file(&config_path)
        .with_context(|| format!("load config {config_path}"))?;

    let dedup = DedupStore::open(
        cfg.state_dir.join("dedup.json"),
        ChronoDuration::days(cfg.retention_days),
    )
    .await;
    let recorder = OutcomeRecorder::new(cfg.state_dir.join("delivery_log.jsonl"));

    let primary = cfg.build_sender(&cfg.primary)?;
    let backup = cfg
        .backup
        .as_deref()
        .map(|name| cfg.build_sender(name))
        .transpose()?;

    let mut producers: Vec<Box<dyn ContentProducer>> = Vec::new();
    if let Some(dir) = &cfg.spool_dir {
        producers.push(Box::new(SpoolProducer::new(dir)));
    } else {
        tracing::warn!("no spool_dir configured; cycles will have no candidates");
    }

    let coordinator = Coordinator::new(
        producers,
        dedup,
        primary,
        backup,
        recorder,
        cfg.cycle_options(),
    );
    let service = Arc::new(PushService::new(coordinator));

    if let Some(secs) = cfg.push_interval_secs {
        tracing::info!(interval_secs = secs, "in-process push ticker enabled");
        let _ticker = scheduler::spawn_push_ticker(service.clone(), secs);
    }

    let metrics = Metrics::init(cfg.retention_days);
    let app = api::create_router(AppState { service }).merge(metrics.router());

    let addr: SocketAddr = std::env::var("PUSHER_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
        .parse()
        .context("parse PUSHER_ADDR")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "news-digest-pusher listening");
    axum::serve(listener, app).await?;
    Ok(())
}

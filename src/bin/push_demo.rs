//! Demo that runs one push cycle against in-memory channels (no network),
//! with a flaky primary so the backup fallback is visible in the output.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use news_digest_pusher::channel::{ChannelSender, MockChannel, SendOutcome};
use news_digest_pusher::coordinator::{Coordinator, CycleOptions};
use news_digest_pusher::dedup::DedupStore;
use news_digest_pusher::item::{Category, ContentItem};
use news_digest_pusher::outcome::OutcomeRecorder;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_target(false).init();

    let now = Utc::now();
    let items = vec![
        ContentItem::new(
            Category::News,
            "BBC News",
            "Markets steady as central banks hold",
            "Major indices closed flat after a week of rate speculation.",
            now,
        )
        .with_importance(2)
        .with_link("https://example.org/markets-steady"),
        ContentItem::new(
            Category::Stock,
            "Yahoo Finance",
            "AAPL 182.40 USD",
            "182.40 USD (+1.10, +0.62%)",
            now,
        ),
        ContentItem::new(
            Category::Social,
            "Reddit",
            "Chip shortage thread trending",
            "Community chatter about supply chains picking up again.",
            now,
        ),
    ];

    let primary = Arc::new(MockChannel::scripted(
        "whatsapp-demo",
        vec![SendOutcome::TransientFailure],
    ));
    let backup = Arc::new(MockChannel::succeeding("wecom-demo"));

    let state_dir = std::env::temp_dir().join("push-demo-state");
    let dedup = DedupStore::open(state_dir.join("dedup.json"), ChronoDuration::days(7)).await;
    let recorder = OutcomeRecorder::new(state_dir.join("delivery_log.jsonl"));

    let coordinator = Coordinator::new(
        Vec::new(),
        dedup,
        Box::new(primary.clone()),
        Some(Box::new(backup.clone()) as Box<dyn ChannelSender>),
        recorder,
        CycleOptions::default(),
    );

    let result = coordinator.deliver(items, now).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&result).expect("serialize result")
    );
    for (idx, text) in backup.sent_blocks() {
        println!("--- delivered block {idx} ---\n{text}");
    }
    println!("push-demo done");
}

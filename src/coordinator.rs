// src/coordinator.rs
//! Push cycle orchestration.
//!
//! One cycle runs filtering → formatting → primary send → (backup send) →
//! recording, sequentially and to completion. Any block failure on a channel
//! aborts that channel's remaining blocks; the backup channel restarts the
//! whole block sequence so a recipient never receives a digest stitched from
//! two channels. Fingerprints are recorded only after a full-sequence success,
//! which is what makes the next cycle retry anything undelivered. All faults
//! end up inside the returned [`DeliveryResult`]; `run_cycle` never errors.

use chrono::{DateTime, SecondsFormat, Utc};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;

use crate::channel::ChannelSender;
use crate::dedup::{DedupStats, DedupStore};
use crate::filter::filter_candidates;
use crate::format::{self, FormatOptions};
use crate::item::{ContentItem, ContentProducer};
use crate::outcome::{ChannelUsed, DeliveryResult, OutcomeRecorder};

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("push_cycles_total", "Push cycles started.");
        describe_counter!("push_cycles_failed_total", "Push cycles with no successful channel.");
        describe_counter!("push_items_deduped_total", "Candidates dropped as already pushed.");
        describe_counter!(
            "push_items_collapsed_total",
            "Candidates dropped as near-duplicate headlines."
        );
        describe_counter!("push_blocks_sent_total", "Blocks delivered on the winning channel.");
        describe_counter!("push_channel_fallbacks_total", "Primary failures that engaged the backup.");
        describe_counter!("push_producer_errors_total", "Content producer collect errors.");
        describe_counter!(
            "push_dedup_record_failures_total",
            "Delivered fingerprints that could not be persisted (will re-deliver)."
        );
    });
}

#[derive(Debug, Clone)]
pub struct CycleOptions {
    pub max_block_size: usize,
    pub similarity_threshold: f64,
    pub digest_title: String,
}

impl Default for CycleOptions {
    fn default() -> Self {
        Self {
            max_block_size: format::DEFAULT_MAX_BLOCK_SIZE,
            similarity_threshold: 0.90,
            digest_title: "Market digest".to_string(),
        }
    }
}

pub struct Coordinator {
    producers: Vec<Box<dyn ContentProducer>>,
    dedup: DedupStore,
    primary: Box<dyn ChannelSender>,
    backup: Option<Box<dyn ChannelSender>>,
    recorder: OutcomeRecorder,
    opts: CycleOptions,
}

impl Coordinator {
    pub fn new(
        producers: Vec<Box<dyn ContentProducer>>,
        dedup: DedupStore,
        primary: Box<dyn ChannelSender>,
        backup: Option<Box<dyn ChannelSender>>,
        recorder: OutcomeRecorder,
        opts: CycleOptions,
    ) -> Self {
        Self {
            producers,
            dedup,
            primary,
            backup,
            recorder,
            opts,
        }
    }

    pub fn dedup(&self) -> &DedupStore {
        &self.dedup
    }

    pub fn recorder(&self) -> &OutcomeRecorder {
        &self.recorder
    }

    /// Gather this cycle's candidates. A failing producer is logged and
    /// skipped; its items simply aren't offered this hour.
    pub async fn collect_candidates(&self) -> Vec<ContentItem> {
        ensure_metrics_described();
        let mut out = Vec::new();
        for p in &self.producers {
            match p.collect().await {
                Ok(mut items) => out.append(&mut items),
                Err(e) => {
                    tracing::warn!(producer = p.name(), "producer error: {e:#}");
                    counter!("push_producer_errors_total").increment(1);
                }
            }
        }
        out
    }

    /// Run one full cycle: collect, then deliver.
    pub async fn run_cycle(&self) -> DeliveryResult {
        let started_at = Utc::now();
        let candidates = self.collect_candidates().await;
        self.deliver(candidates, started_at).await
    }

    /// The cycle state machine, with an injected start instant so every
    /// decision in the cycle shares one clock reading.
    pub async fn deliver(
        &self,
        mut candidates: Vec<ContentItem>,
        started_at: DateTime<Utc>,
    ) -> DeliveryResult {
        ensure_metrics_described();
        counter!("push_cycles_total").increment(1);
        let cycle_id = started_at.to_rfc3339_opts(SecondsFormat::Secs, true);

        // Priority order up front: near-duplicate collapse keeps the first
        // copy it sees, which must be the most important one.
        candidates.sort_by(|a, b| {
            b.importance
                .cmp(&a.importance)
                .then(b.observed_at.cmp(&a.observed_at))
        });

        // Purge before filtering, never mid-filter.
        let purged = self.dedup.purge_expired(started_at).await;
        if purged > 0 {
            tracing::debug!(purged, "expired dedup records purged");
        }

        let filtered = filter_candidates(
            &self.dedup,
            candidates,
            self.opts.similarity_threshold,
            started_at,
        );
        counter!("push_items_deduped_total").increment(filtered.duplicates as u64);
        counter!("push_items_collapsed_total").increment(filtered.near_duplicates as u64);
        let survivors = filtered.kept;

        if survivors.is_empty() {
            tracing::info!(%cycle_id, deduped = filtered.duplicates, "nothing new to push");
            let result = DeliveryResult {
                cycle_id,
                channel_used: ChannelUsed::None,
                total_blocks: 0,
                attempts: Vec::new(),
                overall_success: true,
                error_detail: None,
            };
            self.record_result(&result).await;
            return result;
        }

        let header = format::digest_header(&self.opts.digest_title, started_at);
        let blocks = format::format(
            &survivors,
            &FormatOptions {
                max_block_size: self.opts.max_block_size,
                header: Some(header),
            },
        );

        let mut attempts = Vec::new();
        let mut channel_used = ChannelUsed::None;

        if send_all(self.primary.as_ref(), &blocks, &mut attempts).await {
            channel_used = ChannelUsed::Primary;
        } else {
            tracing::warn!(
                %cycle_id,
                channel = self.primary.name(),
                "primary channel failed, engaging backup"
            );
            counter!("push_channel_fallbacks_total").increment(1);
            match &self.backup {
                // The backup retries the FULL block sequence from the start.
                Some(backup) => {
                    if send_all(backup.as_ref(), &blocks, &mut attempts).await {
                        channel_used = ChannelUsed::Backup;
                    }
                }
                None => tracing::warn!(%cycle_id, "no backup channel configured"),
            }
        }

        let overall_success = channel_used != ChannelUsed::None;
        if overall_success {
            counter!("push_blocks_sent_total").increment(blocks.len() as u64);
            for item in &survivors {
                if let Err(e) = self.dedup.record(item, started_at).await {
                    counter!("push_dedup_record_failures_total").increment(1);
                    tracing::warn!(
                        fingerprint = %item.id,
                        "fingerprint not recorded, item will re-deliver: {e:#}"
                    );
                }
            }
        } else {
            counter!("push_cycles_failed_total").increment(1);
        }

        let error_detail = if overall_success {
            None
        } else {
            attempts
                .iter()
                .rev()
                .find(|a| !a.is_success())
                .map(|a| match &a.error_detail {
                    Some(d) => format!("{}: {}", a.channel_name, d),
                    None => format!("{}: block {} failed", a.channel_name, a.block_index),
                })
                .or_else(|| Some("no channel accepted the digest".to_string()))
        };

        let result = DeliveryResult {
            cycle_id,
            channel_used,
            total_blocks: blocks.len(),
            attempts,
            overall_success,
            error_detail,
        };
        self.record_result(&result).await;
        tracing::info!(
            cycle_id = %result.cycle_id,
            success = result.overall_success,
            channel = ?result.channel_used,
            blocks = result.total_blocks,
            "push cycle finished"
        );
        result
    }

    /// Persist the result unconditionally; a log failure must not fail the cycle.
    async fn record_result(&self, result: &DeliveryResult) {
        if let Err(e) = self.recorder.append(result).await {
            tracing::warn!("outcome log append failed: {e:#}");
        }
    }
}

/// Send all blocks in order on one channel. The first non-success aborts the
/// remaining blocks (partial digests are never topped up cross-channel).
async fn send_all(
    channel: &dyn ChannelSender,
    blocks: &[crate::format::MessageBlock],
    attempts: &mut Vec<crate::channel::DeliveryAttempt>,
) -> bool {
    for block in blocks {
        let attempt = channel.send(block).await;
        let ok = attempt.is_success();
        attempts.push(attempt);
        if !ok {
            return false;
        }
    }
    true
}

/// Shared entry point for the admin API and the in-process scheduler: one
/// async mutex serializes cycles (and reconciles) so overlapping triggers
/// can't interleave `purge_expired` with `record`.
pub struct PushService {
    coordinator: Coordinator,
    gate: tokio::sync::Mutex<()>,
}

impl PushService {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn trigger_cycle(&self) -> DeliveryResult {
        let _guard = self.gate.lock().await;
        self.coordinator.run_cycle().await
    }

    pub async fn last_result(&self) -> anyhow::Result<Option<DeliveryResult>> {
        self.coordinator.recorder().last_result().await
    }

    pub async fn reconcile(&self, fingerprint: &str) -> bool {
        let _guard = self.gate.lock().await;
        self.coordinator.dedup().clear(fingerprint).await
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.coordinator.dedup().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MockChannel, SendOutcome};
    use crate::item::Category;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    static SEQ: AtomicU32 = AtomicU32::new(0);

    fn temp_path(tag: &str, suffix: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "ndp-coord-{}-{}-{}.{}",
            tag,
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed),
            suffix
        ))
    }

    fn item(title: &str, minute: u32) -> ContentItem {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 8, minute, 0).unwrap();
        ContentItem::new(Category::News, "BBC", title, "a short body.", ts)
    }

    async fn coordinator(
        tag: &str,
        primary: Arc<MockChannel>,
        backup: Option<Arc<MockChannel>>,
        max_block_size: usize,
    ) -> Coordinator {
        let dedup = DedupStore::open(temp_path(tag, "json"), ChronoDuration::days(7)).await;
        let recorder = OutcomeRecorder::new(temp_path(tag, "jsonl"));
        Coordinator::new(
            Vec::new(),
            dedup,
            Box::new(primary),
            backup.map(|b| Box::new(b) as Box<dyn ChannelSender>),
            recorder,
            CycleOptions {
                max_block_size,
                ..CycleOptions::default()
            },
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn novel_items_deliver_on_primary_and_record_fingerprints() {
        let primary = Arc::new(MockChannel::succeeding("primary"));
        let coord = coordinator("scen-a", primary.clone(), None, 2000).await;

        let items = vec![item("alpha", 1), item("bravo", 2), item("charlie", 3)];
        let result = coord.deliver(items.clone(), now()).await;

        assert!(result.overall_success);
        assert_eq!(result.channel_used, ChannelUsed::Primary);
        assert_eq!(result.total_blocks, 1);
        assert_eq!(result.attempts.len(), 1);
        for it in &items {
            assert!(coord.dedup().is_duplicate(it, now()));
        }
    }

    #[tokio::test]
    async fn already_pushed_items_are_filtered_out() {
        let primary = Arc::new(MockChannel::succeeding("primary"));
        let coord = coordinator("scen-b", primary.clone(), None, 2000).await;

        let items = vec![item("alpha", 1), item("bravo", 2), item("charlie", 3)];
        coord.dedup().record(&items[0], now()).await.unwrap();

        let result = coord.deliver(items, now()).await;
        assert!(result.overall_success);

        let sent = primary.sent_blocks();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].1.contains("alpha"));
        assert!(sent[0].1.contains("bravo"));
        assert!(sent[0].1.contains("charlie"));
    }

    #[tokio::test]
    async fn primary_failure_restarts_full_sequence_on_backup() {
        let primary = Arc::new(MockChannel::scripted(
            "primary",
            vec![SendOutcome::TransientFailure],
        ));
        let backup = Arc::new(MockChannel::succeeding("backup"));
        // Small ceiling forces at least two blocks.
        let coord = coordinator("scen-c", primary.clone(), Some(backup.clone()), 150).await;

        // Distinct headlines so the similarity filter keeps all of them.
        let titles = [
            "oil prices slip on demand worries",
            "tech rally lifts the nasdaq",
            "fed minutes due later today",
            "yen weakens past intervention levels",
            "housing starts fall sharply",
            "copper futures hit a record",
        ];
        let items: Vec<ContentItem> = titles
            .iter()
            .enumerate()
            .map(|(i, t)| item(t, i as u32))
            .collect();
        let result = coord.deliver(items, now()).await;

        assert!(result.overall_success);
        assert_eq!(result.channel_used, ChannelUsed::Backup);
        assert!(result.total_blocks >= 2);

        // Primary aborted after its first failed block.
        assert_eq!(primary.sent_blocks().len(), 1);
        // Backup got the whole sequence from block 0, in order.
        let backup_sent = backup.sent_blocks();
        assert_eq!(backup_sent.len(), result.total_blocks);
        let indices: Vec<usize> = backup_sent.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, (0..result.total_blocks).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn both_channels_failing_records_nothing_and_reoffers_items() {
        let primary = Arc::new(MockChannel::scripted(
            "primary",
            vec![SendOutcome::TransientFailure],
        ));
        let backup = Arc::new(MockChannel::scripted(
            "backup",
            vec![SendOutcome::PermanentFailure],
        ));
        let coord = coordinator("scen-d", primary.clone(), Some(backup.clone()), 2000).await;

        let items = vec![item("alpha", 1), item("bravo", 2)];
        let result = coord.deliver(items.clone(), now()).await;

        assert!(!result.overall_success);
        assert_eq!(result.channel_used, ChannelUsed::None);
        assert!(result.error_detail.is_some());
        for it in &items {
            assert!(!coord.dedup().is_duplicate(it, now()));
        }

        // Next cycle: the same candidates survive filtering again.
        let primary2 = Arc::new(MockChannel::succeeding("primary"));
        let retry = Coordinator::new(
            Vec::new(),
            DedupStore::open(temp_path("scen-d2", "json"), ChronoDuration::days(7)).await,
            Box::new(primary2.clone()),
            None,
            OutcomeRecorder::new(temp_path("scen-d2", "jsonl")),
            CycleOptions::default(),
        );
        let result2 = retry
            .deliver(items, now() + ChronoDuration::hours(1))
            .await;
        assert!(result2.overall_success);
        assert_eq!(result2.channel_used, ChannelUsed::Primary);
    }

    #[tokio::test]
    async fn oversized_item_is_truncated_not_fatal() {
        let primary = Arc::new(MockChannel::succeeding("primary"));
        let coord = coordinator("scen-e", primary.clone(), None, 2000).await;

        let giant = item(&"x".repeat(5000), 0);
        let result = coord.deliver(vec![giant], now()).await;

        assert!(result.overall_success);
        let sent = primary.sent_blocks();
        // Header block plus the truncated item block.
        assert_eq!(sent.len(), result.total_blocks);
        assert!(sent
            .iter()
            .any(|(_, text)| text.contains(crate::format::TRUNCATION_MARKER)));
        for (_, text) in &sent {
            assert!(text.chars().count() <= 2000);
        }
    }

    #[tokio::test]
    async fn all_duplicates_short_circuits_with_success_and_no_attempts() {
        let primary = Arc::new(MockChannel::succeeding("primary"));
        let coord = coordinator("empty", primary.clone(), None, 2000).await;

        let items = vec![item("alpha", 1)];
        coord.dedup().record(&items[0], now()).await.unwrap();

        let result = coord.deliver(items, now()).await;
        assert!(result.overall_success);
        assert_eq!(result.channel_used, ChannelUsed::None);
        assert_eq!(result.total_blocks, 0);
        assert!(result.attempts.is_empty());
        assert!(primary.sent_blocks().is_empty());
    }

    #[tokio::test]
    async fn outcome_log_receives_every_cycle() {
        let primary = Arc::new(MockChannel::scripted(
            "primary",
            vec![SendOutcome::PermanentFailure],
        ));
        let coord = coordinator("log", primary, None, 2000).await;

        let result = coord.deliver(vec![item("alpha", 1)], now()).await;
        assert!(!result.overall_success);

        let last = coord.recorder().last_result().await.unwrap().unwrap();
        assert_eq!(last, result);
    }
}

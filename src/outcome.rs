// src/outcome.rs
//! Cycle outcomes and their append-only log.
//!
//! One JSON line per cycle, keyed by the cycle start timestamp, written after
//! every cycle regardless of success. The log is the only cross-restart
//! record of what was delivered when, and feeds the operator's
//! `last-result` view.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::channel::DeliveryAttempt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelUsed {
    Primary,
    Backup,
    None,
}

/// Aggregate result of one push cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryResult {
    /// Cycle start in RFC 3339 UTC; doubles as the log key.
    pub cycle_id: String,
    pub channel_used: ChannelUsed,
    pub total_blocks: usize,
    pub attempts: Vec<DeliveryAttempt>,
    pub overall_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OutcomeRecorder {
    path: PathBuf,
}

impl OutcomeRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append one result as a JSON line.
    pub async fn append(&self, result: &DeliveryResult) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create state dir {}", parent.display()))?;
        }
        let mut line = serde_json::to_vec(result).context("serialize delivery result")?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open outcome log {}", self.path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("append outcome log {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flush outcome log {}", self.path.display()))?;
        Ok(())
    }

    /// Latest parseable entry, or `None` for a missing/empty log. Unparseable
    /// trailing lines (e.g. a cut-short write from a killed process) are
    /// skipped in favor of the newest intact one.
    pub async fn last_result(&self) -> Result<Option<DeliveryResult>> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("read outcome log {}", self.path.display()))
            }
        };
        Ok(raw
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str::<DeliveryResult>(line).ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{DeliveryAttempt, SendOutcome};
    use chrono::Utc;

    fn temp_log_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ndp-outcome-{}-{}.jsonl", tag, std::process::id()))
    }

    fn result(cycle_id: &str, success: bool) -> DeliveryResult {
        DeliveryResult {
            cycle_id: cycle_id.to_string(),
            channel_used: if success {
                ChannelUsed::Primary
            } else {
                ChannelUsed::None
            },
            total_blocks: 1,
            attempts: vec![DeliveryAttempt {
                channel_name: "mock".into(),
                block_index: 0,
                started_at: Utc::now(),
                duration_ms: 12,
                outcome: if success {
                    SendOutcome::Success
                } else {
                    SendOutcome::TransientFailure
                },
                error_detail: None,
            }],
            overall_success: success,
            error_detail: None,
        }
    }

    #[tokio::test]
    async fn append_then_read_back_latest() {
        let path = temp_log_path("roundtrip");
        let _ = std::fs::remove_file(&path);
        let rec = OutcomeRecorder::new(&path);

        rec.append(&result("2026-03-01T09:00:00Z", true)).await.unwrap();
        rec.append(&result("2026-03-01T10:00:00Z", false)).await.unwrap();

        let last = rec.last_result().await.unwrap().unwrap();
        assert_eq!(last.cycle_id, "2026-03-01T10:00:00Z");
        assert!(!last.overall_success);
        assert_eq!(last.channel_used, ChannelUsed::None);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_log_yields_none() {
        let path = temp_log_path("missing");
        let _ = std::fs::remove_file(&path);
        let rec = OutcomeRecorder::new(&path);
        assert!(rec.last_result().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn torn_trailing_line_is_skipped() {
        let path = temp_log_path("torn");
        let _ = std::fs::remove_file(&path);
        let rec = OutcomeRecorder::new(&path);
        rec.append(&result("2026-03-01T09:00:00Z", true)).await.unwrap();

        use std::io::Write as _;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "{{\"cycle_id\":\"2026-03-01T10:0").unwrap();

        let last = rec.last_result().await.unwrap().unwrap();
        assert_eq!(last.cycle_id, "2026-03-01T09:00:00Z");

        let _ = std::fs::remove_file(&path);
    }
}

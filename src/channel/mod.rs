// src/channel/mod.rs
//! Delivery channels. The coordinator only ever sees the [`ChannelSender`]
//! trait and the closed [`SendOutcome`] taxonomy; all channel-specific error
//! handling (HTTP statuses, token refresh, SMTP faults) is classified here
//! and returned as data, never raised.

pub mod email;
pub mod wecom;
pub mod whatsapp;

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::format::MessageBlock;

/// Closed outcome classification for one block send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcome {
    /// Remote accepted the block.
    Success,
    /// Timeout, rate limit, expired token and the like; worth a fallback.
    TransientFailure,
    /// Malformed payload, bad recipient, missing credentials; no retry this cycle.
    PermanentFailure,
}

/// One attempted block delivery, append-only evidence for the outcome log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub channel_name: String,
    pub block_index: usize,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: SendOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl DeliveryAttempt {
    /// Build an attempt from a send that started at `started` / `t0`.
    pub fn finish(
        channel_name: &str,
        block_index: usize,
        started_at: DateTime<Utc>,
        t0: Instant,
        outcome: SendOutcome,
        error_detail: Option<String>,
    ) -> Self {
        Self {
            channel_name: channel_name.to_string(),
            block_index,
            started_at,
            duration_ms: t0.elapsed().as_millis() as u64,
            outcome,
            error_detail,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == SendOutcome::Success
    }
}

/// A messaging channel able to deliver formatted blocks to its configured
/// recipient. Implementations must be reusable across all blocks of a cycle
/// without re-authenticating while their credential is still valid, and must
/// classify every failure instead of returning an error.
#[async_trait::async_trait]
pub trait ChannelSender: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, block: &MessageBlock) -> DeliveryAttempt;
}

// Lets callers keep a handle on a channel (e.g. a shared mock) while the
// coordinator owns it as a trait object.
#[async_trait::async_trait]
impl<T: ChannelSender + ?Sized> ChannelSender for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn send(&self, block: &MessageBlock) -> DeliveryAttempt {
        (**self).send(block).await
    }
}

/// Map an HTTP response status to the outcome taxonomy: 2xx accepted,
/// 408/429/5xx retryable, everything else a caller error.
pub(crate) fn classify_status(status: reqwest::StatusCode) -> SendOutcome {
    if status.is_success() {
        SendOutcome::Success
    } else if status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        SendOutcome::TransientFailure
    } else {
        SendOutcome::PermanentFailure
    }
}

/// Transport-level reqwest failures: timeouts and connection errors are
/// transient, a request we could not even build is permanent.
pub(crate) fn classify_transport(err: &reqwest::Error) -> SendOutcome {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        SendOutcome::TransientFailure
    } else if err.is_builder() {
        SendOutcome::PermanentFailure
    } else {
        SendOutcome::TransientFailure
    }
}

// --- Test helper ---

/// Scripted in-memory channel for tests and the demo binary. Outcomes are
/// consumed per send in order; an exhausted script keeps returning the last
/// entry (or success when none was given).
pub struct MockChannel {
    name: String,
    script: std::sync::Mutex<Vec<SendOutcome>>,
    pub sent: std::sync::Mutex<Vec<(usize, String)>>,
}

impl MockChannel {
    pub fn succeeding(name: impl Into<String>) -> Self {
        Self::scripted(name, vec![])
    }

    pub fn scripted(name: impl Into<String>, outcomes: Vec<SendOutcome>) -> Self {
        Self {
            name: name.into(),
            script: std::sync::Mutex::new(outcomes),
            sent: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn sent_blocks(&self) -> Vec<(usize, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ChannelSender for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, block: &MessageBlock) -> DeliveryAttempt {
        let started_at = Utc::now();
        let t0 = Instant::now();
        let outcome = {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script.first().copied().unwrap_or(SendOutcome::Success)
            }
        };
        self.sent
            .lock()
            .unwrap()
            .push((block.index, block.text.clone()));
        let detail = match outcome {
            SendOutcome::Success => None,
            _ => Some("scripted failure".to_string()),
        };
        DeliveryAttempt::finish(&self.name, block.index, started_at, t0, outcome, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_matches_taxonomy() {
        use reqwest::StatusCode;
        assert_eq!(classify_status(StatusCode::OK), SendOutcome::Success);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            SendOutcome::TransientFailure
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            SendOutcome::TransientFailure
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            SendOutcome::PermanentFailure
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            SendOutcome::PermanentFailure
        );
    }

    #[tokio::test]
    async fn mock_channel_replays_script_then_repeats_last() {
        let ch = MockChannel::scripted(
            "mock",
            vec![SendOutcome::TransientFailure, SendOutcome::Success],
        );
        let block = MessageBlock {
            index: 0,
            text: "hello".into(),
            truncated: false,
        };
        assert_eq!(ch.send(&block).await.outcome, SendOutcome::TransientFailure);
        assert_eq!(ch.send(&block).await.outcome, SendOutcome::Success);
        assert_eq!(ch.send(&block).await.outcome, SendOutcome::Success);
        assert_eq!(ch.sent_blocks().len(), 3);
    }
}

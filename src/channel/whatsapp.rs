// src/channel/whatsapp.rs
//! WhatsApp sender, speaking to a self-hosted gateway (OpenClaw/WAHA style)
//! over its REST surface. The gateway owns the WhatsApp session; this side
//! only posts text payloads and classifies the HTTP response.

use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{classify_status, classify_transport, ChannelSender, DeliveryAttempt, SendOutcome};
use crate::format::MessageBlock;

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppConfig {
    /// Full URL of the gateway's send endpoint.
    pub gateway_url: String,
    pub api_key: String,
    /// Recipient phone number in E.164 form.
    pub to: String,
}

pub struct WhatsAppSender {
    cfg: Option<WhatsAppConfig>,
    client: Client,
    timeout: Duration,
}

impl WhatsAppSender {
    pub fn new(cfg: Option<WhatsAppConfig>) -> Self {
        Self {
            cfg,
            client: Client::new(),
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }
}

#[derive(Serialize)]
struct GatewayPayload<'a> {
    to: &'a str,
    body: &'a str,
}

#[async_trait::async_trait]
impl ChannelSender for WhatsAppSender {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn send(&self, block: &MessageBlock) -> DeliveryAttempt {
        let started_at = Utc::now();
        let t0 = Instant::now();
        let Some(cfg) = &self.cfg else {
            return DeliveryAttempt::finish(
                self.name(),
                block.index,
                started_at,
                t0,
                SendOutcome::PermanentFailure,
                Some("whatsapp channel is not configured".to_string()),
            );
        };

        let payload = GatewayPayload {
            to: &cfg.to,
            body: &block.text,
        };
        let result = self
            .client
            .post(&cfg.gateway_url)
            .bearer_auth(&cfg.api_key)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await;

        let (outcome, detail) = match result {
            Ok(resp) => {
                let outcome = classify_status(resp.status());
                let detail = if outcome == SendOutcome::Success {
                    None
                } else {
                    Some(format!("whatsapp gateway returned {}", resp.status()))
                };
                (outcome, detail)
            }
            Err(e) => (
                classify_transport(&e),
                Some(format!("whatsapp gateway request failed: {e}")),
            ),
        };
        DeliveryAttempt::finish(self.name(), block.index, started_at, t0, outcome, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_sender_reports_permanent_failure() {
        let sender = WhatsAppSender::new(None);
        let block = MessageBlock {
            index: 0,
            text: "digest".into(),
            truncated: false,
        };
        let attempt = sender.send(&block).await;
        assert_eq!(attempt.outcome, SendOutcome::PermanentFailure);
        assert_eq!(attempt.channel_name, "whatsapp");
    }
}

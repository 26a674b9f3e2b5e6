// src/channel/email.rs
//! SMTP digest fallback. Useful as the channel of last resort when both chat
//! surfaces are down; each block becomes one plain-text mail.

use std::time::Instant;

use chrono::Utc;
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::{authentication::Credentials, AsyncSmtpTransport};
use lettre::{AsyncTransport, Tokio1Executor};
use serde::Deserialize;

use super::{ChannelSender, DeliveryAttempt, SendOutcome};
use crate::format::MessageBlock;

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_user: String,
    pub smtp_pass: String,
    pub from: String,
    pub to: String,
    #[serde(default = "default_subject")]
    pub subject: String,
}

fn default_subject() -> String {
    "News digest".to_string()
}

struct Inner {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
    subject: String,
}

/// Invalid or missing configuration leaves `inner` empty; sends then report
/// `PermanentFailure` instead of failing service startup.
pub struct EmailSender {
    inner: Option<Inner>,
    config_error: Option<String>,
}

impl EmailSender {
    pub fn new(cfg: Option<EmailConfig>) -> Self {
        let Some(cfg) = cfg else {
            return Self {
                inner: None,
                config_error: Some("email channel is not configured".to_string()),
            };
        };
        match Self::build(cfg) {
            Ok(inner) => Self {
                inner: Some(inner),
                config_error: None,
            },
            Err(e) => {
                tracing::warn!("email channel disabled: {e:#}");
                Self {
                    inner: None,
                    config_error: Some(format!("email configuration invalid: {e}")),
                }
            }
        }
    }

    fn build(cfg: EmailConfig) -> anyhow::Result<Inner> {
        let creds = Credentials::new(cfg.smtp_user, cfg.smtp_pass);
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.smtp_host)?
            .credentials(creds)
            .build();
        let from: Mailbox = cfg.from.parse()?;
        let to: Mailbox = cfg.to.parse()?;
        Ok(Inner {
            mailer,
            from,
            to,
            subject: cfg.subject,
        })
    }
}

#[async_trait::async_trait]
impl ChannelSender for EmailSender {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, block: &MessageBlock) -> DeliveryAttempt {
        let started_at = Utc::now();
        let t0 = Instant::now();
        let Some(inner) = &self.inner else {
            return DeliveryAttempt::finish(
                self.name(),
                block.index,
                started_at,
                t0,
                SendOutcome::PermanentFailure,
                self.config_error.clone(),
            );
        };

        let msg = Message::builder()
            .from(inner.from.clone())
            .to(inner.to.clone())
            .subject(&inner.subject)
            .header(header::ContentType::TEXT_PLAIN)
            .body(block.text.clone());
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                return DeliveryAttempt::finish(
                    self.name(),
                    block.index,
                    started_at,
                    t0,
                    SendOutcome::PermanentFailure,
                    Some(format!("build email: {e}")),
                )
            }
        };

        let (outcome, detail) = match inner.mailer.send(msg).await {
            Ok(_) => (SendOutcome::Success, None),
            Err(e) if e.is_permanent() => {
                (SendOutcome::PermanentFailure, Some(format!("smtp rejected: {e}")))
            }
            Err(e) => (SendOutcome::TransientFailure, Some(format!("smtp send failed: {e}"))),
        };
        DeliveryAttempt::finish(self.name(), block.index, started_at, t0, outcome, detail)
    }
}

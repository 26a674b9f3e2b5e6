// src/channel/wecom.rs
//! Enterprise chat (WeCom work app) sender.
//!
//! Auth lifecycle: an access token is fetched on first use and cached for its
//! advertised lifetime minus a refresh margin, so all blocks of a cycle reuse
//! one token. A server-side `token expired` errcode invalidates the cache and
//! the block is retried once with a fresh token before being classified.

use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{classify_transport, ChannelSender, DeliveryAttempt, SendOutcome};
use crate::format::MessageBlock;

const DEFAULT_BASE_URL: &str = "https://qyapi.weixin.qq.com/cgi-bin";
/// Tokens are valid 7200 s; refresh this many seconds early.
const TOKEN_REFRESH_MARGIN_SECS: u64 = 300;

const ERR_OK: i64 = 0;
const ERR_TOKEN_INVALID: i64 = 40014;
const ERR_TOKEN_EXPIRED: i64 = 42001;
const ERR_TOKEN_MISSING: i64 = 41001;
const ERR_RATE_LIMITED: i64 = 45009;

#[derive(Debug, Clone, Deserialize)]
pub struct WeComConfig {
    pub corp_id: String,
    pub agent_id: String,
    pub secret: String,
    #[serde(default = "default_to_user")]
    pub to_user: String,
    /// API base override, used by tests against a local stub.
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_to_user() -> String {
    "@all".to_string()
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct WeComSender {
    cfg: Option<WeComConfig>,
    client: Client,
    timeout: Duration,
    token: tokio::sync::Mutex<Option<CachedToken>>,
}

impl WeComSender {
    pub fn new(cfg: Option<WeComConfig>) -> Self {
        Self {
            cfg,
            client: Client::new(),
            timeout: Duration::from_secs(10),
            token: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    fn base_url(cfg: &WeComConfig) -> &str {
        cfg.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    /// Return a live cached token or fetch a fresh one.
    async fn access_token(&self, cfg: &WeComConfig) -> Result<String, (SendOutcome, String)> {
        let mut guard = self.token.lock().await;
        if let Some(tok) = guard.as_ref() {
            if Instant::now() < tok.expires_at {
                return Ok(tok.value.clone());
            }
        }

        let url = format!("{}/gettoken", Self::base_url(cfg));
        let resp = self
            .client
            .get(&url)
            .query(&[("corpid", cfg.corp_id.as_str()), ("corpsecret", cfg.secret.as_str())])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| (classify_transport(&e), format!("wecom token request failed: {e}")))?;
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| (SendOutcome::TransientFailure, format!("wecom token response unreadable: {e}")))?;

        if body.errcode != ERR_OK {
            // Bad corp id / secret; retrying within the cycle cannot help.
            return Err((
                SendOutcome::PermanentFailure,
                format!("wecom token rejected (errcode {}): {}", body.errcode, body.errmsg),
            ));
        }
        let value = body.access_token.ok_or_else(|| {
            (
                SendOutcome::PermanentFailure,
                "wecom token response missing access_token".to_string(),
            )
        })?;
        let ttl = body
            .expires_in
            .unwrap_or(7200)
            .saturating_sub(TOKEN_REFRESH_MARGIN_SECS);
        *guard = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(ttl),
        });
        tracing::debug!("wecom access token refreshed");
        Ok(value)
    }

    async fn post_message(
        &self,
        cfg: &WeComConfig,
        token: &str,
        agent_id: i64,
        block: &MessageBlock,
    ) -> Result<SendResponse, reqwest::Error> {
        let url = format!(
            "{}/message/send?access_token={}",
            Self::base_url(cfg),
            token
        );
        let payload = TextPayload {
            touser: &cfg.to_user,
            msgtype: "text",
            agentid: agent_id,
            text: TextContent {
                content: &block.text,
            },
            safe: 0,
        };
        self.client
            .post(&url)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await?
            .json::<SendResponse>()
            .await
    }

    async fn send_inner(
        &self,
        cfg: &WeComConfig,
        block: &MessageBlock,
    ) -> (SendOutcome, Option<String>) {
        let agent_id: i64 = match cfg.agent_id.parse() {
            Ok(v) => v,
            Err(_) => {
                return (
                    SendOutcome::PermanentFailure,
                    Some(format!("wecom agent_id is not numeric: {:?}", cfg.agent_id)),
                )
            }
        };
        let token = match self.access_token(cfg).await {
            Ok(t) => t,
            Err((outcome, detail)) => return (outcome, Some(detail)),
        };

        match self.post_message(cfg, &token, agent_id, block).await {
            Ok(resp) if resp.errcode == ERR_OK => (SendOutcome::Success, None),
            Ok(resp) if is_token_errcode(resp.errcode) => {
                // Server no longer honors the cached token; refresh once.
                self.token.lock().await.take();
                let token = match self.access_token(cfg).await {
                    Ok(t) => t,
                    Err((outcome, detail)) => return (outcome, Some(detail)),
                };
                match self.post_message(cfg, &token, agent_id, block).await {
                    Ok(r2) if r2.errcode == ERR_OK => (SendOutcome::Success, None),
                    Ok(r2) => (
                        classify_errcode(r2.errcode),
                        Some(format!(
                            "wecom errcode {} after token refresh: {}",
                            r2.errcode, r2.errmsg
                        )),
                    ),
                    Err(e) => (classify_transport(&e), Some(format!("wecom send failed: {e}"))),
                }
            }
            Ok(resp) => (
                classify_errcode(resp.errcode),
                Some(format!("wecom errcode {}: {}", resp.errcode, resp.errmsg)),
            ),
            Err(e) => (classify_transport(&e), Some(format!("wecom send failed: {e}"))),
        }
    }
}

fn is_token_errcode(code: i64) -> bool {
    matches!(code, ERR_TOKEN_INVALID | ERR_TOKEN_EXPIRED | ERR_TOKEN_MISSING)
}

/// Non-token errcodes: rate limiting is retryable, the rest are caller errors.
fn classify_errcode(code: i64) -> SendOutcome {
    if code == ERR_RATE_LIMITED || is_token_errcode(code) {
        SendOutcome::TransientFailure
    } else {
        SendOutcome::PermanentFailure
    }
}

#[async_trait::async_trait]
impl ChannelSender for WeComSender {
    fn name(&self) -> &str {
        "wecom"
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
                Some("wecom channel is not configured".to_string()),
            );
        };
        let (outcome, detail) = self.send_inner(cfg, block).await;
        DeliveryAttempt::finish(self.name(), block.index, started_at, t0, outcome, detail)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Serialize)]
struct TextPayload<'a> {
    touser: &'a str,
    msgtype: &'static str,
    agentid: i64,
    text: TextContent<'a>,
    safe: u8,
}

#[derive(Serialize)]
struct TextContent<'a> {
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

// src/config.rs
use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::channel::email::{EmailConfig, EmailSender};
use crate::channel::wecom::{WeComConfig, WeComSender};
use crate::channel::whatsapp::{WhatsAppConfig, WhatsAppSender};
use crate::channel::ChannelSender;
use crate::coordinator::CycleOptions;

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}
fn default_max_block_size() -> usize {
    2000
}
fn default_retention_days() -> i64 {
    7
}
fn default_similarity_threshold() -> f64 {
    0.90
}
fn default_digest_title() -> String {
    "Market digest".to_string()
}

/// Service configuration, loaded from TOML. Secret-bearing fields may hold
/// the literal `"ENV"`, which resolves to the matching environment variable
/// at load time so config files stay committable.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_max_block_size")]
    pub max_block_size: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_digest_title")]
    pub digest_title: String,
    /// Channel tried first each cycle: "wecom" | "whatsapp" | "email".
    pub primary: String,
    /// Fallback channel; omit to disable fallback.
    #[serde(default)]
    pub backup: Option<String>,
    /// Self-trigger period; omit when an external scheduler drives cycles.
    #[serde(default)]
    pub push_interval_secs: Option<u64>,
    /// Directory external collectors drop candidate JSON into.
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
    #[serde(default)]
    pub wecom: Option<WeComConfig>,
    #[serde(default)]
    pub whatsapp: Option<WhatsAppConfig>,
    #[serde(default)]
    pub email: Option<EmailConfig>,
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(&path)
            .with_context(|| format!("read config {}", path.as_ref().display()))?;
        let mut cfg: AppConfig = toml::from_str(&data).context("parse pusher config")?;
        cfg.resolve_secrets()?;
        cfg.sanitize();
        Ok(cfg)
    }

    fn resolve_secrets(&mut self) -> Result<()> {
        if let Some(w) = &mut self.wecom {
            resolve_env(&mut w.corp_id, "WECOM_CORP_ID")?;
            resolve_env(&mut w.agent_id, "WECOM_AGENT_ID")?;
            resolve_env(&mut w.secret, "WECOM_SECRET")?;
        }
        if let Some(w) = &mut self.whatsapp {
            resolve_env(&mut w.gateway_url, "WHATSAPP_GATEWAY_URL")?;
            resolve_env(&mut w.api_key, "WHATSAPP_API_KEY")?;
            resolve_env(&mut w.to, "WHATSAPP_NUMBER")?;
        }
        if let Some(e) = &mut self.email {
            resolve_env(&mut e.smtp_host, "SMTP_HOST")?;
            resolve_env(&mut e.smtp_user, "SMTP_USER")?;
            resolve_env(&mut e.smtp_pass, "SMTP_PASS")?;
            resolve_env(&mut e.from, "NOTIFY_EMAIL_FROM")?;
            resolve_env(&mut e.to, "NOTIFY_EMAIL_TO")?;
        }
        Ok(())
    }

    fn sanitize(&mut self) {
        if !(64..=65_536).contains(&self.max_block_size) {
            self.max_block_size = default_max_block_size();
        }
        if self.retention_days < 1 {
            self.retention_days = default_retention_days();
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            self.similarity_threshold = default_similarity_threshold();
        }
        if self.digest_title.trim().is_empty() {
            self.digest_title = default_digest_title();
        }
    }

    /// Build a sender by configured name. Unknown names are a wiring error;
    /// a known but unconfigured channel still builds and classifies every
    /// send as a permanent failure.
    pub fn build_sender(&self, name: &str) -> Result<Box<dyn ChannelSender>> {
        match name {
            "wecom" => Ok(Box::new(WeComSender::new(self.wecom.clone()))),
            "whatsapp" => Ok(Box::new(WhatsAppSender::new(self.whatsapp.clone()))),
            "email" => Ok(Box::new(EmailSender::new(self.email.clone()))),
            other => anyhow::bail!("unknown channel '{other}' (expected wecom|whatsapp|email)"),
        }
    }

    pub fn cycle_options(&self) -> CycleOptions {
        CycleOptions {
            max_block_size: self.max_block_size,
            similarity_threshold: self.similarity_threshold,
            digest_title: self.digest_title.clone(),
        }
    }
}

fn resolve_env(field: &mut String, var: &str) -> Result<()> {
    if field.trim().eq_ignore_ascii_case("env") {
        *field = env::var(var).map_err(|_| anyhow::anyhow!("Missing {var} env var"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> AppConfig {
        let mut cfg: AppConfig = toml::from_str(toml_str).unwrap();
        cfg.resolve_secrets().unwrap();
        cfg.sanitize();
        cfg
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse(r#"primary = "wecom""#);
        assert_eq!(cfg.max_block_size, 2000);
        assert_eq!(cfg.retention_days, 7);
        assert_eq!(cfg.digest_title, "Market digest");
        assert!(cfg.backup.is_none());
        assert!(cfg.wecom.is_none());
    }

    #[test]
    fn out_of_range_values_reset_to_defaults() {
        let cfg = parse(
            r#"
            primary = "whatsapp"
            max_block_size = 3
            retention_days = 0
            similarity_threshold = 4.2
            digest_title = "   "
            "#,
        );
        assert_eq!(cfg.max_block_size, 2000);
        assert_eq!(cfg.retention_days, 7);
        assert!((cfg.similarity_threshold - 0.90).abs() < 1e-9);
        assert_eq!(cfg.digest_title, "Market digest");
    }

    #[test]
    #[serial_test::serial]
    fn env_placeholder_resolves_from_environment() {
        env::set_var("WECOM_CORP_ID", "corp-123");
        env::set_var("WECOM_AGENT_ID", "1000002");
        env::set_var("WECOM_SECRET", "s3cret");
        let cfg = parse(
            r#"
            primary = "wecom"
            [wecom]
            corp_id = "ENV"
            agent_id = "ENV"
            secret = "ENV"
            "#,
        );
        let w = cfg.wecom.unwrap();
        assert_eq!(w.corp_id, "corp-123");
        assert_eq!(w.agent_id, "1000002");
        assert_eq!(w.secret, "s3cret");
        assert_eq!(w.to_user, "@all");
        env::remove_var("WECOM_CORP_ID");
        env::remove_var("WECOM_AGENT_ID");
        env::remove_var("WECOM_SECRET");
    }

    #[test]
    #[serial_test::serial]
    fn missing_env_secret_is_an_error() {
        env::remove_var("WHATSAPP_API_KEY");
        let mut cfg: AppConfig = toml::from_str(
            r#"
            primary = "whatsapp"
            [whatsapp]
            gateway_url = "http://localhost:3000/send"
            api_key = "ENV"
            to = "+15551234567"
            "#,
        )
        .unwrap();
        assert!(cfg.resolve_secrets().is_err());
    }

    #[test]
    fn unknown_channel_name_fails_wiring() {
        let cfg = parse(r#"primary = "wecom""#);
        assert!(cfg.build_sender("telegram").is_err());
        assert!(cfg.build_sender("wecom").is_ok());
    }
}

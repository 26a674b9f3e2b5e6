// src/item.rs
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse content kind, used only for rendering decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    News,
    Stock,
    Social,
}

/// One candidate piece of content for the current push cycle.
/// Immutable once created; identity is the `id` fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Stable fingerprint (see [`ContentItem::fingerprint`]).
    pub id: String,
    pub category: Category,
    pub title: String,
    /// Raw body/summary text; may contain HTML entities, normalized at render time.
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    /// Ordinal importance 0..=4, higher is more urgent.
    pub importance: u8,
    pub source: String,
    pub observed_at: DateTime<Utc>,
}

impl ContentItem {
    /// Stable content fingerprint: SHA-256 over `source|title|hour-bucket`,
    /// truncated to 16 bytes of hex. The hour bucket keeps re-published
    /// identical headlines identical across cycles within the same hour.
    pub fn fingerprint(source: &str, title: &str, observed_at: DateTime<Utc>) -> String {
        use sha2::{Digest, Sha256};
        let bucket = observed_at.timestamp().div_euclid(3600);
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.update(b"|");
        hasher.update(title.as_bytes());
        hasher.update(b"|");
        hasher.update(bucket.to_string().as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(32);
        for b in digest.iter().take(16) {
            use std::fmt::Write as _;
            let _ = write!(&mut out, "{:02x}", b);
        }
        out
    }

    /// Convenience constructor that derives `id` from the stability contract.
    pub fn new(
        category: Category,
        source: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        let source = source.into();
        let title = title.into();
        let id = Self::fingerprint(&source, &title, observed_at);
        Self {
            id,
            category,
            title,
            body: body.into(),
            link: None,
            importance: 0,
            source,
            observed_at,
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn with_importance(mut self, importance: u8) -> Self {
        self.importance = importance.min(4);
        self
    }
}

/// Upstream collaborators (RSS scrapers, stock fetchers, ...) hand candidate
/// items to the coordinator through this trait. Acquisition itself lives
/// outside this crate.
#[async_trait::async_trait]
pub trait ContentProducer: Send + Sync {
    async fn collect(&self) -> Result<Vec<ContentItem>>;
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fingerprint_is_stable_within_the_hour() {
        let a = Utc.with_ymd_and_hms(2026, 3, 1, 9, 5, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 3, 1, 9, 55, 0).unwrap();
        assert_eq!(
            ContentItem::fingerprint("Reuters", "Fed holds rates", a),
            ContentItem::fingerprint("Reuters", "Fed holds rates", b),
        );
    }

    #[test]
    fn fingerprint_changes_across_hours_and_sources() {
        let a = Utc.with_ymd_and_hms(2026, 3, 1, 9, 59, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 3, 1, 10, 1, 0).unwrap();
        assert_ne!(
            ContentItem::fingerprint("Reuters", "Fed holds rates", a),
            ContentItem::fingerprint("Reuters", "Fed holds rates", b),
        );
        assert_ne!(
            ContentItem::fingerprint("Reuters", "Fed holds rates", a),
            ContentItem::fingerprint("BBC", "Fed holds rates", a),
        );
    }

    #[test]
    fn fingerprint_is_32_hex_chars() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let fp = ContentItem::fingerprint("BBC", "headline", ts);
        assert_eq!(fp.len(), 32);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

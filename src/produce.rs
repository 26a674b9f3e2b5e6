// src/produce.rs
//! Content producer implementations.
//!
//! Acquisition (RSS scraping, stock APIs) lives in external collaborators;
//! they drop candidate items as JSON files into a spool directory and this
//! side picks them up each cycle. Already-pushed items are filtered by the
//! dedup store, so spool files need no cleanup protocol to avoid re-sends.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::item::{ContentItem, ContentProducer};

/// Spool files may contain a single item or a batch.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SpoolFile {
    Batch(Vec<ContentItem>),
    Single(ContentItem),
}

pub struct SpoolProducer {
    dir: PathBuf,
}

impl SpoolProducer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait::async_trait]
impl ContentProducer for SpoolProducer {
    async fn collect(&self) -> Result<Vec<ContentItem>> {
        let mut out = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("read spool dir {}", self.dir.display()))?;
        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
            .collect();
        // Stable candidate order across cycles.
        paths.sort();

        for path in paths {
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "spool file unreadable: {e}");
                    continue;
                }
            };
            match serde_json::from_str::<SpoolFile>(&content) {
                Ok(SpoolFile::Batch(mut items)) => out.append(&mut items),
                Ok(SpoolFile::Single(item)) => out.push(item),
                Err(e) => {
                    tracing::warn!(path = %path.display(), "spool file unparseable: {e}");
                }
            }
        }
        out.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "spool"
    }
}

// --- Test helper ---

/// Fixed in-memory producer for tests and the demo binary.
pub struct StaticProducer {
    items: Vec<ContentItem>,
}

impl StaticProducer {
    pub fn new(items: Vec<ContentItem>) -> Self {
        Self { items }
    }
}

#[async_trait::async_trait]
impl ContentProducer for StaticProducer {
    async fn collect(&self) -> Result<Vec<ContentItem>> {
        Ok(self.items.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Category;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn spool_reads_batches_and_singles_and_skips_junk() {
        let dir = std::env::temp_dir().join(format!("ndp-spool-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let single = ContentItem::new(Category::News, "BBC", "single headline", "body", ts);
        let batch = vec![
            ContentItem::new(Category::Stock, "Yahoo", "AAPL", "180.00 (+0.62%)", ts),
            ContentItem::new(Category::News, "SCMP", "batch headline", "body", ts),
        ];
        std::fs::write(dir.join("a-single.json"), serde_json::to_vec(&single).unwrap()).unwrap();
        std::fs::write(dir.join("b-batch.json"), serde_json::to_vec(&batch).unwrap()).unwrap();
        std::fs::write(dir.join("c-junk.json"), b"{ nope").unwrap();
        std::fs::write(dir.join("d-ignored.txt"), b"not json").unwrap();

        let producer = SpoolProducer::new(&dir);
        let items = producer.collect().await.unwrap();
        assert_eq!(items.len(), 3);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn missing_spool_dir_is_an_error_not_a_panic() {
        let producer = SpoolProducer::new("/nonexistent/ndp-spool");
        assert!(producer.collect().await.is_err());
    }
}

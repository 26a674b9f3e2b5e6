// src/dedup.rs
//! Persistent fingerprint store for already-pushed content.
//!
//! Policy on infrastructure errors:
//! - `is_duplicate` fails open (unknown store state never suppresses delivery),
//! - `record` fails closed (a fingerprint we could not persist is treated as
//!   not recorded, so the item is retried next cycle).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::item::ContentItem;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub fingerprint: String,
    pub first_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupStats {
    pub live_records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_first_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    records: Vec<DedupRecord>,
}

#[derive(Debug)]
pub struct DedupStore {
    path: PathBuf,
    retention: ChronoDuration,
    records: Mutex<HashMap<String, DedupRecord>>,
}

impl DedupStore {
    /// Open the store at `path`, tolerating a missing or corrupt snapshot:
    /// an unreadable store starts empty, favoring re-delivery over loss.
    pub async fn open(path: impl Into<PathBuf>, retention: ChronoDuration) -> Self {
        let path = path.into();
        let records = match fs::read_to_string(&path).await {
            Ok(s) => match serde_json::from_str::<Snapshot>(&s) {
                Ok(snap) => snap
                    .records
                    .into_iter()
                    .map(|r| (r.fingerprint.clone(), r))
                    .collect(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), "dedup snapshot unparseable, starting empty: {e:#}");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            retention,
            records: Mutex::new(records),
        }
    }

    /// True if a live record exists for `item.id` at `now`.
    pub fn is_duplicate(&self, item: &ContentItem, now: DateTime<Utc>) -> bool {
        let map = self.records.lock().expect("dedup mutex poisoned");
        map.get(&item.id).is_some_and(|r| r.expires_at > now)
    }

    /// Record `item` as pushed at `now`. Idempotent: an existing live record
    /// keeps its `first_seen_at` and expiry. Returns an error (and leaves the
    /// store unchanged) when the snapshot cannot be persisted.
    pub async fn record(&self, item: &ContentItem, now: DateTime<Utc>) -> Result<()> {
        let (prior, snapshot) = {
            let mut map = self.records.lock().expect("dedup mutex poisoned");
            if map.get(&item.id).is_some_and(|r| r.expires_at > now) {
                return Ok(());
            }
            let prior = map.insert(
                item.id.clone(),
                DedupRecord {
                    fingerprint: item.id.clone(),
                    first_seen_at: now,
                    expires_at: now + self.retention,
                },
            );
            (prior, Self::snapshot_of(&map))
        };

        if let Err(e) = self.persist(snapshot).await {
            // Roll back: an unpersisted record must not suppress retries.
            let mut map = self.records.lock().expect("dedup mutex poisoned");
            match prior {
                Some(old) => {
                    map.insert(item.id.clone(), old);
                }
                None => {
                    map.remove(&item.id);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Delete every record whose expiry has passed. Returns the purge count.
    /// Persist failures are logged; the in-memory view stays purged.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let (purged, snapshot) = {
            let mut map = self.records.lock().expect("dedup mutex poisoned");
            let before = map.len();
            map.retain(|_, r| r.expires_at > now);
            (before - map.len(), Self::snapshot_of(&map))
        };
        if purged > 0 {
            if let Err(e) = self.persist(snapshot).await {
                tracing::warn!("dedup purge persist failed: {e:#}");
            }
        }
        purged
    }

    /// Remove one fingerprint so the item re-delivers next cycle
    /// (operator force-reconcile). Returns whether a record was removed.
    pub async fn clear(&self, fingerprint: &str) -> bool {
        let (removed, snapshot) = {
            let mut map = self.records.lock().expect("dedup mutex poisoned");
            let removed = map.remove(fingerprint).is_some();
            (removed, Self::snapshot_of(&map))
        };
        if removed {
            if let Err(e) = self.persist(snapshot).await {
                tracing::warn!("dedup clear persist failed: {e:#}");
            }
        }
        removed
    }

    pub fn stats(&self) -> DedupStats {
        let map = self.records.lock().expect("dedup mutex poisoned");
        DedupStats {
            live_records: map.len(),
            oldest_first_seen: map.values().map(|r| r.first_seen_at).min(),
        }
    }

    fn snapshot_of(map: &HashMap<String, DedupRecord>) -> Snapshot {
        let mut records: Vec<DedupRecord> = map.values().cloned().collect();
        // Stable file contents regardless of map iteration order.
        records.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        Snapshot { records }
    }

    async fn persist(&self, snapshot: Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create state dir {}", parent.display()))?;
        }
        let body = serde_json::to_vec_pretty(&snapshot).context("serialize dedup snapshot")?;
        fs::write(&self.path, body)
            .await
            .with_context(|| format!("write dedup snapshot {}", self.path.display()))?;
        Ok(())
    }
}

// src/filter.rs
//! Candidate filtering for one push cycle: drop fingerprints already pushed,
//! then collapse near-identical headlines that different sources republish.
//!
//! Similarity: `strsim::normalized_levenshtein` (returns f64).

use chrono::{DateTime, Utc};
use strsim::normalized_levenshtein;

use crate::dedup::DedupStore;
use crate::item::ContentItem;

/// Outcome of the filtering stage, counts kept for telemetry.
#[derive(Debug)]
pub struct FilterOutcome {
    pub kept: Vec<ContentItem>,
    pub duplicates: usize,
    pub near_duplicates: usize,
}

/// Drop items whose fingerprint is live in `store`, then collapse near
/// duplicates among the survivors. Collapsed items are not recorded anywhere:
/// if the kept copy never delivers, both reappear as candidates next cycle.
pub fn filter_candidates(
    store: &DedupStore,
    candidates: Vec<ContentItem>,
    similarity_threshold: f64,
    now: DateTime<Utc>,
) -> FilterOutcome {
    let total = candidates.len();
    let fresh: Vec<ContentItem> = candidates
        .into_iter()
        .filter(|it| !store.is_duplicate(it, now))
        .collect();
    let duplicates = total - fresh.len();

    let kept = collapse_near_duplicates(fresh, similarity_threshold);
    let near_duplicates = total - duplicates - kept.len();

    FilterOutcome {
        kept,
        duplicates,
        near_duplicates,
    }
}

/// Keep the first of any pair of titles whose normalized Levenshtein
/// similarity reaches `threshold`. Input order is preserved, so with the
/// coordinator's priority ordering the more important copy survives.
pub fn collapse_near_duplicates(items: Vec<ContentItem>, threshold: f64) -> Vec<ContentItem> {
    if !(0.0..=1.0).contains(&threshold) || items.len() < 2 {
        return items;
    }
    let mut kept: Vec<ContentItem> = Vec::with_capacity(items.len());
    for it in items {
        let candidate_title = it.title.to_lowercase();
        let dup_of = kept
            .iter()
            .position(|k| normalized_levenshtein(&k.title.to_lowercase(), &candidate_title) >= threshold);
        match dup_of {
            Some(i) => {
                tracing::debug!(
                    kept = %kept[i].title,
                    dropped = %it.title,
                    "near-duplicate headline collapsed"
                );
            }
            None => kept.push(it),
        }
    }
    kept
}

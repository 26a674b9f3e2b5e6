// src/format.rs
//! Digest rendering and chunking.
//!
//! Items are rendered to plain text and greedily packed into blocks no longer
//! than the channel's size ceiling, in a fixed priority order (importance
//! descending, then recency). Output is fully deterministic: same items and
//! ceiling, same block boundaries. No item is dropped or split across blocks;
//! a single item too large for any block is hard-truncated with a marker.

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::item::{Category, ContentItem};

pub const DEFAULT_MAX_BLOCK_SIZE: usize = 2000;
pub const TRUNCATION_MARKER: &str = " …[truncated]";

const ITEM_SEPARATOR: &str = "\n\n";
/// Headroom for the `\n(part i/n)` suffix appended to multi-block digests.
const PART_SUFFIX_RESERVE: usize = 16;
/// Rendered body summaries are capped at this many characters.
const SUMMARY_MAX_CHARS: usize = 300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBlock {
    pub index: usize,
    pub text: String,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub max_block_size: usize,
    /// Optional digest header rendered at the top of the first block.
    pub header: Option<String>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            header: None,
        }
    }
}

/// Digest header for one cycle, e.g. `📬 Market digest — 2026-03-01 09:00 UTC`.
/// Takes the cycle start so repeated formatting of one cycle stays identical.
pub fn digest_header(title: &str, cycle_started_at: DateTime<Utc>) -> String {
    format!(
        "📬 {} — {} UTC",
        title,
        cycle_started_at.format("%Y-%m-%d %H:%M")
    )
}

/// Decode HTML entities, strip tags, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").unwrap());
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").unwrap());

    let decoded = html_escape::decode_html_entities(s).to_string();
    let stripped = re_tags.replace_all(&decoded, "");
    re_ws.replace_all(&stripped, " ").trim().to_string()
}

/// Cut `text` at a sentence boundary under `max_chars`; hard cut with an
/// ellipsis when not even the first sentence fits.
pub fn summarize(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out = String::new();
    let mut out_len = 0usize;
    for sentence in text.split_inclusive(['.', '!', '?', '。', '！', '？']) {
        let s_len = sentence.chars().count();
        if out_len + s_len > max_chars {
            break;
        }
        out.push_str(sentence);
        out_len += s_len;
    }
    if out.is_empty() {
        out = text.chars().take(max_chars.saturating_sub(3)).collect();
        out.push_str("...");
    }
    out.trim_end().to_string()
}

/// First signed percentage found in a stock body, e.g. `-1.85` from
/// `"322.10 USD (-6.10, -1.85%)"`.
fn change_percent(body: &str) -> Option<f64> {
    static RE_PCT: OnceCell<Regex> = OnceCell::new();
    let re = RE_PCT.get_or_init(|| Regex::new(r"([+-]?\d+(?:\.\d+)?)%").unwrap());
    re.captures(body)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn item_glyph(item: &ContentItem) -> &'static str {
    match item.category {
        Category::Stock => match change_percent(&item.body) {
            Some(p) if p > 3.0 => "🚀",
            Some(p) if p > 0.0 => "📈",
            Some(p) if p < -3.0 => "📉",
            Some(_) => "➡️",
            None => "📊",
        },
        Category::News | Category::Social => match item.importance {
            3.. => "🔥",
            2 => "⚠️",
            _ => "•",
        },
    }
}

/// Render one item to its digest text: glyph + title + source, then an
/// optional body summary and link. Deterministic, no wall-clock reads.
pub fn render_item(item: &ContentItem) -> String {
    let mut out = String::new();
    out.push_str(item_glyph(item));
    out.push(' ');
    out.push_str(&normalize_text(&item.title));
    out.push_str(" (");
    out.push_str(&item.source);
    out.push(')');

    let body = summarize(&normalize_text(&item.body), SUMMARY_MAX_CHARS);
    if !body.is_empty() {
        out.push('\n');
        out.push_str(&body);
    }
    if let Some(link) = &item.link {
        out.push('\n');
        out.push_str(link);
    }
    out
}

/// Format `items` into channel-safe blocks.
///
/// When the digest spans more than one block, packing runs again with
/// headroom reserved for a `(part i/n)` suffix, so every emitted block
/// still respects the ceiling. A single-block digest carries no suffix and
/// uses the full ceiling, which keeps the oversized-item truncation budget
/// at exactly `max_block_size` minus the marker.
pub fn format(items: &[ContentItem], opts: &FormatOptions) -> Vec<MessageBlock> {
    if items.is_empty() {
        return Vec::new();
    }

    let mut ordered: Vec<&ContentItem> = items.iter().collect();
    ordered.sort_by(|a, b| {
        b.importance
            .cmp(&a.importance)
            .then(b.observed_at.cmp(&a.observed_at))
    });
    let rendered: Vec<String> = ordered.iter().map(|it| render_item(it)).collect();

    let packed = pack(&rendered, opts.max_block_size, opts.header.as_deref());
    if packed.len() <= 1 {
        return packed
            .into_iter()
            .enumerate()
            .map(|(index, (text, truncated))| MessageBlock {
                index,
                text,
                truncated,
            })
            .collect();
    }

    let budget = opts.max_block_size.saturating_sub(PART_SUFFIX_RESERVE);
    let repacked = pack(&rendered, budget, opts.header.as_deref());
    let total = repacked.len();
    repacked
        .into_iter()
        .enumerate()
        .map(|(index, (text, truncated))| MessageBlock {
            index,
            text: format!("{}\n(part {}/{})", text, index + 1, total),
            truncated,
        })
        .collect()
}

/// Greedy packing of pre-rendered item texts. Returns `(text, truncated)`
/// pairs; a truncated entry is always a block of its own.
fn pack(rendered: &[String], max: usize, header: Option<&str>) -> Vec<(String, bool)> {
    let sep_len = ITEM_SEPARATOR.chars().count();
    let mut blocks: Vec<(String, bool)> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    if let Some(h) = header {
        current.push_str(h);
        current_len = h.chars().count();
    }

    for text in rendered {
        let text_len = text.chars().count();

        if text_len > max {
            if current_len > 0 {
                blocks.push((std::mem::take(&mut current), false));
                current_len = 0;
            }
            blocks.push((truncate_to(text, max), true));
            continue;
        }

        let lead = if current_len == 0 { 0 } else { sep_len };
        if current_len + lead + text_len <= max {
            if lead > 0 {
                current.push_str(ITEM_SEPARATOR);
            }
            current.push_str(text);
            current_len += lead + text_len;
        } else {
            blocks.push((std::mem::take(&mut current), false));
            current.push_str(text);
            current_len = text_len;
        }
    }
    if current_len > 0 {
        blocks.push((current, false));
    }
    blocks
}

fn truncate_to(text: &str, max: usize) -> String {
    let marker_len = TRUNCATION_MARKER.chars().count();
    let mut out: String = text
        .chars()
        .take(max.saturating_sub(marker_len))
        .collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

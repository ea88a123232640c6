//! Core domain model and shared contracts for vidsent.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "vidsent-core";

/// Upper bound on key phrases kept per comment.
pub const MAX_KEY_PHRASES: usize = 5;

/// Sentiment classification attached to a comment by the enrichment stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

impl SentimentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Neutral => "neutral",
            SentimentLabel::Negative => "negative",
        }
    }
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered key phrases, bounded to [`MAX_KEY_PHRASES`] at construction.
///
/// Serialized transparently as a plain string array; the storage layer is the
/// only place that turns it into an opaque column value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyPhrases(Vec<String>);

impl KeyPhrases {
    pub fn new(mut phrases: Vec<String>) -> Self {
        phrases.truncate(MAX_KEY_PHRASES);
        Self(phrases)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Derived fields written back by the enrichment stage, always as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrichment {
    pub label: SentimentLabel,
    pub score: f64,
    pub phrases: KeyPhrases,
}

/// One top-level comment as returned by the remote source.
///
/// This is the single record shared by the fetcher, the log publisher, the
/// loader, and the enrichment stage; wire payloads carry these field names.
/// `category` is unknown at fetch time and back-filled by the caller; the
/// enrichment fields stay absent until the enrichment stage computes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub comment_id: String,
    pub video_id: String,
    #[serde(default)]
    pub category: Option<String>,
    pub author: String,
    pub text: String,
    pub like_count: u64,
    pub reply_count: u64,
    pub published_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub sentiment_label: Option<SentimentLabel>,
    #[serde(default)]
    pub sentiment_score: Option<f64>,
    #[serde(default)]
    pub phrases: Option<KeyPhrases>,
}

/// Whitespace-normalize comment text for downstream analysis.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Durable per-video record of every comment known so far, sorted ascending
/// by `published_at`. Comment ids are unique within the sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusSnapshot {
    pub video_id: String,
    pub video_title: String,
    pub channel_title: String,
    #[serde(default)]
    pub category: Option<String>,
    pub total_comments: usize,
    pub last_updated: DateTime<Utc>,
    pub comments: Vec<Comment>,
}

impl CorpusSnapshot {
    /// The dedup set handed to the fetcher; rebuilt from the snapshot on
    /// every run, never cached across runs.
    pub fn known_ids(&self) -> HashSet<String> {
        self.comments
            .iter()
            .map(|c| c.comment_id.clone())
            .collect()
    }
}

/// Merge a previous snapshot (possibly absent) with newly fetched comments.
///
/// Union keyed by `comment_id`; a re-fetched comment replaces the stored one
/// entirely, so refreshed engagement counters win. The result is re-sorted by
/// `(published_at, comment_id)` before it is persisted.
pub fn merge_snapshot(
    previous: Option<CorpusSnapshot>,
    video_id: &str,
    video_title: &str,
    channel_title: &str,
    category: Option<String>,
    new_comments: Vec<Comment>,
    now: DateTime<Utc>,
) -> CorpusSnapshot {
    let mut by_id: BTreeMap<String, Comment> = BTreeMap::new();
    if let Some(prev) = previous {
        for comment in prev.comments {
            by_id.insert(comment.comment_id.clone(), comment);
        }
    }
    for comment in new_comments {
        by_id.insert(comment.comment_id.clone(), comment);
    }

    let mut comments: Vec<Comment> = by_id.into_values().collect();
    comments.sort_by(|a, b| {
        a.published_at
            .cmp(&b.published_at)
            .then_with(|| a.comment_id.cmp(&b.comment_id))
    });

    CorpusSnapshot {
        video_id: video_id.to_string(),
        video_title: video_title.to_string(),
        channel_title: channel_title.to_string(),
        category,
        total_comments: comments.len(),
        last_updated: now,
        comments,
    }
}

/// Cooperative cancellation shared between a signal source and the long
/// running fetch/consume loops. Checked at page and batch boundaries; the
/// current atomic unit always completes before the loop stops.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    inner: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.store(true, Ordering::Relaxed);
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.load(Ordering::Relaxed)
    }
}

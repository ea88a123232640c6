//! Remote comment source contracts + the incremental paginated fetcher.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use vidsent_core::{Comment, ShutdownFlag};
use vidsent_storage::{classify_reqwest_error, classify_status, BackoffPolicy, RetryDisposition};

pub const CRATE_NAME: &str = "vidsent-adapters";

pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("video not found: {video_id}")]
    VideoNotFound { video_id: String },
    #[error("quota exhausted or comments disabled for {video_id}")]
    QuotaOrDisabled { video_id: String },
    #[error("transport error for {video_id}: {message}")]
    Transport {
        video_id: String,
        message: String,
        retryable: bool,
    },
}

impl SourceError {
    pub fn is_retryable_transport(&self) -> bool {
        matches!(self, SourceError::Transport { retryable: true, .. })
    }

    /// The failure category reported in run summaries.
    pub fn category(&self) -> &'static str {
        match self {
            SourceError::VideoNotFound { .. } => "video_not_found",
            SourceError::QuotaOrDisabled { .. } => "quota_or_disabled",
            SourceError::Transport { .. } => "transport",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoMeta {
    pub video_id: String,
    pub title: String,
    pub channel_title: String,
    pub reported_comment_count: u64,
}

/// One page of top-level comments in chronological request order.
#[derive(Debug, Clone, Default)]
pub struct CommentPage {
    pub comments: Vec<Comment>,
    pub next_page_token: Option<String>,
}

/// A paginated remote source of video comments.
#[async_trait]
pub trait CommentSource: Send + Sync {
    async fn video_meta(&self, video_id: &str) -> Result<VideoMeta, SourceError>;

    async fn comment_page(
        &self,
        video_id: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<CommentPage, SourceError>;
}

/// Receives each newly discovered comment as soon as the fetcher sees it.
///
/// Delivery is at-least-once and fire-and-continue: implementations log their
/// own failures and never fail the fetch.
#[async_trait]
pub trait CommentSink: Send + Sync {
    async fn publish(&self, comment: &Comment);
}

/// Sink for snapshot-only ingestion runs.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl CommentSink for NullSink {
    async fn publish(&self, _comment: &Comment) {}
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub page_size: u32,
    /// Consecutive zero-new pages tolerated in incremental mode before
    /// paging stops.
    pub empty_page_limit: usize,
    /// Pause between successive page requests; skipped after the last page.
    pub page_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            empty_page_limit: 3,
            page_delay: Duration::from_millis(500),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchTermination {
    /// The source reported no further page token.
    Completed,
    /// Incremental mode hit the consecutive-empty-page bound.
    EarlyStopped,
    /// Cooperative shutdown; the accumulated result is a partial success.
    Cancelled,
    /// Quota/permission refusal mid-pagination; accumulated comments kept.
    QuotaExhausted,
    /// A page kept failing past the bounded retries; accumulated comments kept.
    PageRetriesExhausted,
}

impl FetchTermination {
    pub fn is_partial(&self) -> bool {
        !matches!(self, FetchTermination::Completed | FetchTermination::EarlyStopped)
    }
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub meta: VideoMeta,
    /// Comments not present in the known-id set, in discovery order.
    pub new_comments: Vec<Comment>,
    pub pages_walked: usize,
    /// Remote calls spent on this video, for quota bookkeeping.
    pub remote_calls: usize,
    pub termination: FetchTermination,
}

/// Walks a video's comment pages oldest-first, skipping already-known ids and
/// streaming each new comment to the sink before pagination continues.
pub struct CommentFetcher {
    config: FetcherConfig,
}

impl CommentFetcher {
    pub fn new(config: FetcherConfig) -> Self {
        Self { config }
    }

    pub async fn fetch_new_comments(
        &self,
        source: &dyn CommentSource,
        sink: &dyn CommentSink,
        video_id: &str,
        known_ids: &HashSet<String>,
        shutdown: &ShutdownFlag,
    ) -> Result<FetchOutcome, SourceError> {
        let span = info_span!("comment_fetch", video_id);
        self.fetch_inner(source, sink, video_id, known_ids, shutdown)
            .instrument(span)
            .await
    }

    async fn fetch_inner(
        &self,
        source: &dyn CommentSource,
        sink: &dyn CommentSink,
        video_id: &str,
        known_ids: &HashSet<String>,
        shutdown: &ShutdownFlag,
    ) -> Result<FetchOutcome, SourceError> {
        let mut remote_calls = 0usize;

        let meta = self
            .call_with_retry(&mut remote_calls, || source.video_meta(video_id))
            .await?;

        let incremental = !known_ids.is_empty();
        info!(
            title = meta.title.as_str(),
            channel = meta.channel_title.as_str(),
            reported_comments = meta.reported_comment_count,
            mode = if incremental { "incremental" } else { "full" },
            "starting fetch"
        );

        let mut new_comments: Vec<Comment> = Vec::new();
        let mut seen_this_run: HashSet<String> = HashSet::new();
        let mut page_token: Option<String> = None;
        let mut pages_walked = 0usize;
        let mut consecutive_empty = 0usize;
        let mut termination = FetchTermination::Completed;

        loop {
            if shutdown.is_triggered() {
                info!(pages_walked, "shutdown requested, stopping fetch");
                termination = FetchTermination::Cancelled;
                break;
            }

            let page_result = self
                .call_with_retry(&mut remote_calls, || {
                    source.comment_page(video_id, self.config.page_size, page_token.as_deref())
                })
                .await;

            let page = match page_result {
                Ok(page) => page,
                Err(SourceError::QuotaOrDisabled { .. }) if pages_walked > 0 => {
                    warn!(pages_walked, "quota refused mid-fetch, keeping accumulated comments");
                    termination = FetchTermination::QuotaExhausted;
                    break;
                }
                Err(err @ SourceError::Transport { .. }) if pages_walked > 0 => {
                    warn!(
                        pages_walked,
                        error = %err,
                        "page retries exhausted, keeping accumulated comments"
                    );
                    termination = FetchTermination::PageRetriesExhausted;
                    break;
                }
                Err(err) => return Err(err),
            };

            pages_walked += 1;

            let mut page_new = 0usize;
            for comment in page.comments {
                if known_ids.contains(&comment.comment_id)
                    || !seen_this_run.insert(comment.comment_id.clone())
                {
                    continue;
                }
                sink.publish(&comment).await;
                new_comments.push(comment);
                page_new += 1;
            }

            info!(
                page = pages_walked,
                page_new,
                total_new = new_comments.len(),
                "page processed"
            );

            if incremental {
                if page_new == 0 {
                    consecutive_empty += 1;
                    if consecutive_empty >= self.config.empty_page_limit {
                        info!(
                            consecutive_empty,
                            "no new comments on consecutive pages, stopping early"
                        );
                        termination = FetchTermination::EarlyStopped;
                        break;
                    }
                } else {
                    consecutive_empty = 0;
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => {
                    termination = FetchTermination::Completed;
                    break;
                }
            }

            if !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }
        }

        info!(
            total_new = new_comments.len(),
            pages_walked,
            remote_calls,
            ?termination,
            "fetch finished"
        );

        Ok(FetchOutcome {
            meta,
            new_comments,
            pages_walked,
            remote_calls,
            termination,
        })
    }

    /// Bounded caller-side retry of transient transport failures. Anything
    /// tagged non-retryable, not-found, or quota surfaces immediately.
    async fn call_with_retry<T, F, Fut>(
        &self,
        remote_calls: &mut usize,
        mut op: F,
    ) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, SourceError>>,
    {
        let mut attempt = 0usize;
        loop {
            *remote_calls += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable_transport() && attempt < self.config.backoff.max_retries => {
                    let delay = self.config.backoff.delay_for_attempt(attempt);
                    warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying page request");
                    attempt += 1;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

const YOUTUBE_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

/// YouTube Data API v3 client for `videos.list` and `commentThreads.list`.
///
/// Performs exactly one HTTP request per call; retry policy belongs to the
/// fetch loop.
#[derive(Debug, Clone)]
pub struct YouTubeDataApi {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl YouTubeDataApi {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: YOUTUBE_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn transport(video_id: &str, err: reqwest::Error) -> SourceError {
        SourceError::Transport {
            video_id: video_id.to_string(),
            message: err.to_string(),
            retryable: classify_reqwest_error(&err) == RetryDisposition::Retryable,
        }
    }

    async fn check_status(
        video_id: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, SourceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match status.as_u16() {
            403 => Err(SourceError::QuotaOrDisabled {
                video_id: video_id.to_string(),
            }),
            404 => Err(SourceError::VideoNotFound {
                video_id: video_id.to_string(),
            }),
            _ => Err(SourceError::Transport {
                video_id: video_id.to_string(),
                message: format!("http status {status}"),
                retryable: classify_status(status) == RetryDisposition::Retryable,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideosListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
struct VideoItem {
    snippet: VideoSnippet,
    #[serde(default)]
    statistics: Option<VideoStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    title: String,
    channel_title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatistics {
    // The API reports counters as decimal strings.
    #[serde(default)]
    comment_count: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentThreadsResponse {
    #[serde(default)]
    items: Vec<ThreadItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ThreadItem {
    id: String,
    snippet: ThreadSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadSnippet {
    #[serde(default)]
    total_reply_count: u64,
    top_level_comment: TopLevelComment,
}

#[derive(Debug, Deserialize)]
struct TopLevelComment {
    snippet: TopLevelSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopLevelSnippet {
    author_display_name: String,
    text_display: String,
    #[serde(default)]
    like_count: u64,
    published_at: DateTime<Utc>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

#[async_trait]
impl CommentSource for YouTubeDataApi {
    async fn video_meta(&self, video_id: &str) -> Result<VideoMeta, SourceError> {
        let url = format!("{}/videos", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("part", "snippet,statistics"),
                ("id", video_id),
                ("key", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|err| Self::transport(video_id, err))?;
        let response = Self::check_status(video_id, response).await?;
        let body: VideosListResponse = response
            .json()
            .await
            .map_err(|err| Self::transport(video_id, err))?;

        let item = body.items.into_iter().next().ok_or_else(|| {
            SourceError::VideoNotFound {
                video_id: video_id.to_string(),
            }
        })?;

        let reported_comment_count = item
            .statistics
            .and_then(|s| s.comment_count)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);

        Ok(VideoMeta {
            video_id: video_id.to_string(),
            title: item.snippet.title,
            channel_title: item.snippet.channel_title,
            reported_comment_count,
        })
    }

    async fn comment_page(
        &self,
        video_id: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<CommentPage, SourceError> {
        let url = format!("{}/commentThreads", self.base_url);
        let page_size = page_size.to_string();
        let mut query: Vec<(&str, &str)> = vec![
            ("part", "snippet"),
            ("videoId", video_id),
            ("key", self.api_key.as_str()),
            ("maxResults", page_size.as_str()),
            ("order", "time"),
            ("textFormat", "plainText"),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|err| Self::transport(video_id, err))?;
        let response = Self::check_status(video_id, response).await?;
        let body: CommentThreadsResponse = response
            .json()
            .await
            .map_err(|err| Self::transport(video_id, err))?;

        let comments = body
            .items
            .into_iter()
            .map(|item| {
                let top = item.snippet.top_level_comment.snippet;
                Comment {
                    comment_id: item.id,
                    video_id: video_id.to_string(),
                    category: None,
                    author: top.author_display_name,
                    text: top.text_display,
                    like_count: top.like_count,
                    reply_count: item.snippet.total_reply_count,
                    published_at: top.published_at,
                    updated_at: top.updated_at.unwrap_or(top.published_at),
                    sentiment_label: None,
                    sentiment_score: None,
                    phrases: None,
                }
            })
            .collect();

        Ok(CommentPage {
            comments,
            next_page_token: body.next_page_token,
        })
    }
}

//! Durable corpus snapshot storage + HTTP fetch utilities for vidsent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;
use vidsent_core::CorpusSnapshot;

pub const CRATE_NAME: &str = "vidsent-storage";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed snapshot {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One JSON snapshot file per video id under a root directory.
///
/// Writes go through a temp file in the same directory followed by a rename,
/// so a crash mid-write never leaves a truncated snapshot behind. Callers
/// must hold exclusive access to a given video id; the store itself does no
/// cross-process locking.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, video_id: &str) -> PathBuf {
        // Video ids come from config; keep the file name to a safe subset.
        let safe: String = video_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{safe}.json"))
    }

    /// Load the snapshot for a video. Absence is a valid cold-start state.
    pub async fn load(&self, video_id: &str) -> Result<Option<CorpusSnapshot>, SnapshotError> {
        let path = self.path_for(video_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(SnapshotError::Io { path, source: err }),
        };
        let snapshot = serde_json::from_slice(&bytes)
            .map_err(|err| SnapshotError::Malformed { path, source: err })?;
        Ok(Some(snapshot))
    }

    /// Atomically replace the snapshot for `snapshot.video_id`.
    pub async fn save(&self, snapshot: &CorpusSnapshot) -> anyhow::Result<PathBuf> {
        let path = self.path_for(&snapshot.video_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating snapshot directory {}", parent.display()))?;
        }

        let bytes = serde_json::to_vec_pretty(snapshot).context("serializing snapshot")?;

        let temp_name = format!(".{}.{}.tmp", snapshot.video_id, Uuid::new_v4());
        let temp_path = path
            .parent()
            .expect("snapshot path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        debug!(
            video_id = snapshot.video_id.as_str(),
            comments = snapshot.total_comments,
            path = %path.display(),
            "snapshot saved"
        );
        Ok(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded exponential backoff for transient remote failures. Retrying is
/// the caller's job; the remote source client itself never loops.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;
    use vidsent_core::{merge_snapshot, Comment};

    fn mk_snapshot(video_id: &str, ids: &[&str]) -> CorpusSnapshot {
        let now = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let comments = ids
            .iter()
            .enumerate()
            .map(|(i, id)| Comment {
                comment_id: id.to_string(),
                video_id: video_id.to_string(),
                category: Some("robotics".into()),
                author: "a".into(),
                text: "t".into(),
                like_count: i as u64,
                reply_count: 0,
                published_at: now + chrono::Duration::seconds(i as i64),
                updated_at: now + chrono::Duration::seconds(i as i64),
                sentiment_label: None,
                sentiment_score: None,
                phrases: None,
            })
            .collect();
        merge_snapshot(None, video_id, "Title", "Channel", Some("robotics".into()), comments, now)
    }

    #[tokio::test]
    async fn missing_snapshot_is_a_cold_start() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let loaded = store.load("nope").await.expect("load");
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let snapshot = mk_snapshot("vid1", &["c1", "c2"]);

        store.save(&snapshot).await.expect("save");
        let loaded = store.load("vid1").await.expect("load").expect("present");
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn save_overwrites_previous_snapshot_atomically() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());

        store.save(&mk_snapshot("vid1", &["c1"])).await.expect("first save");
        store
            .save(&mk_snapshot("vid1", &["c1", "c2", "c3"]))
            .await
            .expect("second save");

        let loaded = store.load("vid1").await.expect("load").expect("present");
        assert_eq!(loaded.total_comments, 3);

        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn malformed_snapshot_is_reported_not_swallowed() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        std::fs::write(store.path_for("vid1"), b"{not json").expect("write garbage");

        let err = store.load("vid1").await.expect_err("should fail");
        assert!(matches!(err, SnapshotError::Malformed { .. }));
    }

    #[test]
    fn path_for_sanitizes_hostile_ids() {
        let store = SnapshotStore::new("/data/raw");
        let path = store.path_for("../../etc/passwd");
        assert_eq!(path, PathBuf::from("/data/raw/______etc_passwd.json"));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn too_many_requests_is_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
    }
}

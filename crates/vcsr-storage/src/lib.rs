//! Durable bookkeeping + delivery pacing primitives for VCSR.
//!
//! The [`Ledger`] is the idempotency store: the set of record ids already
//! delivered, rewritten atomically on every commit. Everything else here is
//! pass-scoped state (pacer, breaker) or retry plumbing shared by the
//! adapters.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "vcsr-storage";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("ledger blob at {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// On-disk shape of the ledger: a single versionless blob, replaced whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerBlob {
    ids: Vec<String>,
    last_updated: Option<DateTime<Utc>>,
    total_count: usize,
    provenance: String,
}

/// Durable store of delivered record ids.
///
/// Growth is unbounded by design; pruning is an explicit operator action,
/// never implicit. A missing file loads as the empty ledger so first runs
/// need no bootstrap step.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    ids: BTreeSet<String>,
    last_updated: Option<DateTime<Utc>>,
    provenance: String,
}

impl Ledger {
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self {
                    path,
                    ids: BTreeSet::new(),
                    last_updated: None,
                    provenance: String::new(),
                });
            }
            Err(source) => return Err(LedgerError::Io { path, source }),
        };

        let blob: LedgerBlob = serde_json::from_str(&text).map_err(|source| {
            LedgerError::Malformed {
                path: path.clone(),
                source,
            }
        })?;
        let ids: BTreeSet<String> = blob.ids.into_iter().collect();
        if blob.total_count != ids.len() {
            warn!(
                path = %path.display(),
                recorded = blob.total_count,
                actual = ids.len(),
                "ledger total_count disagrees with id set; trusting the ids"
            );
        }
        Ok(Self {
            path,
            ids,
            last_updated: blob.last_updated,
            provenance: blob.provenance,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Candidate ids not yet delivered.
    pub fn diff(&self, candidates: &HashSet<String>) -> HashSet<String> {
        candidates
            .iter()
            .filter(|id| !self.ids.contains(*id))
            .cloned()
            .collect()
    }

    /// Add `ids` and rewrite the blob atomically (temp file, fsync, rename).
    ///
    /// A crash before the rename leaves the previous blob intact; a crash
    /// after it leaves the new one. There is no window where an acknowledged
    /// commit can be lost. Seeding and incremental updates both come through
    /// here.
    pub async fn commit<I, S>(&mut self, ids: I, provenance: &str) -> Result<(), LedgerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in ids {
            self.ids.insert(id.into());
        }
        self.last_updated = Some(Utc::now());
        self.provenance = provenance.to_string();
        self.persist().await
    }

    async fn persist(&self) -> Result<(), LedgerError> {
        let blob = LedgerBlob {
            ids: self.ids.iter().cloned().collect(),
            last_updated: self.last_updated,
            total_count: self.ids.len(),
            provenance: self.provenance.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&blob).expect("ledger blob serializes");

        let io_err = |source| LedgerError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let temp_path = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!(".{}.ledger.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err)?;
        let write_result = async {
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(source) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(source));
        }

        match fs::rename(&temp_path, &self.path).await {
            Ok(()) => Ok(()),
            Err(source) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(io_err(source))
            }
        }
    }
}

/// Run metadata: when the last pass finished, operator visibility only.
/// Dedup never consults this; it is identity-based, not time-based.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RunMeta {
    pub last_run_timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct RunMetaStore {
    path: PathBuf,
}

impl RunMetaStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> Result<Option<RunMeta>, LedgerError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let meta = serde_json::from_str(&text).map_err(|source| LedgerError::Malformed {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(meta))
    }

    /// Overwrite with the current wall clock.
    pub async fn mark_now(&self) -> Result<(), LedgerError> {
        let meta = RunMeta {
            last_run_timestamp: Utc::now().timestamp(),
        };
        let bytes = serde_json::to_vec(&meta).expect("run meta serializes");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| LedgerError::Io {
                    path: self.path.clone(),
                    source,
                })?;
        }
        fs::write(&self.path, bytes)
            .await
            .map_err(|source| LedgerError::Io {
                path: self.path.clone(),
                source,
            })
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

/// Exponential backoff for source-side retries: attempt `k` waits
/// `base_delay * 2^k`, capped at `max_delay`; `max_retries` bounds the
/// retries after the initial try (default 3, so 4 total tries).
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
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
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

/// Strict fixed-interval pacing for outbound sends.
///
/// `acquire` returns once at least `1/rate` seconds have elapsed since the
/// previous `acquire` returned. Deliberately not a token bucket: the sink's
/// quota window is short enough that a burst can trip it.
#[derive(Debug)]
pub struct IntervalPacer {
    interval: Duration,
    last: Option<Instant>,
}

impl IntervalPacer {
    pub fn from_rate(rate_per_second: f64) -> Self {
        let interval = if rate_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / rate_per_second)
        } else {
            Duration::ZERO
        };
        Self {
            interval,
            last: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn acquire(&mut self) {
        if let Some(last) = self.last {
            tokio::time::sleep_until(last + self.interval).await;
        }
        self.last = Some(Instant::now());
    }
}

/// Consecutive-failure guard over a pass's deliveries.
///
/// Never persisted: every pass starts with a closed breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Returns true when this failure opened the breaker.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.is_open()
    }

    pub fn is_open(&self) -> bool {
        self.consecutive_failures >= self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn absent_ledger_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let ledger = Ledger::load(dir.path().join("ledger.json"))
            .await
            .expect("load");
        assert!(ledger.is_empty());
        assert!(!ledger.contains("conv-1"));
    }

    #[tokio::test]
    async fn commit_persists_and_reloads() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state").join("ledger.json");

        let mut ledger = Ledger::load(&path).await.expect("load");
        ledger
            .commit(["conv-a".to_string(), "conv-b".to_string()], "pass test-1")
            .await
            .expect("commit");

        let reloaded = Ledger::load(&path).await.expect("reload");
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains("conv-a"));
        assert!(reloaded.contains("conv-b"));

        // No temp files left behind by the atomic replace.
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn commits_are_additive_and_diff_excludes_delivered() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");

        let mut ledger = Ledger::load(&path).await.expect("load");
        ledger
            .commit(["conv-a".to_string()], "seed")
            .await
            .expect("seed commit");
        ledger
            .commit(["conv-b".to_string()], "pass test-2")
            .await
            .expect("second commit");

        let candidates: HashSet<String> = ["conv-a", "conv-b", "conv-c"]
            .into_iter()
            .map(String::from)
            .collect();
        let new_ids = ledger.diff(&candidates);
        assert_eq!(new_ids.len(), 1);
        assert!(new_ids.contains("conv-c"));
    }

    #[tokio::test]
    async fn blob_records_count_and_provenance() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");

        let mut ledger = Ledger::load(&path).await.expect("load");
        ledger
            .commit(["b".to_string(), "a".to_string()], "seeded from csv")
            .await
            .expect("commit");

        let blob: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read"))
                .expect("parse blob");
        assert_eq!(blob["total_count"], 2);
        assert_eq!(blob["provenance"], "seeded from csv");
        // Sorted ids keep the blob diffable between commits.
        assert_eq!(blob["ids"][0], "a");
        assert_eq!(blob["ids"][1], "b");
    }

    #[tokio::test]
    async fn run_meta_roundtrip() {
        let dir = tempdir().expect("tempdir");
        let store = RunMetaStore::new(dir.path().join("last_run.json"));
        assert!(store.load().await.expect("load absent").is_none());

        store.mark_now().await.expect("mark");
        let meta = store.load().await.expect("load").expect("present");
        assert!(meta.last_run_timestamp > 0);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(10));
    }

    #[test]
    fn breaker_trips_at_threshold_and_resets_on_success() {
        let mut breaker = CircuitBreaker::new(3);
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        breaker.record_success();
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure());
        assert!(breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_enforces_minimum_interval() {
        let mut pacer = IntervalPacer::from_rate(10.0);
        let start = Instant::now();
        for _ in 0..5 {
            pacer.acquire().await;
        }
        // First acquire is free; the remaining four each wait 100ms.
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_with_zero_rate_never_sleeps() {
        let mut pacer = IntervalPacer::from_rate(0.0);
        let start = Instant::now();
        for _ in 0..100 {
            pacer.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn status_classification_matches_retry_taxonomy() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }
}

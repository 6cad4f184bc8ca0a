//! Run recorder.
//!
//! Keeps an append-only, bounded run history and aggregate counters in a
//! [`KvStore`]. Both live in one JSON envelope with a generation counter, so
//! a record lands in the history and the counters together or not at all.
//! Writes compare-and-set against the bytes that were read and retry with
//! exponential backoff on conflict.

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use quill_core::types::{Classification, Confidence, Verdict};

use crate::store::{KvStore, StoreError};

/// Recorder failure. Never fails a run; see [`QualityFlag::RecordNotPersisted`].
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Store call timed out")]
    Timeout,

    #[error("Gave up after repeated write conflicts on '{0}'")]
    Conflict(String),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<StoreError> for RecorderError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(key) => RecorderError::Conflict(key),
            StoreError::Timeout => RecorderError::Timeout,
            other => RecorderError::Store(other),
        }
    }
}

/// Degradations attached to a run outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    /// Fields came from heuristic detectors
    HeuristicExtraction,
    /// Some required fields were not found
    UnmatchedRequiredFields,
    /// Returned artifact failed a critical check
    ValidationDeficient,
    /// The first selected backend did not produce the artifact
    FallbackUsed,
    /// A regeneration attempt was made
    Regenerated,
    /// Regeneration was requested but no backend was left to run it
    RegenerationUnavailable,
    /// The run record could not be written
    RecordNotPersisted,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Compliant,
    Deficient,
    Failed,
    Cancelled,
    TimedOut,
}

/// One persisted run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub case_id: String,
    pub task_type: String,
    pub classification: Classification,

    /// Backends dispatched, in order, without repeats
    pub backends_attempted: Vec<String>,

    /// Backend that produced the returned artifact
    pub final_backend: Option<String>,

    pub status: RunStatus,
    pub final_verdict: Option<Verdict>,
    pub regenerated: bool,
    pub extraction_confidence: Option<Confidence>,
    pub total_wall_clock_ms: u64,
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub quality_flags: BTreeSet<QualityFlag>,
}

/// Aggregate counters over all recorded runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunStats {
    pub total: u64,
    pub compliant: u64,
    pub deficient: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub regenerated: u64,
    pub heuristic_extractions: u64,
    pub by_task: BTreeMap<String, u64>,
    pub by_backend: BTreeMap<String, u64>,
    pub total_wall_clock_ms: u64,
}

impl RunStats {
    pub fn apply(&mut self, record: &RunRecord) {
        self.total += 1;
        match record.status {
            RunStatus::Compliant => self.compliant += 1,
            RunStatus::Deficient => self.deficient += 1,
            RunStatus::Failed => self.failed += 1,
            RunStatus::Cancelled => self.cancelled += 1,
            RunStatus::TimedOut => self.timed_out += 1,
        }
        if record.regenerated {
            self.regenerated += 1;
        }
        if record.extraction_confidence == Some(Confidence::Heuristic) {
            self.heuristic_extractions += 1;
        }
        *self.by_task.entry(record.task_type.clone()).or_insert(0) += 1;
        if let Some(backend) = &record.final_backend {
            *self.by_backend.entry(backend.clone()).or_insert(0) += 1;
        }
        self.total_wall_clock_ms += record.total_wall_clock_ms;
    }

    pub fn average_wall_clock_ms(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.total_wall_clock_ms as f64 / self.total as f64
        }
    }
}

/// Stored value with its write generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub generation: u64,
    pub data: T,
}

/// History and counters, stored together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RunLog {
    #[serde(default)]
    history: Vec<RunRecord>,
    #[serde(default)]
    stats: RunStats,
}

/// Recorder settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Prefix for the run log key
    pub key_prefix: String,

    /// Most recent runs kept in the history
    pub history_limit: usize,

    /// Timeout for each store call
    #[serde(with = "crate::config::duration_str")]
    pub write_timeout: Duration,

    /// Retries after a write conflict
    pub max_retries: usize,

    /// First backoff delay after a conflict
    #[serde(with = "crate::config::duration_str")]
    pub retry_base_delay: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            key_prefix: "quill".to_string(),
            history_limit: 100,
            write_timeout: Duration::from_secs(2),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(20),
        }
    }
}

pub struct RunRecorder {
    store: Arc<dyn KvStore>,
    config: RecorderConfig,
}

impl RunRecorder {
    pub fn new(store: Arc<dyn KvStore>, config: RecorderConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    fn log_key(&self) -> String {
        format!("{}:runs", self.config.key_prefix)
    }

    /// Append a record to the history and fold it into the counters in one
    /// write.
    pub async fn record(&self, record: &RunRecord) -> Result<(), RecorderError> {
        let limit = self.config.history_limit.max(1);

        let generation = self
            .update::<RunLog, _>(&self.log_key(), |log| {
                log.history.push(record.clone());
                if log.history.len() > limit {
                    let excess = log.history.len() - limit;
                    log.history.drain(..excess);
                }
                log.stats.apply(record);
            })
            .await?;

        debug!(
            run_id = %record.run_id,
            status = ?record.status,
            generation,
            "Run recorded"
        );
        Ok(())
    }

    /// Recorded runs, oldest first.
    pub async fn history(&self) -> Result<Vec<RunRecord>, RecorderError> {
        Ok(self.load::<RunLog>(&self.log_key()).await?.data.history)
    }

    pub async fn stats(&self) -> Result<RunStats, RecorderError> {
        Ok(self.load::<RunLog>(&self.log_key()).await?.data.stats)
    }

    async fn load<T>(&self, key: &str) -> Result<Envelope<T>, RecorderError>
    where
        T: DeserializeOwned + Default,
    {
        match self.timed(self.store.get(key)).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Envelope::default()),
        }
    }

    async fn update<T, F>(&self, key: &str, mutate: F) -> Result<u64, RecorderError>
    where
        T: Serialize + DeserializeOwned + Default + Send,
        F: Fn(&mut T) + Sync,
    {
        let this = self;
        let mutate = &mutate;
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.retry_base_delay)
            .with_max_times(self.config.max_retries)
            .with_jitter();

        (|| async move { this.try_update::<T, F>(key, mutate).await })
            .retry(backoff)
            .when(|err| matches!(err, RecorderError::Conflict(_)))
            .notify(|err, delay| {
                warn!(key = %key, error = %err, delay = ?delay, "Recorder write conflict, retrying");
            })
            .await
    }

    async fn try_update<T, F>(&self, key: &str, mutate: &F) -> Result<u64, RecorderError>
    where
        T: Serialize + DeserializeOwned + Default + Send,
        F: Fn(&mut T) + Sync,
    {
        let current = self.timed(self.store.get(key)).await?;
        let mut envelope: Envelope<T> = match &current {
            Some(bytes) => serde_json::from_slice(bytes)?,
            None => Envelope::default(),
        };

        mutate(&mut envelope.data);
        envelope.generation += 1;
        let bytes = serde_json::to_vec(&envelope)?;

        self.timed(self.store.compare_and_set(key, current.as_deref(), bytes))
            .await?;
        Ok(envelope.generation)
    }

    async fn timed<T, Fut>(&self, call: Fut) -> Result<T, RecorderError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.config.write_timeout, call).await {
            Ok(result) => result.map_err(RecorderError::from),
            Err(_) => {
                warn!(timeout = ?self.config.write_timeout, "Store call timed out");
                Err(RecorderError::Timeout)
            }
        }
    }
}

//! Durable job records and the tracker that owns every state write.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bincode::config;
use bincode::serde::{decode_from_slice, encode_to_vec};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};
use thiserror::Error;

use crate::extract::{ErrorKind, ExtractionOptions};
use crate::services::complexity::ComplexityClass;
use crate::store::{StateStore, StoreError};
use crate::text::compare::Divergence;

const CAS_MAX_ATTEMPTS: usize = 3;

/// Lifecycle state of an extraction job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Pending,
    Analyzing,
    Extracting,
    Comparing,
    NeedsReview,
    Arbitrated,
    Completed,
    Failed,
    Timeout,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Timeout)
    }

    /// Progress waypoint the contract pins to each state.
    pub fn baseline_progress(self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Analyzing => 5,
            JobState::Extracting => 25,
            JobState::Comparing => 75,
            JobState::NeedsReview => 80,
            JobState::Arbitrated => 90,
            JobState::Completed | JobState::Failed | JobState::Timeout => 100,
        }
    }

    /// Legal forward edges of the state machine. Terminal states accept
    /// nothing; `Failed`/`Timeout` are reachable from any live state.
    pub fn can_transition_to(self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(next, JobState::Failed | JobState::Timeout) {
            return true;
        }
        matches!(
            (self, next),
            (JobState::Pending, JobState::Analyzing)
                | (JobState::Analyzing, JobState::Extracting)
                | (JobState::Extracting, JobState::Comparing)
                | (JobState::Extracting, JobState::Completed)
                | (JobState::Comparing, JobState::Completed)
                | (JobState::Comparing, JobState::NeedsReview)
                | (JobState::NeedsReview, JobState::Arbitrated)
                | (JobState::Arbitrated, JobState::Completed)
        )
    }
}

/// User-selected routing strategy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Strategy {
    Fallback,
    ParallelLocal,
    ParallelAll,
    Hybrid,
}

/// Error record surfaced through `status.last_error` and the webhook payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Per-extractor run statistics inside the aggregation report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorRunStats {
    pub success: bool,
    pub confidence: f32,
    pub elapsed_ms: u64,
    pub char_count: usize,
}

/// Summary of a multi-extractor run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationReport {
    pub extractor_count: usize,
    pub successful_count: usize,
    pub failed_count: usize,
    pub average_confidence: f32,
    pub total_elapsed_ms: u64,
    pub selected_extractor: Option<String>,
    pub extractors: BTreeMap<String, ExtractorRunStats>,
}

/// Mutable annotations accumulated while a job runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Strategy actually executed after downgrades and degradations.
    #[serde(default)]
    pub effective_strategy: Option<Strategy>,
    /// Strategy the resource gate downgraded away from, if any.
    #[serde(default)]
    pub downgraded_from: Option<Strategy>,
    #[serde(default)]
    pub extractors_used: Vec<String>,
    #[serde(default)]
    pub timed_out_extractors: Vec<String>,
    #[serde(default)]
    pub pages: u32,
    #[serde(default)]
    pub tables: usize,
    #[serde(default)]
    pub images: usize,
    #[serde(default)]
    pub selected_confidence: f32,
    #[serde(default)]
    pub webhook_delivered: Option<bool>,
    #[serde(default)]
    pub webhook_attempts: u32,
}

/// Durable record for one job. All mutation goes through `JobTracker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub state: JobState,
    pub progress_pct: u8,
    pub strategy: Strategy,
    #[serde(default)]
    pub requested_extractors: Vec<String>,
    #[serde(default)]
    pub force_complexity: Option<ComplexityClass>,
    pub options: ExtractionOptions,
    #[serde(default)]
    pub callback_url: Option<String>,
    pub source_path: String,
    pub content_hash: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default)]
    pub terminal_at_ms: Option<i64>,
    #[serde(default)]
    pub last_error: Option<JobError>,
    #[serde(default)]
    pub metadata: JobMetadata,
    #[serde(default)]
    pub complexity: Option<crate::services::complexity::ComplexityReport>,
    #[serde(default)]
    pub aggregation: Option<AggregationReport>,
    /// Persisted when the job parks in `NeedsReview`.
    #[serde(default)]
    pub divergences: Vec<Divergence>,
}

impl JobRecord {
    #[must_use]
    pub fn new(
        job_id: impl Into<String>,
        strategy: Strategy,
        options: ExtractionOptions,
        source_path: impl Into<String>,
        content_hash: impl Into<String>,
    ) -> Self {
        let job_id = job_id.into();
        debug_assert!(!job_id.is_empty());
        let now_ms = current_timestamp_ms();
        Self {
            job_id,
            state: JobState::Pending,
            progress_pct: 0,
            strategy,
            requested_extractors: Vec::new(),
            force_complexity: None,
            options,
            callback_url: None,
            source_path: source_path.into(),
            content_hash: content_hash.into(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            terminal_at_ms: None,
            last_error: None,
            metadata: JobMetadata::default(),
            complexity: None,
            aggregation: None,
            divergences: Vec::new(),
        }
    }
}

pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn job_key(job_id: &str) -> String {
    format!("job:{job_id}")
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Encode(#[from] bincode::error::EncodeError),
    #[error(transparent)]
    Decode(#[from] bincode::error::DecodeError),
    #[error("job `{0}` already exists")]
    Duplicate(String),
    #[error("job `{0}` not found")]
    NotFound(String),
    #[error("illegal transition {from:?} -> {to:?} for job `{job_id}`")]
    IllegalTransition {
        job_id: String,
        from: JobState,
        to: JobState,
    },
    #[error("job `{0}` record contended beyond retry budget")]
    Contention(String),
}

impl TrackerError {
    /// Maps onto the error taxonomy where a kind applies.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            TrackerError::Store(_) | TrackerError::Contention(_) => {
                Some(ErrorKind::TransientStateStore)
            }
            _ => None,
        }
    }
}

/// Owns every write to `job:{id}`. Each mutation is a compare-and-swap over
/// the serialized record; stale writers retry and the state machine cannot
/// regress.
#[derive(Clone)]
pub struct JobTracker {
    store: Arc<dyn StateStore>,
}

impl JobTracker {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn create(&self, record: &JobRecord) -> Result<(), TrackerError> {
        let key = job_key(&record.job_id);
        let encoded = encode_to_vec(record, config::standard())?;
        if !self.store.cas(&key, None, &encoded)? {
            return Err(TrackerError::Duplicate(record.job_id.clone()));
        }
        Ok(())
    }

    pub fn read(&self, job_id: &str) -> Result<JobRecord, TrackerError> {
        let raw = self
            .store
            .get(&job_key(job_id))?
            .ok_or_else(|| TrackerError::NotFound(job_id.to_string()))?;
        let (record, _) = decode_from_slice::<JobRecord, _>(&raw, config::standard())?;
        Ok(record)
    }

    /// CAS-retry loop applying `mutate` to a fresh copy of the record.
    ///
    /// `mutate` may reject the update by returning an error; progress can
    /// only grow and terminal states absorb every later mutation attempt.
    pub fn update<F>(&self, job_id: &str, mutate: F) -> Result<JobRecord, TrackerError>
    where
        F: Fn(&mut JobRecord) -> Result<(), TrackerError>,
    {
        let key = job_key(job_id);
        for _ in 0..CAS_MAX_ATTEMPTS {
            let raw = self
                .store
                .get(&key)?
                .ok_or_else(|| TrackerError::NotFound(job_id.to_string()))?;
            let (mut record, _) = decode_from_slice::<JobRecord, _>(&raw, config::standard())?;
            let before_progress = record.progress_pct;

            mutate(&mut record)?;

            record.progress_pct = record.progress_pct.max(before_progress);
            if !record.state.is_terminal() {
                record.progress_pct = record.progress_pct.min(99);
            }
            record.updated_at_ms = current_timestamp_ms();

            let encoded = encode_to_vec(&record, config::standard())?;
            if self.store.cas(&key, Some(&raw), &encoded)? {
                return Ok(record);
            }
            tracing::debug!(job_id, "job record contended, retrying CAS");
        }
        Err(TrackerError::Contention(job_id.to_string()))
    }

    /// Transition to `new_state`, bumping progress to the state's waypoint.
    pub fn update_state(
        &self,
        job_id: &str,
        new_state: JobState,
    ) -> Result<JobRecord, TrackerError> {
        self.update(job_id, |record| {
            if !record.state.can_transition_to(new_state) {
                return Err(TrackerError::IllegalTransition {
                    job_id: record.job_id.clone(),
                    from: record.state,
                    to: new_state,
                });
            }
            record.state = new_state;
            record.progress_pct = record.progress_pct.max(new_state.baseline_progress());
            if new_state.is_terminal() {
                record.progress_pct = 100;
                record.terminal_at_ms = Some(current_timestamp_ms());
            }
            Ok(())
        })
    }

    pub fn update_progress(&self, job_id: &str, pct: u8) -> Result<JobRecord, TrackerError> {
        self.update(job_id, |record| {
            record.progress_pct = record.progress_pct.max(pct.min(100));
            Ok(())
        })
    }

    pub fn set_error(
        &self,
        job_id: &str,
        kind: ErrorKind,
        message: impl Into<String> + Clone,
    ) -> Result<JobRecord, TrackerError> {
        self.update(job_id, move |record| {
            record.last_error = Some(JobError::new(kind, message.clone().into()));
            Ok(())
        })
    }

    /// All stored jobs, optionally filtered by state.
    pub fn list(&self, filter: Option<JobState>) -> Result<Vec<JobRecord>, TrackerError> {
        let mut out = Vec::new();
        for key in self.store.keys_with_prefix("job:")? {
            let Some(raw) = self.store.get(&key)? else {
                continue;
            };
            let (record, _) = decode_from_slice::<JobRecord, _>(&raw, config::standard())?;
            if filter.map(|f| record.state == f).unwrap_or(true) {
                out.push(record);
            }
        }
        out.sort_by_key(|r| r.created_at_ms);
        Ok(out)
    }

    /// Per-state job counts for the CLI overview.
    pub fn counts(&self) -> Result<BTreeMap<String, usize>, TrackerError> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for record in self.list(None)? {
            *counts.entry(record.state.as_ref().to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    pub fn delete(&self, job_id: &str) -> Result<(), TrackerError> {
        self.store.delete(&job_key(job_id))?;
        Ok(())
    }
}

//! Retention sweeper for terminal jobs and expired store entries.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::{AppPaths, PathError};
use crate::services::arbitration::arbitration_key;
use crate::services::jobs::{current_timestamp_ms, JobState, JobTracker, TrackerError};
use crate::services::orchestrator::candidates_key;
use crate::store::{StateStore, StoreError};

const MS_PER_DAY: i64 = 86_400_000;

/// Retention windows per terminal outcome.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub completed_days: u32,
    pub failed_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_days: 7,
            failed_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperReport {
    pub removed_jobs: Vec<String>,
    pub expired_entries: usize,
    pub retained: usize,
}

impl ReaperReport {
    pub fn is_empty(&self) -> bool {
        self.removed_jobs.is_empty() && self.expired_entries == 0
    }
}

#[derive(Debug, Error)]
pub enum ReaperError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error("retention configuration invalid: {0}")]
    InvalidConfig(String),
}

/// Sweep expired TTL entries and destroy terminal jobs past retention.
pub fn reap(
    store: &dyn StateStore,
    tracker: &JobTracker,
    paths: &AppPaths,
    config: &RetentionConfig,
) -> Result<ReaperReport, ReaperError> {
    if config.completed_days == 0 || config.failed_days == 0 {
        return Err(ReaperError::InvalidConfig(
            "retention windows must be at least one day".to_string(),
        ));
    }

    let expired_entries = store.sweep_expired()?;
    let now_ms = current_timestamp_ms();

    let mut removed_jobs = Vec::new();
    let mut retained = 0_usize;

    for record in tracker.list(None)? {
        let Some(terminal_at) = record.terminal_at_ms else {
            retained += 1;
            continue;
        };
        let window_days = match record.state {
            JobState::Completed => config.completed_days,
            JobState::Failed | JobState::Timeout => config.failed_days,
            _ => {
                retained += 1;
                continue;
            }
        };
        let cutoff_ms = now_ms - window_days as i64 * MS_PER_DAY;
        if terminal_at > cutoff_ms {
            retained += 1;
            continue;
        }

        store.delete(&candidates_key(&record.job_id))?;
        store.delete(&arbitration_key(&record.job_id))?;
        tracker.delete(&record.job_id)?;
        if let Ok(dir) = paths.job_output_dir(&record.job_id) {
            if let Err(source) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(
                    job_id = %record.job_id,
                    path = %dir.display(),
                    error = %source,
                    "failed to remove job output directory"
                );
            }
        }
        tracing::info!(job_id = %record.job_id, state = record.state.as_ref(), "reaped job");
        removed_jobs.push(record.job_id);
    }

    Ok(ReaperReport {
        removed_jobs,
        expired_entries,
        retained,
    })
}

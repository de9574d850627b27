//! Control surface: submit, status, result, review, download.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::config::ExtractionConfig;
use crate::extract::ExtractionOptions;
use crate::paths::{AppPaths, PathError};
use crate::services::complexity::ComplexityClass;
use crate::services::jobs::{JobRecord, JobState, JobTracker, Strategy, TrackerError};
use crate::services::orchestrator::JobTask;
use crate::store::{Queue, StoreError};
use crate::text::compare::Divergence;

/// Per-call submission parameters. Everything optional falls back to the
/// deployment configuration (which itself sits on environment defaults).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitRequest {
    pub source_ref: String,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub force_complexity: Option<ComplexityClass>,
    #[serde(default)]
    pub requested_extractors: Vec<String>,
    #[serde(default)]
    pub extract_tables: Option<bool>,
    #[serde(default)]
    pub extract_images: Option<bool>,
    #[serde(default)]
    pub extract_formulas: Option<bool>,
    #[serde(default)]
    pub ocr_languages: Option<Vec<String>>,
    #[serde(default)]
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub job_id: String,
    pub state: JobState,
    pub progress_pct: u8,
    pub updated_at_ms: i64,
    pub last_error: Option<crate::services::jobs::JobError>,
    pub metadata: crate::services::jobs::JobMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewResponse {
    pub job_id: String,
    pub divergences: Vec<Divergence>,
    pub divergence_count: usize,
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("input rejected: {reason}")]
    InputRejected { reason: String },
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("job `{job_id}` is in state {state:?}, expected {expected:?}")]
    WrongState {
        job_id: String,
        state: JobState,
        expected: JobState,
    },
    #[error("unknown artifact `{0}`; expected markdown or metadata")]
    UnknownArtifact(String),
    #[error("failed to read artifact {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Accept-and-enqueue front of the core. Heavy lifting happens in workers.
pub struct Coordinator {
    tracker: JobTracker,
    queue: Arc<dyn Queue>,
    paths: AppPaths,
    extraction: ExtractionConfig,
}

impl Coordinator {
    pub fn new(
        tracker: JobTracker,
        queue: Arc<dyn Queue>,
        paths: AppPaths,
        extraction: ExtractionConfig,
    ) -> Self {
        Self {
            tracker,
            queue,
            paths,
            extraction,
        }
    }

    fn effective_options(&self, request: &SubmitRequest) -> ExtractionOptions {
        let defaults = &self.extraction.default_options;
        ExtractionOptions {
            extract_tables: request.extract_tables.unwrap_or(defaults.extract_tables),
            extract_images: request.extract_images.unwrap_or(defaults.extract_images),
            extract_formulas: request
                .extract_formulas
                .unwrap_or(defaults.extract_formulas),
            ocr_languages: request
                .ocr_languages
                .clone()
                .unwrap_or_else(|| defaults.ocr_languages.clone()),
        }
    }

    fn validate_source(&self, source_ref: &str) -> Result<Vec<u8>, CoordinatorError> {
        let path = Path::new(source_ref);
        if !path.is_file() {
            return Err(CoordinatorError::InputRejected {
                reason: format!("source `{source_ref}` is not a readable file"),
            });
        }
        let is_pdf = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false);
        if !is_pdf {
            return Err(CoordinatorError::InputRejected {
                reason: format!("source `{source_ref}` is not a PDF"),
            });
        }
        let bytes = std::fs::read(path).map_err(|source| CoordinatorError::InputRejected {
            reason: format!("source `{source_ref}` unreadable: {source}"),
        })?;
        if bytes.is_empty() {
            return Err(CoordinatorError::InputRejected {
                reason: "source file is empty".to_string(),
            });
        }
        if bytes.len() as u64 > self.extraction.max_input_bytes {
            return Err(CoordinatorError::InputRejected {
                reason: format!(
                    "source is {} bytes, limit is {}",
                    bytes.len(),
                    self.extraction.max_input_bytes
                ),
            });
        }
        Ok(bytes)
    }

    /// Validate the input, create the durable record, enqueue the task.
    pub fn submit(&self, request: &SubmitRequest) -> Result<String, CoordinatorError> {
        let bytes = self.validate_source(&request.source_ref)?;
        let content_hash = blake3::hash(&bytes).to_hex().to_string();
        let job_id = uuid::Uuid::new_v4().to_string();

        let mut record = JobRecord::new(
            job_id.clone(),
            request.strategy.unwrap_or(self.extraction.default_strategy),
            self.effective_options(request),
            request.source_ref.clone(),
            content_hash,
        );
        record.requested_extractors = request.requested_extractors.clone();
        record.force_complexity = request.force_complexity;
        record.callback_url = request.callback_url.clone();

        self.tracker.create(&record)?;
        let payload = serde_json::to_vec(&JobTask {
            job_id: job_id.clone(),
        })?;
        self.queue.enqueue(&payload)?;
        tracing::info!(
            job_id = %job_id,
            strategy = record.strategy.as_ref(),
            source = %request.source_ref,
            "job submitted"
        );
        Ok(job_id)
    }

    pub fn status(&self, job_id: &str) -> Result<StatusResponse, CoordinatorError> {
        let record = self.tracker.read(job_id)?;
        Ok(StatusResponse {
            job_id: record.job_id,
            state: record.state,
            progress_pct: record.progress_pct,
            updated_at_ms: record.updated_at_ms,
            last_error: record.last_error,
            metadata: record.metadata,
        })
    }

    /// Full result for a completed job. Candidate and divergence detail is
    /// present only when more than one extractor ran.
    pub fn result(&self, job_id: &str) -> Result<serde_json::Value, CoordinatorError> {
        let record = self.tracker.read(job_id)?;
        if record.state != JobState::Completed {
            return Err(CoordinatorError::WrongState {
                job_id: job_id.to_string(),
                state: record.state,
                expected: JobState::Completed,
            });
        }

        let markdown = self.read_artifact_file(job_id, "markdown")?;
        let metadata = self.read_artifact_file(job_id, "metadata")?;
        let metadata: serde_json::Value = serde_json::from_slice(&metadata)?;

        let multi_extractor = record
            .aggregation
            .as_ref()
            .map(|a| a.extractor_count > 1)
            .unwrap_or(false);

        let mut out = json!({
            "job_id": record.job_id,
            "markdown": String::from_utf8_lossy(&markdown),
            "metadata": metadata,
            "complexity": record.complexity,
            "aggregation": record.aggregation,
        });
        if multi_extractor {
            let report = std::fs::read(self.paths.job_report_path(job_id)?).ok();
            if let Some(report) = report {
                let report: serde_json::Value = serde_json::from_slice(&report)?;
                out["all_candidates"] = report["candidates"].clone();
                out["divergences"] = report["divergences"].clone();
            }
        }
        Ok(out)
    }

    /// Divergence set of a job parked for review.
    pub fn review(&self, job_id: &str) -> Result<ReviewResponse, CoordinatorError> {
        let record = self.tracker.read(job_id)?;
        if record.state != JobState::NeedsReview {
            return Err(CoordinatorError::WrongState {
                job_id: job_id.to_string(),
                state: record.state,
                expected: JobState::NeedsReview,
            });
        }
        Ok(ReviewResponse {
            job_id: record.job_id,
            divergence_count: record.divergences.len(),
            divergences: record.divergences,
        })
    }

    pub fn download(&self, job_id: &str, artifact: &str) -> Result<Vec<u8>, CoordinatorError> {
        // Existence check doubles as job validation.
        self.tracker.read(job_id)?;
        self.read_artifact_file(job_id, artifact)
    }

    fn read_artifact_file(&self, job_id: &str, artifact: &str) -> Result<Vec<u8>, CoordinatorError> {
        let path = match artifact {
            "markdown" => self.paths.job_document_path(job_id)?,
            "metadata" => self.paths.job_metadata_path(job_id)?,
            other => return Err(CoordinatorError::UnknownArtifact(other.to_string())),
        };
        std::fs::read(&path).map_err(|source| CoordinatorError::Artifact { path, source })
    }

    pub fn list(&self, state: Option<JobState>) -> Result<Vec<JobRecord>, CoordinatorError> {
        Ok(self.tracker.list(state)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::AppPaths;
    use crate::store::{LmdbQueue, LmdbStateStore, Queue as _};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn coordinator() -> (TempDir, Coordinator, Arc<LmdbQueue>) {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let store = Arc::new(LmdbStateStore::open(&paths).expect("store"));
        let queue = Arc::new(LmdbQueue::with_env(store.env_handle()).expect("queue"));
        let coordinator = Coordinator::new(
            JobTracker::new(store),
            queue.clone(),
            paths,
            ExtractionConfig::default(),
        );
        (temp, coordinator, queue)
    }

    fn write_pdf(dir: &Path, name: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, b"%PDF-1.7 minimal").expect("write pdf");
        path.display().to_string()
    }

    #[test]
    fn submit_creates_record_and_enqueues() {
        let (temp, coordinator, queue) = coordinator();
        let source = write_pdf(temp.path(), "in.pdf");

        let job_id = coordinator
            .submit(&SubmitRequest {
                source_ref: source,
                strategy: Some(Strategy::ParallelLocal),
                callback_url: Some("https://example.com/cb".to_string()),
                ..SubmitRequest::default()
            })
            .expect("submit");

        let status = coordinator.status(&job_id).expect("status");
        assert_eq!(status.state, JobState::Pending);
        assert_eq!(status.progress_pct, 0);
        assert_eq!(queue.pending_len().expect("len"), 1);
    }

    #[test]
    fn non_pdf_and_missing_sources_are_rejected() {
        let (temp, coordinator, queue) = coordinator();

        let err = coordinator
            .submit(&SubmitRequest {
                source_ref: "/nonexistent/file.pdf".to_string(),
                ..SubmitRequest::default()
            })
            .expect_err("missing file");
        assert!(matches!(err, CoordinatorError::InputRejected { .. }));

        let txt = temp.path().join("note.txt");
        std::fs::write(&txt, b"hello").expect("write");
        let err = coordinator
            .submit(&SubmitRequest {
                source_ref: txt.display().to_string(),
                ..SubmitRequest::default()
            })
            .expect_err("wrong type");
        assert!(matches!(err, CoordinatorError::InputRejected { .. }));

        assert_eq!(queue.pending_len().expect("len"), 0);
    }

    #[test]
    fn per_call_options_override_defaults() {
        let (temp, coordinator, _queue) = coordinator();
        let source = write_pdf(temp.path(), "in.pdf");

        let job_id = coordinator
            .submit(&SubmitRequest {
                source_ref: source,
                extract_tables: Some(false),
                ocr_languages: Some(vec!["pl".to_string()]),
                ..SubmitRequest::default()
            })
            .expect("submit");

        let record = coordinator.list(None).expect("list");
        let record = record.iter().find(|r| r.job_id == job_id).expect("record");
        assert!(!record.options.extract_tables);
        assert!(record.options.extract_images);
        assert_eq!(record.options.ocr_languages, vec!["pl".to_string()]);
    }

    #[test]
    fn review_requires_needs_review_state() {
        let (temp, coordinator, _queue) = coordinator();
        let source = write_pdf(temp.path(), "in.pdf");
        let job_id = coordinator
            .submit(&SubmitRequest {
                source_ref: source,
                ..SubmitRequest::default()
            })
            .expect("submit");

        let err = coordinator.review(&job_id).expect_err("pending job");
        assert!(matches!(err, CoordinatorError::WrongState { .. }));
    }
}

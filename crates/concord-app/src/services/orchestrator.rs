//! The job state machine, driven end-to-end by one worker at a time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bincode::config;
use bincode::serde::{decode_from_slice, encode_to_vec};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;

use crate::extract::{CandidateExtraction, ErrorKind, Extractor};
use crate::paths::{AppPaths, PathError};
use crate::services::arbitration::arbitration_key;
use crate::services::complexity::{ComplexityAnalyzer, ComplexityClass, ComplexityError};
use crate::services::executor::ParallelExecutor;
use crate::services::gate::ResourceGate;
use crate::services::jobs::{
    AggregationReport, ExtractorRunStats, JobRecord, JobState, JobTracker, Strategy, TrackerError,
};
use crate::services::registry::ExtractorRegistry;
use crate::services::webhook::{WebhookDispatcher, WebhookEvent};
use crate::store::{Queue, StateStore, StoreError};
use crate::text::compare::{compare, ComparatorConfig, ComparisonOutcome};
use crate::text::merge::{merge, ManualChoice, MergePolicy, MergedDocument};
use crate::text::normalize::normalize_candidate;

pub fn candidates_key(job_id: &str) -> String {
    format!("candidates:{job_id}")
}

/// Queue message carrying one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTask {
    pub job_id: String,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Wall-clock bound for one job.
    pub job_timeout: Duration,
    pub comparator: ComparatorConfig,
    /// Policy applied when comparing completes without hard divergences.
    pub default_policy: MergePolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(600),
            comparator: ComparatorConfig::default(),
            default_policy: MergePolicy::HighestConfidence,
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Complexity(#[from] ComplexityError),
    #[error(transparent)]
    Compare(#[from] crate::text::compare::CompareError),
    #[error(transparent)]
    Merge(#[from] crate::text::merge::MergeError),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    Encode(#[from] bincode::error::EncodeError),
    #[error(transparent)]
    Decode(#[from] bincode::error::DecodeError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to write artifact {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Drives one job from dequeue to a terminal state, resuming from whatever
/// state the record last persisted.
pub struct Orchestrator {
    tracker: JobTracker,
    store: Arc<dyn StateStore>,
    registry: ExtractorRegistry,
    analyzer: ComplexityAnalyzer,
    gate: ResourceGate,
    executor: ParallelExecutor,
    webhook: WebhookDispatcher,
    paths: AppPaths,
    config: OrchestratorConfig,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tracker: JobTracker,
        store: Arc<dyn StateStore>,
        registry: ExtractorRegistry,
        analyzer: ComplexityAnalyzer,
        gate: ResourceGate,
        executor: ParallelExecutor,
        webhook: WebhookDispatcher,
        paths: AppPaths,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            tracker,
            store,
            registry,
            analyzer,
            gate,
            executor,
            webhook,
            paths,
            config,
        }
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    /// Run one job to a resting state (terminal or `NeedsReview`).
    ///
    /// Redelivery of an already-terminal job is a no-op; a job in any other
    /// state resumes from its persisted position.
    pub async fn run_job(&self, job_id: &str) -> Result<(), OrchestratorError> {
        let record = self.tracker.read(job_id)?;
        if record.state.is_terminal() {
            tracing::debug!(job_id, state = record.state.as_ref(), "redelivery for terminal job ignored");
            return Ok(());
        }

        let deadline = Instant::now() + self.config.job_timeout;
        match self.drive(job_id, deadline).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!(job_id, error = %err, "job failed with unrecoverable error");
                self.fail(job_id, error_kind_of(&err), err.to_string()).await?;
                Ok(())
            }
        }
    }

    async fn drive(&self, job_id: &str, deadline: Instant) -> Result<(), OrchestratorError> {
        loop {
            let record = self.tracker.read(job_id)?;
            if Instant::now() >= deadline && !record.state.is_terminal() {
                return self.timeout(job_id).await;
            }

            match record.state {
                JobState::Pending => {
                    self.tracker.update_state(job_id, JobState::Analyzing)?;
                }
                JobState::Analyzing => {
                    self.analyze(&record)?;
                }
                JobState::Extracting => {
                    self.extract(&record, deadline).await?;
                }
                JobState::Comparing => {
                    self.compare_and_settle(&record).await?;
                }
                JobState::NeedsReview => {
                    // Parked for arbitration; nothing to do until choices
                    // arrive through the arbitration service.
                    return Ok(());
                }
                JobState::Arbitrated => {
                    self.apply_arbitration(&record).await?;
                }
                JobState::Completed | JobState::Failed | JobState::Timeout => {
                    return Ok(());
                }
            }
        }
    }

    fn analyze(&self, record: &JobRecord) -> Result<(), OrchestratorError> {
        let report = self.analyzer.analyze(
            std::path::Path::new(&record.source_path),
            &record.options,
            record.force_complexity,
        )?;
        tracing::info!(
            job_id = %record.job_id,
            score = report.score,
            class = report.class.as_ref(),
            cached = report.cached,
            "complexity classified"
        );
        self.tracker.update(&record.job_id, |r| {
            r.complexity = Some(report.clone());
            Ok(())
        })?;
        self.tracker.update_state(&record.job_id, JobState::Extracting)?;
        Ok(())
    }

    /// Pipeline selection per strategy and complexity class.
    async fn extract(&self, record: &JobRecord, deadline: Instant) -> Result<(), OrchestratorError> {
        let class = record
            .complexity
            .as_ref()
            .map(|c| c.class)
            .unwrap_or(ComplexityClass::Medium);

        let mut strategy = if class == ComplexityClass::Simple {
            Strategy::Fallback
        } else {
            record.strategy
        };

        if strategy != Strategy::Fallback {
            let (admitted, downgrade) = self.gate.admit(strategy);
            if let Some(downgrade) = downgrade {
                self.tracker.update(&record.job_id, |r| {
                    r.metadata.downgraded_from = Some(downgrade.from);
                    Ok(())
                })?;
            }
            strategy = admitted;
        }

        let mut pool = self.extractor_pool(record, strategy);

        // Parallel strategies need at least two candidates to compare.
        if strategy != Strategy::Fallback && pool.len() < 2 {
            tracing::warn!(
                job_id = %record.job_id,
                strategy = strategy.as_ref(),
                available = pool.len(),
                "not enough extractors for parallel run, degrading to fallback"
            );
            strategy = Strategy::Fallback;
            pool = self.extractor_pool(record, strategy);
        }

        self.tracker.update(&record.job_id, |r| {
            r.metadata.effective_strategy = Some(strategy);
            Ok(())
        })?;

        if pool.is_empty() {
            self.fail(
                &record.job_id,
                ErrorKind::ExtractorUnavailable,
                "no extractor passed the availability gate",
            )
            .await?;
            return Ok(());
        }

        match strategy {
            Strategy::Fallback => self.run_fallback(record, pool, deadline).await,
            Strategy::ParallelLocal | Strategy::ParallelAll | Strategy::Hybrid => {
                self.run_parallel(record, pool, deadline).await
            }
        }
    }

    fn extractor_pool(&self, record: &JobRecord, strategy: Strategy) -> Vec<Arc<dyn Extractor>> {
        if !record.requested_extractors.is_empty() {
            let (resolved, missing) = self.registry.resolve_requested(&record.requested_extractors);
            if !missing.is_empty() {
                tracing::warn!(
                    job_id = %record.job_id,
                    missing = ?missing,
                    "requested extractors unavailable"
                );
            }
            return resolved;
        }
        match strategy {
            Strategy::Fallback | Strategy::ParallelAll => self.registry.ordered_available(),
            Strategy::ParallelLocal | Strategy::Hybrid => self.registry.ordered_available_local(),
        }
    }

    /// Sequential pass: first success wins, every failure is recorded.
    async fn run_fallback(
        &self,
        record: &JobRecord,
        pool: Vec<Arc<dyn Extractor>>,
        deadline: Instant,
    ) -> Result<(), OrchestratorError> {
        let mut last_failure: Option<CandidateExtraction> = None;

        for extractor in pool {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return self.timeout(&record.job_id).await;
            };
            let candidates = match tokio::time::timeout(
                remaining,
                self.executor
                    .run(&[extractor.clone()], std::path::Path::new(&record.source_path), &record.options),
            )
            .await
            {
                Ok(candidates) => candidates,
                Err(_) => return self.timeout(&record.job_id).await,
            };
            let Some(candidate) = candidates.into_iter().next() else {
                continue;
            };

            if candidate.success {
                tracing::info!(
                    job_id = %record.job_id,
                    extractor = %candidate.extractor_name,
                    confidence = candidate.confidence,
                    "fallback succeeded"
                );
                let normalized = normalize_candidate(candidate);
                self.persist_candidates(&record.job_id, &[normalized.clone()])?;
                self.complete_with(record, vec![normalized], None, "single_extractor")
                    .await?;
                return Ok(());
            }

            tracing::warn!(
                job_id = %record.job_id,
                extractor = %candidate.extractor_name,
                error = candidate.error_message.as_deref().unwrap_or("unknown"),
                "fallback extractor failed, trying next"
            );
            if candidate.error_kind == Some(ErrorKind::ExtractorTimeout) {
                self.tracker.update(&record.job_id, |r| {
                    let name = candidate.extractor_name.clone();
                    if !r.metadata.timed_out_extractors.contains(&name) {
                        r.metadata.timed_out_extractors.push(name);
                    }
                    Ok(())
                })?;
            }
            last_failure = Some(candidate);
        }

        let message = last_failure
            .as_ref()
            .and_then(|c| c.error_message.clone())
            .unwrap_or_else(|| "all extractors in fallback chain failed".to_string());
        let kind = last_failure
            .as_ref()
            .and_then(|c| c.error_kind)
            .unwrap_or(ErrorKind::ExtractorUnavailable);
        self.fail(&record.job_id, kind, message).await?;
        Ok(())
    }

    /// Concurrent pass followed by the comparing phase.
    async fn run_parallel(
        &self,
        record: &JobRecord,
        pool: Vec<Arc<dyn Extractor>>,
        deadline: Instant,
    ) -> Result<(), OrchestratorError> {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return self.timeout(&record.job_id).await;
        };

        let run = self
            .executor
            .run(&pool, std::path::Path::new(&record.source_path), &record.options);
        let candidates = match tokio::time::timeout(remaining, run).await {
            Ok(candidates) => candidates,
            Err(_) => return self.timeout(&record.job_id).await,
        };

        let timed_out: Vec<String> = candidates
            .iter()
            .filter(|c| c.error_kind == Some(ErrorKind::ExtractorTimeout))
            .map(|c| c.extractor_name.clone())
            .collect();
        if !timed_out.is_empty() {
            self.tracker.update(&record.job_id, |r| {
                for name in &timed_out {
                    if !r.metadata.timed_out_extractors.contains(name) {
                        r.metadata.timed_out_extractors.push(name.clone());
                    }
                }
                Ok(())
            })?;
        }

        let normalized: Vec<CandidateExtraction> =
            candidates.into_iter().map(normalize_candidate).collect();
        let successful = normalized.iter().filter(|c| c.success).count();

        if successful == 0 {
            let message = normalized
                .iter()
                .filter_map(|c| c.error_message.as_deref())
                .collect::<Vec<_>>()
                .join("; ");
            // parallel_local falls back to the remote extractor when the
            // whole local pool came up empty.
            if record.strategy == Strategy::ParallelLocal {
                if let Some(remote) = self.registry.available_remote() {
                    tracing::warn!(
                        job_id = %record.job_id,
                        "all local extractors failed, falling back to remote"
                    );
                    return self.run_fallback(record, vec![remote], deadline).await;
                }
            }
            self.fail(
                &record.job_id,
                ErrorKind::ExtractorError,
                if message.is_empty() {
                    "all parallel extractors failed".to_string()
                } else {
                    message
                },
            )
            .await?;
            return Ok(());
        }

        self.persist_candidates(&record.job_id, &normalized)?;
        self.tracker.update(&record.job_id, |r| {
            r.aggregation = Some(aggregate(&normalized));
            Ok(())
        })?;
        self.tracker.update_state(&record.job_id, JobState::Comparing)?;
        Ok(())
    }

    /// Compare candidates and settle into COMPLETED or NEEDS_REVIEW.
    async fn compare_and_settle(&self, record: &JobRecord) -> Result<(), OrchestratorError> {
        let mut candidates = self.load_candidates(&record.job_id)?;
        let successful: Vec<CandidateExtraction> =
            candidates.iter().filter(|c| c.success).cloned().collect();

        if successful.len() < 2 {
            // A lone survivor has nothing to diverge from.
            self.complete_with(record, successful, None, "single_extractor")
                .await?;
            return Ok(());
        }

        let mut comparison = compare(&record.job_id, &successful, &self.config.comparator)?;

        // Hybrid: a hard divergence conscripts the remote extractor and the
        // whole set is re-compared with it included.
        if record.strategy == Strategy::Hybrid
            && comparison.has_hard_divergences()
            && !candidates.iter().any(|c| {
                self.registry
                    .available_remote()
                    .map(|r| r.name() == c.extractor_name)
                    .unwrap_or(false)
            })
        {
            if let Some(remote) = self.registry.available_remote() {
                tracing::info!(
                    job_id = %record.job_id,
                    remote = remote.name(),
                    "hybrid escalation: invoking remote extractor"
                );
                let extra = self
                    .executor
                    .run(
                        &[remote],
                        std::path::Path::new(&record.source_path),
                        &record.options,
                    )
                    .await;
                if let Some(candidate) = extra.into_iter().next() {
                    candidates.push(normalize_candidate(candidate));
                    self.persist_candidates(&record.job_id, &candidates)?;
                    self.tracker.update(&record.job_id, |r| {
                        r.aggregation = Some(aggregate(&candidates));
                        Ok(())
                    })?;
                    let successful: Vec<CandidateExtraction> =
                        candidates.iter().filter(|c| c.success).cloned().collect();
                    if successful.len() >= 2 {
                        comparison = compare(&record.job_id, &successful, &self.config.comparator)?;
                    }
                }
            }
        }

        let successful: Vec<CandidateExtraction> =
            candidates.iter().filter(|c| c.success).cloned().collect();

        if comparison.has_hard_divergences() {
            let divergences = comparison.divergences.clone();
            tracing::info!(
                job_id = %record.job_id,
                divergence_count = divergences.len(),
                "hard divergences found, parking for review"
            );
            self.tracker.update(&record.job_id, |r| {
                r.divergences = divergences.clone();
                Ok(())
            })?;
            let parked = self
                .tracker
                .update_state(&record.job_id, JobState::NeedsReview)?;
            self.notify(WebhookEvent::NeedsReview, &parked).await?;
            return Ok(());
        }

        let priorities = priorities_of(&successful, &self.registry);
        let outcome = merge(
            &successful,
            &priorities,
            &comparison,
            &self.config.default_policy,
        )?;
        debug_assert!(!outcome.needs_review);

        let merged = MergedDocument {
            markdown: outcome.markdown,
            policy: self.config.default_policy.name().to_string(),
            resolutions: outcome.resolutions,
        };
        self.complete_merged(record, &successful, Some(&comparison), merged)
            .await?;
        Ok(())
    }

    /// Apply stored arbitration choices and finish the job.
    async fn apply_arbitration(&self, record: &JobRecord) -> Result<(), OrchestratorError> {
        let raw = self
            .store
            .get(&arbitration_key(&record.job_id))?
            .ok_or_else(|| TrackerError::NotFound(format!("arbitration:{}", record.job_id)))
            .map_err(OrchestratorError::Tracker)?;
        let (choices, _): (std::collections::BTreeMap<String, ManualChoice>, _) =
            decode_from_slice(&raw, config::standard())?;

        let candidates = self.load_candidates(&record.job_id)?;
        let successful: Vec<CandidateExtraction> =
            candidates.iter().filter(|c| c.success).cloned().collect();
        let comparison = compare(&record.job_id, &successful, &self.config.comparator)?;
        let priorities = priorities_of(&successful, &self.registry);

        let outcome = merge(
            &successful,
            &priorities,
            &comparison,
            &MergePolicy::Manual(choices),
        )?;
        let merged = MergedDocument {
            markdown: outcome.markdown,
            policy: "MANUAL".to_string(),
            resolutions: outcome.resolutions,
        };
        self.complete_merged(record, &successful, Some(&comparison), merged)
            .await?;
        Ok(())
    }

    async fn complete_with(
        &self,
        record: &JobRecord,
        successful: Vec<CandidateExtraction>,
        comparison: Option<&ComparisonOutcome>,
        policy: &str,
    ) -> Result<(), OrchestratorError> {
        let Some(best) = successful.first() else {
            self.fail(
                &record.job_id,
                ErrorKind::ExtractorError,
                "no successful extraction to finalize",
            )
            .await?;
            return Ok(());
        };
        let merged = MergedDocument {
            markdown: best.markdown.clone(),
            policy: policy.to_string(),
            resolutions: Default::default(),
        };
        self.complete_merged(record, &successful, comparison, merged)
            .await
    }

    /// Write artifacts, finalize the record, fire the webhook.
    async fn complete_merged(
        &self,
        record: &JobRecord,
        successful: &[CandidateExtraction],
        comparison: Option<&ComparisonOutcome>,
        merged: MergedDocument,
    ) -> Result<(), OrchestratorError> {
        let priorities = priorities_of(successful, &self.registry);
        let selected = crate::text::compare::preferred_candidate(
            successful,
            &priorities,
            &(0..successful.len()).collect::<Vec<_>>(),
        );
        let selected = selected.map(|idx| &successful[idx]);

        self.write_artifacts(record, successful, comparison, &merged)?;

        // A parallel run already recorded the full aggregation (failures
        // included); only the fallback path builds it here.
        let fallback_aggregation = aggregate(successful);
        let selected_name = selected.map(|c| c.extractor_name.clone());
        self.tracker.update(&record.job_id, |r| {
            let mut aggregation = r
                .aggregation
                .clone()
                .unwrap_or_else(|| fallback_aggregation.clone());
            aggregation.selected_extractor = selected_name.clone();
            r.aggregation = Some(aggregation);
            r.metadata.extractors_used = successful
                .iter()
                .map(|c| c.extractor_name.clone())
                .collect();
            if let Some(best) = selected {
                r.metadata.selected_confidence = best.confidence;
                r.metadata.pages = best.page_count;
                r.metadata.tables = best.tables.len();
                r.metadata.images = best.images.len();
            }
            Ok(())
        })?;

        let finished = self.tracker.update_state(&record.job_id, JobState::Completed)?;
        tracing::info!(job_id = %record.job_id, "job completed");
        self.notify(WebhookEvent::Completed, &finished).await?;
        Ok(())
    }

    async fn fail(
        &self,
        job_id: &str,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        let message = message.into();
        let current = self.tracker.read(job_id)?;
        if current.state.is_terminal() {
            return Ok(());
        }
        self.tracker.set_error(job_id, kind, message.clone())?;
        let record = self.tracker.update_state(job_id, JobState::Failed)?;
        tracing::error!(job_id, kind = kind.as_ref(), message, "job failed");
        self.notify(WebhookEvent::Failed, &record).await?;
        Ok(())
    }

    async fn timeout(&self, job_id: &str) -> Result<(), OrchestratorError> {
        let current = self.tracker.read(job_id)?;
        if current.state.is_terminal() {
            return Ok(());
        }
        self.tracker
            .set_error(job_id, ErrorKind::JobTimeout, "job exceeded wall-clock budget")?;
        let record = self.tracker.update_state(job_id, JobState::Timeout)?;
        tracing::error!(job_id, "job timed out");
        self.notify(WebhookEvent::Timeout, &record).await?;
        Ok(())
    }

    async fn notify(&self, event: WebhookEvent, record: &JobRecord) -> Result<(), OrchestratorError> {
        if record.callback_url.is_none() {
            return Ok(());
        }
        let outcome = self.webhook.dispatch(event, record).await;
        self.tracker.update(&record.job_id, |r| {
            r.metadata.webhook_delivered = Some(outcome.delivered);
            r.metadata.webhook_attempts = outcome.attempts;
            if !outcome.delivered {
                // Recorded, but the job never leaves its terminal state.
                if r.last_error.is_none() {
                    r.last_error = Some(crate::services::jobs::JobError::new(
                        ErrorKind::WebhookDeliveryFailed,
                        format!("webhook delivery failed after {} attempts", outcome.attempts),
                    ));
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    fn persist_candidates(
        &self,
        job_id: &str,
        candidates: &[CandidateExtraction],
    ) -> Result<(), OrchestratorError> {
        let encoded = encode_to_vec(candidates, config::standard())?;
        self.store.set(&candidates_key(job_id), &encoded, None)?;
        Ok(())
    }

    pub(crate) fn load_candidates(
        &self,
        job_id: &str,
    ) -> Result<Vec<CandidateExtraction>, OrchestratorError> {
        let raw = self
            .store
            .get(&candidates_key(job_id))?
            .ok_or_else(|| TrackerError::NotFound(format!("candidates:{job_id}")))
            .map_err(OrchestratorError::Tracker)?;
        let (candidates, _) = decode_from_slice(&raw, config::standard())?;
        Ok(candidates)
    }

    fn write_artifacts(
        &self,
        record: &JobRecord,
        successful: &[CandidateExtraction],
        comparison: Option<&ComparisonOutcome>,
        merged: &MergedDocument,
    ) -> Result<(), OrchestratorError> {
        let document_path = self.paths.job_document_path(&record.job_id)?;
        write_file(&document_path, merged.markdown.as_bytes())?;

        let best = successful.first();
        let metadata = json!({
            "job_id": &record.job_id,
            "strategy": record.strategy.as_ref(),
            "policy": &merged.policy,
            "complexity": &record.complexity,
            "metrics": best.map(|c| json!({
                "total_chars": c.markdown.len(),
                "total_lines": c.markdown.lines().count(),
                "table_count": c.tables.len(),
                "image_count": c.images.len(),
                "elapsed_ms": c.elapsed_ms,
                "elapsed_ms_per_page": if c.page_count > 0 {
                    c.elapsed_ms / c.page_count as u64
                } else {
                    c.elapsed_ms
                },
                "confidence": c.confidence,
            })),
        });
        let metadata_path = self.paths.job_metadata_path(&record.job_id)?;
        write_file(&metadata_path, serde_json::to_vec_pretty(&metadata)?.as_slice())?;

        let report = json!({
            "job_id": &record.job_id,
            "candidates": successful,
            "divergences": comparison.map(|c| c.divergences.as_slice()).unwrap_or_default(),
            "resolutions": &merged.resolutions,
            "aggregation": aggregate(successful),
        });
        let report_path = self.paths.job_report_path(&record.job_id)?;
        write_file(&report_path, serde_json::to_vec_pretty(&report)?.as_slice())?;
        Ok(())
    }
}

fn write_file(path: &std::path::Path, bytes: &[u8]) -> Result<(), OrchestratorError> {
    std::fs::write(path, bytes).map_err(|source| OrchestratorError::Artifact {
        path: path.to_path_buf(),
        source,
    })
}

fn error_kind_of(err: &OrchestratorError) -> ErrorKind {
    match err {
        OrchestratorError::Complexity(ComplexityError::Io { .. }) => ErrorKind::InputRejected,
        OrchestratorError::Complexity(_) => ErrorKind::InputRejected,
        OrchestratorError::Compare(_) => ErrorKind::ComparatorError,
        OrchestratorError::Merge(_) => ErrorKind::MergeUnresolved,
        OrchestratorError::Tracker(t) => t.kind().unwrap_or(ErrorKind::TransientStateStore),
        OrchestratorError::Store(_) => ErrorKind::TransientStateStore,
        _ => ErrorKind::ComparatorError,
    }
}

/// Priority per candidate, looked up from the registry (unknown names sink).
fn priorities_of(candidates: &[CandidateExtraction], registry: &ExtractorRegistry) -> Vec<u8> {
    candidates
        .iter()
        .map(|c| {
            registry
                .get(&c.extractor_name)
                .map(|e| e.priority())
                .unwrap_or(u8::MAX)
        })
        .collect()
}

/// Aggregation summary over all candidates of a run.
pub fn aggregate(candidates: &[CandidateExtraction]) -> AggregationReport {
    let successful: Vec<&CandidateExtraction> =
        candidates.iter().filter(|c| c.success).collect();
    let average_confidence = if successful.is_empty() {
        0.0
    } else {
        successful.iter().map(|c| c.confidence).sum::<f32>() / successful.len() as f32
    };
    AggregationReport {
        extractor_count: candidates.len(),
        successful_count: successful.len(),
        failed_count: candidates.len() - successful.len(),
        average_confidence,
        total_elapsed_ms: candidates.iter().map(|c| c.elapsed_ms).sum(),
        selected_extractor: None,
        extractors: candidates
            .iter()
            .map(|c| {
                (
                    c.extractor_name.clone(),
                    ExtractorRunStats {
                        success: c.success,
                        confidence: c.confidence,
                        elapsed_ms: c.elapsed_ms,
                        char_count: c.markdown.len(),
                    },
                )
            })
            .collect(),
    }
}

/// Single-tasked worker: dequeue, re-read state, drive, ack.
pub struct Worker {
    queue: Arc<dyn Queue>,
    orchestrator: Arc<Orchestrator>,
    poll_interval: Duration,
    /// Must be at least the job timeout so a live worker never loses its lease.
    visibility: Duration,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn Queue>,
        orchestrator: Arc<Orchestrator>,
        poll_interval: Duration,
        visibility: Duration,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            poll_interval,
            visibility,
        }
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.poll_once().await {
                Ok(true) => continue,
                Ok(false) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "worker poll failed");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
        tracing::info!("worker stopped");
    }

    /// Process at most one task. Returns whether anything was dequeued.
    pub async fn poll_once(&self) -> Result<bool, OrchestratorError> {
        let Some((task, lease)) = self.queue.dequeue(self.visibility)? else {
            return Ok(false);
        };
        let parsed: JobTask = match serde_json::from_slice(&task.payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::error!(error = %err, "dropping malformed queue payload");
                self.queue.ack(&lease)?;
                return Ok(true);
            }
        };

        tracing::info!(job_id = %parsed.job_id, delivery = task.delivery_count, "task dequeued");
        match self.orchestrator.run_job(&parsed.job_id).await {
            Ok(()) => {
                self.queue.ack(&lease)?;
            }
            Err(err) => {
                tracing::error!(job_id = %parsed.job_id, error = %err, "job run errored, returning task");
                self.queue.nack(&lease)?;
            }
        }
        Ok(true)
    }
}

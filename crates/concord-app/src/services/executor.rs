//! Bounded parallel fan-out over extractors.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::extract::{CandidateExtraction, ErrorKind, ExtractionOptions, Extractor};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Concurrent extractor ceiling.
    pub max_concurrent: usize,
    /// Individual deadline applied to every extractor task.
    pub per_extractor_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            per_extractor_timeout: Duration::from_secs(300),
        }
    }
}

/// Classified outcome of one extractor task.
#[derive(Debug, Clone)]
pub enum ExtractorOutcome {
    Success,
    Error,
    Timeout,
}

impl ExtractorOutcome {
    pub fn of(candidate: &CandidateExtraction) -> Self {
        if candidate.success {
            ExtractorOutcome::Success
        } else if candidate.error_kind == Some(ErrorKind::ExtractorTimeout) {
            ExtractorOutcome::Timeout
        } else {
            ExtractorOutcome::Error
        }
    }
}

/// Runs up to `max_concurrent` extractors at once, one timeout per task.
///
/// The run returns only when every task resolved; a failing or timing-out
/// task never cancels its siblings. Returned candidates keep the caller's
/// (priority) order. Cancelling the job as a whole is done by dropping the
/// returned future, which aborts the in-flight tasks.
pub struct ParallelExecutor {
    config: ExecutorConfig,
}

impl ParallelExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        debug_assert!(config.max_concurrent >= 1);
        Self { config }
    }

    pub async fn run(
        &self,
        extractors: &[Arc<dyn Extractor>],
        file_path: &std::path::Path,
        options: &ExtractionOptions,
    ) -> Vec<CandidateExtraction> {
        if extractors.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let timeout = self.config.per_extractor_timeout;
        let mut join_set: JoinSet<(usize, CandidateExtraction)> = JoinSet::new();

        for (index, extractor) in extractors.iter().enumerate() {
            let extractor = extractor.clone();
            let semaphore = semaphore.clone();
            let file_path: PathBuf = file_path.to_path_buf();
            let options = options.clone();
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("executor semaphore never closes");
                let name = extractor.name().to_string();
                let version = extractor.version().to_string();
                tracing::debug!(extractor = %name, "extractor task starting");

                let candidate =
                    match tokio::time::timeout(timeout, extractor.extract(&file_path, &options))
                        .await
                    {
                        Ok(candidate) => candidate,
                        Err(_) => {
                            tracing::warn!(
                                extractor = %name,
                                timeout_s = timeout.as_secs(),
                                "extractor timed out"
                            );
                            CandidateExtraction::failure(
                                name,
                                version,
                                ErrorKind::ExtractorTimeout,
                                format!("exceeded per-extractor timeout of {}s", timeout.as_secs()),
                            )
                        }
                    };
                (index, candidate)
            });
        }

        let mut slots: Vec<Option<CandidateExtraction>> = vec![None; extractors.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, candidate)) => slots[index] = Some(candidate),
                Err(join_error) => {
                    // A panicked task is an extractor error, not a crash of
                    // the whole run; the slot is filled below.
                    tracing::error!(error = %join_error, "extractor task panicked");
                }
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    CandidateExtraction::failure(
                        extractors[index].name(),
                        extractors[index].version(),
                        ErrorKind::ExtractorError,
                        "extractor task aborted",
                    )
                })
            })
            .collect()
    }
}

//! Terminal-event delivery with bounded retry.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde_json::json;
use thiserror::Error;

use crate::services::jobs::{current_timestamp_ms, JobRecord, JobState};

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Total delivery attempts (first try included).
    pub attempts: u32,
    /// First retry delay; subsequent delays double.
    pub base_delay: Duration,
    pub request_timeout: Duration,
    /// Public base for result/download URLs in payloads. Relative paths are
    /// emitted when unset.
    pub public_base_url: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            public_base_url: None,
        }
    }
}

/// Terminal events a job can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEvent {
    Completed,
    Failed,
    NeedsReview,
    Timeout,
}

impl WebhookEvent {
    pub fn for_state(state: JobState) -> Option<Self> {
        match state {
            JobState::Completed => Some(WebhookEvent::Completed),
            JobState::Failed => Some(WebhookEvent::Failed),
            JobState::NeedsReview => Some(WebhookEvent::NeedsReview),
            JobState::Timeout => Some(WebhookEvent::Timeout),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            WebhookEvent::Completed => "extraction.completed",
            WebhookEvent::Failed => "extraction.failed",
            WebhookEvent::NeedsReview => "extraction.needs_review",
            WebhookEvent::Timeout => "extraction.timeout",
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone)]
pub struct WebhookOutcome {
    pub delivered: bool,
    pub attempts: u32,
    pub last_status: Option<u16>,
}

#[derive(Debug, Error)]
enum DeliveryError {
    #[error("webhook endpoint answered {0}")]
    Status(u16),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Posts terminal events to the job's callback URL.
///
/// Delivery is at-least-once with exponential backoff. Failure after the
/// final attempt is reported to the caller; it never touches job state.
pub struct WebhookDispatcher {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(config: WebhookConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn url_for(&self, job_id: &str, suffix: &str) -> String {
        match &self.config.public_base_url {
            Some(base) => format!("{}/v1/jobs/{job_id}/{suffix}", base.trim_end_matches('/')),
            None => format!("/v1/jobs/{job_id}/{suffix}"),
        }
    }

    /// JSON payload for a terminal event.
    pub fn payload(&self, event: WebhookEvent, job: &JobRecord) -> serde_json::Value {
        json!({
            "event": event.name(),
            "job_id": &job.job_id,
            "timestamp": current_timestamp_ms(),
            "data": {
                "status": job.state.as_ref(),
                "download_url": self.url_for(&job.job_id, "download/markdown"),
                "result_url": self.url_for(&job.job_id, "result"),
                "error": &job.last_error,
                "summary": {
                    "pages": job.metadata.pages,
                    "tables": job.metadata.tables,
                    "images": job.metadata.images,
                    "confidence": job.metadata.selected_confidence,
                    "extraction_strategy": job
                        .metadata
                        .effective_strategy
                        .unwrap_or(job.strategy)
                        .as_ref(),
                    "extractors_used": &job.metadata.extractors_used,
                },
            },
        })
    }

    /// Deliver the event for the job's current state. Returns the outcome;
    /// the caller decides what to record.
    pub async fn dispatch(&self, event: WebhookEvent, job: &JobRecord) -> WebhookOutcome {
        let Some(callback_url) = job.callback_url.clone() else {
            return WebhookOutcome {
                delivered: false,
                attempts: 0,
                last_status: None,
            };
        };

        let payload = self.payload(event, job);
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let last_status = std::sync::atomic::AtomicU16::new(0);

        let send = || {
            let payload = payload.clone();
            let callback_url = callback_url.clone();
            let last_status = &last_status;
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                let response = self.client.post(&callback_url).json(&payload).send().await?;
                let status = response.status();
                last_status.store(status.as_u16(), std::sync::atomic::Ordering::SeqCst);
                if status.is_success() {
                    Ok(())
                } else {
                    Err(DeliveryError::Status(status.as_u16()))
                }
            }
        };

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.base_delay)
            .with_factor(2.0)
            .with_max_times(self.config.attempts.saturating_sub(1) as usize)
            .with_jitter();

        let result = send
            .retry(backoff)
            .notify(|err: &DeliveryError, delay: Duration| {
                tracing::warn!(
                    job_id = %job.job_id,
                    error = %err,
                    retry_in_s = delay.as_secs_f64(),
                    "webhook delivery failed, retrying"
                );
            })
            .await;

        let attempts = attempts.load(std::sync::atomic::Ordering::SeqCst);
        let status = last_status.load(std::sync::atomic::Ordering::SeqCst);
        let last_status = if status == 0 { None } else { Some(status) };

        match result {
            Ok(()) => {
                tracing::info!(job_id = %job.job_id, event = event.name(), attempts, "webhook delivered");
                WebhookOutcome {
                    delivered: true,
                    attempts,
                    last_status,
                }
            }
            Err(err) => {
                tracing::error!(
                    job_id = %job.job_id,
                    event = event.name(),
                    attempts,
                    error = %err,
                    "webhook delivery exhausted"
                );
                WebhookOutcome {
                    delivered: false,
                    attempts,
                    last_status,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractionOptions;
    use crate::services::jobs::Strategy;

    fn job() -> JobRecord {
        let mut job = JobRecord::new(
            "job-wh",
            Strategy::ParallelLocal,
            ExtractionOptions::default(),
            "/tmp/in.pdf",
            "hash",
        );
        job.state = JobState::Completed;
        job.metadata.extractors_used = vec!["docling".to_string(), "mineru".to_string()];
        job.metadata.selected_confidence = 0.92;
        job
    }

    #[test]
    fn event_names_follow_the_contract() {
        assert_eq!(WebhookEvent::Completed.name(), "extraction.completed");
        assert_eq!(WebhookEvent::NeedsReview.name(), "extraction.needs_review");
        assert_eq!(WebhookEvent::for_state(JobState::Timeout), Some(WebhookEvent::Timeout));
        assert_eq!(WebhookEvent::for_state(JobState::Extracting), None);
    }

    #[test]
    fn payload_carries_summary_and_urls() {
        let dispatcher = WebhookDispatcher::new(WebhookConfig {
            public_base_url: Some("https://api.example.com/".to_string()),
            ..WebhookConfig::default()
        });
        let payload = dispatcher.payload(WebhookEvent::Completed, &job());

        assert_eq!(payload["event"], "extraction.completed");
        assert_eq!(payload["job_id"], "job-wh");
        assert_eq!(
            payload["data"]["result_url"],
            "https://api.example.com/v1/jobs/job-wh/result"
        );
        assert_eq!(
            payload["data"]["download_url"],
            "https://api.example.com/v1/jobs/job-wh/download/markdown"
        );
        let summary = &payload["data"]["summary"];
        assert_eq!(summary["extraction_strategy"], "parallel_local");
        assert_eq!(summary["extractors_used"][0], "docling");
    }

    #[tokio::test]
    async fn missing_callback_is_a_quiet_no_op() {
        let dispatcher = WebhookDispatcher::new(WebhookConfig::default());
        let outcome = dispatcher.dispatch(WebhookEvent::Completed, &job()).await;
        assert!(!outcome.delivered);
        assert_eq!(outcome.attempts, 0);
    }
}

//! Webhook delivery behavior against a live mock endpoint.

mod common;

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{harness_with, medium_probe, simple_probe};
use concord_app::extract::{ErrorKind, ExtractionOptions, Extractor, ScriptedExtractor};
use concord_app::services::coordinator::SubmitRequest;
use concord_app::services::jobs::{JobRecord, JobState, Strategy};
use concord_app::services::webhook::{WebhookConfig, WebhookDispatcher, WebhookEvent};

fn fast_config() -> WebhookConfig {
    WebhookConfig {
        attempts: 3,
        base_delay: Duration::from_millis(10),
        request_timeout: Duration::from_secs(2),
        public_base_url: Some("https://concord.example.com".to_string()),
    }
}

fn completed_job(callback_url: &str) -> JobRecord {
    let mut job = JobRecord::new(
        "job-hook",
        Strategy::Fallback,
        ExtractionOptions::default(),
        "/tmp/in.pdf",
        "hash",
    );
    job.state = JobState::Completed;
    job.callback_url = Some(callback_url.to_string());
    job
}

#[tokio::test]
async fn delivery_succeeds_on_first_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = WebhookDispatcher::new(fast_config());
    let job = completed_job(&format!("{}/hook", server.uri()));
    let outcome = dispatcher.dispatch(WebhookEvent::Completed, &job).await;

    assert!(outcome.delivered);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.last_status, Some(200));

    let requests = server.received_requests().await.expect("requests");
    let body: serde_json::Value = requests[0].body_json().expect("json body");
    assert_eq!(body["event"], "extraction.completed");
    assert_eq!(body["job_id"], "job-hook");
    assert_eq!(
        body["data"]["result_url"],
        "https://concord.example.com/v1/jobs/job-hook/result"
    );
}

#[tokio::test]
async fn delivery_retries_with_backoff_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dispatcher = WebhookDispatcher::new(fast_config());
    let job = completed_job(&format!("{}/hook", server.uri()));
    let outcome = dispatcher.dispatch(WebhookEvent::Completed, &job).await;

    assert!(outcome.delivered);
    assert_eq!(outcome.attempts, 3);
}

#[tokio::test]
async fn exhausted_delivery_reports_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let dispatcher = WebhookDispatcher::new(fast_config());
    let job = completed_job(&format!("{}/hook", server.uri()));
    let outcome = dispatcher.dispatch(WebhookEvent::Completed, &job).await;

    assert!(!outcome.delivered);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.last_status, Some(500));
}

#[tokio::test]
async fn failed_job_fires_extraction_failed_event() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cb"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness_with(
        vec![Arc::new(
            ScriptedExtractor::new("alpha", 1, "").failing(ErrorKind::ExtractorError, "boom"),
        ) as Arc<dyn Extractor>],
        simple_probe(),
        fast_config(),
        None,
    );
    let job_id = h
        .coordinator
        .submit(&SubmitRequest {
            source_ref: h.source.display().to_string(),
            strategy: Some(Strategy::Fallback),
            callback_url: Some(format!("{}/cb", server.uri())),
            ..SubmitRequest::default()
        })
        .expect("submit");
    h.drain().await;

    let record = h.tracker.read(&job_id).expect("read");
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.metadata.webhook_delivered, Some(true));
    assert_eq!(record.metadata.webhook_attempts, 1);

    let requests = server.received_requests().await.expect("requests");
    let body: serde_json::Value = requests[0].body_json().expect("json body");
    assert_eq!(body["event"], "extraction.failed");
    assert_eq!(body["data"]["status"], "failed");
    assert_eq!(body["data"]["error"]["kind"], "EXTRACTOR_ERROR");
}

#[tokio::test]
async fn needs_review_fires_its_event_and_completion_follows_arbitration() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cb"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = harness_with(
        vec![
            Arc::new(
                ScriptedExtractor::new("alpha", 1, "# T\n\ncompletely distinct alpha words here\n")
                    .with_confidence(0.9),
            ) as Arc<dyn Extractor>,
            Arc::new(
                ScriptedExtractor::new("beta", 2, "# T\n\nsomething else entirely from beta\n")
                    .with_confidence(0.8),
            ),
        ],
        medium_probe(),
        fast_config(),
        None,
    );
    let job_id = h
        .coordinator
        .submit(&SubmitRequest {
            source_ref: h.source.display().to_string(),
            strategy: Some(Strategy::ParallelLocal),
            callback_url: Some(format!("{}/cb", server.uri())),
            ..SubmitRequest::default()
        })
        .expect("submit");
    h.drain().await;

    assert_eq!(
        h.tracker.read(&job_id).expect("read").state,
        JobState::NeedsReview
    );

    let review = h.coordinator.review(&job_id).expect("review");
    let choices: Vec<_> = review
        .divergences
        .iter()
        .map(|d| concord_app::services::arbitration::ArbitrationChoice {
            divergence_id: d.id.clone(),
            choice: "A".to_string(),
            content: None,
        })
        .collect();
    h.arbitration.arbitrate(&job_id, &choices).await.expect("arbitrate");

    let requests = server.received_requests().await.expect("requests");
    let events: Vec<String> = requests
        .iter()
        .map(|r| {
            let body: serde_json::Value = r.body_json().expect("json");
            body["event"].as_str().expect("event").to_string()
        })
        .collect();
    assert_eq!(
        events,
        vec![
            "extraction.needs_review".to_string(),
            "extraction.completed".to_string()
        ]
    );
}

#[tokio::test]
async fn webhook_failure_is_recorded_without_touching_state() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let h = harness_with(
        vec![Arc::new(ScriptedExtractor::new("alpha", 1, "# A\n\ntext\n")) as Arc<dyn Extractor>],
        simple_probe(),
        fast_config(),
        None,
    );
    let job_id = h
        .coordinator
        .submit(&SubmitRequest {
            source_ref: h.source.display().to_string(),
            strategy: Some(Strategy::Fallback),
            callback_url: Some(format!("{}/cb", server.uri())),
            ..SubmitRequest::default()
        })
        .expect("submit");
    h.drain().await;

    let record = h.tracker.read(&job_id).expect("read");
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.progress_pct, 100);
    assert_eq!(record.metadata.webhook_delivered, Some(false));
    assert_eq!(record.metadata.webhook_attempts, 3);
    let error = record.last_error.expect("recorded");
    assert_eq!(error.kind, ErrorKind::WebhookDeliveryFailed);
}

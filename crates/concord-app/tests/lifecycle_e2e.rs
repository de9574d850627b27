//! End-to-end lifecycle scenarios over the queue and orchestrator.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{harness, harness_with, medium_probe, simple_probe};
use concord_app::extract::{ErrorKind, Extractor, ScriptedExtractor};
use concord_app::services::coordinator::SubmitRequest;
use concord_app::services::jobs::{JobState, Strategy};
use concord_app::services::webhook::WebhookConfig;

fn submit(harness: &common::Harness, strategy: Strategy) -> String {
    harness
        .coordinator
        .submit(&SubmitRequest {
            source_ref: harness.source.display().to_string(),
            strategy: Some(strategy),
            ..SubmitRequest::default()
        })
        .expect("submit")
}

#[tokio::test]
async fn simple_fallback_uses_first_extractor_only() {
    let a = ScriptedExtractor::new("alpha", 1, "# Doc\n\nfrom alpha\n").with_confidence(0.9);
    let b = ScriptedExtractor::new("beta", 2, "# Doc\n\nfrom beta\n").with_confidence(0.8);
    let (a_calls, b_calls) = (a.call_counter(), b.call_counter());
    let h = harness(
        vec![Arc::new(a) as Arc<dyn Extractor>, Arc::new(b)],
        simple_probe(),
    );

    let job_id = submit(&h, Strategy::Fallback);
    h.drain().await;

    let record = h.tracker.read(&job_id).expect("read");
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.progress_pct, 100);
    assert!(record.last_error.is_none());
    assert!(record.divergences.is_empty());
    assert_eq!(a_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(b_calls.load(std::sync::atomic::Ordering::SeqCst), 0);

    let markdown = h
        .coordinator
        .download(&job_id, "markdown")
        .expect("download");
    assert!(String::from_utf8_lossy(&markdown).contains("from alpha"));
}

#[tokio::test]
async fn parallel_consensus_completes_with_higher_confidence_pick() {
    let md = "# Title\n\nidentical paragraph across extractors\n";
    let h = harness(
        vec![
            Arc::new(ScriptedExtractor::new("alpha", 1, md).with_confidence(0.95))
                as Arc<dyn Extractor>,
            Arc::new(ScriptedExtractor::new("beta", 2, md).with_confidence(0.85)),
        ],
        medium_probe(),
    );

    let job_id = submit(&h, Strategy::ParallelLocal);
    h.drain().await;

    let record = h.tracker.read(&job_id).expect("read");
    assert_eq!(record.state, JobState::Completed);
    let aggregation = record.aggregation.expect("aggregation");
    assert_eq!(aggregation.successful_count, 2);
    assert_eq!(aggregation.extractor_count, 2);
    assert_eq!(aggregation.selected_extractor.as_deref(), Some("alpha"));
    assert!(record.divergences.is_empty());

    let result = h.coordinator.result(&job_id).expect("result");
    assert_eq!(result["divergences"].as_array().map(Vec::len), Some(0));
    assert!(result["markdown"]
        .as_str()
        .expect("markdown")
        .contains("identical paragraph"));
}

#[tokio::test]
async fn fallback_survives_first_extractor_timeout() {
    let stuck = ScriptedExtractor::new("stuck", 1, "never\n")
        .with_latency(Duration::from_secs(30));
    let b = ScriptedExtractor::new("beta", 2, "# Doc\n\nrescued by beta\n");
    let h = harness_with(
        vec![Arc::new(stuck) as Arc<dyn Extractor>, Arc::new(b)],
        simple_probe(),
        WebhookConfig::default(),
        Some(Duration::from_millis(150)),
    );

    let job_id = submit(&h, Strategy::Fallback);
    h.drain().await;

    let record = h.tracker.read(&job_id).expect("read");
    assert_eq!(record.state, JobState::Completed);
    assert!(record.last_error.is_none());
    assert_eq!(
        record.metadata.timed_out_extractors,
        vec!["stuck".to_string()]
    );
}

#[tokio::test]
async fn all_extractors_unavailable_fails_the_job() {
    let h = harness(
        vec![
            Arc::new(ScriptedExtractor::new("alpha", 1, "x\n").unavailable())
                as Arc<dyn Extractor>,
            Arc::new(ScriptedExtractor::new("beta", 2, "y\n").unavailable()),
        ],
        simple_probe(),
    );

    let job_id = submit(&h, Strategy::Fallback);
    h.drain().await;

    let record = h.tracker.read(&job_id).expect("read");
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.progress_pct, 100);
    let error = record.last_error.expect("error recorded");
    assert_eq!(error.kind, ErrorKind::ExtractorUnavailable);
}

#[tokio::test]
async fn all_extractors_erroring_fails_with_extractor_error() {
    let h = harness(
        vec![
            Arc::new(
                ScriptedExtractor::new("alpha", 1, "").failing(ErrorKind::ExtractorError, "bad xref"),
            ) as Arc<dyn Extractor>,
            Arc::new(
                ScriptedExtractor::new("beta", 2, "").failing(ErrorKind::ExtractorError, "oom"),
            ),
        ],
        simple_probe(),
    );

    let job_id = submit(&h, Strategy::Fallback);
    h.drain().await;

    let record = h.tracker.read(&job_id).expect("read");
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(
        record.last_error.expect("error").kind,
        ErrorKind::ExtractorError
    );
}

#[tokio::test]
async fn terminal_redelivery_is_a_no_op() {
    let h = harness(
        vec![Arc::new(ScriptedExtractor::new("alpha", 1, "# A\n\ntext\n")) as Arc<dyn Extractor>],
        simple_probe(),
    );

    let job_id = submit(&h, Strategy::Fallback);
    h.drain().await;

    let before = h.tracker.read(&job_id).expect("read");
    assert_eq!(before.state, JobState::Completed);

    // Re-deliver the same task; nothing may change.
    h.orchestrator.run_job(&job_id).await.expect("redelivery");
    let after = h.tracker.read(&job_id).expect("read");
    assert_eq!(after.state, before.state);
    assert_eq!(after.updated_at_ms, before.updated_at_ms);
}

#[tokio::test]
async fn parallel_local_falls_back_to_remote_when_local_pool_fails() {
    let remote = ScriptedExtractor::new("hosted", 5, "# Doc\n\nremote rescue\n").remote();
    let remote_calls = remote.call_counter();
    let h = harness(
        vec![
            Arc::new(
                ScriptedExtractor::new("alpha", 1, "").failing(ErrorKind::ExtractorError, "boom"),
            ) as Arc<dyn Extractor>,
            Arc::new(
                ScriptedExtractor::new("beta", 2, "").failing(ErrorKind::ExtractorError, "boom"),
            ),
            Arc::new(remote),
        ],
        medium_probe(),
    );

    let job_id = submit(&h, Strategy::ParallelLocal);
    h.drain().await;

    let record = h.tracker.read(&job_id).expect("read");
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(remote_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn hybrid_escalates_to_remote_on_hard_divergence() {
    let remote = ScriptedExtractor::new("hosted", 5, "# T\n\nthe quick brown fox\n")
        .remote()
        .with_confidence(0.7);
    let remote_calls = remote.call_counter();
    let h = harness(
        vec![
            Arc::new(
                ScriptedExtractor::new("alpha", 1, "# T\n\nthe quick brown fox\n")
                    .with_confidence(0.9),
            ) as Arc<dyn Extractor>,
            Arc::new(
                ScriptedExtractor::new("beta", 2, "# T\n\nunrelated words entirely different\n")
                    .with_confidence(0.8),
            ),
            Arc::new(remote),
        ],
        medium_probe(),
    );

    let job_id = submit(&h, Strategy::Hybrid);
    h.drain().await;

    let record = h.tracker.read(&job_id).expect("read");
    assert_eq!(record.state, JobState::NeedsReview);
    assert_eq!(remote_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    // The remote candidate joined the final comparison.
    assert!(record
        .divergences
        .iter()
        .all(|d| d.block_refs.len() == 3));
}

#[tokio::test]
async fn requested_extractors_restrict_the_pool() {
    let a = ScriptedExtractor::new("alpha", 1, "# A\n\nalpha text\n");
    let b = ScriptedExtractor::new("beta", 2, "# B\n\nbeta text\n");
    let a_calls = a.call_counter();
    let h = harness(
        vec![Arc::new(a) as Arc<dyn Extractor>, Arc::new(b)],
        simple_probe(),
    );

    let job_id = h
        .coordinator
        .submit(&SubmitRequest {
            source_ref: h.source.display().to_string(),
            strategy: Some(Strategy::Fallback),
            requested_extractors: vec!["beta".to_string()],
            ..SubmitRequest::default()
        })
        .expect("submit");
    h.drain().await;

    let record = h.tracker.read(&job_id).expect("read");
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(a_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(record.metadata.extractors_used, vec!["beta".to_string()]);
}

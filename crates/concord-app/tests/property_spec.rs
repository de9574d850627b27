//! Property-based checks for the quantified invariants.

use proptest::prelude::*;
use tempfile::TempDir;

use concord_app::extract::{CandidateExtraction, ExtractionOptions, Table};
use concord_app::paths::AppPaths;
use concord_app::services::jobs::{JobRecord, JobState, JobTracker, Strategy as JobStrategy, TrackerError};
use concord_app::store::LmdbStateStore;
use concord_app::text::compare::{compare, table_similarity, token_similarity, ComparatorConfig};
use concord_app::text::merge::{merge, MergePolicy};
use concord_app::text::normalize::{normalize_candidate, normalize_markdown};

fn candidate(name: &str, confidence: f32, markdown: String) -> CandidateExtraction {
    normalize_candidate(CandidateExtraction {
        extractor_name: name.to_string(),
        extractor_version: "1".to_string(),
        markdown,
        blocks: Vec::new(),
        tables: Vec::new(),
        images: Vec::new(),
        confidence,
        elapsed_ms: 1,
        page_count: 1,
        success: true,
        error_kind: None,
        error_message: None,
    })
}

/// Markdown-ish text: headings, bullets, tables, blank runs, comments.
fn markdown_strategy() -> impl Strategy<Value = String> {
    let line = prop_oneof![
        "[a-z][a-z ]{0,30}",
        "# [a-z ]{1,20}",
        "- [a-z ]{1,20}",
        Just("| a | b |".to_string()),
        Just("| --- |".to_string()),
        Just("<!-- noise -->".to_string()),
        Just("<!-- image -->".to_string()),
        Just("Title".to_string()),
        Just("====".to_string()),
        Just(String::new()),
    ];
    proptest::collection::vec(line, 0..24).prop_map(|lines| lines.join("\n"))
}

fn paragraphs_strategy() -> impl Strategy<Value = String> {
    proptest::collection::vec("[a-z]{2,8}( [a-z]{2,8}){0,6}", 1..6)
        .prop_map(|paragraphs| paragraphs.join("\n\n"))
}

proptest! {
    // Normalizer idempotence: N(N(x)) == N(x).
    #[test]
    fn normalize_markdown_is_idempotent(input in markdown_strategy()) {
        let once = normalize_markdown(&input);
        let twice = normalize_markdown(&once);
        prop_assert_eq!(once, twice);
    }

    // Comparator symmetry over text blocks.
    #[test]
    fn token_similarity_is_symmetric(
        a in "[a-z ]{0,60}",
        b in "[a-z ]{0,60}",
    ) {
        let ab = token_similarity(&a, &b);
        let ba = token_similarity(&b, &a);
        prop_assert!((ab - ba).abs() < 1e-12);
        prop_assert!((0.0..=1.0).contains(&ab));
    }

    // Comparator symmetry over tables.
    #[test]
    fn table_similarity_is_symmetric(
        rows_a in proptest::collection::vec(
            proptest::collection::vec("[a-c]{0,2}", 0..4), 0..4),
        rows_b in proptest::collection::vec(
            proptest::collection::vec("[a-c]{0,2}", 0..4), 0..4),
    ) {
        let a = Table { rows: rows_a };
        let b = Table { rows: rows_b };
        let ab = table_similarity(&a, &b);
        let ba = table_similarity(&b, &a);
        prop_assert!((ab - ba).abs() < 1e-12);
        prop_assert!((0.0..=1.0).contains(&ab));
    }

    // Identical canonical content never emits a divergence.
    #[test]
    fn consensus_emits_no_divergences(markdown in paragraphs_strategy()) {
        let a = candidate("alpha", 0.9, markdown.clone());
        let b = candidate("beta", 0.8, markdown);
        if a.blocks.is_empty() {
            return Ok(());
        }
        let outcome = compare("job-prop", &[a, b], &ComparatorConfig::default())
            .expect("compare");
        prop_assert!(outcome.divergences.is_empty());
        prop_assert!(outcome.clusters.iter().all(|c| c.consensus));
    }

    // Merger totality: one resolution per divergence under non-manual policy.
    #[test]
    fn merge_records_one_resolution_per_divergence(
        text_a in paragraphs_strategy(),
        text_b in paragraphs_strategy(),
    ) {
        let a = candidate("alpha", 0.9, text_a);
        let b = candidate("beta", 0.8, text_b);
        if a.blocks.is_empty() || b.blocks.is_empty() {
            return Ok(());
        }
        let candidates = vec![a, b];
        let comparison = compare("job-prop", &candidates, &ComparatorConfig::default())
            .expect("compare");
        let outcome = merge(
            &candidates,
            &[1, 2],
            &comparison,
            &MergePolicy::HighestConfidence,
        )
        .expect("merge");
        prop_assert!(!outcome.needs_review);
        prop_assert_eq!(outcome.resolutions.len(), comparison.divergences.len());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    // Monotonic progress under arbitrary update sequences.
    #[test]
    fn progress_is_monotonic(updates in proptest::collection::vec(0u8..=100, 1..12)) {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let store = std::sync::Arc::new(LmdbStateStore::open(&paths).expect("store"));
        let tracker = JobTracker::new(store);
        tracker
            .create(&JobRecord::new(
                "prop-progress",
                JobStrategy::Fallback,
                ExtractionOptions::default(),
                "/tmp/in.pdf",
                "hash",
            ))
            .expect("create");

        let mut observed = Vec::with_capacity(updates.len());
        for pct in updates {
            let record = tracker.update_progress("prop-progress", pct).expect("update");
            observed.push(record.progress_pct);
        }
        prop_assert!(observed.windows(2).all(|w| w[0] <= w[1]));
        prop_assert!(observed.iter().all(|&p| p < 100));
    }

    // Terminal absorption: no transition leaves a terminal state.
    #[test]
    fn terminal_states_absorb(
        terminal_idx in 0usize..3,
        next_idx in 0usize..9,
    ) {
        let terminals = [JobState::Completed, JobState::Failed, JobState::Timeout];
        let all_states = [
            JobState::Pending,
            JobState::Analyzing,
            JobState::Extracting,
            JobState::Comparing,
            JobState::NeedsReview,
            JobState::Arbitrated,
            JobState::Completed,
            JobState::Failed,
            JobState::Timeout,
        ];
        let terminal = terminals[terminal_idx];
        let next = all_states[next_idx];
        prop_assert!(!terminal.can_transition_to(next));

        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let store = std::sync::Arc::new(LmdbStateStore::open(&paths).expect("store"));
        let tracker = JobTracker::new(store);
        let mut record = JobRecord::new(
            "prop-terminal",
            JobStrategy::Fallback,
            ExtractionOptions::default(),
            "/tmp/in.pdf",
            "hash",
        );
        record.state = terminal;
        record.progress_pct = 100;
        tracker.create(&record).expect("create");

        let result = tracker.update_state("prop-terminal", next);
        let is_illegal_transition = matches!(result, Err(TrackerError::IllegalTransition { .. }));
        prop_assert!(is_illegal_transition);
    }
}

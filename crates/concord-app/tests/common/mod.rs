//! Shared wiring for the end-to-end suites.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use concord_app::config::ExtractionConfig;
use concord_app::extract::Extractor;
use concord_app::paths::AppPaths;
use concord_app::pdf::{DocumentProbe, PageProbe};
use concord_app::services::arbitration::ArbitrationService;
use concord_app::services::complexity::ComplexityAnalyzer;
use concord_app::services::coordinator::Coordinator;
use concord_app::services::executor::{ExecutorConfig, ParallelExecutor};
use concord_app::services::gate::ResourceGate;
use concord_app::services::jobs::JobTracker;
use concord_app::services::orchestrator::{Orchestrator, OrchestratorConfig, Worker};
use concord_app::services::registry::ExtractorRegistry;
use concord_app::services::webhook::{WebhookConfig, WebhookDispatcher};
use concord_app::store::{LmdbQueue, LmdbStateStore};

pub struct Harness {
    pub temp: TempDir,
    pub paths: AppPaths,
    pub store: Arc<LmdbStateStore>,
    pub queue: Arc<LmdbQueue>,
    pub tracker: JobTracker,
    pub coordinator: Coordinator,
    pub orchestrator: Arc<Orchestrator>,
    pub arbitration: ArbitrationService,
    pub source: PathBuf,
}

impl Harness {
    pub fn worker(&self) -> Worker {
        Worker::new(
            self.queue.clone(),
            self.orchestrator.clone(),
            Duration::from_millis(10),
            Duration::from_secs(60),
        )
    }

    /// Drain the queue, driving every pending job to rest.
    pub async fn drain(&self) {
        let worker = self.worker();
        while worker.poll_once().await.expect("worker poll") {}
    }
}

/// A probe that classifies as `medium`, so parallel strategies stay parallel.
pub fn medium_probe() -> DocumentProbe {
    let mut pages = vec![
        PageProbe {
            text_len: 900,
            multi_column: true,
            table_like_lines: 4,
            ..PageProbe::default()
        };
        15
    ];
    pages.extend(vec![
        PageProbe {
            text_len: 1200,
            ..PageProbe::default()
        };
        15
    ]);
    DocumentProbe {
        page_count: 30,
        pages,
    }
}

/// A probe that classifies as `simple` (single short text page).
pub fn simple_probe() -> DocumentProbe {
    DocumentProbe {
        page_count: 1,
        pages: vec![PageProbe {
            text_len: 1500,
            ..PageProbe::default()
        }],
    }
}

pub fn harness(extractors: Vec<Arc<dyn Extractor>>, probe: DocumentProbe) -> Harness {
    harness_with(extractors, probe, WebhookConfig::default(), None)
}

pub fn harness_with(
    extractors: Vec<Arc<dyn Extractor>>,
    probe: DocumentProbe,
    webhook: WebhookConfig,
    per_extractor_timeout: Option<Duration>,
) -> Harness {
    let temp = TempDir::new().expect("temp dir");
    let paths = AppPaths::new(temp.path()).expect("paths");
    let store = Arc::new(LmdbStateStore::open(&paths).expect("store"));
    let queue = Arc::new(LmdbQueue::with_env(store.env_handle()).expect("queue"));
    let tracker = JobTracker::new(store.clone());
    let registry = ExtractorRegistry::with_extractors(extractors);

    let analyzer =
        ComplexityAnalyzer::with_prober(store.clone(), move |_bytes| Ok(probe.clone()));
    let executor = ParallelExecutor::new(ExecutorConfig {
        max_concurrent: 3,
        per_extractor_timeout: per_extractor_timeout.unwrap_or(Duration::from_secs(5)),
    });

    let orchestrator = Arc::new(Orchestrator::new(
        tracker.clone(),
        store.clone(),
        registry.clone(),
        analyzer,
        ResourceGate::with_sampler(0.25, || 1.0),
        executor,
        WebhookDispatcher::new(webhook),
        paths.clone(),
        OrchestratorConfig {
            job_timeout: Duration::from_secs(30),
            ..OrchestratorConfig::default()
        },
    ));
    let coordinator = Coordinator::new(
        tracker.clone(),
        queue.clone(),
        paths.clone(),
        ExtractionConfig::default(),
    );
    let arbitration = ArbitrationService::new(tracker.clone(), store.clone(), orchestrator.clone());

    let source = temp.path().join("input.pdf");
    std::fs::write(&source, b"%PDF-1.7 test fixture").expect("write source");

    Harness {
        temp,
        paths,
        store,
        queue,
        tracker,
        coordinator,
        orchestrator,
        arbitration,
        source,
    }
}

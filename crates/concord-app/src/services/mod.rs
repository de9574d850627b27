//! Coordination layer for IO-bound work.
//!
//! Modules here own external systems (the durable store, extractor
//! processes, webhook endpoints) and the job state machine built on top of
//! them. Pure transforms stay in `crate::text` and `crate::pdf` so
//! concurrency and resource accounting remain localized.

pub mod arbitration;
pub mod complexity;
pub mod coordinator;
pub mod executor;
pub mod gate;
pub mod jobs;
pub mod orchestrator;
pub mod reaper;
pub mod registry;
pub mod webhook;

pub use arbitration::{ArbitrationChoice, ArbitrationError, ArbitrationService};
pub use complexity::{ComplexityAnalyzer, ComplexityClass, ComplexityError, ComplexityReport};
pub use coordinator::{Coordinator, CoordinatorError, SubmitRequest};
pub use executor::{ExecutorConfig, ExtractorOutcome, ParallelExecutor};
pub use gate::{ResourceGate, StrategyDowngrade};
pub use jobs::{
    AggregationReport, JobError, JobMetadata, JobRecord, JobState, JobTracker, Strategy,
    TrackerError,
};
pub use orchestrator::{Orchestrator, OrchestratorError, Worker};
pub use reaper::{reap, ReaperError, ReaperReport, RetentionConfig};
pub use registry::ExtractorRegistry;
pub use webhook::{WebhookDispatcher, WebhookEvent, WebhookOutcome};

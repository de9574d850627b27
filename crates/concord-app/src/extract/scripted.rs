//! Deterministic scripted extractor for tests and local development.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{
    Capabilities, CandidateExtraction, ErrorKind, ExtractionOptions, Extractor, Precision, Speed,
};

/// An extractor that replays a fixed script: configurable markdown,
/// confidence, latency, and failure mode. Used by the test suites and by
/// `concord submit --dry-run` style experiments; it never touches the input
/// file beyond existence.
#[derive(Clone)]
pub struct ScriptedExtractor {
    name: String,
    priority: u8,
    local: bool,
    available: bool,
    markdown: String,
    confidence: f32,
    latency: Duration,
    fail_with: Option<(ErrorKind, String)>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedExtractor {
    pub fn new(name: impl Into<String>, priority: u8, markdown: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority,
            local: true,
            available: true,
            markdown: markdown.into(),
            confidence: 0.9,
            latency: Duration::ZERO,
            fail_with: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn remote(mut self) -> Self {
        self.local = false;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn failing(mut self, kind: ErrorKind, message: impl Into<String>) -> Self {
        self.fail_with = Some((kind, message.into()));
        self
    }

    /// How many times `extract` ran.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Shared counter handle, for asserting across clones.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait::async_trait]
impl Extractor for ScriptedExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        "scripted"
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn is_local(&self) -> bool {
        self.local
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_tables: true,
            supports_formulas: true,
            supports_images: true,
            supports_ocr: false,
            precision: Precision::High,
            speed: Speed::Fast,
        }
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn extract(&self, _file_path: &Path, _options: &ExtractionOptions) -> CandidateExtraction {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some((kind, message)) = &self.fail_with {
            return CandidateExtraction::failure(self.name.clone(), "scripted", *kind, message);
        }
        CandidateExtraction {
            extractor_name: self.name.clone(),
            extractor_version: "scripted".to_string(),
            markdown: self.markdown.clone(),
            blocks: Vec::new(),
            tables: Vec::new(),
            images: Vec::new(),
            confidence: self.confidence,
            elapsed_ms: self.latency.as_millis() as u64,
            page_count: 1,
            success: true,
            error_kind: None,
            error_message: None,
        }
    }
}

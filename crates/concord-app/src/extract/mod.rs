//! The extractor contract consumed by the coordination core.
//!
//! Extractors are external collaborators (Docling, MinerU, a hosted OCR
//! service). The core sees each as an opaque capability: a name, a priority,
//! an availability probe, and an `extract` call that always comes back with a
//! `CandidateExtraction`. Failure is encoded in the record, never thrown
//! across the boundary.

mod docling;
mod mineru;
mod remote;
pub mod scripted;

pub use docling::DoclingExtractor;
pub use mineru::MinerUExtractor;
pub use remote::RemoteOcrExtractor;
pub use scripted::ScriptedExtractor;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

/// System-wide error taxonomy. Kinds, not causes: policy hangs off the kind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InputRejected,
    ExtractorUnavailable,
    ExtractorTimeout,
    ExtractorError,
    ComparatorError,
    MergeUnresolved,
    JobTimeout,
    TransientStateStore,
    WebhookDeliveryFailed,
}

/// Unit of comparison emitted by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub kind: BlockKind,
    pub page_hint: Option<u32>,
    pub content_hash: String,
    pub text: String,
    pub order: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BlockKind {
    Heading,
    Paragraph,
    List,
    Table,
    Image,
    Formula,
    Code,
}

/// A table as rows of cell text. The normalizer pads rows to a uniform width.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }
}

/// A stable relative image reference (`images/p{page}_{idx}.{ext}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub path: String,
    pub page: u32,
}

/// Options forwarded to every extractor run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionOptions {
    #[serde(default = "default_true")]
    pub extract_tables: bool,
    #[serde(default = "default_true")]
    pub extract_images: bool,
    #[serde(default)]
    pub extract_formulas: bool,
    #[serde(default)]
    pub ocr_languages: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            extract_tables: true,
            extract_images: true,
            extract_formulas: false,
            ocr_languages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Precision {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Speed {
    Slow,
    Medium,
    Fast,
}

/// Static capability record an extractor declares at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_tables: bool,
    pub supports_formulas: bool,
    pub supports_images: bool,
    pub supports_ocr: bool,
    pub precision: Precision,
    pub speed: Speed,
}

/// Serializable extractor description for the CLI and the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorInfo {
    pub name: String,
    pub version: String,
    pub priority: u8,
    pub local: bool,
    pub available: bool,
    pub capabilities: Capabilities,
}

/// One extractor's output for a single job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateExtraction {
    pub extractor_name: String,
    pub extractor_version: String,
    pub markdown: String,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub tables: Vec<Table>,
    #[serde(default)]
    pub images: Vec<ImageRef>,
    pub confidence: f32,
    pub elapsed_ms: u64,
    pub page_count: u32,
    pub success: bool,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl CandidateExtraction {
    /// A failed run. All content fields stay empty; the kind carries policy.
    pub fn failure(
        extractor_name: impl Into<String>,
        extractor_version: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            extractor_name: extractor_name.into(),
            extractor_version: extractor_version.into(),
            markdown: String::new(),
            blocks: Vec::new(),
            tables: Vec::new(),
            images: Vec::new(),
            confidence: 0.0,
            elapsed_ms: 0,
            page_count: 0,
            success: false,
            error_kind: Some(kind),
            error_message: Some(message.into()),
        }
    }
}

/// Contract every pluggable extractor implements.
///
/// `extract` must never panic or error across the boundary; adapters convert
/// any internal failure into a `CandidateExtraction` with `success = false`.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Lower number wins when ordering candidates.
    fn priority(&self) -> u8;

    /// True when the extractor runs on this host rather than a hosted API.
    fn is_local(&self) -> bool;

    fn capabilities(&self) -> Capabilities;

    /// Runtime availability probe: models, binaries, API keys.
    fn is_available(&self) -> bool;

    async fn extract(&self, file_path: &Path, options: &ExtractionOptions) -> CandidateExtraction;

    fn info(&self) -> ExtractorInfo {
        ExtractorInfo {
            name: self.name().to_string(),
            version: self.version().to_string(),
            priority: self.priority(),
            local: self.is_local(),
            available: self.is_available(),
            capabilities: self.capabilities(),
        }
    }
}

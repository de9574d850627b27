//! Pure transforms over extracted Markdown.
//!
//! Everything here is side-effect free so the orchestrator can compose these
//! stages without hidden IO or mutable state. Canonicalization, block-level
//! comparison, and merging all operate on `CandidateExtraction` values that
//! have already been produced by the extractors.

pub mod compare;
pub mod merge;
pub mod normalize;

pub use compare::{
    ComparatorConfig, CompareError, ComparisonOutcome, Divergence, DivergenceKind,
};
pub use merge::{ManualChoice, MergeError, MergeOutcome, MergePolicy, MergedDocument, ResolutionKind};
pub use normalize::{normalize_candidate, normalize_markdown, segment_blocks};

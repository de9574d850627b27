//! Complexity scoring with store-backed memoization.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bincode::config;
use bincode::serde::{decode_from_slice, encode_to_vec};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};
use thiserror::Error;

use crate::extract::ExtractionOptions;
use crate::pdf::{probe_document, DocumentProbe, PdfProbeError};
use crate::store::{StateStore, StoreError};

/// Criterion weights; they sum to 100.
const WEIGHT_PAGES: u32 = 10;
const WEIGHT_TABLES: u32 = 25;
const WEIGHT_COLUMNS: u32 = 20;
const WEIGHT_IMAGES: u32 = 15;
const WEIGHT_FORMULAS: u32 = 15;
const WEIGHT_SCANNED: u32 = 15;

const SIMPLE_MAX_SCORE: u32 = 30;
const COMPLEX_MIN_SCORE: u32 = 60;

const TABLE_SAMPLE_PAGES: usize = 10;
const FORMULA_SAMPLE_PAGES: usize = 10;
const COLUMN_SAMPLE_PAGES: usize = 5;
const SCAN_SAMPLE_PAGES: usize = 5;
/// A page with images but almost no text reads as scanned.
const SCAN_TEXT_FLOOR: usize = 100;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ComplexityClass {
    Simple,
    Medium,
    Complex,
}

impl ComplexityClass {
    fn from_score(score: u32) -> Self {
        if score <= SIMPLE_MAX_SCORE {
            ComplexityClass::Simple
        } else if score >= COMPLEX_MIN_SCORE {
            ComplexityClass::Complex
        } else {
            ComplexityClass::Medium
        }
    }
}

/// One criterion's contribution: the raw probed signal, its bucketed
/// sub-score in 0..=100, and the weighted contribution to the total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentScore {
    pub raw: f64,
    pub subscore: u32,
    pub weighted: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityReport {
    pub score: u32,
    pub class: ComplexityClass,
    pub components: BTreeMap<String, ComponentScore>,
    pub cached: bool,
}

#[derive(Debug, Error)]
pub enum ComplexityError {
    #[error("failed to read input file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Probe(#[from] PdfProbeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Encode(#[from] bincode::error::EncodeError),
    #[error(transparent)]
    Decode(#[from] bincode::error::DecodeError),
}

/// Cache key over the document bytes *and* the option bag, so the same file
/// probed under different options never aliases.
pub fn complexity_cache_key(bytes: &[u8], options: &ExtractionOptions) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(bytes);
    hasher.update(options.extract_tables.to_string().as_bytes());
    hasher.update(options.extract_images.to_string().as_bytes());
    hasher.update(options.extract_formulas.to_string().as_bytes());
    for lang in &options.ocr_languages {
        hasher.update(lang.as_bytes());
    }
    format!("complexity:{}", hasher.finalize().to_hex())
}

type ProbeFn = dyn Fn(&[u8]) -> Result<DocumentProbe, PdfProbeError> + Send + Sync;

/// Scores a document and memoizes the result in the state store.
///
/// Successful reports persist with no TTL (identical bytes imply an
/// identical report); failures are never cached.
pub struct ComplexityAnalyzer {
    store: Arc<dyn StateStore>,
    prober: Box<ProbeFn>,
}

impl ComplexityAnalyzer {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            prober: Box::new(|bytes| probe_document(bytes)),
        }
    }

    /// Replace the structural prober; tests and embedders use this to avoid
    /// a Pdfium runtime.
    pub fn with_prober<F>(store: Arc<dyn StateStore>, prober: F) -> Self
    where
        F: Fn(&[u8]) -> Result<DocumentProbe, PdfProbeError> + Send + Sync + 'static,
    {
        Self {
            store,
            prober: Box::new(prober),
        }
    }

    pub fn analyze(
        &self,
        path: &Path,
        options: &ExtractionOptions,
        force: Option<ComplexityClass>,
    ) -> Result<ComplexityReport, ComplexityError> {
        let bytes = std::fs::read(path).map_err(|source| ComplexityError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.analyze_bytes(&bytes, options, force)
    }

    pub fn analyze_bytes(
        &self,
        bytes: &[u8],
        options: &ExtractionOptions,
        force: Option<ComplexityClass>,
    ) -> Result<ComplexityReport, ComplexityError> {
        let key = complexity_cache_key(bytes, options);

        if let Some(raw) = self.store.get(&key)? {
            let (mut report, _) = decode_from_slice::<ComplexityReport, _>(&raw, config::standard())?;
            report.cached = true;
            apply_force(&mut report, force);
            tracing::debug!(score = report.score, class = ?report.class, "complexity cache hit");
            return Ok(report);
        }

        let probe = (self.prober)(bytes)?;
        let mut report = report_from_probe(&probe);
        let encoded = encode_to_vec(&report, config::standard())?;
        self.store.set(&key, &encoded, None)?;

        apply_force(&mut report, force);
        tracing::info!(
            score = report.score,
            class = ?report.class,
            pages = probe.page_count,
            "complexity analyzed"
        );
        Ok(report)
    }
}

/// A forced class bypasses classification but not scoring; the override is
/// visible as its own component entry.
fn apply_force(report: &mut ComplexityReport, force: Option<ComplexityClass>) {
    if let Some(class) = force {
        report.class = class;
        report.components.insert(
            "forced".to_string(),
            ComponentScore {
                raw: 1.0,
                subscore: 0,
                weighted: 0.0,
            },
        );
    }
}

/// Bucketed scoring over the probe. Deterministic and pure.
pub fn report_from_probe(probe: &DocumentProbe) -> ComplexityReport {
    let sampled = probe.probed_pages().max(1);
    let page_count = probe.page_count.max(1);

    let pages_sub = match probe.page_count {
        0..=5 => 0,
        6..=20 => 5,
        21..=50 => 10,
        _ => 25,
    };

    let sampled_tables: usize = probe
        .pages
        .iter()
        .take(TABLE_SAMPLE_PAGES)
        .map(|p| usize::from(p.table_like_lines >= 3))
        .sum();
    let table_sample = probe.pages.len().min(TABLE_SAMPLE_PAGES).max(1);
    let table_estimate = sampled_tables as f64 / table_sample as f64 * page_count as f64;
    let tables_sub = if table_estimate < 0.5 {
        0
    } else if table_estimate <= 3.0 {
        40
    } else {
        100
    };

    let column_sample = probe.pages.len().min(COLUMN_SAMPLE_PAGES).max(1);
    let multi_column_pages = probe
        .pages
        .iter()
        .take(COLUMN_SAMPLE_PAGES)
        .filter(|p| p.multi_column)
        .count();
    let column_ratio = multi_column_pages as f64 / column_sample as f64;
    let columns_sub = if column_ratio >= 0.5 {
        100
    } else if multi_column_pages > 0 {
        60
    } else {
        0
    };

    let images_per_page = probe.total_images() as f64 / sampled as f64;
    let images_sub = if images_per_page < 0.1 {
        0
    } else if images_per_page < 0.5 {
        33
    } else if images_per_page < 1.0 {
        66
    } else {
        100
    };

    let formula_sample = probe.pages.len().min(FORMULA_SAMPLE_PAGES).max(1);
    let sampled_formulas: usize = probe
        .pages
        .iter()
        .take(FORMULA_SAMPLE_PAGES)
        .map(|p| p.formula_hits)
        .sum();
    let formula_estimate = sampled_formulas as f64 / formula_sample as f64 * page_count as f64;
    let formulas_sub = if formula_estimate < 1.0 {
        0
    } else if formula_estimate <= 5.0 {
        50
    } else {
        100
    };

    let scan_sample = probe.pages.len().min(SCAN_SAMPLE_PAGES).max(1);
    let scanned_pages = probe
        .pages
        .iter()
        .take(SCAN_SAMPLE_PAGES)
        .filter(|p| p.image_count > 0 && p.text_len < SCAN_TEXT_FLOOR)
        .count();
    let scan_ratio = scanned_pages as f64 / scan_sample as f64;
    let scanned_sub = if scanned_pages == 0 {
        0
    } else if scan_ratio < 0.5 {
        50
    } else {
        100
    };

    let mut components = BTreeMap::new();
    let mut total = 0.0_f64;
    for (name, raw, subscore, weight) in [
        ("pages", probe.page_count as f64, pages_sub, WEIGHT_PAGES),
        ("tables", table_estimate, tables_sub, WEIGHT_TABLES),
        ("columns", column_ratio, columns_sub, WEIGHT_COLUMNS),
        ("images", images_per_page, images_sub, WEIGHT_IMAGES),
        ("formulas", formula_estimate, formulas_sub, WEIGHT_FORMULAS),
        ("scanned", scan_ratio, scanned_sub, WEIGHT_SCANNED),
    ] {
        let weighted = weight as f64 * subscore as f64 / 100.0;
        total += weighted;
        components.insert(
            name.to_string(),
            ComponentScore {
                raw,
                subscore,
                weighted,
            },
        );
    }

    let score = total.round() as u32;
    ComplexityReport {
        score,
        class: ComplexityClass::from_score(score),
        components,
        cached: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::AppPaths;
    use crate::pdf::PageProbe;
    use crate::store::LmdbStateStore;
    use tempfile::TempDir;

    fn plain_page(text_len: usize) -> PageProbe {
        PageProbe {
            text_len,
            ..PageProbe::default()
        }
    }

    fn simple_probe() -> DocumentProbe {
        DocumentProbe {
            page_count: 2,
            pages: vec![plain_page(1500), plain_page(1800)],
        }
    }

    fn complex_probe() -> DocumentProbe {
        let page = PageProbe {
            text_len: 40,
            image_count: 2,
            multi_column: true,
            table_like_lines: 6,
            formula_hits: 3,
        };
        DocumentProbe {
            page_count: 80,
            pages: vec![page; 20],
        }
    }

    #[test]
    fn plain_short_document_scores_simple() {
        let report = report_from_probe(&simple_probe());
        assert_eq!(report.class, ComplexityClass::Simple);
        assert!(report.score <= 30);
        assert_eq!(report.components["pages"].subscore, 0);
        assert!(!report.cached);
    }

    #[test]
    fn dense_scanned_document_scores_complex() {
        let report = report_from_probe(&complex_probe());
        assert_eq!(report.class, ComplexityClass::Complex);
        assert!(report.score >= 60);
        assert_eq!(report.components["scanned"].subscore, 100);
        assert_eq!(report.components["tables"].subscore, 100);
    }

    #[test]
    fn weights_bound_the_score_to_one_hundred() {
        let report = report_from_probe(&complex_probe());
        assert!(report.score <= 100);
        let weighted_sum: f64 = report.components.values().map(|c| c.weighted).sum();
        assert!(weighted_sum <= 100.0);
    }

    fn analyzer_with(
        probe: DocumentProbe,
    ) -> (TempDir, ComplexityAnalyzer, std::sync::Arc<std::sync::atomic::AtomicUsize>) {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let store = Arc::new(LmdbStateStore::open(&paths).expect("store"));
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let analyzer = ComplexityAnalyzer::with_prober(store, move |_bytes| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(probe.clone())
        });
        (temp, analyzer, calls)
    }

    #[test]
    fn second_analysis_hits_the_cache() {
        use std::sync::atomic::Ordering;
        let (_temp, analyzer, calls) = analyzer_with(simple_probe());
        let options = ExtractionOptions::default();

        let first = analyzer
            .analyze_bytes(b"pdf bytes", &options, None)
            .expect("first");
        assert!(!first.cached);

        let second = analyzer
            .analyze_bytes(b"pdf bytes", &options, None)
            .expect("second");
        assert!(second.cached);
        assert_eq!(first.score, second.score);
        assert_eq!(first.components, second.components);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_options_probe_again() {
        use std::sync::atomic::Ordering;
        let (_temp, analyzer, calls) = analyzer_with(simple_probe());

        let defaults = ExtractionOptions::default();
        analyzer
            .analyze_bytes(b"pdf bytes", &defaults, None)
            .expect("first");

        let formulas = ExtractionOptions {
            extract_formulas: true,
            ..ExtractionOptions::default()
        };
        analyzer
            .analyze_bytes(b"pdf bytes", &formulas, None)
            .expect("second");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn forced_class_overrides_classification_not_score() {
        let (_temp, analyzer, _calls) = analyzer_with(simple_probe());
        let report = analyzer
            .analyze_bytes(b"pdf bytes", &ExtractionOptions::default(), Some(ComplexityClass::Complex))
            .expect("analyze");
        assert_eq!(report.class, ComplexityClass::Complex);
        assert!(report.score <= 30);
        assert!(report.components.contains_key("forced"));
    }
}

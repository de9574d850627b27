//! Structural PDF probe used by the complexity analyzer.
//!
//! The probe never extracts content for output; it only samples layout
//! signals (text volume, images, column gaps, table-like lines, formula
//! glyphs) that feed the complexity score.

use std::env;

use pdfium_render::prelude::{PdfPageObjectCommon, PdfPageObjectsCommon, Pdfium, PdfiumError};
use thiserror::Error;

/// Pages beyond this index are not probed; the score scales from the sample.
const PROBE_PAGE_LIMIT: usize = 50;
/// Horizontal whitespace (in PDF points) treated as a column boundary.
const COLUMN_GAP_POINTS: f32 = 100.0;

const FORMULA_GLYPHS: &[char] = &['∑', '∫', '∏', '√', '∞', '≤', '≥', '≠', '≈', '±'];

#[derive(Debug, Error)]
pub enum PdfProbeError {
    #[error("failed to load Pdfium runtime: {0}")]
    Library(#[from] PdfiumError),
    #[error("failed to load PDF document: {0}")]
    Document(#[source] PdfiumError),
    #[error("failed to read page {page_index}: {source}")]
    Page {
        page_index: usize,
        #[source]
        source: PdfiumError,
    },
}

/// Layout signals for a single probed page.
#[derive(Debug, Clone, Default)]
pub struct PageProbe {
    pub text_len: usize,
    pub image_count: usize,
    pub multi_column: bool,
    pub table_like_lines: usize,
    pub formula_hits: usize,
}

/// Aggregated signals for a whole document.
#[derive(Debug, Clone)]
pub struct DocumentProbe {
    pub page_count: usize,
    /// One entry per probed page (at most `PROBE_PAGE_LIMIT`).
    pub pages: Vec<PageProbe>,
}

impl DocumentProbe {
    pub fn probed_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn total_images(&self) -> usize {
        self.pages.iter().map(|p| p.image_count).sum()
    }
}

/// Probe the layout of a PDF held in memory.
pub fn probe_document(bytes: &[u8]) -> Result<DocumentProbe, PdfProbeError> {
    let pdfium = load_pdfium()?;
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(PdfProbeError::Document)?;

    let page_count = document.pages().len() as usize;
    let mut pages = Vec::with_capacity(page_count.min(PROBE_PAGE_LIMIT));

    for (page_index, page) in document.pages().iter().enumerate() {
        if page_index >= PROBE_PAGE_LIMIT {
            break;
        }

        let text = page
            .text()
            .map_err(|source| PdfProbeError::Page { page_index, source })?
            .all();

        let mut image_count = 0_usize;
        let mut text_lefts: Vec<f32> = Vec::new();
        for object in page.objects().iter() {
            if object.as_image_object().is_some() {
                image_count += 1;
            } else if object.as_text_object().is_some() {
                if let Ok(bounds) = object.bounds() {
                    text_lefts.push(bounds.left().value);
                }
            }
        }

        pages.push(PageProbe {
            text_len: text.trim().len(),
            image_count,
            multi_column: has_column_gap(&mut text_lefts),
            table_like_lines: count_table_like_lines(&text),
            formula_hits: count_formula_hits(&text),
        });
    }

    Ok(DocumentProbe { page_count, pages })
}

/// A page reads as multi-column when its text objects cluster around left
/// edges separated by a wide horizontal gap.
fn has_column_gap(lefts: &mut Vec<f32>) -> bool {
    if lefts.len() < 2 {
        return false;
    }
    lefts.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    lefts
        .windows(2)
        .any(|pair| (pair[1] - pair[0]).is_finite() && pair[1] - pair[0] > COLUMN_GAP_POINTS)
}

/// Lines with several wide interior runs of spaces behave like table rows.
fn count_table_like_lines(text: &str) -> usize {
    text.lines()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && trimmed.matches("   ").count() >= 2
        })
        .count()
}

fn count_formula_hits(text: &str) -> usize {
    let glyph_hits = text.chars().filter(|c| FORMULA_GLYPHS.contains(c)).count();
    let latex_hits = text.matches("\\begin{equation}").count()
        + text.matches("$$").count() / 2;
    glyph_hits + latex_hits
}

fn load_pdfium() -> Result<Pdfium, PdfiumError> {
    if let Ok(dir) = env::var("PDFIUM_LIB_DIR") {
        let library = Pdfium::pdfium_platform_library_name_at_path(&dir);
        if let Ok(bindings) = Pdfium::bind_to_library(library) {
            return Ok(Pdfium::new(bindings));
        }
    }
    Pdfium::bind_to_system_library().map(Pdfium::new)
}

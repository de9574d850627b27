//! Canonicalization of extractor Markdown ahead of comparison.
//!
//! The whole pass is idempotent: `normalize_markdown(normalize_markdown(x))`
//! equals `normalize_markdown(x)` for every input. Tests enforce this.

use std::sync::OnceLock;

use regex::Regex;

use crate::extract::{Block, BlockKind, CandidateExtraction, ImageRef, Table};

const IMAGE_PLACEHOLDER: &str = "<!-- image -->";

fn image_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[([^\]]*)\]\(([^)\s]+)\)").expect("valid image regex"))
}

fn canonical_image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|/)p(\d+)_(\d+)\.([A-Za-z0-9]+)$").expect("valid path regex"))
}

/// Canonicalize Markdown: line endings, blank-line runs, heading form,
/// bullet glyphs, trailing whitespace, table cell padding, and HTML comment
/// stripping (structural placeholders survive).
pub fn normalize_markdown(markdown: &str) -> String {
    if markdown.is_empty() {
        return String::new();
    }

    let unified = markdown.replace("\r\n", "\n").replace('\r', "\n");
    let without_comments = strip_html_comments(&unified);
    let lines: Vec<String> = without_comments.split('\n').map(str::to_string).collect();

    let lines = convert_setext_headings(lines);
    let lines = normalize_bullets(lines);
    let lines = pad_table_rows(lines);
    let lines = ensure_blank_before_headings(lines);

    let mut out = String::new();
    let mut blank_run = 0_usize;
    for line in &lines {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            out.push('\n');
        } else {
            blank_run = 0;
            out.push_str(trimmed);
            out.push('\n');
        }
    }

    let trimmed = out.trim_matches('\n');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}\n")
    }
}

/// Drop `<!-- ... -->` comments except the structural image placeholder.
fn strip_html_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("<!--") {
        let Some(end) = rest[start..].find("-->") else {
            break;
        };
        let comment = &rest[start..start + end + 3];
        out.push_str(&rest[..start]);
        if comment == IMAGE_PLACEHOLDER {
            out.push_str(comment);
        }
        rest = &rest[start + end + 3..];
    }
    out.push_str(rest);
    out
}

/// `Title\n=====` becomes `# Title`. Only `=` underlines convert; dashed
/// underlines are too easy to confuse with rules and table separators.
fn convert_setext_headings(lines: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut i = 0;
    while i < lines.len() {
        let line = &lines[i];
        let underline_next = lines
            .get(i + 1)
            .map(|next| {
                let t = next.trim();
                t.len() >= 2 && t.chars().all(|c| c == '=')
            })
            .unwrap_or(false);
        let title = line.trim();
        let eligible = underline_next
            && !title.is_empty()
            && !title.starts_with('#')
            && !title.starts_with('|')
            && !title.starts_with("```");
        if eligible {
            out.push(format!("# {title}"));
            i += 2;
        } else {
            out.push(line.clone());
            i += 1;
        }
    }
    out
}

fn normalize_bullets(lines: Vec<String>) -> Vec<String> {
    lines
        .into_iter()
        .map(|line| {
            let trimmed_start = line.trim_start();
            let indent_len = line.len() - trimmed_start.len();
            for glyph in ['•', '●', '∙', '*', '+'] {
                let mut prefix = glyph.to_string();
                prefix.push(' ');
                if let Some(rest) = trimmed_start.strip_prefix(&prefix) {
                    return format!("{}- {}", &line[..indent_len], rest);
                }
            }
            line
        })
        .collect()
}

fn ensure_blank_before_headings(lines: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    for line in lines {
        let is_heading = line.trim_start().starts_with('#');
        if is_heading {
            if let Some(prev) = out.last() {
                if !prev.trim().is_empty() {
                    out.push(String::new());
                }
            }
        }
        out.push(line);
    }
    out
}

fn is_table_row(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with('|')
}

fn is_separator_cell(cell: &str) -> bool {
    let t = cell.trim();
    !t.is_empty() && t.chars().all(|c| c == '-' || c == ':')
}

pub(crate) fn split_table_row(line: &str) -> Vec<String> {
    let mut inner = line.trim();
    if let Some(stripped) = inner.strip_prefix('|') {
        inner = stripped;
    }
    if let Some(stripped) = inner.strip_suffix('|') {
        inner = stripped;
    }
    inner.split('|').map(|cell| cell.trim().to_string()).collect()
}

fn render_table_row(cells: &[String]) -> String {
    let mut out = String::from("|");
    for cell in cells {
        out.push(' ');
        out.push_str(cell);
        out.push_str(" |");
    }
    out
}

/// Pad every row of each table run to the widest row's cell count.
fn pad_table_rows(lines: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut i = 0;
    while i < lines.len() {
        if !is_table_row(&lines[i]) {
            out.push(lines[i].clone());
            i += 1;
            continue;
        }
        let mut run_end = i;
        while run_end < lines.len() && is_table_row(&lines[run_end]) {
            run_end += 1;
        }
        let rows: Vec<Vec<String>> = lines[i..run_end].iter().map(|l| split_table_row(l)).collect();
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        for mut cells in rows {
            let separator = cells.iter().all(|c| is_separator_cell(c));
            while cells.len() < width {
                cells.push(if separator { "---".to_string() } else { String::new() });
            }
            if separator {
                for cell in &mut cells {
                    *cell = "---".to_string();
                }
            }
            out.push(render_table_row(&cells));
        }
        i = run_end;
    }
    out
}

/// Rewrite image references to `images/p{page}_{idx}.{ext}`.
///
/// The page comes from the candidate's `ImageRef` list when one lines up with
/// the reference's position, otherwise from an already-canonical name, and
/// falls back to 0. The per-page index is assigned in document order, which
/// makes the rewrite stable under repetition.
pub fn rewrite_image_refs(markdown: &str, images: &[ImageRef]) -> (String, Vec<ImageRef>) {
    let mut counters: std::collections::BTreeMap<u32, u32> = std::collections::BTreeMap::new();
    let mut canonical: Vec<ImageRef> = Vec::new();
    let mut ordinal = 0_usize;

    let rewritten = image_ref_re().replace_all(markdown, |caps: &regex::Captures<'_>| {
        let alt = &caps[1];
        let path = &caps[2];
        let parsed = canonical_image_re().captures(path);
        let page = images
            .get(ordinal)
            .map(|r| r.page)
            .or_else(|| parsed.as_ref().and_then(|c| c[1].parse().ok()))
            .unwrap_or(0);
        let ext = path
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or("png")
            .to_ascii_lowercase();
        let idx = counters.entry(page).or_insert(0);
        let canonical_path = format!("images/p{page}_{idx}.{ext}");
        *idx += 1;
        ordinal += 1;
        canonical.push(ImageRef {
            path: canonical_path.clone(),
            page,
        });
        format!("![{alt}]({canonical_path})")
    });

    (rewritten.into_owned(), canonical)
}

fn classify_chunk(text: &str) -> BlockKind {
    let first = text.lines().next().unwrap_or("").trim_start();
    if first.starts_with('#') {
        BlockKind::Heading
    } else if first.starts_with("```") {
        BlockKind::Code
    } else if first.starts_with('|') {
        BlockKind::Table
    } else if first.starts_with("![") {
        BlockKind::Image
    } else if first.starts_with("$$") || first.starts_with("\\[") {
        BlockKind::Formula
    } else if first.starts_with("- ")
        || first.starts_with("1. ")
        || first.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) && first.contains(". ")
    {
        BlockKind::List
    } else {
        BlockKind::Paragraph
    }
}

fn page_hint_for(kind: BlockKind, text: &str) -> Option<u32> {
    if kind != BlockKind::Image {
        return None;
    }
    let caps = image_ref_re().captures(text)?;
    let path = caps.get(2)?.as_str();
    canonical_image_re()
        .captures(path)
        .and_then(|c| c[1].parse().ok())
}

/// Segment canonical Markdown into comparison blocks.
///
/// Blocks split at blank lines, except inside fenced code which stays one
/// block. Each block's `content_hash` covers its canonical text.
pub fn segment_blocks(markdown: &str) -> Vec<Block> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_fence = false;

    for line in markdown.lines() {
        if line.trim_start().starts_with("```") {
            if !in_fence && !current.trim().is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            in_fence = !in_fence;
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
            if !in_fence {
                chunks.push(std::mem::take(&mut current));
            }
            continue;
        }
        if in_fence {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
            continue;
        }
        if line.trim().is_empty() {
            if !current.trim().is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            current.clear();
            continue;
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.trim().is_empty() {
        chunks.push(current);
    }

    chunks
        .into_iter()
        .enumerate()
        .map(|(order, text)| {
            let kind = classify_chunk(&text);
            Block {
                kind,
                page_hint: page_hint_for(kind, &text),
                content_hash: blake3::hash(text.as_bytes()).to_hex().to_string(),
                text,
                order,
            }
        })
        .collect()
}

/// Parse a table block's text into rows of cells.
pub(crate) fn parse_table(text: &str) -> Table {
    let rows = text
        .lines()
        .filter(|line| is_table_row(line))
        .map(split_table_row)
        .filter(|cells| !cells.iter().all(|c| is_separator_cell(c)))
        .collect();
    Table { rows }
}

/// Full canonicalization of one extractor output: Markdown passes, image
/// reference rewriting, block segmentation, and table extraction.
pub fn normalize_candidate(mut candidate: CandidateExtraction) -> CandidateExtraction {
    if !candidate.success {
        return candidate;
    }
    let canonical = normalize_markdown(&candidate.markdown);
    let (rewritten, images) = rewrite_image_refs(&canonical, &candidate.images);
    let blocks = segment_blocks(&rewritten);
    let tables = blocks
        .iter()
        .filter(|b| b.kind == BlockKind::Table)
        .map(|b| parse_table(&b.text))
        .collect();

    candidate.markdown = rewritten;
    candidate.blocks = blocks;
    candidate.tables = tables;
    candidate.images = images;
    candidate
}

//! Block-level alignment, similarity, and divergence emission.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::AsRefStr;
use thiserror::Error;

use super::normalize::parse_table;
use crate::extract::{Block, BlockKind, CandidateExtraction, Table};

/// Token budget for the LCS similarity; longer blocks are compared over
/// their leading tokens to keep the DP quadratic term bounded.
const MAX_SIMILARITY_TOKENS: usize = 512;
const EXCERPT_LIMIT: usize = 2_000;

#[derive(Debug, Clone, Copy)]
pub struct ComparatorConfig {
    /// Below this minimum pairwise similarity a cluster is a divergence.
    pub similarity_threshold: f64,
    /// At or above this minimum pairwise similarity a cluster is consensus.
    pub auto_merge_threshold: f64,
    /// Local alignment window when pairing blocks across candidates.
    pub align_window: usize,
}

impl Default for ComparatorConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.90,
            auto_merge_threshold: 0.95,
            align_window: 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum CompareError {
    #[error("comparison requires at least two candidates, got {0}")]
    TooFewCandidates(usize),
    #[error("comparator invariant violated: {0}")]
    Invariant(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DivergenceKind {
    TextMismatch,
    Structural,
    TableMismatch,
    MissingBlock,
}

/// A cluster whose members disagree beyond the configured threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Divergence {
    /// Stable per (job, cluster ordinal).
    pub id: String,
    pub kind: DivergenceKind,
    /// For each candidate, the aligned block's order, or None when missing.
    pub block_refs: Vec<Option<usize>>,
    /// Pairwise similarities, candidate-indexed; symmetric with unit diagonal.
    pub similarity_matrix: Vec<Vec<f64>>,
    pub page_hint: Option<u32>,
    /// True when the minimum similarity falls inside the soft band
    /// `[similarity_threshold, auto_merge_threshold)`.
    pub soft: bool,
    /// Bounded per-candidate content excerpts for the review surface.
    pub excerpts: Vec<Option<String>>,
}

/// One alignment class of blocks across candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub ordinal: usize,
    pub block_refs: Vec<Option<usize>>,
    pub min_similarity: f64,
    pub consensus: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonOutcome {
    pub clusters: Vec<Cluster>,
    pub divergences: Vec<Divergence>,
}

impl ComparisonOutcome {
    pub fn hard_divergences(&self) -> impl Iterator<Item = &Divergence> + '_ {
        self.divergences.iter().filter(|d| !d.soft)
    }

    pub fn has_hard_divergences(&self) -> bool {
        self.hard_divergences().next().is_some()
    }
}

/// Longest-common-subsequence ratio over whitespace tokens, in [0, 1].
pub fn token_similarity(a: &str, b: &str) -> f64 {
    let tokens_a: Vec<&str> = a.split_whitespace().take(MAX_SIMILARITY_TOKENS).collect();
    let tokens_b: Vec<&str> = b.split_whitespace().take(MAX_SIMILARITY_TOKENS).collect();

    match (tokens_a.is_empty(), tokens_b.is_empty()) {
        (true, true) => return 1.0,
        (true, false) | (false, true) => return 0.0,
        _ => {}
    }

    let n = tokens_a.len();
    let m = tokens_b.len();
    let mut prev = vec![0_usize; m + 1];
    let mut row = vec![0_usize; m + 1];
    for i in 1..=n {
        for j in 1..=m {
            row[j] = if tokens_a[i - 1] == tokens_b[j - 1] {
                prev[j - 1] + 1
            } else {
                prev[j].max(row[j - 1])
            };
        }
        std::mem::swap(&mut prev, &mut row);
    }
    let lcs = prev[m] as f64;
    (2.0 * lcs) / (n + m) as f64
}

/// Cell-by-cell equality ratio with row and column count penalties.
pub fn table_similarity(a: &Table, b: &Table) -> f64 {
    let (rows_a, rows_b) = (a.row_count(), b.row_count());
    let (cols_a, cols_b) = (a.column_count(), b.column_count());

    if rows_a == 0 && rows_b == 0 {
        return 1.0;
    }
    if rows_a == 0 || rows_b == 0 {
        return 0.0;
    }

    let shared_rows = rows_a.min(rows_b);
    let shared_cols = cols_a.min(cols_b).max(1);
    let mut equal = 0_usize;
    let mut total = 0_usize;
    for r in 0..shared_rows {
        for c in 0..shared_cols {
            let cell_a = a.rows[r].get(c).map(String::as_str).unwrap_or("");
            let cell_b = b.rows[r].get(c).map(String::as_str).unwrap_or("");
            total += 1;
            if cell_a == cell_b {
                equal += 1;
            }
        }
    }
    let cell_ratio = if total == 0 { 1.0 } else { equal as f64 / total as f64 };
    let row_penalty = shared_rows as f64 / rows_a.max(rows_b) as f64;
    let col_penalty = shared_cols as f64 / cols_a.max(cols_b).max(1) as f64;
    cell_ratio * row_penalty * col_penalty
}

/// Similarity between two aligned blocks, dispatching on kind.
pub fn block_similarity(a: &Block, b: &Block) -> f64 {
    if a.kind != b.kind {
        // Cross-kind pairings carry a structural penalty on top of content.
        return token_similarity(&a.text, &b.text) * 0.5;
    }
    match a.kind {
        BlockKind::Table => table_similarity(&parse_table(&a.text), &parse_table(&b.text)),
        BlockKind::Image => {
            if a.text == b.text {
                1.0
            } else if a.page_hint.is_some() && a.page_hint == b.page_hint {
                0.5
            } else {
                0.0
            }
        }
        _ => token_similarity(&a.text, &b.text),
    }
}

/// Stable divergence identifier for a (job, cluster ordinal) pair.
pub fn divergence_id(job_id: &str, ordinal: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_id.as_bytes());
    hasher.update(b":");
    hasher.update(ordinal.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Below this similarity a window match is not trusted to skip ahead; the
/// in-order block is paired instead so mismatched text still aligns
/// positionally and surfaces as a text divergence.
const PAIR_FLOOR: f64 = 0.30;

/// Align blocks across candidates using the highest-priority candidate as
/// the spine. Within a small forward window, same-kind blocks pair greedily
/// by best similarity; everything unpaired becomes its own cluster.
fn align(candidates: &[&[Block]], window: usize) -> Vec<Vec<Option<usize>>> {
    debug_assert!(candidates.len() >= 2);
    let spine = candidates[0];
    let mut cursors = vec![0_usize; candidates.len()];
    let mut consumed: Vec<Vec<bool>> = candidates.iter().map(|c| vec![false; c.len()]).collect();
    let mut clusters: Vec<Vec<Option<usize>>> = Vec::new();

    for (spine_idx, spine_block) in spine.iter().enumerate() {
        let mut refs: Vec<Option<usize>> = vec![None; candidates.len()];
        refs[0] = Some(spine_idx);

        for (cand_idx, blocks) in candidates.iter().enumerate().skip(1) {
            let start = cursors[cand_idx];
            let end = (start + window + 1).min(blocks.len());
            let mut best: Option<(usize, f64)> = None;
            for pos in start..end {
                if consumed[cand_idx][pos] || blocks[pos].kind != spine_block.kind {
                    continue;
                }
                let similarity = block_similarity(spine_block, &blocks[pos]);
                let better = match best {
                    Some((_, best_sim)) => similarity > best_sim,
                    None => true,
                };
                if better {
                    best = Some((pos, similarity));
                }
            }
            let chosen = match best {
                Some((pos, similarity)) if similarity >= PAIR_FLOOR => Some(pos),
                _ => {
                    // No convincing match ahead: pair in order when the
                    // block at the cursor has the same kind.
                    blocks
                        .get(start)
                        .filter(|b| !consumed[cand_idx][start] && b.kind == spine_block.kind)
                        .map(|_| start)
                }
            };
            if let Some(pos) = chosen {
                refs[cand_idx] = Some(pos);
                consumed[cand_idx][pos] = true;
                cursors[cand_idx] = pos + 1;
            }
        }
        clusters.push(refs);
    }

    // Blocks no spine block claimed become missing-elsewhere clusters.
    for (cand_idx, blocks) in candidates.iter().enumerate().skip(1) {
        for pos in 0..blocks.len() {
            if !consumed[cand_idx][pos] {
                let mut refs: Vec<Option<usize>> = vec![None; candidates.len()];
                refs[cand_idx] = Some(pos);
                clusters.push(refs);
            }
        }
    }

    clusters
}

fn excerpt(text: &str) -> String {
    if text.len() <= EXCERPT_LIMIT {
        return text.to_string();
    }
    let mut cut = EXCERPT_LIMIT;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].to_string()
}

fn majority_page_hint(blocks: &[Option<&Block>]) -> Option<u32> {
    let mut counts: std::collections::BTreeMap<u32, usize> = std::collections::BTreeMap::new();
    for block in blocks.iter().flatten() {
        if let Some(page) = block.page_hint {
            *counts.entry(page).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(page, _)| page)
}

fn divergence_kind(members: &[Option<&Block>]) -> DivergenceKind {
    if members.iter().any(Option::is_none) {
        return DivergenceKind::MissingBlock;
    }
    let kinds: Vec<BlockKind> = members.iter().flatten().map(|b| b.kind).collect();
    if kinds.windows(2).any(|w| w[0] != w[1]) {
        return DivergenceKind::Structural;
    }
    if kinds.first() == Some(&BlockKind::Table) {
        return DivergenceKind::TableMismatch;
    }
    DivergenceKind::TextMismatch
}

/// Compare two or more normalized candidates and emit the divergence set.
///
/// Candidates must arrive in stable priority order; cluster ordinals and the
/// resulting divergence ids depend on it.
pub fn compare(
    job_id: &str,
    candidates: &[CandidateExtraction],
    config: &ComparatorConfig,
) -> Result<ComparisonOutcome, CompareError> {
    if candidates.len() < 2 {
        return Err(CompareError::TooFewCandidates(candidates.len()));
    }
    if config.similarity_threshold > config.auto_merge_threshold {
        return Err(CompareError::Invariant(format!(
            "similarity threshold {} exceeds auto-merge threshold {}",
            config.similarity_threshold, config.auto_merge_threshold
        )));
    }

    let block_slices: Vec<&[Block]> = candidates.iter().map(|c| c.blocks.as_slice()).collect();
    let raw_clusters = align(&block_slices, config.align_window);

    let mut clusters = Vec::with_capacity(raw_clusters.len());
    let mut divergences = Vec::new();

    for (ordinal, refs) in raw_clusters.into_iter().enumerate() {
        let members: Vec<Option<&Block>> = refs
            .iter()
            .enumerate()
            .map(|(cand_idx, r)| r.map(|pos| &candidates[cand_idx].blocks[pos]))
            .collect();

        let n = members.len();
        let mut matrix = vec![vec![0.0_f64; n]; n];
        let mut min_similarity = 1.0_f64;
        for i in 0..n {
            matrix[i][i] = 1.0;
            for j in (i + 1)..n {
                let similarity = match (members[i], members[j]) {
                    (Some(a), Some(b)) => block_similarity(a, b),
                    _ => 0.0,
                };
                matrix[i][j] = similarity;
                matrix[j][i] = similarity;
                min_similarity = min_similarity.min(similarity);
            }
        }

        let consensus = min_similarity >= config.auto_merge_threshold;
        clusters.push(Cluster {
            ordinal,
            block_refs: refs.clone(),
            min_similarity,
            consensus,
        });

        if !consensus {
            let soft = min_similarity >= config.similarity_threshold;
            divergences.push(Divergence {
                id: divergence_id(job_id, ordinal),
                kind: divergence_kind(&members),
                block_refs: refs,
                similarity_matrix: matrix,
                page_hint: majority_page_hint(&members),
                soft,
                excerpts: members
                    .iter()
                    .map(|m| m.map(|b| excerpt(&b.text)))
                    .collect(),
            });
        }
    }

    Ok(ComparisonOutcome {
        clusters,
        divergences,
    })
}

/// Order of preference among present cluster members: higher confidence,
/// then lower priority number, then alphabetical extractor name.
pub fn preferred_candidate(
    candidates: &[CandidateExtraction],
    priorities: &[u8],
    present: &[usize],
) -> Option<usize> {
    debug_assert_eq!(candidates.len(), priorities.len());
    present.iter().copied().min_by(|&a, &b| {
        let conf = candidates[b]
            .confidence
            .partial_cmp(&candidates[a].confidence)
            .unwrap_or(std::cmp::Ordering::Equal);
        conf.then_with(|| priorities[a].cmp(&priorities[b]))
            .then_with(|| candidates[a].extractor_name.cmp(&candidates[b].extractor_name))
    })
}

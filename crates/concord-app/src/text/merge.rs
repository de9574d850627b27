//! Candidate fusion under a named policy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::compare::{preferred_candidate, ComparisonOutcome};
use crate::extract::CandidateExtraction;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergePolicy {
    /// Per cluster, take the block from the candidate with the highest
    /// confidence (ties broken by priority, then name).
    HighestConfidence,
    /// Take the named extractor's block where present and successful, else
    /// fall back to highest confidence.
    Prefer(String),
    /// Consensus clusters merge automatically; soft divergences resolve by
    /// confidence; hard divergences are left unresolved for review.
    AutoMergeHighConfidence,
    /// Apply an explicit mapping from divergence id to choice.
    Manual(BTreeMap<String, ManualChoice>),
}

impl MergePolicy {
    pub fn name(&self) -> &'static str {
        match self {
            MergePolicy::HighestConfidence => "HIGHEST_CONFIDENCE",
            MergePolicy::Prefer(_) => "PREFER",
            MergePolicy::AutoMergeHighConfidence => "AUTO_MERGE_HIGH_CONFIDENCE",
            MergePolicy::Manual(_) => "MANUAL",
        }
    }
}

/// One arbitration choice for a divergence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "choice", content = "content", rename_all = "UPPERCASE")]
pub enum ManualChoice {
    A,
    B,
    C,
    #[serde(rename = "manual")]
    Manual(String),
}

impl ManualChoice {
    fn candidate_index(&self) -> Option<usize> {
        match self {
            ManualChoice::A => Some(0),
            ManualChoice::B => Some(1),
            ManualChoice::C => Some(2),
            ManualChoice::Manual(_) => None,
        }
    }
}

/// How a divergence was resolved in the merged document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionKind {
    A,
    B,
    C,
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "auto")]
    Auto,
}

fn slot_for(index: usize) -> ResolutionKind {
    match index {
        0 => ResolutionKind::A,
        1 => ResolutionKind::B,
        2 => ResolutionKind::C,
        _ => ResolutionKind::Auto,
    }
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("no successful candidates to merge")]
    NoCandidates,
    #[error("manual policy is missing a choice for divergence {0}")]
    MissingChoice(String),
    #[error("choice {choice} for divergence {id} points at an absent candidate")]
    AbsentCandidate { id: String, choice: String },
}

/// Result of one merge run.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub needs_review: bool,
    pub markdown: String,
    pub resolutions: BTreeMap<String, ResolutionKind>,
    pub unresolved: Vec<String>,
}

/// The final artifact for a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedDocument {
    pub markdown: String,
    pub policy: String,
    pub resolutions: BTreeMap<String, ResolutionKind>,
}

/// Fuse candidates into one document.
///
/// Walks clusters in order; consensus clusters take the preferred present
/// member, divergent clusters resolve per policy. Whenever the outcome is
/// not `needs_review`, exactly one resolution is recorded per divergence.
pub fn merge(
    candidates: &[CandidateExtraction],
    priorities: &[u8],
    comparison: &ComparisonOutcome,
    policy: &MergePolicy,
) -> Result<MergeOutcome, MergeError> {
    if candidates.iter().all(|c| !c.success) {
        return Err(MergeError::NoCandidates);
    }

    // Emission order in `compare` pairs non-consensus clusters with
    // divergences one-to-one.
    let divergence_by_ordinal: BTreeMap<usize, &super::compare::Divergence> = comparison
        .clusters
        .iter()
        .filter(|c| !c.consensus)
        .zip(comparison.divergences.iter())
        .map(|(c, d)| (c.ordinal, d))
        .collect();

    let mut parts: Vec<String> = Vec::new();
    let mut resolutions: BTreeMap<String, ResolutionKind> = BTreeMap::new();
    let mut unresolved: Vec<String> = Vec::new();

    for cluster in &comparison.clusters {
        let present: Vec<usize> = cluster
            .block_refs
            .iter()
            .enumerate()
            .filter_map(|(idx, r)| r.map(|_| idx))
            .filter(|&idx| candidates[idx].success)
            .collect();

        let text_of = |cand_idx: usize| -> String {
            let pos = cluster.block_refs[cand_idx].expect("present member has a block");
            candidates[cand_idx].blocks[pos].text.clone()
        };

        if cluster.consensus {
            if let Some(best) = preferred_candidate(candidates, priorities, &present) {
                parts.push(text_of(best));
            }
            continue;
        }

        let divergence = divergence_by_ordinal
            .get(&cluster.ordinal)
            .copied()
            .expect("non-consensus cluster has a divergence");

        match policy {
            MergePolicy::HighestConfidence => {
                let best = preferred_candidate(candidates, priorities, &present)
                    .ok_or(MergeError::NoCandidates)?;
                parts.push(text_of(best));
                resolutions.insert(divergence.id.clone(), slot_for(best));
            }
            MergePolicy::Prefer(name) => {
                let named = present
                    .iter()
                    .copied()
                    .find(|&idx| candidates[idx].extractor_name == *name);
                let pick = named
                    .or_else(|| preferred_candidate(candidates, priorities, &present))
                    .ok_or(MergeError::NoCandidates)?;
                parts.push(text_of(pick));
                resolutions.insert(divergence.id.clone(), slot_for(pick));
            }
            MergePolicy::AutoMergeHighConfidence => {
                if divergence.soft {
                    let best = preferred_candidate(candidates, priorities, &present)
                        .ok_or(MergeError::NoCandidates)?;
                    parts.push(text_of(best));
                    resolutions.insert(divergence.id.clone(), slot_for(best));
                } else {
                    // Keep the preferred text as a placeholder so the partial
                    // document stays readable for reviewers.
                    if let Some(best) = preferred_candidate(candidates, priorities, &present) {
                        parts.push(text_of(best));
                    }
                    unresolved.push(divergence.id.clone());
                }
            }
            MergePolicy::Manual(choices) => {
                let choice = choices
                    .get(&divergence.id)
                    .ok_or_else(|| MergeError::MissingChoice(divergence.id.clone()))?;
                match choice.candidate_index() {
                    Some(idx) => {
                        if !present.contains(&idx) {
                            return Err(MergeError::AbsentCandidate {
                                id: divergence.id.clone(),
                                choice: format!("{choice:?}"),
                            });
                        }
                        parts.push(text_of(idx));
                        resolutions.insert(divergence.id.clone(), slot_for(idx));
                    }
                    None => {
                        if let ManualChoice::Manual(content) = choice {
                            parts.push(content.trim_end().to_string());
                            resolutions.insert(divergence.id.clone(), ResolutionKind::Manual);
                        }
                    }
                }
            }
        }
    }

    let needs_review = !unresolved.is_empty();
    if !needs_review {
        debug_assert_eq!(resolutions.len(), comparison.divergences.len());
    }

    let markdown = if parts.is_empty() {
        String::new()
    } else {
        format!("{}\n", parts.join("\n\n"))
    };

    Ok(MergeOutcome {
        needs_review,
        markdown,
        resolutions,
        unresolved,
    })
}

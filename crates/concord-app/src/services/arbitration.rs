//! Human arbitration: per-divergence choices close out a reviewed job.

use std::collections::BTreeMap;
use std::sync::Arc;

use bincode::config;
use bincode::serde::encode_to_vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::jobs::{JobRecord, JobState, JobTracker, TrackerError};
use crate::services::orchestrator::{Orchestrator, OrchestratorError};
use crate::store::{StateStore, StoreError};
use crate::text::merge::ManualChoice;

pub fn arbitration_key(job_id: &str) -> String {
    format!("arbitration:{job_id}")
}

/// One submitted choice, as it arrives from the review surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrationChoice {
    pub divergence_id: String,
    /// `A`, `B`, `C`, or `manual`.
    pub choice: String,
    #[serde(default)]
    pub content: Option<String>,
}

impl ArbitrationChoice {
    fn to_manual(&self) -> Result<ManualChoice, ArbitrationError> {
        match self.choice.as_str() {
            "A" | "a" => Ok(ManualChoice::A),
            "B" | "b" => Ok(ManualChoice::B),
            "C" | "c" => Ok(ManualChoice::C),
            "manual" => {
                let content = self.content.clone().filter(|c| !c.trim().is_empty()).ok_or(
                    ArbitrationError::InvalidChoice {
                        divergence_id: self.divergence_id.clone(),
                        reason: "manual choice requires non-empty content".to_string(),
                    },
                )?;
                Ok(ManualChoice::Manual(content))
            }
            other => Err(ArbitrationError::InvalidChoice {
                divergence_id: self.divergence_id.clone(),
                reason: format!("unknown choice `{other}`"),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum ArbitrationError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Encode(#[from] bincode::error::EncodeError),
    #[error(transparent)]
    Orchestrator(#[from] Box<OrchestratorError>),
    #[error("job `{job_id}` is in state {state:?}, arbitration requires needs_review")]
    InvalidState { job_id: String, state: JobState },
    #[error("choices do not cover outstanding divergences: {0:?}")]
    MissingChoices(Vec<String>),
    #[error("choice references unknown divergence `{0}`")]
    UnknownDivergence(String),
    #[error("invalid choice for divergence `{divergence_id}`: {reason}")]
    InvalidChoice {
        divergence_id: String,
        reason: String,
    },
}

/// Validates submitted choices, stores them as the job's one-shot mailbox,
/// and drives the job through `ARBITRATED` to `COMPLETED`.
pub struct ArbitrationService {
    tracker: JobTracker,
    store: Arc<dyn StateStore>,
    orchestrator: Arc<Orchestrator>,
}

impl ArbitrationService {
    pub fn new(
        tracker: JobTracker,
        store: Arc<dyn StateStore>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            tracker,
            store,
            orchestrator,
        }
    }

    pub async fn arbitrate(
        &self,
        job_id: &str,
        choices: &[ArbitrationChoice],
    ) -> Result<JobRecord, ArbitrationError> {
        let record = self.tracker.read(job_id)?;
        if record.state != JobState::NeedsReview {
            return Err(ArbitrationError::InvalidState {
                job_id: job_id.to_string(),
                state: record.state,
            });
        }

        let outstanding: Vec<String> = record.divergences.iter().map(|d| d.id.clone()).collect();
        let mut mapping: BTreeMap<String, ManualChoice> = BTreeMap::new();
        for choice in choices {
            if !outstanding.contains(&choice.divergence_id) {
                return Err(ArbitrationError::UnknownDivergence(
                    choice.divergence_id.clone(),
                ));
            }
            mapping.insert(choice.divergence_id.clone(), choice.to_manual()?);
        }

        let missing: Vec<String> = outstanding
            .iter()
            .filter(|id| !mapping.contains_key(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ArbitrationError::MissingChoices(missing));
        }

        let encoded = encode_to_vec(&mapping, config::standard())?;
        self.store
            .set(&arbitration_key(job_id), &encoded, None)?;

        self.tracker.update_state(job_id, JobState::Arbitrated)?;
        tracing::info!(job_id, choices = choices.len(), "arbitration accepted");

        // The orchestrator resumes from ARBITRATED, re-runs the merger under
        // MANUAL policy, and fires the completion webhook.
        self.orchestrator
            .run_job(job_id)
            .await
            .map_err(Box::new)?;

        Ok(self.tracker.read(job_id)?)
    }
}

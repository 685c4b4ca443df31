use std::sync::Arc;

use anketa_normalizer::{denormalize, is_blank};
use anketa_store::SessionStore;
use anketa_types::{
    AnketaRecord, DialogueEntry, DialogueRole, SessionStatus, StatusTransitionError,
};
use tokio::task::JoinHandle;

use crate::{
    ControllerError, ExtractionService, ProcessingGuard, ProcessingRegistry,
    SessionStateController, TransitionOutcome,
};

/// Result of one finalize run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeReport {
    Completed {
        status: SessionStatus,
        merged_fields: usize,
        blocks: usize,
    },
    /// The session moved on (e.g. was paused) before processing could start.
    Skipped { persisted: SessionStatus },
    AlreadyRunning,
    /// Synthesis failed; the session stays in `processing` and can be resumed.
    ExtractionFailed { error: String },
}

/// Dialogue ingestion and the end-of-call finalize routine.
#[derive(Clone)]
pub struct SessionPipeline {
    controller: SessionStateController,
    extraction: Arc<dyn ExtractionService>,
    processing: ProcessingRegistry,
}

impl SessionPipeline {
    pub fn new(
        controller: SessionStateController,
        extraction: Arc<dyn ExtractionService>,
        processing: ProcessingRegistry,
    ) -> Self {
        Self {
            controller,
            extraction,
            processing,
        }
    }

    pub fn controller(&self) -> &SessionStateController {
        &self.controller
    }

    pub fn processing(&self) -> &ProcessingRegistry {
        &self.processing
    }

    fn store(&self) -> &Arc<dyn SessionStore> {
        self.controller.store()
    }

    /// Stores a dialogue turn, then runs incremental extraction for
    /// participant turns. Extraction failures are logged and do not fail the append.
    pub async fn append_dialogue(
        &self,
        session_id: &str,
        role: DialogueRole,
        content: &str,
    ) -> Result<DialogueEntry, ControllerError> {
        let entry = self
            .store()
            .append_dialogue(session_id, DialogueEntry::new(role, content))
            .await?;
        if role == DialogueRole::System {
            return Ok(entry);
        }

        let dialogue = self.store().list_dialogue(session_id).await?;
        match self.extraction.extract(session_id, &dialogue).await {
            Ok(update) => {
                let merged = self.merge_agent_fields(session_id, &update).await?;
                if merged > 0 {
                    tracing::debug!(session_id, merged, "incremental extraction merged fields");
                }
            }
            Err(error) => {
                tracing::warn!(session_id, error = %error, "incremental extraction failed");
            }
        }
        Ok(entry)
    }

    /// User-facing end request. Only a live session can be ended.
    pub async fn ensure_endable(&self, session_id: &str) -> Result<(), ControllerError> {
        let status = self.controller.authoritative_status(session_id).await?;
        if status != SessionStatus::Active {
            return Err(ControllerError::InvalidTransition(
                StatusTransitionError::Invalid {
                    from: status,
                    to: SessionStatus::Processing,
                },
            ));
        }
        Ok(())
    }

    /// Runs `finalize` on the runtime without blocking the caller.
    ///
    /// The processing slot is claimed before this returns, so pollers see the
    /// indicator as soon as the end request completes.
    pub fn spawn_finalize(
        &self,
        session_id: &str,
    ) -> JoinHandle<Result<FinalizeReport, ControllerError>> {
        let guard = self.processing.begin(session_id);
        let pipeline = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let report = match guard {
                Some(guard) => pipeline.run_finalize(&session_id, guard).await,
                None => Ok(FinalizeReport::AlreadyRunning),
            };
            match &report {
                Ok(report) => tracing::info!(session_id = %session_id, ?report, "finalize finished"),
                Err(error) => tracing::warn!(session_id = %session_id, error = %error, "finalize failed"),
            }
            report
        })
    }

    /// `processing`, synthesis, merge, then `reviewing`; every status write is
    /// conditional so a concurrent pause always survives.
    pub async fn finalize(&self, session_id: &str) -> Result<FinalizeReport, ControllerError> {
        let Some(guard) = self.processing.begin(session_id) else {
            return Ok(FinalizeReport::AlreadyRunning);
        };
        self.run_finalize(session_id, guard).await
    }

    async fn run_finalize(
        &self,
        session_id: &str,
        _guard: ProcessingGuard,
    ) -> Result<FinalizeReport, ControllerError> {
        if let TransitionOutcome::RaceLost { persisted, .. } =
            self.controller.begin_processing(session_id).await?
        {
            return Ok(FinalizeReport::Skipped { persisted });
        }

        let dialogue = self.store().list_dialogue(session_id).await?;
        let document = match self.extraction.finalize(session_id, &dialogue).await {
            Ok(document) => document,
            Err(error) => {
                tracing::warn!(session_id, error = %error, "final synthesis failed");
                return Ok(FinalizeReport::ExtractionFailed {
                    error: error.to_string(),
                });
            }
        };

        let merged_fields = self.merge_agent_fields(session_id, &document.anketa).await?;
        let blocks = document.blocks.len();
        if blocks > 0 {
            self.store()
                .append_ai_blocks(session_id, document.blocks)
                .await?;
        }

        let status = self.controller.begin_review(session_id).await?.status();
        Ok(FinalizeReport::Completed {
            status,
            merged_fields,
            blocks,
        })
    }

    /// Merges non-blank canonical values in storage shape. Agent writes never clear a field.
    async fn merge_agent_fields(
        &self,
        session_id: &str,
        update: &AnketaRecord,
    ) -> Result<usize, ControllerError> {
        let filled: AnketaRecord = update
            .iter()
            .filter(|(_, value)| !is_blank(value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if filled.is_empty() {
            return Ok(0);
        }
        let count = filled.len();
        self.store()
            .merge_anketa(session_id, denormalize(&filled))
            .await?;
        Ok(count)
    }
}

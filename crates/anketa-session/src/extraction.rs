use anketa_types::{AiBlock, AnketaRecord, DialogueEntry};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extraction backend unavailable: {0}")]
    Unavailable(String),
    #[error("extraction produced malformed output: {0}")]
    Malformed(String),
}

/// Structured output of the end-of-call synthesis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalDocument {
    /// Canonical-shaped field updates.
    pub anketa: AnketaRecord,
    pub blocks: Vec<AiBlock>,
}

/// Derives questionnaire content from dialogue.
///
/// Implementations return canonical field names; the pipeline maps them to the
/// storage shape before merging.
#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Incremental pass run after each captured dialogue turn.
    async fn extract(
        &self,
        session_id: &str,
        dialogue: &[DialogueEntry],
    ) -> Result<AnketaRecord, ExtractionError>;

    /// Full synthesis run once the call ends.
    async fn finalize(
        &self,
        session_id: &str,
        dialogue: &[DialogueEntry],
    ) -> Result<FinalDocument, ExtractionError>;
}

/// Extraction backend that derives nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExtractionService;

#[async_trait]
impl ExtractionService for NoopExtractionService {
    async fn extract(
        &self,
        _session_id: &str,
        _dialogue: &[DialogueEntry],
    ) -> Result<AnketaRecord, ExtractionError> {
        Ok(AnketaRecord::new())
    }

    async fn finalize(
        &self,
        _session_id: &str,
        _dialogue: &[DialogueEntry],
    ) -> Result<FinalDocument, ExtractionError> {
        Ok(FinalDocument::default())
    }
}

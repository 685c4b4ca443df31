//! Authoritative session lifecycle for anketa consultations.
//!
//! `SessionStateController` owns every status write and enforces the
//! read-then-conditional-write discipline; `SessionPipeline` layers dialogue
//! ingestion and the end-of-call finalize routine on top of it.

mod affordances;
mod controller;
mod extraction;
mod pipeline;
mod processing;

pub use affordances::StatusAffordances;
pub use controller::{ControllerError, SessionStateController, TransitionOutcome};
pub use extraction::{ExtractionError, ExtractionService, FinalDocument, NoopExtractionService};
pub use pipeline::{FinalizeReport, SessionPipeline};
pub use processing::{ProcessingGuard, ProcessingRegistry};

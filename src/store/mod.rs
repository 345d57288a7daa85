//! Persisted entities for the call-analysis pipeline.
//!
//! One database file holds operators, call files and the per-stage
//! derived artefacts (transcription, diarization, analysis).

mod models;
mod schema;
#[allow(clippy::module_inception)]
mod store;

pub use models::{
    Analysis, CallRecord, Diarization, DiarizationMethod, FileStatus, Operator, ResultsFilter,
    ResultsPage, ScoreQuote, Speaker, SpeakerSegment, Transcription, WordTiming,
};
pub use store::{CallStore, ResultListRow, SqliteCallStore};

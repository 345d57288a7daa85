//! Trait seams for the external engines and their production clients.
//!
//! All four engines are black boxes to the pipeline: the probe tool
//! (ffprobe/ffmpeg), the speech-to-text service, the speaker-separation
//! service and the scoring model. The orchestrator only sees the traits,
//! which is also what the test suite mocks.

mod probe;
mod scorer;
mod separator;
mod transcriber;

pub use probe::{AudioProbe, FfmpegAudioTool, ProbeInfo, StereoPcm};
pub use scorer::{CallScorer, ChatScorer};
pub use separator::{PyannoteClient, SpeakerSeparator, SpeakerTurn};
pub use transcriber::{Transcriber, TranscriptOutput, WhisperClient};

use thiserror::Error;

/// Errors shared by the engine clients.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Audio could not be decoded: {0}")]
    Undecodable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EngineError::Timeout
        } else {
            EngineError::Connection(e.to_string())
        }
    }
}

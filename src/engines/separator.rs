//! Speaker-separation engine client.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::EngineError;

/// One time range attributed to an engine-labelled speaker. Labels are
/// opaque (e.g. "SPEAKER_00"); role mapping happens in the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerTurn {
    pub start: f64,
    pub end: f64,
    pub label: String,
}

#[async_trait]
pub trait SpeakerSeparator: Send + Sync {
    /// False when the auth credential is missing; the pipeline then falls
    /// back to a single-speaker result instead of failing the job.
    fn is_available(&self) -> bool;

    async fn separate(&self, path: &Path) -> Result<Vec<SpeakerTurn>, EngineError>;
}

/// Client for a pyannote speaker-diarization service.
pub struct PyannoteClient {
    client: Client,
    base_url: String,
    hf_token: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct SeparateRequest<'a> {
    path: &'a str,
}

#[derive(Debug, Deserialize)]
struct SeparateResponse {
    #[serde(default)]
    turns: Vec<ResponseTurn>,
}

#[derive(Debug, Deserialize)]
struct ResponseTurn {
    start: f64,
    end: f64,
    speaker: String,
}

impl PyannoteClient {
    pub fn new(base_url: impl Into<String>, hf_token: Option<String>, timeout_sec: u64) -> Self {
        let hf_token = hf_token.filter(|t| !t.trim().is_empty());
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            hf_token,
            timeout: Duration::from_secs(timeout_sec),
        }
    }
}

#[async_trait]
impl SpeakerSeparator for PyannoteClient {
    fn is_available(&self) -> bool {
        self.hf_token.is_some()
    }

    async fn separate(&self, path: &Path) -> Result<Vec<SpeakerTurn>, EngineError> {
        let token = self
            .hf_token
            .as_deref()
            .ok_or_else(|| EngineError::Connection("HF token not configured".to_string()))?;

        let url = format!("{}/diarize", self.base_url);
        let path_str = path.to_string_lossy();

        debug!(path = %path_str, "requesting speaker separation");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", token))
            .json(&SeparateRequest { path: &path_str })
            .timeout(self.timeout)
            .send()
            .await
            .map_err(EngineError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let parsed: SeparateResponse = response
            .json()
            .await
            .map_err(|e| EngineError::InvalidResponse(format!("diarization response: {e}")))?;

        Ok(parsed
            .turns
            .into_iter()
            .map(|t| SpeakerTurn {
                start: t.start,
                end: t.end,
                label: t.speaker,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_token_means_unavailable() {
        assert!(!PyannoteClient::new("http://x", None, 60).is_available());
        assert!(!PyannoteClient::new("http://x", Some("  ".to_string()), 60).is_available());
        assert!(PyannoteClient::new("http://x", Some("hf_abc".to_string()), 60).is_available());
    }

    #[test]
    fn response_parses_turns() {
        let json = r#"{"turns": [
            {"start": 0.0, "end": 2.5, "speaker": "SPEAKER_00"},
            {"start": 2.5, "end": 4.0, "speaker": "SPEAKER_01"}
        ]}"#;
        let parsed: SeparateResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.turns.len(), 2);
        assert_eq!(parsed.turns[1].speaker, "SPEAKER_01");
    }
}

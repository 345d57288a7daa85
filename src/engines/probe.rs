//! Audio probing and decoding via ffprobe/ffmpeg subprocesses.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use super::EngineError;

/// A probe must answer within this budget; exceeding it is a validation
/// failure, not a crash.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Full-file stereo decode can take much longer on long recordings.
const DECODE_TIMEOUT: Duration = Duration::from_secs(300);

pub const SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeInfo {
    pub duration_sec: f64,
    pub channels: u32,
}

/// Decoded stereo PCM, one f32 vector per channel.
#[derive(Debug, Clone, Default)]
pub struct StereoPcm {
    pub left: Vec<f32>,
    pub right: Vec<f32>,
    pub sample_rate: u32,
}

/// Probe and decode operations the pipeline needs from the audio tool.
#[async_trait]
pub trait AudioProbe: Send + Sync {
    /// Probe an in-memory blob (used by the validator before the blob has
    /// a permanent location).
    async fn probe_bytes(&self, ext: &str, data: &[u8]) -> Result<ProbeInfo, EngineError>;

    /// Probe a file already on disk.
    async fn probe_path(&self, path: &Path) -> Result<ProbeInfo, EngineError>;

    /// Decode a file to 16 kHz two-channel PCM for channel-split
    /// diarization.
    async fn decode_stereo(&self, path: &Path) -> Result<StereoPcm, EngineError>;
}

/// ffprobe/ffmpeg backed implementation.
pub struct FfmpegAudioTool;

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    channels: Option<u32>,
}

impl FfmpegAudioTool {
    async fn run_ffprobe(&self, path: &Path) -> Result<ProbeInfo, EngineError> {
        let output = tokio::time::timeout(
            PROBE_TIMEOUT,
            Command::new("ffprobe")
                .args(["-v", "quiet", "-print_format", "json", "-show_streams", "-show_format"])
                .arg(path)
                .output(),
        )
        .await
        .map_err(|_| EngineError::Timeout)??;

        if !output.status.success() {
            return Err(EngineError::Undecodable(format!(
                "ffprobe exited with status {}",
                output.status
            )));
        }

        let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| EngineError::InvalidResponse(format!("ffprobe output: {e}")))?;

        let duration_sec = parsed
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse::<f64>().ok())
            .unwrap_or(0.0);
        let channels = parsed
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("audio"))
            .and_then(|s| s.channels)
            .unwrap_or(0);

        debug!(
            path = %path.display(),
            duration_sec,
            channels,
            "probed audio file"
        );
        Ok(ProbeInfo {
            duration_sec,
            channels,
        })
    }

    fn scratch_path(ext: &str) -> PathBuf {
        std::env::temp_dir().join(format!("probe-{}.{}", Uuid::new_v4(), ext))
    }
}

#[async_trait]
impl AudioProbe for FfmpegAudioTool {
    async fn probe_bytes(&self, ext: &str, data: &[u8]) -> Result<ProbeInfo, EngineError> {
        let scratch = Self::scratch_path(ext);
        tokio::fs::write(&scratch, data).await?;
        let result = self.run_ffprobe(&scratch).await;
        if let Err(e) = tokio::fs::remove_file(&scratch).await {
            warn!("Failed to remove probe scratch file {:?}: {}", scratch, e);
        }
        result
    }

    async fn probe_path(&self, path: &Path) -> Result<ProbeInfo, EngineError> {
        self.run_ffprobe(path).await
    }

    async fn decode_stereo(&self, path: &Path) -> Result<StereoPcm, EngineError> {
        let output = tokio::time::timeout(
            DECODE_TIMEOUT,
            Command::new("ffmpeg")
                .arg("-i")
                .arg(path)
                .args([
                    "-ar",
                    &SAMPLE_RATE.to_string(),
                    "-ac",
                    "2",
                    "-f",
                    "f32le",
                    "-loglevel",
                    "quiet",
                    "pipe:1",
                ])
                .output(),
        )
        .await
        .map_err(|_| EngineError::Timeout)??;

        if !output.status.success() {
            return Err(EngineError::Undecodable(format!(
                "ffmpeg exited with status {}",
                output.status
            )));
        }

        Ok(deinterleave_f32le(&output.stdout))
    }
}

/// Split interleaved little-endian f32 stereo frames `[L0, R0, L1, R1, …]`
/// into per-channel vectors. A trailing partial frame is discarded.
fn deinterleave_f32le(raw: &[u8]) -> StereoPcm {
    let frame_count = raw.len() / 8;
    let mut left = Vec::with_capacity(frame_count);
    let mut right = Vec::with_capacity(frame_count);
    for frame in raw.chunks_exact(8) {
        left.push(f32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]));
        right.push(f32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]));
    }
    StereoPcm {
        left,
        right,
        sample_rate: SAMPLE_RATE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deinterleave_splits_channels() {
        let mut raw = Vec::new();
        for (l, r) in [(1.0f32, -1.0f32), (0.5, -0.5)] {
            raw.extend_from_slice(&l.to_le_bytes());
            raw.extend_from_slice(&r.to_le_bytes());
        }
        let pcm = deinterleave_f32le(&raw);
        assert_eq!(pcm.left, vec![1.0, 0.5]);
        assert_eq!(pcm.right, vec![-1.0, -0.5]);
        assert_eq!(pcm.sample_rate, SAMPLE_RATE);
    }

    #[test]
    fn deinterleave_drops_partial_frame() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1.0f32.to_le_bytes());
        raw.extend_from_slice(&2.0f32.to_le_bytes());
        raw.extend_from_slice(&[0u8; 3]);
        let pcm = deinterleave_f32le(&raw);
        assert_eq!(pcm.left.len(), 1);
        assert_eq!(pcm.right.len(), 1);
    }

    #[test]
    fn ffprobe_json_parses_duration_and_channels() {
        let json = r#"{
            "streams": [
                {"codec_type": "video"},
                {"codec_type": "audio", "channels": 2}
            ],
            "format": {"duration": "8.250000"}
        }"#;
        let parsed: FfprobeOutput = serde_json::from_str(json).unwrap();
        let duration = parsed
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse::<f64>().ok())
            .unwrap();
        assert!((duration - 8.25).abs() < 1e-9);
        let channels = parsed
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("audio"))
            .and_then(|s| s.channels);
        assert_eq!(channels, Some(2));
    }
}

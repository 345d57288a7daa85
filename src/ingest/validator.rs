//! Content validation for uploaded audio blobs.
//!
//! Checks run in a fixed order and short-circuit on the first failure:
//! extension, size, magic bytes, SHA-256, probe, duration bounds, dedup.
//! The validator never touches the store; the caller supplies the set of
//! known hashes and keeps it growing across a batch.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::engines::{AudioProbe, EngineError};

pub const ALLOWED_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "flac", "m4a", "webm"];

/// Magic-byte prefixes per extension. m4a is handled separately: its
/// `ftyp` marker sits at offset 4.
const MAGIC_SIGNATURES: &[(&str, &[&[u8]])] = &[
    ("mp3", &[&[0xFF, 0xFB], &[0xFF, 0xF3], &[0xFF, 0xF2], b"ID3"]),
    ("wav", &[b"RIFF"]),
    ("ogg", &[b"OggS"]),
    ("flac", &[b"fLaC"]),
    ("webm", &[&[0x1A, 0x45, 0xDF, 0xA3]]),
];

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    /// New content, safe to ingest.
    Valid {
        file_hash: String,
        duration_sec: f64,
        channels: u32,
        ext: String,
    },
    /// Byte-identical content already known; duration and channels are
    /// still populated so the caller can report them.
    Duplicate {
        file_hash: String,
        duration_sec: f64,
        channels: u32,
    },
    Invalid { reason: String },
}

impl ValidationOutcome {
    fn invalid(reason: impl Into<String>) -> Self {
        ValidationOutcome::Invalid {
            reason: reason.into(),
        }
    }
}

pub struct Validator {
    max_file_size_bytes: u64,
    min_duration_sec: f64,
    max_duration_sec: f64,
}

impl Validator {
    pub fn new(max_file_size_mb: u64, min_duration_sec: f64, max_duration_sec: f64) -> Self {
        Self {
            max_file_size_bytes: max_file_size_mb * 1024 * 1024,
            min_duration_sec,
            max_duration_sec,
        }
    }

    pub async fn validate(
        &self,
        filename: &str,
        content: &[u8],
        known_hashes: &HashMap<String, String>,
        probe: &dyn AudioProbe,
    ) -> ValidationOutcome {
        // 1. Extension whitelist
        let Some(ext) = extension_of(filename) else {
            return ValidationOutcome::invalid(format!(
                "Unsupported format. Allowed: {}",
                ALLOWED_EXTENSIONS.join(", ")
            ));
        };

        // 2. Size bounds
        let size = content.len() as u64;
        if size == 0 {
            return ValidationOutcome::invalid("File is empty");
        }
        if size > self.max_file_size_bytes {
            return ValidationOutcome::invalid(format!(
                "File size ({} MB) exceeds the {} MB limit",
                size / 1024 / 1024,
                self.max_file_size_bytes / 1024 / 1024
            ));
        }

        // 3. Magic bytes
        if !matches_magic(content, &ext) {
            return ValidationOutcome::invalid(format!(
                "File content does not match the .{} extension",
                ext
            ));
        }

        // 4. SHA-256 before the probe: cheap and needed either way
        let file_hash = sha256_hex(content);

        // 5. Probe
        let info = match probe.probe_bytes(&ext, content).await {
            Ok(info) => info,
            Err(EngineError::Timeout) => {
                return ValidationOutcome::invalid("Audio analysis timed out")
            }
            Err(e) => return ValidationOutcome::invalid(format!("File cannot be decoded: {e}")),
        };
        if info.duration_sec <= 0.0 {
            return ValidationOutcome::invalid("Could not determine audio duration");
        }
        if info.channels < 1 {
            return ValidationOutcome::invalid("No audio stream found");
        }

        // 6. Duration bounds
        if info.duration_sec < self.min_duration_sec {
            return ValidationOutcome::invalid(format!(
                "Duration ({:.1} s) is below the {:.0} s minimum",
                info.duration_sec, self.min_duration_sec
            ));
        }
        if info.duration_sec > self.max_duration_sec {
            return ValidationOutcome::invalid(format!(
                "Duration ({:.1} h) exceeds the {:.0} h maximum",
                info.duration_sec / 3600.0,
                self.max_duration_sec / 3600.0
            ));
        }

        // 7. Dedup
        if known_hashes.contains_key(&file_hash) {
            return ValidationOutcome::Duplicate {
                file_hash,
                duration_sec: info.duration_sec,
                channels: info.channels,
            };
        }

        ValidationOutcome::Valid {
            file_hash,
            duration_sec: info.duration_sec,
            channels: info.channels,
            ext,
        }
    }
}

/// Lower-cased extension, only if it is on the whitelist.
fn extension_of(filename: &str) -> Option<String> {
    let ext = filename.rsplit_once('.')?.1.to_lowercase();
    if ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        Some(ext)
    } else {
        None
    }
}

fn matches_magic(content: &[u8], ext: &str) -> bool {
    if ext == "m4a" {
        return content.len() >= 8 && &content[4..8] == b"ftyp";
    }
    let Some((_, signatures)) = MAGIC_SIGNATURES.iter().find(|(e, _)| *e == ext) else {
        return true;
    };
    signatures.iter().any(|sig| content.starts_with(sig))
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

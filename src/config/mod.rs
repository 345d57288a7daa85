//! Environment-driven configuration.
//!
//! Every setting is resolvable from the environment (or the matching CLI
//! flag); `AppConfig::resolve` validates the combination once at startup.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

/// Model label sent to the scoring engine and stored with each analysis.
pub const SCORING_MODEL: &str = "gpt-4";

/// Timeout for one engine call (transcription/separation run minutes on
/// long recordings).
pub const ENGINE_TIMEOUT_SEC: u64 = 600;

/// Timeout for one scoring completion.
pub const SCORING_TIMEOUT_SEC: u64 = 60;

#[derive(Parser, Debug, Clone)]
#[clap(name = "call-analytics-server", about = "Call-center audio analysis server")]
pub struct CliArgs {
    /// SQLite database location. `sqlite://` URLs are accepted for
    /// compatibility with container setups.
    #[clap(long, env = "DATABASE_URL", default_value = "data/call_analytics.db")]
    pub database_url: String,

    /// Scoring engine credential; analysis is skipped when empty.
    #[clap(long, env = "OPENAI_API_KEY", default_value = "", hide_env_values = true)]
    pub openai_api_key: String,

    /// Base URL of the OpenAI-compatible scoring API.
    #[clap(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    /// Transcription service endpoint.
    #[clap(long, env = "WHISPER_URL", default_value = "http://127.0.0.1:9000")]
    pub whisper_url: String,

    #[clap(long, env = "WHISPER_MODEL", default_value = "large-v3")]
    pub whisper_model: String,

    #[clap(long, env = "WHISPER_DEVICE", default_value = "cuda")]
    pub whisper_device: String,

    #[clap(long, env = "WHISPER_LANGUAGE", default_value = "ru")]
    pub whisper_language: String,

    /// Speaker-separation credential; single-speaker fallback when empty.
    #[clap(long, env = "HF_TOKEN", default_value = "", hide_env_values = true)]
    pub hf_token: String,

    /// Speaker-separation service endpoint.
    #[clap(long, env = "PYANNOTE_URL", default_value = "http://127.0.0.1:9001")]
    pub pyannote_url: String,

    #[clap(long, env = "MAX_FILE_SIZE_MB", default_value_t = 500)]
    pub max_file_size_mb: u64,

    #[clap(long, env = "MAX_BATCH_SIZE", default_value_t = 20)]
    pub max_batch_size: usize,

    #[clap(long, env = "MIN_DURATION_SEC", default_value_t = 3)]
    pub min_duration_sec: u64,

    #[clap(long, env = "MAX_DURATION_SEC", default_value_t = 14400)]
    pub max_duration_sec: u64,

    /// Retention for uploaded blobs; enforcement is an operator concern.
    #[clap(long, env = "AUDIO_RETENTION_DAYS", default_value_t = 7)]
    pub audio_retention_days: u64,

    #[clap(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[clap(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Comma-separated list; `*` allows any origin.
    #[clap(long, env = "CORS_ORIGINS", default_value = "http://localhost:5173")]
    pub cors_origins: String,

    #[clap(long, env = "UPLOADS_DIR", default_value = "data/uploads")]
    pub uploads_dir: PathBuf,

    #[clap(long, env = "AUDIO_DIR", default_value = "data/audio")]
    pub audio_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub whisper_url: String,
    pub whisper_model: String,
    pub whisper_device: String,
    pub whisper_language: String,
    pub hf_token: Option<String>,
    pub pyannote_url: String,
    pub max_file_size_mb: u64,
    pub max_batch_size: usize,
    pub min_duration_sec: f64,
    pub max_duration_sec: f64,
    pub audio_retention_days: u64,
    pub host: String,
    pub port: u16,
    pub cors_origins: String,
    pub uploads_dir: PathBuf,
    pub audio_dir: PathBuf,
}

impl AppConfig {
    pub fn resolve(args: &CliArgs) -> Result<Self> {
        if args.max_batch_size == 0 {
            bail!("max_batch_size must be at least 1");
        }
        if args.max_file_size_mb == 0 {
            bail!("max_file_size_mb must be at least 1");
        }
        if args.min_duration_sec >= args.max_duration_sec {
            bail!(
                "min_duration_sec ({}) must be below max_duration_sec ({})",
                args.min_duration_sec,
                args.max_duration_sec
            );
        }

        let database_path = PathBuf::from(
            args.database_url
                .strip_prefix("sqlite://")
                .unwrap_or(&args.database_url),
        );

        let blank_to_none = |s: &str| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        };

        Ok(Self {
            database_path,
            openai_api_key: blank_to_none(&args.openai_api_key),
            openai_base_url: args.openai_base_url.clone(),
            whisper_url: args.whisper_url.clone(),
            whisper_model: args.whisper_model.clone(),
            whisper_device: args.whisper_device.clone(),
            whisper_language: args.whisper_language.clone(),
            hf_token: blank_to_none(&args.hf_token),
            pyannote_url: args.pyannote_url.clone(),
            max_file_size_mb: args.max_file_size_mb,
            max_batch_size: args.max_batch_size,
            min_duration_sec: args.min_duration_sec as f64,
            max_duration_sec: args.max_duration_sec as f64,
            audio_retention_days: args.audio_retention_days,
            host: args.host.clone(),
            port: args.port,
            cors_origins: args.cors_origins.clone(),
            uploads_dir: args.uploads_dir.clone(),
            audio_dir: args.audio_dir.clone(),
        })
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    pub fn cors_origins_list(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_args() -> CliArgs {
        CliArgs::parse_from(["call-analytics-server"])
    }

    #[test]
    fn defaults_resolve() {
        let config = AppConfig::resolve(&default_args()).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.max_file_size_mb, 500);
        assert_eq!(config.max_batch_size, 20);
        assert_eq!(config.min_duration_sec, 3.0);
        assert_eq!(config.max_duration_sec, 14400.0);
        assert!(config.openai_api_key.is_none());
        assert!(config.hf_token.is_none());
        assert_eq!(config.database_path, PathBuf::from("data/call_analytics.db"));
    }

    #[test]
    fn sqlite_url_prefix_is_stripped() {
        let mut args = default_args();
        args.database_url = "sqlite:///var/lib/call.db".to_string();
        let config = AppConfig::resolve(&args).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/var/lib/call.db"));
    }

    #[test]
    fn blank_credentials_become_none() {
        let mut args = default_args();
        args.openai_api_key = "   ".to_string();
        args.hf_token = "hf_secret".to_string();
        let config = AppConfig::resolve(&args).unwrap();
        assert!(config.openai_api_key.is_none());
        assert_eq!(config.hf_token.as_deref(), Some("hf_secret"));
    }

    #[test]
    fn cors_origins_split_and_trimmed() {
        let mut args = default_args();
        args.cors_origins = "http://a.example, http://b.example ,".to_string();
        let config = AppConfig::resolve(&args).unwrap();
        assert_eq!(
            config.cors_origins_list(),
            vec!["http://a.example".to_string(), "http://b.example".to_string()]
        );
    }

    #[test]
    fn invalid_duration_bounds_are_rejected() {
        let mut args = default_args();
        args.min_duration_sec = 100;
        args.max_duration_sec = 50;
        assert!(AppConfig::resolve(&args).is_err());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut args = default_args();
        args.max_batch_size = 0;
        assert!(AppConfig::resolve(&args).is_err());
    }

    #[test]
    fn max_file_size_bytes_converts_mebibytes() {
        let config = AppConfig::resolve(&default_args()).unwrap();
        assert_eq!(config.max_file_size_bytes(), 500 * 1024 * 1024);
    }

    #[test]
    fn env_vars_feed_args() {
        // clap env support: value comes from the environment when the
        // flag is absent.
        std::env::set_var("PORT", "9123");
        let args = CliArgs::parse_from(["call-analytics-server"]);
        std::env::remove_var("PORT");
        assert_eq!(args.port, 9123);
    }
}

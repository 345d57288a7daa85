use serde::{Deserialize, Serialize};

/// Lifecycle status of a call file.
///
/// `Done` and `Failed` are terminal; the three running states mean a
/// worker owns the job (or a crash left it behind, see recovery).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Queued,
    Transcribing,
    Diarizing,
    Analyzing,
    Done,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Queued => "queued",
            FileStatus::Transcribing => "transcribing",
            FileStatus::Diarizing => "diarizing",
            FileStatus::Analyzing => "analyzing",
            FileStatus::Done => "done",
            FileStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(FileStatus::Queued),
            "transcribing" => Some(FileStatus::Transcribing),
            "diarizing" => Some(FileStatus::Diarizing),
            "analyzing" => Some(FileStatus::Analyzing),
            "done" => Some(FileStatus::Done),
            "failed" => Some(FileStatus::Failed),
            _ => None,
        }
    }

    /// True for statuses that mean "was being processed when the server died".
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            FileStatus::Transcribing | FileStatus::Diarizing | FileStatus::Analyzing
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Operator {
    pub id: String,
    pub name: String,
    pub created_at: i64,
}

/// A call recording tracked through the pipeline.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub id: String,
    pub operator_id: Option<String>,
    pub original_name: String,
    pub file_hash: String,
    pub file_size: i64,
    pub duration_sec: Option<f64>,
    pub audio_path: Option<String>,
    pub status: FileStatus,
    pub stage: i32,
    pub progress: i32,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    // CRM correlation columns (schema v1). Written by the out-of-core
    // webhook ingester; the pipeline only reads them back.
    pub caller_phone: Option<String>,
    pub called_phone: Option<String>,
    pub operator_phone: Option<String>,
    pub crm_duration: Option<i64>,
    pub order_id: Option<String>,
}

impl CallRecord {
    /// Fresh record as inserted by the ingestion facade.
    pub fn new_queued(
        id: String,
        operator_id: String,
        original_name: String,
        file_hash: String,
        file_size: i64,
        duration_sec: f64,
        audio_path: String,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id,
            operator_id: Some(operator_id),
            original_name,
            file_hash,
            file_size,
            duration_sec: Some(duration_sec),
            audio_path: Some(audio_path),
            status: FileStatus::Queued,
            stage: 0,
            progress: 0,
            retry_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            caller_phone: None,
            called_phone: None,
            operator_phone: None,
            crm_duration: None,
            order_id: None,
        }
    }
}

/// One transcribed word with absolute timings in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone)]
pub struct Transcription {
    pub id: String,
    pub file_id: String,
    pub full_text: String,
    pub words: Vec<WordTiming>,
    pub language: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Operator,
    Client,
    Unknown,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Operator => "operator",
            Speaker::Client => "client",
            Speaker::Unknown => "unknown",
        }
    }
}

/// A merged utterance: consecutive words by the same speaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerSegment {
    pub speaker: Speaker,
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiarizationMethod {
    ChannelSplit,
    Pyannote,
}

impl DiarizationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiarizationMethod::ChannelSplit => "channel_split",
            DiarizationMethod::Pyannote => "pyannote",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "channel_split" => Some(DiarizationMethod::ChannelSplit),
            "pyannote" => Some(DiarizationMethod::Pyannote),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Diarization {
    pub id: String,
    pub file_id: String,
    pub segments: Vec<SpeakerSegment>,
    pub method: DiarizationMethod,
    /// None means the result is exact (channel split) and no probabilistic
    /// score applies.
    pub confidence: Option<f64>,
    pub num_speakers: i32,
    pub created_at: i64,
}

/// Quote extracted by the scoring engine. `criterion` and `sentiment`
/// come from the engine and are kept verbatim after filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreQuote {
    pub text: String,
    pub criterion: String,
    pub sentiment: String,
}

#[derive(Debug, Clone)]
pub struct Analysis {
    pub id: String,
    pub file_id: String,
    pub standard: i32,
    pub loyalty: i32,
    pub kindness: i32,
    pub overall: i32,
    pub summary: String,
    pub quotes: Vec<ScoreQuote>,
    pub model: String,
    /// Some engine fields required clamping or defaulting.
    pub partial: bool,
    pub created_at: i64,
}

/// Filters for the paginated results listing.
#[derive(Debug, Clone, Default)]
pub struct ResultsFilter {
    pub page: usize,
    pub limit: usize,
    /// Substring match on the operator name.
    pub operator: Option<String>,
    pub status: Option<FileStatus>,
    pub date_from: Option<i64>,
    pub date_to: Option<i64>,
    pub score_min: Option<i32>,
    pub score_max: Option<i32>,
    /// Substring match on the original filename.
    pub q: Option<String>,
}

#[derive(Debug)]
pub struct ResultsPage<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
    pub pages: usize,
}

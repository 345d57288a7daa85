//! Shared fixture: a real store/queue/worker wired to scripted engines.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use call_analytics_server::engines::{
    AudioProbe, CallScorer, EngineError, ProbeInfo, SpeakerSeparator, SpeakerTurn, StereoPcm,
    Transcriber, TranscriptOutput,
};
use call_analytics_server::ingest::{IngestionManager, Validator};
use call_analytics_server::pipeline::PipelineEngines;
use call_analytics_server::progress::ProgressBus;
use call_analytics_server::queue::{JobQueue, QueueReceiver, QueueWorker};
use call_analytics_server::store::{CallRecord, CallStore, FileStatus, SqliteCallStore, WordTiming};

// === Scripted engines ===

pub struct MockProbe {
    pub duration_sec: f64,
    pub channels: u32,
    pub pcm: StereoPcm,
}

impl MockProbe {
    pub fn mono(duration_sec: f64) -> Self {
        Self {
            duration_sec,
            channels: 1,
            pcm: StereoPcm::default(),
        }
    }

    /// Stereo where the left channel is loud for the first half of the
    /// recording and the right channel for the second half.
    pub fn stereo_half_split(duration_sec: f64) -> Self {
        let sample_rate = 1_000u32;
        let n = (duration_sec * sample_rate as f64) as usize;
        let mut left = vec![0.01f32; n];
        let mut right = vec![0.01f32; n];
        for i in 0..n / 2 {
            left[i] = 0.9;
        }
        for i in n / 2..n {
            right[i] = 0.9;
        }
        Self {
            duration_sec,
            channels: 2,
            pcm: StereoPcm {
                left,
                right,
                sample_rate,
            },
        }
    }
}

#[async_trait]
impl AudioProbe for MockProbe {
    async fn probe_bytes(&self, _ext: &str, _data: &[u8]) -> Result<ProbeInfo, EngineError> {
        Ok(ProbeInfo {
            duration_sec: self.duration_sec,
            channels: self.channels,
        })
    }

    async fn probe_path(&self, _path: &Path) -> Result<ProbeInfo, EngineError> {
        Ok(ProbeInfo {
            duration_sec: self.duration_sec,
            channels: self.channels,
        })
    }

    async fn decode_stereo(&self, _path: &Path) -> Result<StereoPcm, EngineError> {
        Ok(self.pcm.clone())
    }
}

/// Pops scripted responses in order; repeats the last one when exhausted.
pub struct MockTranscriber {
    script: Mutex<Vec<Result<TranscriptOutput, String>>>,
    pub calls: AtomicUsize,
}

impl MockTranscriber {
    pub fn with_script(script: Vec<Result<TranscriptOutput, String>>) -> Self {
        Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn fixed(output: TranscriptOutput) -> Self {
        Self::with_script(vec![Ok(output)])
    }

    pub fn failing(message: &str) -> Self {
        Self::with_script(vec![Err(message.to_string())])
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, _path: &Path) -> Result<TranscriptOutput, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        let next = if script.len() > 1 {
            script.remove(0)
        } else {
            script[0].clone()
        };
        next.map_err(EngineError::Connection)
    }
}

pub struct MockSeparator {
    pub available: bool,
    pub turns: Vec<SpeakerTurn>,
}

#[async_trait]
impl SpeakerSeparator for MockSeparator {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn separate(&self, _path: &Path) -> Result<Vec<SpeakerTurn>, EngineError> {
        Ok(self.turns.clone())
    }
}

pub struct MockScorer {
    pub response: Option<String>,
    pub calls: AtomicUsize,
}

impl MockScorer {
    pub fn returning(response: &str) -> Self {
        Self {
            response: Some(response.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn down() -> Self {
        Self {
            response: None,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CallScorer for MockScorer {
    fn is_available(&self) -> bool {
        true
    }

    fn model_label(&self) -> &str {
        "mock-model"
    }

    async fn score(
        &self,
        _system_prompt: &str,
        _user_message: &str,
    ) -> Result<String, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.response {
            Some(response) => Ok(response.clone()),
            None => Err(EngineError::Connection("engine down".to_string())),
        }
    }
}

// === Helpers ===

/// Ten words spread over `duration_sec`, each covering 70% of its slot.
pub fn ten_words(duration_sec: f64) -> TranscriptOutput {
    let slot = duration_sec / 10.0;
    let words = (0..10)
        .map(|i| WordTiming {
            word: format!("w{i}"),
            start: i as f64 * slot,
            end: i as f64 * slot + slot * 0.7,
        })
        .collect();
    TranscriptOutput {
        full_text: (0..10).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" "),
        words,
        language: "ru".to_string(),
    }
}

pub fn wav_blob(tag: u8) -> Vec<u8> {
    let mut bytes = b"RIFF".to_vec();
    bytes.extend_from_slice(&[tag; 48]);
    bytes
}

pub const GOOD_SCORECARD: &str = r#"{"standard": 80, "loyalty": 70, "kindness": 90,
    "overall": 30, "summary": "handled the call well",
    "quotes": [{"text": "w0", "criterion": "standard", "sentiment": "positive"}]}"#;

// === Fixture ===

pub struct Fixture {
    pub tmp: TempDir,
    pub store: Arc<SqliteCallStore>,
    pub queue: Arc<JobQueue>,
    pub bus: Arc<ProgressBus>,
    receiver: Option<QueueReceiver>,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(SqliteCallStore::open(tmp.path().join("call.db")).unwrap());
        let (queue, receiver) = JobQueue::new();
        Self {
            tmp,
            store,
            queue,
            bus: Arc::new(ProgressBus::new()),
            receiver: Some(receiver),
        }
    }

    pub fn ingestion(&self, probe: Arc<dyn AudioProbe>) -> IngestionManager {
        IngestionManager::new(
            self.store.clone(),
            self.queue.clone(),
            probe,
            Validator::new(500, 3.0, 14400.0),
            self.tmp.path().to_path_buf(),
            20,
        )
    }

    /// Start the single worker; call at most once per fixture.
    pub fn spawn_worker(
        &mut self,
        engines: PipelineEngines,
    ) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let receiver = self.receiver.take().expect("worker already spawned");
        let worker = QueueWorker::new(
            self.queue.clone(),
            receiver,
            self.store.clone(),
            engines,
            self.bus.clone(),
        );
        worker.recover_interrupted().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));
        (shutdown, handle)
    }

    /// Poll the store until the file reaches a terminal status.
    pub async fn wait_terminal(&self, file_id: &str) -> CallRecord {
        for _ in 0..500 {
            if let Some(record) = self.store.get_file(file_id).unwrap() {
                if matches!(record.status, FileStatus::Done | FileStatus::Failed) {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("file {file_id} never reached a terminal status");
    }

    pub fn insert_manual(&self, id: &str, status: FileStatus, stage: i32) {
        let operator = self.store.upsert_operator("Ivan").unwrap();
        self.store
            .insert_files(&[CallRecord::new_queued(
                id.to_string(),
                operator.id,
                format!("{id}.wav"),
                format!("hash-{id}"),
                256,
                8.0,
                self.tmp
                    .path()
                    .join(format!("{id}.wav"))
                    .to_string_lossy()
                    .to_string(),
            )])
            .unwrap();
        if status != FileStatus::Queued || stage != 0 {
            self.store.set_progress(id, status, stage, 0).unwrap();
        }
    }
}

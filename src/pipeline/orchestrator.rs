//! Per-job state machine.
//!
//! A job enters at its persisted stage and runs every stage above it.
//! Stage numbers are committed at stage entry, so a crash mid-stage is
//! recovered by re-running that stage: the checkpoint artefact is the
//! proof of completion, and a missing artefact re-runs the stage.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::diarize::{self, DiarizationOutcome};
use super::scoring;
use crate::engines::{AudioProbe, CallScorer, SpeakerSeparator, Transcriber, TranscriptOutput};
use crate::metrics;
use crate::progress::{ProgressBus, ProgressFrame};
use crate::store::{
    Analysis, CallRecord, CallStore, Diarization, DiarizationMethod, FileStatus, Speaker,
    SpeakerSegment, Transcription,
};

/// Shared handles to the four external engines.
#[derive(Clone)]
pub struct PipelineEngines {
    pub probe: Arc<dyn AudioProbe>,
    pub transcriber: Arc<dyn Transcriber>,
    pub separator: Arc<dyn SpeakerSeparator>,
    pub scorer: Arc<dyn CallScorer>,
}

// Progress milestones: published at stage entry and after the artefact
// commit.
const TRANSCRIBE_START: i32 = 5;
const TRANSCRIBE_END: i32 = 40;
const DIARIZE_START: i32 = 45;
const DIARIZE_END: i32 = 70;
const ANALYZE_START: i32 = 75;
const ANALYZE_END: i32 = 90;
const DONE: i32 = 100;

pub struct Orchestrator {
    store: Arc<dyn CallStore>,
    engines: PipelineEngines,
    bus: Arc<ProgressBus>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn CallStore>, engines: PipelineEngines, bus: Arc<ProgressBus>) -> Self {
        Self {
            store,
            engines,
            bus,
        }
    }

    /// Run the file to completion or terminal failure. Returns Ok even on
    /// job failure; Err is reserved for infrastructure trouble the worker
    /// should log.
    pub async fn process(&self, file_id: &str) -> Result<()> {
        let Some(record) = self.store.get_file(file_id)? else {
            error!("Pipeline: file {} not found", file_id);
            return Ok(());
        };
        info!(
            "Pipeline: starting file {} (stage={}, status={})",
            file_id,
            record.stage,
            record.status.as_str()
        );

        let transcript = match self.stage_transcription(&record).await {
            Ok(transcript) => transcript,
            Err(e) => {
                self.fail(file_id, &format!("transcription failed: {e:#}")).await;
                return Ok(());
            }
        };

        let segments = match self.stage_diarization(&record, &transcript).await {
            Ok(segments) => segments,
            Err(e) => {
                self.fail(file_id, &format!("diarization failed: {e:#}")).await;
                return Ok(());
            }
        };

        self.stage_analysis(&record, &segments).await;

        self.set_and_publish(file_id, FileStatus::Done, 4, DONE).await?;
        metrics::FILES_PROCESSED_TOTAL
            .with_label_values(&["done"])
            .inc();
        info!("Pipeline complete for {}", file_id);
        Ok(())
    }

    // === Stage 1: transcription ===

    async fn stage_transcription(&self, record: &CallRecord) -> Result<TranscriptOutput> {
        if record.stage >= 1 {
            if let Some(stored) = self.store.get_transcription(&record.id)? {
                info!("Stage 1 skipped (checkpoint): {}", record.id);
                return Ok(TranscriptOutput {
                    full_text: stored.full_text,
                    words: stored.words,
                    language: stored.language,
                });
            }
            warn!("Stage 1 checkpoint missing for {}, re-running", record.id);
        }
        self.run_transcription(record).await
    }

    async fn run_transcription(&self, record: &CallRecord) -> Result<TranscriptOutput> {
        self.set_and_publish(&record.id, FileStatus::Transcribing, 1, TRANSCRIBE_START)
            .await?;
        let started = Instant::now();

        let path = self.audio_path(record)?;
        let output = self.engines.transcriber.transcribe(&path).await?;

        self.store.replace_transcription(&Transcription {
            id: Uuid::new_v4().to_string(),
            file_id: record.id.clone(),
            full_text: output.full_text.clone(),
            words: output.words.clone(),
            language: output.language.clone(),
            created_at: chrono::Utc::now().timestamp(),
        })?;
        self.set_and_publish(&record.id, FileStatus::Transcribing, 1, TRANSCRIBE_END)
            .await?;
        metrics::STAGE_DURATION_SECONDS
            .with_label_values(&["transcription"])
            .observe(started.elapsed().as_secs_f64());
        info!(
            "Transcribed {} ({} words)",
            record.id,
            output.words.len()
        );
        Ok(output)
    }

    // === Stage 2: diarization ===

    async fn stage_diarization(
        &self,
        record: &CallRecord,
        transcript: &TranscriptOutput,
    ) -> Result<Vec<SpeakerSegment>> {
        if record.stage >= 2 {
            if let Some(stored) = self.store.get_diarization(&record.id)? {
                info!("Stage 2 skipped (checkpoint): {}", record.id);
                return Ok(stored.segments);
            }
            warn!("Stage 2 checkpoint missing for {}, re-running", record.id);
        }
        self.run_diarization(record, transcript).await
    }

    async fn run_diarization(
        &self,
        record: &CallRecord,
        transcript: &TranscriptOutput,
    ) -> Result<Vec<SpeakerSegment>> {
        self.set_and_publish(&record.id, FileStatus::Diarizing, 2, DIARIZE_START)
            .await?;
        let started = Instant::now();
        let path = self.audio_path(record)?;

        let channels = match self.engines.probe.probe_path(&path).await {
            Ok(info) => info.channels,
            Err(e) => {
                warn!("Channel probe failed for {} ({}), assuming mono", record.id, e);
                1
            }
        };

        let outcome = if channels == 2 {
            let pcm = self.engines.probe.decode_stereo(&path).await?;
            let words = transcript.words.clone();
            // RMS over the full recording is CPU-bound; keep it off the
            // scheduler.
            let segments =
                tokio::task::spawn_blocking(move || diarize::split_by_channel_energy(&pcm, &words))
                    .await?;
            DiarizationOutcome {
                segments,
                method: DiarizationMethod::ChannelSplit,
                confidence: None,
                num_speakers: 2,
                warnings: Vec::new(),
            }
        } else if !self.engines.separator.is_available() {
            warn!(
                "Separation engine unavailable, single-speaker fallback for {}",
                record.id
            );
            DiarizationOutcome {
                segments: diarize::single_speaker_fallback(&transcript.words),
                method: DiarizationMethod::Pyannote,
                confidence: None,
                num_speakers: 1,
                warnings: vec![
                    "Speaker separation unavailable: auth token not configured. \
                     All text attributed to the operator."
                        .to_string(),
                ],
            }
        } else {
            let turns = self.engines.separator.separate(&path).await?;
            let roles = diarize::map_speaker_roles(&turns);
            let num_speakers = roles.len() as i32;
            let confidence = diarize::estimate_confidence(&turns);

            let mut warnings = Vec::new();
            if num_speakers > 2 {
                warnings.push(format!(
                    "Detected {} speakers; scoring may be less accurate.",
                    num_speakers
                ));
            }
            if confidence < diarize::LOW_CONFIDENCE_THRESHOLD {
                warnings.push(format!(
                    "Speaker separation is uncertain ({:.0}%). Manual review recommended.",
                    confidence
                ));
            }

            DiarizationOutcome {
                segments: diarize::assign_words_to_turns(&transcript.words, &turns, &roles),
                method: DiarizationMethod::Pyannote,
                confidence: Some(confidence),
                num_speakers,
                warnings,
            }
        };

        for warning in &outcome.warnings {
            warn!("Diarization warning for {}: {}", record.id, warning);
        }

        self.store.replace_diarization(&Diarization {
            id: Uuid::new_v4().to_string(),
            file_id: record.id.clone(),
            segments: outcome.segments.clone(),
            method: outcome.method,
            confidence: outcome.confidence,
            num_speakers: outcome.num_speakers,
            created_at: chrono::Utc::now().timestamp(),
        })?;
        self.set_and_publish(&record.id, FileStatus::Diarizing, 2, DIARIZE_END)
            .await?;
        metrics::STAGE_DURATION_SECONDS
            .with_label_values(&["diarization"])
            .observe(started.elapsed().as_secs_f64());
        Ok(outcome.segments)
    }

    // === Stage 3: analysis (non-fatal) ===

    async fn stage_analysis(&self, record: &CallRecord, segments: &[SpeakerSegment]) {
        if record.stage >= 3 {
            // A crash between stage entry and the artefact commit leaves
            // stage=3 with no row; re-run in that case. A run that ended
            // with the engine unavailable finishes at stage 4 and never
            // comes back here.
            match self.store.get_analysis(&record.id) {
                Ok(Some(_)) => {
                    info!("Stage 3 skipped (checkpoint): {}", record.id);
                    return;
                }
                Ok(None) => {
                    warn!("Stage 3 checkpoint missing for {}, re-running", record.id);
                }
                Err(e) => {
                    error!("Stage 3 checkpoint lookup failed for {}: {:#}", record.id, e);
                    return;
                }
            }
        }
        if let Err(e) = self.run_analysis(record, segments).await {
            error!(
                "Stage 3 failed for {} ({:#}), continuing without analysis",
                record.id, e
            );
        }
    }

    async fn run_analysis(&self, record: &CallRecord, segments: &[SpeakerSegment]) -> Result<()> {
        self.set_and_publish(&record.id, FileStatus::Analyzing, 3, ANALYZE_START)
            .await?;
        let started = Instant::now();

        let operator_text = join_speaker_text(segments, Speaker::Operator);
        let client_context = join_speaker_text(segments, Speaker::Client);

        match scoring::run_scoring(
            self.engines.scorer.as_ref(),
            &operator_text,
            &client_context,
        )
        .await
        {
            Some(card) => {
                self.store.replace_analysis(&Analysis {
                    id: Uuid::new_v4().to_string(),
                    file_id: record.id.clone(),
                    standard: card.standard,
                    loyalty: card.loyalty,
                    kindness: card.kindness,
                    overall: card.overall,
                    summary: card.summary,
                    quotes: card.quotes,
                    model: self.engines.scorer.model_label().to_string(),
                    partial: card.partial,
                    created_at: chrono::Utc::now().timestamp(),
                })?;
                self.set_and_publish(&record.id, FileStatus::Analyzing, 3, ANALYZE_END)
                    .await?;
                info!("Analysis stored for {} (overall={})", record.id, card.overall);
            }
            None => {
                warn!(
                    "Analysis unavailable for {}, continuing without a scorecard",
                    record.id
                );
            }
        }
        metrics::STAGE_DURATION_SECONDS
            .with_label_values(&["analysis"])
            .observe(started.elapsed().as_secs_f64());
        Ok(())
    }

    // === Helpers ===

    fn audio_path(&self, record: &CallRecord) -> Result<PathBuf> {
        record
            .audio_path
            .as_ref()
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("audio_path is not set, blob was never persisted"))
    }

    /// Commit the transition, then tell subscribers. Publish order matches
    /// commit order for a given file because the worker is sequential.
    async fn set_and_publish(
        &self,
        file_id: &str,
        status: FileStatus,
        stage: i32,
        progress: i32,
    ) -> Result<()> {
        self.store.set_progress(file_id, status, stage, progress)?;
        self.bus
            .publish(
                file_id,
                ProgressFrame::new(file_id, status, stage, progress, None),
            )
            .await;
        Ok(())
    }

    async fn fail(&self, file_id: &str, message: &str) {
        error!("File {} failed: {}", file_id, message);
        metrics::FILES_PROCESSED_TOTAL
            .with_label_values(&["failed"])
            .inc();
        if let Err(e) = self.store.mark_failed(file_id, message) {
            error!("Could not record failure for {}: {:#}", file_id, e);
            return;
        }
        let (stage, progress) = self
            .store
            .get_file(file_id)
            .ok()
            .flatten()
            .map(|r| (r.stage, r.progress))
            .unwrap_or((0, 0));
        self.bus
            .publish(
                file_id,
                ProgressFrame::new(
                    file_id,
                    FileStatus::Failed,
                    stage,
                    progress,
                    Some(message.to_string()),
                ),
            )
            .await;
    }
}

fn join_speaker_text(segments: &[SpeakerSegment], speaker: Speaker) -> String {
    segments
        .iter()
        .filter(|s| s.speaker == speaker)
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::{EngineError, ProbeInfo, SpeakerTurn, StereoPcm};
    use crate::store::SqliteCallStore;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockProbe {
        channels: u32,
    }

    #[async_trait]
    impl AudioProbe for MockProbe {
        async fn probe_bytes(&self, _ext: &str, _data: &[u8]) -> Result<ProbeInfo, EngineError> {
            Ok(ProbeInfo {
                duration_sec: 10.0,
                channels: self.channels,
            })
        }

        async fn probe_path(&self, _path: &Path) -> Result<ProbeInfo, EngineError> {
            Ok(ProbeInfo {
                duration_sec: 10.0,
                channels: self.channels,
            })
        }

        async fn decode_stereo(&self, _path: &Path) -> Result<StereoPcm, EngineError> {
            // Loud left for the first 5 s, loud right afterwards.
            let mut left = vec![0.01f32; 10_000];
            let mut right = vec![0.01f32; 10_000];
            for i in 0..5_000 {
                left[i] = 0.9;
            }
            for i in 5_000..10_000 {
                right[i] = 0.9;
            }
            Ok(StereoPcm {
                left,
                right,
                sample_rate: 1_000,
            })
        }
    }

    struct MockTranscriber {
        calls: AtomicUsize,
        fail: bool,
    }

    impl MockTranscriber {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl Transcriber for MockTranscriber {
        async fn transcribe(&self, _path: &Path) -> Result<TranscriptOutput, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EngineError::Connection("engine offline".to_string()));
            }
            let words = (0..10)
                .map(|i| crate::store::WordTiming {
                    word: format!("w{i}"),
                    start: i as f64,
                    end: i as f64 + 0.8,
                })
                .collect();
            Ok(TranscriptOutput {
                full_text: "w0 w1 w2 w3 w4 w5 w6 w7 w8 w9".to_string(),
                words,
                language: "ru".to_string(),
            })
        }
    }

    struct NoSeparator;

    #[async_trait]
    impl SpeakerSeparator for NoSeparator {
        fn is_available(&self) -> bool {
            false
        }

        async fn separate(&self, _path: &Path) -> Result<Vec<SpeakerTurn>, EngineError> {
            unreachable!("unavailable separator must never be called")
        }
    }

    struct MockScorer {
        fail: bool,
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
            if self.fail {
                return Err(EngineError::Timeout);
            }
            Ok(r#"{"standard": 80, "loyalty": 70, "kindness": 90, "overall": 80,
                   "summary": "confident and polite"}"#
                .to_string())
        }
    }

    fn harness(
        channels: u32,
        transcriber: MockTranscriber,
        scorer_fails: bool,
    ) -> (Orchestrator, Arc<SqliteCallStore>, Arc<MockTranscriber>) {
        let store = Arc::new(SqliteCallStore::in_memory().unwrap());
        let transcriber = Arc::new(transcriber);
        let engines = PipelineEngines {
            probe: Arc::new(MockProbe { channels }),
            transcriber: transcriber.clone(),
            separator: Arc::new(NoSeparator),
            scorer: Arc::new(MockScorer { fail: scorer_fails }),
        };
        let orchestrator = Orchestrator::new(store.clone(), engines, Arc::new(ProgressBus::new()));
        (orchestrator, store, transcriber)
    }

    fn insert_queued(store: &SqliteCallStore, id: &str) {
        let operator = store.upsert_operator("Ivan").unwrap();
        store
            .insert_files(&[CallRecord::new_queued(
                id.to_string(),
                operator.id,
                "call.wav".to_string(),
                "hash".to_string(),
                1024,
                10.0,
                format!("/tmp/{id}.wav"),
            )])
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stereo_call_reaches_done_with_channel_split() {
        let (orchestrator, store, _) = harness(2, MockTranscriber::ok(), false);
        insert_queued(&store, "f1");

        orchestrator.process("f1").await.unwrap();

        let record = store.get_file("f1").unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Done);
        assert_eq!(record.stage, 4);
        assert_eq!(record.progress, 100);

        let diarization = store.get_diarization("f1").unwrap().unwrap();
        assert_eq!(diarization.method, DiarizationMethod::ChannelSplit);
        assert!(diarization.confidence.is_none());
        assert_eq!(diarization.num_speakers, 2);
        assert_eq!(diarization.segments.len(), 2);

        let analysis = store.get_analysis("f1").unwrap().unwrap();
        assert_eq!(analysis.overall, 80);
        assert_eq!(analysis.model, "mock-model");
    }

    #[tokio::test(start_paused = true)]
    async fn mono_without_separator_degrades_to_single_speaker() {
        let (orchestrator, store, _) = harness(1, MockTranscriber::ok(), false);
        insert_queued(&store, "f1");

        orchestrator.process("f1").await.unwrap();

        let record = store.get_file("f1").unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Done);

        let diarization = store.get_diarization("f1").unwrap().unwrap();
        assert_eq!(diarization.method, DiarizationMethod::Pyannote);
        assert_eq!(diarization.num_speakers, 1);
        assert_eq!(diarization.segments.len(), 1);
        assert_eq!(diarization.segments[0].speaker, Speaker::Operator);
    }

    #[tokio::test(start_paused = true)]
    async fn transcription_failure_is_terminal() {
        let (orchestrator, store, _) = harness(2, MockTranscriber::failing(), false);
        insert_queued(&store, "f1");

        orchestrator.process("f1").await.unwrap();

        let record = store.get_file("f1").unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Failed);
        assert_eq!(record.retry_count, 1);
        assert!(record
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("transcription failed"));
        assert!(store.get_transcription("f1").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn scorer_outage_still_reaches_done_without_analysis() {
        let (orchestrator, store, _) = harness(2, MockTranscriber::ok(), true);
        insert_queued(&store, "f1");

        orchestrator.process("f1").await.unwrap();

        let record = store.get_file("f1").unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Done);
        assert_eq!(record.stage, 4);
        assert!(store.get_analysis("f1").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn completed_transcription_checkpoint_is_skipped() {
        let (orchestrator, store, transcriber) = harness(1, MockTranscriber::ok(), false);
        insert_queued(&store, "f1");

        // Simulate a crash after stage 1 committed its artefact.
        store
            .replace_transcription(&Transcription {
                id: "t1".to_string(),
                file_id: "f1".to_string(),
                full_text: "already transcribed".to_string(),
                words: vec![crate::store::WordTiming {
                    word: "already".to_string(),
                    start: 0.0,
                    end: 1.0,
                }],
                language: "ru".to_string(),
                created_at: 0,
            })
            .unwrap();
        store
            .set_progress("f1", FileStatus::Queued, 1, 40)
            .unwrap();

        orchestrator.process("f1").await.unwrap();

        assert_eq!(
            transcriber.calls.load(Ordering::SeqCst),
            0,
            "checkpointed stage must not re-run"
        );
        let record = store.get_file("f1").unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Done);
        assert_eq!(record.stage, 4);
        assert!(store.get_diarization("f1").unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_checkpoint_artefact_reruns_stage() {
        let (orchestrator, store, transcriber) = harness(1, MockTranscriber::ok(), false);
        insert_queued(&store, "f1");
        // stage says 1 but no transcription row exists
        store
            .set_progress("f1", FileStatus::Queued, 1, 40)
            .unwrap();

        orchestrator.process("f1").await.unwrap();

        assert_eq!(transcriber.calls.load(Ordering::SeqCst), 1);
        assert!(store.get_transcription("f1").unwrap().is_some());
        let record = store.get_file("f1").unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Done);
    }
}

//! The single worker task serving the job queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{JobQueue, QueueReceiver};
use crate::metrics;
use crate::pipeline::{Orchestrator, PipelineEngines};
use crate::progress::ProgressBus;
use crate::store::CallStore;

/// The wait is bounded so a stop request is noticed between jobs.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct QueueWorker {
    queue: Arc<JobQueue>,
    receiver: QueueReceiver,
    store: Arc<dyn CallStore>,
    engines: PipelineEngines,
    bus: Arc<ProgressBus>,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<JobQueue>,
        receiver: QueueReceiver,
        store: Arc<dyn CallStore>,
        engines: PipelineEngines,
        bus: Arc<ProgressBus>,
    ) -> Self {
        Self {
            queue,
            receiver,
            store,
            engines,
            bus,
        }
    }

    /// Startup pass: requeue every file a previous process left in a
    /// running state. Stage is preserved, so completed checkpoints are
    /// skipped when the job runs again. Must be called before [`run`].
    ///
    /// [`run`]: QueueWorker::run
    pub fn recover_interrupted(&self) -> Result<usize> {
        let ids = self.store.recover_interrupted()?;
        if ids.is_empty() {
            return Ok(0);
        }
        info!("Recovering {} interrupted file(s): {:?}", ids.len(), ids);
        for id in &ids {
            self.queue.enqueue_sync(id.clone());
        }
        Ok(ids.len())
    }

    /// Serve jobs until the shutdown token fires. One job at a time;
    /// orchestrator errors are logged and never terminate the loop.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Queue worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            metrics::QUEUE_DEPTH.set(self.queue.queue_length() as f64);

            let next = tokio::select! {
                next = tokio::time::timeout(POLL_INTERVAL, self.receiver.recv()) => next,
                _ = shutdown.cancelled() => break,
            };

            let file_id = match next {
                // Poll window elapsed; loop around and check for a stop.
                Err(_) => continue,
                Ok(None) => {
                    info!("Queue senders dropped, worker exiting");
                    break;
                }
                Ok(Some(id)) => id,
            };

            self.queue.set_current(&file_id);
            info!("Processing file {}", file_id);

            let orchestrator = Orchestrator::new(
                self.store.clone(),
                self.engines.clone(),
                self.bus.clone(),
            );
            if let Err(e) = orchestrator.process(&file_id).await {
                error!("Unhandled error processing {}: {:#}", file_id, e);
            }
            self.queue.clear_current();
        }

        info!("Queue worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::{
        AudioProbe, CallScorer, EngineError, ProbeInfo, SpeakerSeparator, SpeakerTurn, StereoPcm,
        Transcriber, TranscriptOutput,
    };
    use crate::store::{CallRecord, FileStatus, SqliteCallStore};
    use async_trait::async_trait;
    use std::path::Path;

    struct QuietEngines;

    #[async_trait]
    impl AudioProbe for QuietEngines {
        async fn probe_bytes(&self, _ext: &str, _data: &[u8]) -> Result<ProbeInfo, EngineError> {
            Ok(ProbeInfo {
                duration_sec: 5.0,
                channels: 1,
            })
        }

        async fn probe_path(&self, _path: &Path) -> Result<ProbeInfo, EngineError> {
            Ok(ProbeInfo {
                duration_sec: 5.0,
                channels: 1,
            })
        }

        async fn decode_stereo(&self, _path: &Path) -> Result<StereoPcm, EngineError> {
            Ok(StereoPcm::default())
        }
    }

    #[async_trait]
    impl Transcriber for QuietEngines {
        async fn transcribe(&self, _path: &Path) -> Result<TranscriptOutput, EngineError> {
            Ok(TranscriptOutput {
                full_text: "hello".to_string(),
                words: vec![crate::store::WordTiming {
                    word: "hello".to_string(),
                    start: 0.0,
                    end: 0.5,
                }],
                language: "ru".to_string(),
            })
        }
    }

    #[async_trait]
    impl SpeakerSeparator for QuietEngines {
        fn is_available(&self) -> bool {
            false
        }

        async fn separate(&self, _path: &Path) -> Result<Vec<SpeakerTurn>, EngineError> {
            Ok(vec![])
        }
    }

    #[async_trait]
    impl CallScorer for QuietEngines {
        fn is_available(&self) -> bool {
            false
        }

        fn model_label(&self) -> &str {
            "none"
        }

        async fn score(
            &self,
            _system_prompt: &str,
            _user_message: &str,
        ) -> Result<String, EngineError> {
            Err(EngineError::Timeout)
        }
    }

    fn engines() -> PipelineEngines {
        let shared = Arc::new(QuietEngines);
        PipelineEngines {
            probe: shared.clone(),
            transcriber: shared.clone(),
            separator: shared.clone(),
            scorer: shared,
        }
    }

    fn insert_file(store: &SqliteCallStore, id: &str, status: FileStatus, stage: i32) {
        let operator = store.upsert_operator("Ivan").unwrap();
        store
            .insert_files(&[CallRecord::new_queued(
                id.to_string(),
                operator.id,
                format!("{id}.wav"),
                format!("hash-{id}"),
                512,
                5.0,
                format!("/tmp/{id}.wav"),
            )])
            .unwrap();
        if status != FileStatus::Queued || stage != 0 {
            store.set_progress(id, status, stage, 0).unwrap();
        }
    }

    #[tokio::test]
    async fn recovery_enqueues_interrupted_files_only() {
        let store = Arc::new(SqliteCallStore::in_memory().unwrap());
        insert_file(&store, "stuck", FileStatus::Diarizing, 1);
        insert_file(&store, "finished", FileStatus::Done, 4);

        let (queue, receiver) = JobQueue::new();
        let worker = QueueWorker::new(
            queue.clone(),
            receiver,
            store.clone(),
            engines(),
            Arc::new(ProgressBus::new()),
        );

        let recovered = worker.recover_interrupted().unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(queue.queue_length(), 1);

        let stuck = store.get_file("stuck").unwrap().unwrap();
        assert_eq!(stuck.status, FileStatus::Queued);
        assert_eq!(stuck.stage, 1);
    }

    #[tokio::test]
    async fn worker_processes_jobs_and_honours_stop() {
        let store = Arc::new(SqliteCallStore::in_memory().unwrap());
        insert_file(&store, "f1", FileStatus::Queued, 0);

        let (queue, receiver) = JobQueue::new();
        queue.enqueue("f1".to_string()).await;

        let worker = QueueWorker::new(
            queue.clone(),
            receiver,
            store.clone(),
            engines(),
            Arc::new(ProgressBus::new()),
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        // Wait for the job to finish.
        for _ in 0..100 {
            if store.get_file("f1").unwrap().unwrap().status == FileStatus::Done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let record = store.get_file("f1").unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Done);
        assert!(queue.current_file_id().is_none(), "slot cleared after job");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker exits after stop")
            .unwrap();
    }
}

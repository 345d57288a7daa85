use std::sync::Arc;
use std::time::Instant;

use axum::extract::FromRef;

use crate::config::AppConfig;
use crate::engines::{CallScorer, SpeakerSeparator};
use crate::ingest::IngestionManager;
use crate::progress::ProgressBus;
use crate::queue::JobQueue;
use crate::store::CallStore;

pub type SharedConfig = Arc<AppConfig>;
pub type GuardedCallStore = Arc<dyn CallStore>;
pub type GuardedIngestionManager = Arc<IngestionManager>;
pub type GuardedJobQueue = Arc<JobQueue>;
pub type GuardedProgressBus = Arc<ProgressBus>;
pub type GuardedScorer = Arc<dyn CallScorer>;
pub type GuardedSeparator = Arc<dyn SpeakerSeparator>;

#[derive(Clone)]
pub struct ServerState {
    pub config: SharedConfig,
    pub start_time: Instant,
    pub store: GuardedCallStore,
    pub ingestion: GuardedIngestionManager,
    pub queue: GuardedJobQueue,
    pub bus: GuardedProgressBus,
    pub scorer: GuardedScorer,
    pub separator: GuardedSeparator,
}

impl FromRef<ServerState> for SharedConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}

impl FromRef<ServerState> for GuardedCallStore {
    fn from_ref(input: &ServerState) -> Self {
        input.store.clone()
    }
}

impl FromRef<ServerState> for GuardedIngestionManager {
    fn from_ref(input: &ServerState) -> Self {
        input.ingestion.clone()
    }
}

impl FromRef<ServerState> for GuardedJobQueue {
    fn from_ref(input: &ServerState) -> Self {
        input.queue.clone()
    }
}

impl FromRef<ServerState> for GuardedProgressBus {
    fn from_ref(input: &ServerState) -> Self {
        input.bus.clone()
    }
}

impl FromRef<ServerState> for GuardedScorer {
    fn from_ref(input: &ServerState) -> Self {
        input.scorer.clone()
    }
}

impl FromRef<ServerState> for GuardedSeparator {
    fn from_ref(input: &ServerState) -> Self {
        input.separator.clone()
    }
}

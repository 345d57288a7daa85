//! In-memory progress fan-out.
//!
//! Topic key is the file id. Delivery is best-effort: the store remains
//! the source of truth and a subscriber that stops accepting frames is
//! dropped from every topic it joined.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::store::FileStatus;

/// UI label for a pipeline stage. Not part of any invariant.
pub fn stage_name(stage: i32) -> &'static str {
    match stage {
        0 => "waiting",
        1 => "transcription",
        2 => "diarization",
        3 => "analysis",
        4 => "done",
        _ => "",
    }
}

/// One pushed update. `kind` is derived from the status: done maps to
/// "complete", failed to "error", everything else to "progress".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub file_id: String,
    pub status: String,
    pub progress: i32,
    pub stage: i32,
    pub stage_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressFrame {
    pub fn new(
        file_id: &str,
        status: FileStatus,
        stage: i32,
        progress: i32,
        error: Option<String>,
    ) -> Self {
        let kind = match status {
            FileStatus::Done => "complete",
            FileStatus::Failed => "error",
            _ => "progress",
        };
        Self {
            kind: kind.to_string(),
            file_id: file_id.to_string(),
            status: status.as_str().to_string(),
            progress,
            stage,
            stage_name: stage_name(stage).to_string(),
            error,
        }
    }
}

/// Identifies one registered sink across all of its subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

struct SinkEntry {
    id: SinkId,
    sender: mpsc::Sender<ProgressFrame>,
}

#[derive(Default)]
struct BusInner {
    /// file_id -> sinks subscribed to it
    topics: HashMap<String, Vec<SinkEntry>>,
    /// sink -> file_ids it joined, for cleanup
    memberships: HashMap<SinkId, HashSet<String>>,
}

/// Topic-per-file publish/subscribe bus.
pub struct ProgressBus {
    inner: RwLock<BusInner>,
    next_sink_id: AtomicU64,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BusInner::default()),
            next_sink_id: AtomicU64::new(1),
        }
    }

    /// Allocate a sink. The caller forwards frames from the receiver to
    /// its client; dropping the receiver marks the sink dead.
    pub fn register(&self) -> (SinkId, mpsc::Receiver<ProgressFrame>, mpsc::Sender<ProgressFrame>) {
        let (tx, rx) = mpsc::channel(32);
        let id = SinkId(self.next_sink_id.fetch_add(1, Ordering::SeqCst));
        (id, rx, tx)
    }

    pub async fn subscribe(&self, id: SinkId, sender: mpsc::Sender<ProgressFrame>, file_id: &str) {
        let mut inner = self.inner.write().await;
        let sinks = inner.topics.entry(file_id.to_string()).or_default();
        if !sinks.iter().any(|s| s.id == id) {
            sinks.push(SinkEntry { id, sender });
        }
        inner
            .memberships
            .entry(id)
            .or_default()
            .insert(file_id.to_string());
        debug!(?id, file_id, "progress subscription added");
    }

    /// Remove a sink from every topic it joined (disconnect path).
    pub async fn unsubscribe(&self, id: SinkId) {
        let mut inner = self.inner.write().await;
        Self::drop_sinks(&mut inner, &[id]);
    }

    /// Deliver a frame to every subscriber of the file. Sinks that fail
    /// to accept are dropped from all their topics. Returns the number of
    /// successful deliveries.
    pub async fn publish(&self, file_id: &str, frame: ProgressFrame) -> usize {
        let senders: Vec<(SinkId, mpsc::Sender<ProgressFrame>)> = {
            let inner = self.inner.read().await;
            match inner.topics.get(file_id) {
                Some(sinks) => sinks
                    .iter()
                    .map(|s| (s.id, s.sender.clone()))
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut dead: Vec<SinkId> = Vec::new();
        for (id, sender) in senders {
            if sender.send(frame.clone()).await.is_ok() {
                delivered += 1;
            } else {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut inner = self.inner.write().await;
            Self::drop_sinks(&mut inner, &dead);
            debug!(file_id, dropped = dead.len(), "dropped dead progress sinks");
        }
        delivered
    }

    pub async fn subscriber_count(&self, file_id: &str) -> usize {
        let inner = self.inner.read().await;
        inner.topics.get(file_id).map(|s| s.len()).unwrap_or(0)
    }

    fn drop_sinks(inner: &mut BusInner, ids: &[SinkId]) {
        for id in ids {
            if let Some(file_ids) = inner.memberships.remove(id) {
                for file_id in file_ids {
                    if let Some(sinks) = inner.topics.get_mut(&file_id) {
                        sinks.retain(|s| s.id != *id);
                        if sinks.is_empty() {
                            inner.topics.remove(&file_id);
                        }
                    }
                }
            }
        }
    }
}

//! Process-wide FIFO of file ids served by a single worker task.

mod worker;

pub use worker::QueueWorker;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{info, warn};

/// Handle to the job queue. Cheap to clone via `Arc`; the receiving half
/// lives in the single [`QueueWorker`].
pub struct JobQueue {
    tx: mpsc::UnboundedSender<String>,
    len: AtomicUsize,
    current: Mutex<Option<String>>,
}

/// Receiving half handed to the worker; decrements the shared length
/// counter as items are taken.
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<String>,
    queue: Arc<JobQueue>,
}

impl JobQueue {
    pub fn new() -> (Arc<JobQueue>, QueueReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(JobQueue {
            tx,
            len: AtomicUsize::new(0),
            current: Mutex::new(None),
        });
        let receiver = QueueReceiver {
            rx,
            queue: queue.clone(),
        };
        (queue, receiver)
    }

    /// Enqueue from the cooperative scheduler.
    pub async fn enqueue(&self, file_id: String) {
        self.push(file_id);
    }

    /// Thread-safe enqueue usable from synchronous code (HTTP handlers,
    /// tests). The channel is unbounded so the send never blocks.
    pub fn enqueue_sync(&self, file_id: String) {
        self.push(file_id);
    }

    fn push(&self, file_id: String) {
        match self.tx.send(file_id.clone()) {
            Ok(()) => {
                let len = self.len.fetch_add(1, Ordering::SeqCst) + 1;
                info!("Queued file {} (queue size: {})", file_id, len);
            }
            Err(_) => {
                warn!("Queue receiver is gone, dropping file {}", file_id);
            }
        }
    }

    pub fn queue_length(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn current_file_id(&self) -> Option<String> {
        self.current.lock().unwrap().clone()
    }

    fn set_current(&self, file_id: &str) {
        *self.current.lock().unwrap() = Some(file_id.to_string());
    }

    fn clear_current(&self) {
        *self.current.lock().unwrap() = None;
    }
}

impl QueueReceiver {
    /// Take the next id, decrementing the shared length. Returns None when
    /// every sender has been dropped.
    pub async fn recv(&mut self) -> Option<String> {
        let item = self.rx.recv().await;
        if item.is_some() {
            self.queue.len.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_preserves_fifo_order() {
        let (queue, mut rx) = JobQueue::new();
        queue.enqueue("a".to_string()).await;
        queue.enqueue_sync("b".to_string());
        queue.enqueue("c".to_string()).await;

        assert_eq!(queue.queue_length(), 3);
        assert_eq!(rx.recv().await.as_deref(), Some("a"));
        assert_eq!(rx.recv().await.as_deref(), Some("b"));
        assert_eq!(rx.recv().await.as_deref(), Some("c"));
        assert_eq!(queue.queue_length(), 0);
    }

    #[tokio::test]
    async fn enqueue_sync_works_from_other_threads() {
        let (queue, mut rx) = JobQueue::new();
        let q = queue.clone();
        std::thread::spawn(move || {
            q.enqueue_sync("from-thread".to_string());
        })
        .join()
        .unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("from-thread"));
    }

    #[tokio::test]
    async fn current_file_id_roundtrip() {
        let (queue, _rx) = JobQueue::new();
        assert!(queue.current_file_id().is_none());
        queue.set_current("f1");
        assert_eq!(queue.current_file_id().as_deref(), Some("f1"));
        queue.clear_current();
        assert!(queue.current_file_id().is_none());
    }
}

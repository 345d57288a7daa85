//! Ingestion facade: one batch in, validated files on disk + rows in the
//! store + ids on the queue out.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::validator::{ValidationOutcome, Validator};
use crate::engines::AudioProbe;
use crate::queue::JobQueue;
use crate::store::{CallRecord, CallStore, Operator};

/// One uploaded blob as extracted from the multipart request.
pub struct UploadedBlob {
    pub filename: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BlobError {
    pub file: String,
    pub error: String,
}

#[derive(Debug)]
pub struct BatchOutcome {
    /// One id per accepted blob, in submission order. Duplicates resolve
    /// to the pre-existing file id.
    pub file_ids: Vec<String>,
    pub operator: String,
    pub total_files: usize,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("operator_name must not be blank")]
    BlankOperatorName,

    #[error("Too many files: {0} exceeds the batch limit of {1}")]
    BatchTooLarge(usize, usize),

    #[error("All files failed validation")]
    AllRejected(Vec<BlobError>),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct IngestionManager {
    store: Arc<dyn CallStore>,
    queue: Arc<JobQueue>,
    probe: Arc<dyn AudioProbe>,
    validator: Validator,
    uploads_dir: PathBuf,
    max_batch_size: usize,
}

impl IngestionManager {
    pub fn new(
        store: Arc<dyn CallStore>,
        queue: Arc<JobQueue>,
        probe: Arc<dyn AudioProbe>,
        validator: Validator,
        uploads_dir: PathBuf,
        max_batch_size: usize,
    ) -> Self {
        Self {
            store,
            queue,
            probe,
            validator,
            uploads_dir,
            max_batch_size,
        }
    }

    /// Ingest a batch of blobs for one operator.
    ///
    /// Validation runs against a snapshot of the non-failed hash index,
    /// extended as the batch inserts, so a duplicate later in the same
    /// batch resolves to the id allocated earlier in it. All inserts for
    /// the batch, including a first-seen operator row, commit in one
    /// transaction; newly inserted ids are enqueued only after the
    /// commit.
    pub async fn ingest_batch(
        &self,
        operator_name: &str,
        blobs: Vec<UploadedBlob>,
    ) -> Result<BatchOutcome, IngestError> {
        let operator_name = operator_name.trim();
        if operator_name.is_empty() {
            return Err(IngestError::BlankOperatorName);
        }
        if blobs.len() > self.max_batch_size {
            return Err(IngestError::BatchTooLarge(blobs.len(), self.max_batch_size));
        }

        // A first-seen operator is only staged here; the row commits
        // together with the batch, so an aborted batch leaves no trace.
        let (operator, operator_is_new) = match self.store.find_operator_by_name(operator_name)? {
            Some(operator) => (operator, false),
            None => (
                Operator {
                    id: Uuid::new_v4().to_string(),
                    name: operator_name.to_string(),
                    created_at: chrono::Utc::now().timestamp(),
                },
                true,
            ),
        };
        let mut hash_index = self.store.active_hash_index()?;

        let mut accepted_ids: Vec<String> = Vec::new();
        let mut errors: Vec<BlobError> = Vec::new();
        // (record, bytes, ext) staged until the whole batch has validated
        let mut staged: Vec<(CallRecord, Vec<u8>, String)> = Vec::new();

        for blob in &blobs {
            let outcome = self
                .validator
                .validate(&blob.filename, &blob.content, &hash_index, self.probe.as_ref())
                .await;

            match outcome {
                ValidationOutcome::Duplicate { file_hash, .. } => {
                    // Resolved to the existing id, not an error.
                    let existing = hash_index
                        .get(&file_hash)
                        .cloned()
                        .expect("duplicate hash must be in the index");
                    info!(
                        file = %blob.filename,
                        existing_id = %existing,
                        "duplicate upload resolved to existing file"
                    );
                    accepted_ids.push(existing);
                }
                ValidationOutcome::Invalid { reason } => {
                    errors.push(BlobError {
                        file: blob.filename.clone(),
                        error: reason,
                    });
                }
                ValidationOutcome::Valid {
                    file_hash,
                    duration_sec,
                    ext,
                    ..
                } => {
                    let file_id = Uuid::new_v4().to_string();
                    let audio_path = self.uploads_dir.join(format!("{}.{}", file_id, ext));
                    let record = CallRecord::new_queued(
                        file_id.clone(),
                        operator.id.clone(),
                        blob.filename.clone(),
                        file_hash.clone(),
                        blob.content.len() as i64,
                        duration_sec,
                        audio_path.to_string_lossy().to_string(),
                    );
                    hash_index.insert(file_hash, file_id.clone());
                    accepted_ids.push(file_id);
                    staged.push((record, blob.content.clone(), ext));
                }
            }
        }

        if accepted_ids.is_empty() && !errors.is_empty() {
            return Err(IngestError::AllRejected(errors));
        }

        // Persist blobs, then commit all rows in one transaction.
        let mut new_ids = Vec::with_capacity(staged.len());
        let mut records = Vec::with_capacity(staged.len());
        for (record, content, _ext) in &staged {
            let path = PathBuf::from(record.audio_path.as_deref().unwrap_or_default());
            tokio::fs::write(&path, content)
                .await
                .map_err(|e| anyhow::anyhow!("failed to persist blob at {:?}: {}", path, e))?;
            new_ids.push(record.id.clone());
            records.push(record.clone());
        }
        let insert_result = if operator_is_new {
            self.store.insert_operator_and_files(&operator, &records)
        } else {
            self.store.insert_files(&records)
        };
        if let Err(e) = insert_result {
            // Roll back the blobs that were just written.
            for (record, _, _) in &staged {
                if let Some(path) = &record.audio_path {
                    if let Err(rm) = tokio::fs::remove_file(path).await {
                        warn!("Failed to remove orphaned blob {}: {}", path, rm);
                    }
                }
            }
            return Err(IngestError::Internal(e));
        }

        for (file, error) in errors.iter().map(|e| (&e.file, &e.error)) {
            warn!(file = %file, error = %error, "blob rejected during ingestion");
        }

        for id in &new_ids {
            self.queue.enqueue_sync(id.clone());
        }
        info!(
            operator = %operator_name,
            accepted = accepted_ids.len(),
            new = new_ids.len(),
            rejected = errors.len(),
            "ingested upload batch"
        );

        Ok(BatchOutcome {
            total_files: accepted_ids.len(),
            file_ids: accepted_ids,
            operator: operator_name.to_string(),
        })
    }
}

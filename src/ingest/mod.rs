//! Batch intake: validation, dedup, blob persistence and queue hand-off.

mod manager;
mod validator;

pub use manager::{BatchOutcome, BlobError, IngestError, IngestionManager, UploadedBlob};
pub use validator::{ValidationOutcome, Validator, ALLOWED_EXTENSIONS};

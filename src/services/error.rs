use thiserror::Error;

use crate::backend::StoreError;
use crate::models::upload_object::UploadStatus;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("object {0} not found")]
    ObjectNotFound(i64),
    #[error("object {id} is {status}, not accepting this operation")]
    ObjectNotUploading { id: i64, status: UploadStatus },
    #[error("chunk index {index} is outside 0..{chunk_count}")]
    InvalidChunkIndex { index: i64, chunk_count: u32 },
    #[error("an entry named `{0}` already exists here")]
    DuplicateName(String),
    #[error("physical path `{0}` is already in use")]
    PathTaken(String),
    #[error("chunk {0} is missing")]
    ChunkMissing(u32),
    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("assembly of object {id} requested with {accepted}/{expected} chunks accepted")]
    PrematureAssembly {
        id: i64,
        accepted: usize,
        expected: u32,
    },
    #[error("upload {id} has {accepted}/{expected} chunks")]
    IncompleteUpload {
        id: i64,
        accepted: usize,
        expected: u32,
    },
    #[error("writing the assembled object failed: {0}")]
    MergeWriteFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

impl From<StoreError> for UploadError {
    /// Backend failures outside of a merge. Anything but a missing chunk is
    /// reported as a retryable unavailability.
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ChunkMissing(index) => UploadError::ChunkMissing(index),
            other => UploadError::BackendUnavailable(other.to_string()),
        }
    }
}

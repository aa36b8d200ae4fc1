//! Upload session tracking: which chunks are in, whether the upload is
//! complete, and how far along it is.

use serde::Serialize;

use super::error::{UploadError, UploadResult};
use super::metadata_repo::MetadataRepo;
use crate::models::upload_object::{UploadObject, UploadStatus};

/// Progress report for one object.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub object_id: i64,
    pub logical_name: String,
    pub total_size: i64,
    /// Estimate: accepted chunks times the average chunk size.
    pub uploaded_size_estimate: i64,
    /// 0.0 ..= 100.0
    pub percent: f64,
    pub status: UploadStatus,
}

#[derive(Clone)]
pub struct UploadTracker {
    repo: MetadataRepo,
}

impl UploadTracker {
    pub fn new(repo: MetadataRepo) -> Self {
        Self { repo }
    }

    /// Record `index` as durably written and persist the set.
    ///
    /// Returns `true` if the index was already present, in which case
    /// nothing is written. The caller must hold the object's lock.
    pub async fn accept(&self, object: &mut UploadObject, index: u32) -> UploadResult<bool> {
        let already_present = object.accepted_chunks.0.insert(index);
        if !already_present {
            self.repo
                .save_acceptance(object.id, &object.accepted_chunks.0)
                .await?;
        }
        Ok(already_present)
    }
}

/// Check that `index` lies in `0..chunk_count`.
pub fn validate_index(index: i64, chunk_count: u32) -> UploadResult<u32> {
    u32::try_from(index)
        .ok()
        .filter(|i| *i < chunk_count)
        .ok_or(UploadError::InvalidChunkIndex { index, chunk_count })
}

/// True once every declared chunk has been accepted. An object with no
/// chunks is complete from the start.
pub fn is_complete(object: &UploadObject) -> bool {
    object.accepted().len() == object.chunk_count as usize
}

/// Progress derived from the acceptance set alone.
///
/// The uploaded size multiplies the accepted count by
/// `declared_size / chunk_count` using integer division, so it under-reports
/// when the size is not a multiple of the chunk count. Completed objects
/// always report the full size.
pub fn progress(object: &UploadObject) -> Progress {
    let (uploaded, percent) = if object.status == UploadStatus::Completed {
        (object.declared_size, 100.0)
    } else if object.chunk_count == 0 {
        (0, 0.0)
    } else {
        let accepted = object.accepted().len() as i64;
        let per_chunk = object.declared_size / i64::from(object.chunk_count);
        let percent = accepted as f64 / f64::from(object.chunk_count) * 100.0;
        (accepted * per_chunk, percent.clamp(0.0, 100.0))
    };

    Progress {
        object_id: object.id,
        logical_name: object.logical_name.clone(),
        total_size: object.declared_size,
        uploaded_size_estimate: uploaded,
        percent,
        status: object.status,
    }
}

//! Ordered reassembly of staged chunks into the final object.

use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::error::{UploadError, UploadResult};
use super::metadata_repo::MetadataRepo;
use super::path_namer::{CHUNKS_ROOT, FILES_ROOT, staging_dir};
use super::tracker::is_complete;
use crate::backend::{Backends, ChunkStore, StoreError, parent_key};
use crate::models::upload_object::{UploadObject, UploadStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeOutcome {
    /// Chunks were streamed into the final object.
    Assembled,
    /// The object was already completed and its staging area is gone; the
    /// existing final object was left as it was.
    AlreadyAssembled,
}

#[derive(Clone)]
pub struct MergeEngine {
    repo: MetadataRepo,
    backends: Backends,
}

impl MergeEngine {
    pub fn new(repo: MetadataRepo, backends: Backends) -> Self {
        Self { repo, backends }
    }

    /// Stream every staged chunk, in index order, into the object's final
    /// path and record the outcome.
    ///
    /// `object` is the row as read just before the caller moved it to
    /// `merging`; its `status` tells whether this is a first merge, a retry
    /// after failure, or a re-run on a completed object. On failure the
    /// staged chunks are kept and the object is marked `failed`.
    pub async fn assemble(&self, object: &UploadObject) -> UploadResult<MergeOutcome> {
        if !is_complete(object) {
            error!(
                object_id = object.id,
                accepted = object.accepted().len(),
                expected = object.chunk_count,
                "assembly requested before all chunks were accepted"
            );
            self.finish(object.id, object.status).await?;
            return Err(UploadError::PrematureAssembly {
                id: object.id,
                accepted: object.accepted().len(),
                expected: object.chunk_count,
            });
        }

        let store = match self.backends.resolve(object.storage_kind) {
            Ok(store) => store,
            Err(err) => {
                self.finish(object.id, UploadStatus::Failed).await?;
                return Err(err.into());
            }
        };

        let staging = staging_dir(object.id);
        match stream_into_final(store.as_ref(), object, &staging).await {
            Ok(()) => {
                self.finish(object.id, UploadStatus::Completed).await?;
                remove_staging(store.as_ref(), object.id).await;
                info!(
                    object_id = object.id,
                    chunks = object.chunk_count,
                    path = %object.physical_path,
                    backend = %store.kind(),
                    "assembled object"
                );
                Ok(MergeOutcome::Assembled)
            }
            Err(UploadError::ChunkMissing(index)) if object.status == UploadStatus::Completed => {
                self.finish(object.id, UploadStatus::Completed).await?;
                info!(
                    object_id = object.id,
                    missing = index,
                    "staging already cleaned up; keeping existing object"
                );
                Ok(MergeOutcome::AlreadyAssembled)
            }
            Err(err) => {
                self.finish(object.id, UploadStatus::Failed).await?;
                warn!(object_id = object.id, "assembly failed, chunks kept for retry: {err}");
                if object.status != UploadStatus::Completed {
                    reclaim_final_dirs(store.as_ref(), &object.physical_path).await;
                }
                Err(err)
            }
        }
    }

    /// Leave `merging` for `status`. A concurrent delete wins over the
    /// merge result.
    async fn finish(&self, id: i64, status: UploadStatus) -> UploadResult<()> {
        if !self
            .repo
            .compare_and_set_status(id, UploadStatus::Merging, status)
            .await?
        {
            warn!(object_id = id, %status, "object left merging state during assembly");
        }
        Ok(())
    }
}

async fn stream_into_final(
    store: &dyn ChunkStore,
    object: &UploadObject,
    staging: &str,
) -> UploadResult<()> {
    let mut writer = store
        .create_final_object(&object.physical_path)
        .await
        .map_err(write_error)?;

    let mut chunks = match store.read_chunks_in_order(staging, object.chunk_count).await {
        Ok(chunks) => chunks,
        Err(err) => {
            writer.abort().await;
            return Err(read_error(err));
        }
    };

    while let Some(next) = chunks.next().await {
        let failure = match next {
            Ok(bytes) => match writer.append(&bytes).await {
                Ok(()) => continue,
                Err(err) => write_error(err),
            },
            Err(err) => read_error(err),
        };
        drop(chunks);
        writer.abort().await;
        return Err(failure);
    }
    drop(chunks);

    writer.close().await.map_err(write_error)
}

/// Remove an object's staging directory and the chunk root if that left it
/// empty. Failures are logged and never surfaced.
pub(crate) async fn remove_staging(store: &dyn ChunkStore, object_id: i64) {
    let staging = staging_dir(object_id);
    if let Err(err) = store.remove_directory_tree(&staging).await {
        warn!(object_id, "failed to remove staging directory: {err}");
        return;
    }
    if let Err(err) = store.remove_empty_ancestors(CHUNKS_ROOT, "").await {
        debug!(object_id, "failed to prune chunk root: {err}");
    }
}

/// Drop the shard directories an aborted first write left empty.
async fn reclaim_final_dirs(store: &dyn ChunkStore, physical_path: &str) {
    let Some(dir) = parent_key(physical_path) else {
        return;
    };
    if let Err(err) = store.remove_empty_ancestors(dir, FILES_ROOT).await {
        debug!(path = %physical_path, "failed to prune object directories: {err}");
    }
}

fn read_error(err: StoreError) -> UploadError {
    match err {
        StoreError::ChunkMissing(index) => UploadError::ChunkMissing(index),
        other => UploadError::BackendUnavailable(other.to_string()),
    }
}

fn write_error(err: StoreError) -> UploadError {
    match err {
        StoreError::Unavailable(msg) => UploadError::BackendUnavailable(msg),
        other => UploadError::MergeWriteFailed(other.to_string()),
    }
}

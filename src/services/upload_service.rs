//! Upload orchestration: the entry point for every upload operation.
//!
//! `UploadService` owns the metadata repository, the backend registry, the
//! per-object locks and the merge engine, and sequences them so that
//!
//! - a chunk is only recorded as accepted after its bytes are durable,
//! - chunk writes for different indices of one object run in parallel,
//! - exactly one caller wins the transition into `merging` and assembles.

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::error::{UploadError, UploadResult};
use super::merge_engine::{MergeEngine, MergeOutcome, remove_staging};
use super::metadata_repo::{MetadataRepo, NewUploadObject};
use super::object_locks::{MergeTicket, ObjectLocks};
use super::path_namer::{final_path, staging_dir, validate_logical_name};
use super::tracker::{self, Progress, UploadTracker, is_complete, validate_index};
use crate::backend::Backends;
use crate::models::listing::{ChildrenPage, ListChildrenRequest};
use crate::models::upload_object::{StorageKind, UploadObject, UploadStatus};

/// How many creation timestamps to try before giving up on a free
/// physical path.
const PATH_ATTEMPTS: u32 = 8;

/// Parameters of a new file upload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateObjectRequest {
    pub logical_name: String,
    pub declared_size: i64,
    pub chunk_count: i64,
    pub mime_type: Option<String>,
    pub parent_id: Option<i64>,
    pub content_hash: Option<String>,
    /// Defaults to the local backend.
    pub storage_kind: Option<StorageKind>,
}

/// What happened to one admitted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmitOutcome {
    /// The index had already been accepted; nothing changed.
    Replayed,
    /// The chunk was stored and recorded; more chunks are outstanding.
    Accepted,
    /// This chunk completed the upload and the object was assembled.
    Completed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityReport {
    pub ok: bool,
    pub detail: String,
}

#[derive(Clone)]
pub struct UploadService {
    repo: MetadataRepo,
    tracker: UploadTracker,
    merger: MergeEngine,
    backends: Backends,
    locks: ObjectLocks,
}

impl UploadService {
    pub fn new(db: Arc<SqlitePool>, backends: Backends) -> Self {
        let repo = MetadataRepo::new(db);
        Self {
            tracker: UploadTracker::new(repo.clone()),
            merger: MergeEngine::new(repo.clone(), backends.clone()),
            repo,
            backends,
            locks: ObjectLocks::new(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        self.repo.pool()
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// A non-deleted object owned by `owner_id`.
    pub async fn object(&self, owner_id: i64, object_id: i64) -> UploadResult<UploadObject> {
        self.repo.fetch_owned(owner_id, object_id).await
    }

    /// Register a new upload in `uploading` with an empty acceptance set.
    ///
    /// The physical path is computed here, once, and never changes.
    pub async fn create_object(
        &self,
        owner_id: i64,
        req: CreateObjectRequest,
    ) -> UploadResult<UploadObject> {
        validate_logical_name(&req.logical_name).map_err(invalid)?;
        if req.declared_size < 0 {
            return Err(invalid("declared size must not be negative"));
        }
        let chunk_count = u32::try_from(req.chunk_count)
            .ok()
            .filter(|count| *count > 0)
            .ok_or_else(|| invalid("chunk count must be at least 1"))?;

        let storage_kind = req.storage_kind.unwrap_or(StorageKind::Local);
        self.backends.resolve(storage_kind)?;
        self.ensure_parent(owner_id, req.parent_id).await?;
        if self
            .repo
            .name_taken(owner_id, &req.logical_name, req.parent_id, None)
            .await?
        {
            return Err(UploadError::DuplicateName(req.logical_name));
        }

        let mut new = NewUploadObject {
            owner_id,
            physical_path: String::new(),
            logical_name: req.logical_name,
            declared_size: req.declared_size,
            content_hash: req.content_hash,
            mime_type: req.mime_type,
            chunk_count,
            storage_kind,
            status: UploadStatus::Uploading,
            parent_id: req.parent_id,
            is_container: false,
            created_at: Utc::now(),
        };
        let mut attempt = 0;
        let object = loop {
            new.physical_path = final_path(owner_id, &new.logical_name, new.created_at);
            match self.repo.insert(&new).await {
                Err(UploadError::PathTaken(path)) if attempt < PATH_ATTEMPTS => {
                    debug!(owner_id, %path, "physical path in use, picking another");
                    attempt += 1;
                    new.created_at += chrono::Duration::microseconds(1);
                }
                other => break other?,
            }
        };

        info!(
            object_id = object.id,
            owner_id,
            chunks = chunk_count,
            backend = %storage_kind,
            path = %object.physical_path,
            "created upload"
        );
        Ok(object)
    }

    /// Create a folder entry. Folders hold no bytes and start `completed`.
    pub async fn create_folder(
        &self,
        owner_id: i64,
        folder_name: String,
        parent_id: Option<i64>,
    ) -> UploadResult<UploadObject> {
        validate_logical_name(&folder_name).map_err(invalid)?;
        self.ensure_parent(owner_id, parent_id).await?;
        if self
            .repo
            .name_taken(owner_id, &folder_name, parent_id, None)
            .await?
        {
            return Err(UploadError::DuplicateName(folder_name));
        }

        let folder = self
            .repo
            .insert(&NewUploadObject {
                owner_id,
                logical_name: folder_name,
                declared_size: 0,
                content_hash: None,
                mime_type: None,
                chunk_count: 0,
                storage_kind: StorageKind::Local,
                physical_path: String::new(),
                status: UploadStatus::Completed,
                parent_id,
                is_container: true,
                created_at: Utc::now(),
            })
            .await?;

        info!(object_id = folder.id, owner_id, "created folder");
        Ok(folder)
    }

    /// Store chunk `index` of object `object_id` and record it.
    ///
    /// The backend write happens without the object's lock; only the
    /// acceptance update and the completion check are serialized. When this
    /// chunk completes the set, the caller that wins the move to `merging`
    /// assembles the object before returning.
    pub async fn admit_chunk(
        &self,
        object_id: i64,
        index: i64,
        bytes: Bytes,
    ) -> UploadResult<AdmitOutcome> {
        let object = self.repo.fetch(object_id).await?;
        ensure_uploading(&object)?;
        let index = validate_index(index, object.chunk_count)?;

        if object.accepted().contains(index) {
            debug!(object_id, index, "chunk already accepted");
            return Ok(AdmitOutcome::Replayed);
        }

        let store = self.backends.resolve(object.storage_kind)?;
        let staging = staging_dir(object_id);
        let written = match store.ensure_directory(&staging).await {
            Ok(()) => store.write_chunk(&staging, index, bytes).await,
            Err(err) => Err(err),
        };

        let (ready, ticket) = {
            let _guard = self.locks.lock(object_id).await;
            let mut object = self.repo.fetch(object_id).await?;
            match object.status {
                UploadStatus::Deleted => {
                    return Err(UploadError::ObjectNotUploading {
                        id: object_id,
                        status: object.status,
                    });
                }
                UploadStatus::Uploading if written.is_err() && object.accepted().contains(index) => {
                    return Ok(AdmitOutcome::Replayed);
                }
                UploadStatus::Uploading => written?,
                // Another caller completed the set while this write was in
                // flight. The write may have failed against the cleaned-up
                // staging area or recreated it; either way the index is in.
                _ if object.accepted().contains(index) => {
                    if written.is_ok() && object.status == UploadStatus::Completed {
                        debug!(object_id, index, "removing staging recreated by a late chunk");
                        remove_staging(store.as_ref(), object_id).await;
                    }
                    return Ok(AdmitOutcome::Replayed);
                }
                _ => {
                    return Err(UploadError::ObjectNotUploading {
                        id: object_id,
                        status: object.status,
                    });
                }
            }

            let already_present = self.tracker.accept(&mut object, index).await?;
            let outcome = if already_present {
                AdmitOutcome::Replayed
            } else {
                AdmitOutcome::Accepted
            };
            debug!(
                object_id,
                index,
                accepted = object.accepted().len(),
                expected = object.chunk_count,
                "chunk accepted"
            );

            if !is_complete(&object)
                || !self
                    .repo
                    .compare_and_set_status(object_id, UploadStatus::Uploading, UploadStatus::Merging)
                    .await?
            {
                return Ok(outcome);
            }
            let ticket = self.locks.begin_merge(object_id);
            (object, ticket)
        };

        self.run_merge(ready, ticket).await?;
        Ok(AdmitOutcome::Completed)
    }

    /// Re-run assembly of an object.
    ///
    /// Accepted for `failed` and `completed` objects, for `uploading`
    /// objects whose chunks are all in but which never reached `merging`, and
    /// for `merging` objects whose assembler is gone.
    pub async fn retry_assembly(
        &self,
        object_id: i64,
    ) -> UploadResult<(UploadObject, MergeOutcome)> {
        let (object, ticket) = {
            let _guard = self.locks.lock(object_id).await;
            let object = self.repo.fetch(object_id).await?;
            if object.is_container {
                return Err(invalid("folders have no content to assemble"));
            }
            match object.status {
                UploadStatus::Failed | UploadStatus::Completed => {}
                UploadStatus::Uploading if is_complete(&object) => {}
                UploadStatus::Uploading => {
                    return Err(UploadError::IncompleteUpload {
                        id: object_id,
                        accepted: object.accepted().len(),
                        expected: object.chunk_count,
                    });
                }
                UploadStatus::Merging if !self.locks.merge_in_flight(object_id) => {
                    warn!(object_id, "taking over an abandoned assembly");
                }
                UploadStatus::Merging | UploadStatus::Deleted => {
                    return Err(UploadError::ObjectNotUploading {
                        id: object_id,
                        status: object.status,
                    });
                }
            }
            if !self
                .repo
                .compare_and_set_status(object_id, object.status, UploadStatus::Merging)
                .await?
            {
                return Err(UploadError::ObjectNotUploading {
                    id: object_id,
                    status: object.status,
                });
            }
            let ticket = self.locks.begin_merge(object_id);
            (object, ticket)
        };

        info!(object_id, from = %object.status, "retrying assembly");
        let outcome = self.run_merge(object, ticket).await?;
        let refreshed = self.repo.fetch(object_id).await?;
        Ok((refreshed, outcome))
    }

    /// Assemble on a task of its own. A caller that stops waiting does not
    /// cancel the merge, and the ticket is released however the task ends.
    async fn run_merge(
        &self,
        object: UploadObject,
        ticket: MergeTicket,
    ) -> UploadResult<MergeOutcome> {
        let merger = self.merger.clone();
        let object_id = object.id;
        tokio::spawn(async move {
            let _ticket = ticket;
            merger.assemble(&object).await
        })
        .await
        .map_err(|err| {
            error!(object_id, "assembly task ended abnormally: {err}");
            UploadError::MergeWriteFailed(format!("assembly of object {object_id} aborted"))
        })?
    }

    /// Progress from the stored acceptance set. Never touches a backend.
    pub async fn progress(&self, object_id: i64) -> UploadResult<Progress> {
        let object = self.repo.fetch(object_id).await?;
        if object.status == UploadStatus::Deleted {
            return Err(UploadError::ObjectNotFound(object_id));
        }
        Ok(tracker::progress(&object))
    }

    /// Soft-delete an entry. Stored bytes are left where they are.
    pub async fn delete_object(&self, owner_id: i64, object_id: i64) -> UploadResult<()> {
        let _guard = self.locks.lock(object_id).await;
        let object = self.repo.fetch_owned(owner_id, object_id).await?;
        self.repo.soft_delete(object.id).await?;
        info!(object_id, owner_id, status = %object.status, "deleted object");
        Ok(())
    }

    /// Give an entry a new name in the same parent.
    pub async fn rename_object(
        &self,
        owner_id: i64,
        object_id: i64,
        new_name: String,
    ) -> UploadResult<UploadObject> {
        validate_logical_name(&new_name).map_err(invalid)?;
        let _guard = self.locks.lock(object_id).await;
        let object = self.repo.fetch_owned(owner_id, object_id).await?;
        if self
            .repo
            .name_taken(owner_id, &new_name, object.parent_id, Some(object_id))
            .await?
        {
            return Err(UploadError::DuplicateName(new_name));
        }
        self.repo
            .relocate(object_id, &new_name, object.parent_id)
            .await?;
        info!(object_id, from = %object.logical_name, to = %new_name, "renamed object");
        self.repo.fetch(object_id).await
    }

    /// Move an entry under `new_parent` (root when `None`), keeping its name.
    pub async fn move_object(
        &self,
        owner_id: i64,
        object_id: i64,
        new_parent: Option<i64>,
    ) -> UploadResult<UploadObject> {
        let _guard = self.locks.lock(object_id).await;
        let object = self.repo.fetch_owned(owner_id, object_id).await?;
        self.ensure_parent(owner_id, new_parent).await?;
        self.ensure_not_descendant(owner_id, object_id, new_parent)
            .await?;
        if self
            .repo
            .name_taken(owner_id, &object.logical_name, new_parent, Some(object_id))
            .await?
        {
            return Err(UploadError::DuplicateName(object.logical_name));
        }
        self.repo
            .relocate(object_id, &object.logical_name, new_parent)
            .await?;
        info!(object_id, from = ?object.parent_id, to = ?new_parent, "moved object");
        self.repo.fetch(object_id).await
    }

    /// One page of a folder's live entries, folders first.
    pub async fn list_children(
        &self,
        owner_id: i64,
        req: &ListChildrenRequest,
    ) -> UploadResult<ChildrenPage> {
        self.ensure_parent(owner_id, req.parent_id).await?;
        let (files, total) = self.repo.list_children(owner_id, req.parent_id, req).await?;
        Ok(ChildrenPage::new(files, total, req))
    }

    /// Round-trip against the remote backend.
    pub async fn check_remote(&self) -> ConnectivityReport {
        connectivity_report(&self.backends).await
    }

    /// Fail every object left in `merging` by a previous process so an
    /// operator retry can pick it up. Call before serving requests.
    pub async fn recover_stale_merges(&self) -> UploadResult<u64> {
        let reset = self.repo.fail_stale_merges().await?;
        if reset > 0 {
            warn!(objects = reset, "marked interrupted assemblies as failed");
        }
        Ok(reset)
    }

    /// `parent_id`, when set, must be a live folder of the same owner.
    async fn ensure_parent(&self, owner_id: i64, parent_id: Option<i64>) -> UploadResult<()> {
        let Some(parent_id) = parent_id else {
            return Ok(());
        };
        let parent = match self.repo.fetch_owned(owner_id, parent_id).await {
            Ok(parent) => parent,
            Err(UploadError::ObjectNotFound(_)) => {
                return Err(invalid(format!("parent {parent_id} does not exist")));
            }
            Err(err) => return Err(err),
        };
        if !parent.is_container {
            return Err(invalid(format!("parent {parent_id} is not a folder")));
        }
        Ok(())
    }

    /// Reject moves that would make an entry its own ancestor.
    async fn ensure_not_descendant(
        &self,
        owner_id: i64,
        object_id: i64,
        new_parent: Option<i64>,
    ) -> UploadResult<()> {
        let mut cursor = new_parent;
        while let Some(id) = cursor {
            if id == object_id {
                return Err(invalid("an entry cannot be moved into itself"));
            }
            cursor = self.repo.fetch_owned(owner_id, id).await?.parent_id;
        }
        Ok(())
    }
}

/// Reachability of the remote backend, or why it cannot be checked.
pub async fn connectivity_report(backends: &Backends) -> ConnectivityReport {
    let Some(remote) = backends.remote() else {
        return ConnectivityReport {
            ok: false,
            detail: "remote backend is not configured (set SFTP_HOST)".into(),
        };
    };
    match remote.test_reachability().await {
        Ok(()) => ConnectivityReport {
            ok: true,
            detail: "remote backend reachable".into(),
        },
        Err(err) => ConnectivityReport {
            ok: false,
            detail: err.to_string(),
        },
    }
}

fn ensure_uploading(object: &UploadObject) -> UploadResult<()> {
    if object.status != UploadStatus::Uploading {
        return Err(UploadError::ObjectNotUploading {
            id: object.id,
            status: object.status,
        });
    }
    Ok(())
}

fn invalid(reason: impl Into<String>) -> UploadError {
    UploadError::InvalidRequest(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        acceptance::AcceptanceSet,
        listing::{SortField, SortOrder},
    };
    use crate::services::path_namer::chunk_name;
    use crate::backend::{
        ChunkStore, ChunkStream, FinalObjectWriter, StoreResult, local::LocalStore,
    };
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::{
        path::Path,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tempfile::TempDir;

    const PAUSE: Duration = Duration::from_millis(500);

    /// Counters for the test store. The `slow_*` fields hold how many of the
    /// next calls of that kind sleep before doing their work.
    #[derive(Default)]
    struct Hooks {
        removals: AtomicUsize,
        slow_mkdirs: AtomicUsize,
        slow_writes: AtomicUsize,
        slow_reads: AtomicUsize,
        panicking_reads: AtomicUsize,
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn maybe_pause(counter: &AtomicUsize) {
        if take(counter) {
            tokio::time::sleep(PAUSE).await;
        }
    }

    /// Local store with injectable delays that counts staging cleanups.
    struct HookedStore {
        inner: LocalStore,
        hooks: Arc<Hooks>,
    }

    #[async_trait]
    impl ChunkStore for HookedStore {
        fn kind(&self) -> StorageKind {
            self.inner.kind()
        }

        async fn ensure_directory(&self, path: &str) -> StoreResult<()> {
            maybe_pause(&self.hooks.slow_mkdirs).await;
            self.inner.ensure_directory(path).await
        }

        async fn write_chunk(&self, staging: &str, index: u32, bytes: Bytes) -> StoreResult<()> {
            maybe_pause(&self.hooks.slow_writes).await;
            self.inner.write_chunk(staging, index, bytes).await
        }

        async fn read_chunks_in_order(&self, staging: &str, count: u32) -> StoreResult<ChunkStream> {
            if take(&self.hooks.panicking_reads) {
                panic!("chunk reader crashed");
            }
            maybe_pause(&self.hooks.slow_reads).await;
            self.inner.read_chunks_in_order(staging, count).await
        }

        async fn create_final_object(&self, path: &str) -> StoreResult<Box<dyn FinalObjectWriter>> {
            self.inner.create_final_object(path).await
        }

        async fn remove_directory_tree(&self, staging: &str) -> StoreResult<()> {
            self.hooks.removals.fetch_add(1, Ordering::SeqCst);
            self.inner.remove_directory_tree(staging).await
        }

        async fn remove_empty_ancestors(&self, path: &str, stop_at: &str) -> StoreResult<()> {
            self.inner.remove_empty_ancestors(path, stop_at).await
        }

        async fn test_reachability(&self) -> StoreResult<()> {
            self.inner.test_reachability().await
        }
    }

    struct Fixture {
        service: UploadService,
        root: TempDir,
        hooks: Arc<Hooks>,
    }

    impl Fixture {
        fn read_final(&self, object: &UploadObject) -> Vec<u8> {
            std::fs::read(self.root.path().join(&object.physical_path)).unwrap()
        }

        fn chunk_path(&self, object_id: i64, index: u32) -> std::path::PathBuf {
            self.root
                .path()
                .join(staging_dir(object_id))
                .join(chunk_name(index))
        }

        fn removals(&self) -> usize {
            self.hooks.removals.load(Ordering::SeqCst)
        }

        /// Poll until the object reaches `status` or two seconds pass.
        async fn wait_for(&self, object_id: i64, status: UploadStatus) -> UploadObject {
            for _ in 0..40 {
                let object = self.service.repo.fetch(object_id).await.unwrap();
                if object.status == status {
                    return object;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            panic!("object {object_id} never reached {status}");
        }
    }

    async fn memory_pool() -> Arc<SqlitePool> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        Arc::new(pool)
    }

    async fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let hooks = Arc::new(Hooks::default());
        let store = HookedStore {
            inner: LocalStore::new(root.path()),
            hooks: hooks.clone(),
        };
        let backends = Backends::new(Arc::new(store), None);
        Fixture {
            service: UploadService::new(memory_pool().await, backends),
            root,
            hooks,
        }
    }

    fn request(name: &str, size: i64, chunks: i64) -> CreateObjectRequest {
        CreateObjectRequest {
            logical_name: name.into(),
            declared_size: size,
            chunk_count: chunks,
            mime_type: Some("application/octet-stream".into()),
            parent_id: None,
            content_hash: None,
            storage_kind: None,
        }
    }

    fn staging_exists(root: &Path, object_id: i64) -> bool {
        root.join(staging_dir(object_id)).exists()
    }

    #[tokio::test]
    async fn three_chunk_upload_with_duplicate() {
        let fx = fixture().await;
        let obj = fx
            .service
            .create_object(7, request("report.pdf", 9, 3))
            .await
            .unwrap();
        assert_eq!(obj.status, UploadStatus::Uploading);

        let svc = &fx.service;
        let b = Bytes::from_static;
        assert_eq!(svc.admit_chunk(obj.id, 0, b(b"B0-")).await.unwrap(), AdmitOutcome::Accepted);
        assert_eq!(svc.admit_chunk(obj.id, 2, b(b"B2-")).await.unwrap(), AdmitOutcome::Accepted);
        assert_eq!(svc.admit_chunk(obj.id, 0, b(b"B0-")).await.unwrap(), AdmitOutcome::Replayed);
        assert_eq!(svc.admit_chunk(obj.id, 1, b(b"B1-")).await.unwrap(), AdmitOutcome::Completed);

        let done = fx.service.object(7, obj.id).await.unwrap();
        assert_eq!(done.status, UploadStatus::Completed);
        assert_eq!(fx.read_final(&done), b"B0-B1-B2-");
        assert!(!staging_exists(fx.root.path(), obj.id));
        assert_eq!(fx.removals(), 1);

        let p = fx.service.progress(obj.id).await.unwrap();
        assert_eq!(p.percent, 100.0);
        assert_eq!(p.uploaded_size_estimate, 9);
    }

    #[tokio::test]
    async fn arrival_order_does_not_change_output() {
        let fx = fixture().await;
        let a = fx
            .service
            .create_object(1, request("a.bin", 12, 4))
            .await
            .unwrap();
        let b = fx
            .service
            .create_object(1, request("b.bin", 12, 4))
            .await
            .unwrap();
        let parts: [&[u8]; 4] = [b"aaa", b"bbb", b"ccc", b"ddd"];

        for i in [0, 1, 2, 3] {
            fx.service
                .admit_chunk(a.id, i, Bytes::copy_from_slice(parts[i as usize]))
                .await
                .unwrap();
        }
        for i in [3, 1, 1, 0, 2] {
            fx.service
                .admit_chunk(b.id, i, Bytes::copy_from_slice(parts[i as usize]))
                .await
                .unwrap();
        }

        let a = fx.service.object(1, a.id).await.unwrap();
        let b = fx.service.object(1, b.id).await.unwrap();
        assert_eq!(fx.read_final(&a), b"aaabbbcccddd");
        assert_eq!(fx.read_final(&a), fx.read_final(&b));
    }

    #[tokio::test]
    async fn progress_tracks_accepted_chunks() {
        let fx = fixture().await;
        let obj = fx
            .service
            .create_object(1, request("p.bin", 400, 4))
            .await
            .unwrap();
        let p = fx.service.progress(obj.id).await.unwrap();
        assert_eq!(p.percent, 0.0);
        assert_eq!(p.status, UploadStatus::Uploading);

        fx.service
            .admit_chunk(obj.id, 1, Bytes::from(vec![1u8; 100]))
            .await
            .unwrap();
        let p = fx.service.progress(obj.id).await.unwrap();
        assert_eq!(p.percent, 25.0);
        assert_eq!(p.uploaded_size_estimate, 100);
    }

    #[tokio::test]
    async fn out_of_range_index_is_rejected_without_side_effects() {
        let fx = fixture().await;
        let obj = fx
            .service
            .create_object(1, request("x.bin", 30, 3))
            .await
            .unwrap();

        for bad in [3, -1, 99] {
            let err = fx
                .service
                .admit_chunk(obj.id, bad, Bytes::from_static(b"zz"))
                .await
                .unwrap_err();
            assert!(matches!(err, UploadError::InvalidChunkIndex { .. }));
        }
        let obj = fx.service.object(1, obj.id).await.unwrap();
        assert!(obj.accepted().is_empty());
        assert!(!staging_exists(fx.root.path(), obj.id));
    }

    #[tokio::test]
    async fn unknown_object_is_not_found() {
        let fx = fixture().await;
        let err = fx
            .service
            .admit_chunk(404, 0, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::ObjectNotFound(404)));
    }

    #[tokio::test]
    async fn chunks_after_completion_are_refused() {
        let fx = fixture().await;
        let obj = fx
            .service
            .create_object(1, request("one.bin", 3, 1))
            .await
            .unwrap();
        fx.service
            .admit_chunk(obj.id, 0, Bytes::from_static(b"one"))
            .await
            .unwrap();
        let err = fx
            .service
            .admit_chunk(obj.id, 0, Bytes::from_static(b"one"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::ObjectNotUploading {
                status: UploadStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn duplicate_names_are_scoped_by_parent() {
        let fx = fixture().await;
        let folder = fx
            .service
            .create_folder(1, "docs".into(), None)
            .await
            .unwrap();
        assert!(folder.is_container);
        assert_eq!(folder.status, UploadStatus::Completed);

        fx.service
            .create_object(1, request("same.txt", 1, 1))
            .await
            .unwrap();
        let mut nested = request("same.txt", 1, 1);
        nested.parent_id = Some(folder.id);
        fx.service.create_object(1, nested.clone()).await.unwrap();

        let err = fx.service.create_object(1, nested).await.unwrap_err();
        assert!(matches!(err, UploadError::DuplicateName(name) if name == "same.txt"));

        // Another owner may reuse the name at the root.
        fx.service
            .create_object(2, request("same.txt", 1, 1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deleted_names_can_be_reused() {
        let fx = fixture().await;
        let obj = fx
            .service
            .create_object(1, request("tmp.bin", 1, 1))
            .await
            .unwrap();
        fx.service.delete_object(1, obj.id).await.unwrap();
        assert!(matches!(
            fx.service.object(1, obj.id).await,
            Err(UploadError::ObjectNotFound(_))
        ));
        fx.service
            .create_object(1, request("tmp.bin", 1, 1))
            .await
            .unwrap();

        let err = fx
            .service
            .admit_chunk(obj.id, 0, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::ObjectNotUploading {
                status: UploadStatus::Deleted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn create_validates_request() {
        let fx = fixture().await;
        for req in [
            request("", 1, 1),
            request("../etc", 1, 1),
            request("a/b", 1, 1),
            request("ok.bin", -1, 1),
            request("ok.bin", 1, 0),
            request("ok.bin", 1, -3),
        ] {
            let err = fx.service.create_object(1, req).await.unwrap_err();
            assert!(matches!(err, UploadError::InvalidRequest(_)), "{err}");
        }

        let file = fx
            .service
            .create_object(1, request("plain.bin", 1, 1))
            .await
            .unwrap();
        let mut under_file = request("child.bin", 1, 1);
        under_file.parent_id = Some(file.id);
        assert!(matches!(
            fx.service.create_object(1, under_file).await,
            Err(UploadError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn unconfigured_remote_backend_is_unavailable() {
        let fx = fixture().await;
        let mut req = request("remote.bin", 10, 2);
        req.storage_kind = Some(StorageKind::Remote);
        let err = fx.service.create_object(1, req).await.unwrap_err();
        assert!(matches!(err, UploadError::BackendUnavailable(_)));

        let report = fx.service.check_remote().await;
        assert!(!report.ok);
    }

    #[tokio::test]
    async fn missing_chunk_fails_merge_and_retry_recovers() {
        let fx = fixture().await;
        let obj = fx
            .service
            .create_object(1, request("lost.bin", 6, 3))
            .await
            .unwrap();
        fx.service
            .admit_chunk(obj.id, 0, Bytes::from_static(b"00"))
            .await
            .unwrap();
        fx.service
            .admit_chunk(obj.id, 1, Bytes::from_static(b"11"))
            .await
            .unwrap();

        std::fs::remove_file(fx.chunk_path(obj.id, 1)).unwrap();

        let err = fx
            .service
            .admit_chunk(obj.id, 2, Bytes::from_static(b"22"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::ChunkMissing(1)));

        let failed = fx.service.object(1, obj.id).await.unwrap();
        assert_eq!(failed.status, UploadStatus::Failed);
        assert!(!fx.root.path().join(&failed.physical_path).exists());
        assert!(fx.chunk_path(obj.id, 0).exists());
        assert!(fx.chunk_path(obj.id, 2).exists());
        assert_eq!(fx.removals(), 0);

        std::fs::write(fx.chunk_path(obj.id, 1), b"11").unwrap();
        let (done, outcome) = fx.service.retry_assembly(obj.id).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Assembled);
        assert_eq!(done.status, UploadStatus::Completed);
        assert_eq!(fx.read_final(&done), b"001122");
        assert!(!staging_exists(fx.root.path(), obj.id));
    }

    #[tokio::test]
    async fn reassembling_a_completed_object_keeps_its_bytes() {
        let fx = fixture().await;
        let obj = fx
            .service
            .create_object(1, request("twice.bin", 4, 2))
            .await
            .unwrap();
        fx.service
            .admit_chunk(obj.id, 0, Bytes::from_static(b"ab"))
            .await
            .unwrap();
        fx.service
            .admit_chunk(obj.id, 1, Bytes::from_static(b"cd"))
            .await
            .unwrap();
        let first = fx.service.object(1, obj.id).await.unwrap();
        let before = fx.read_final(&first);

        let (again, outcome) = fx.service.retry_assembly(obj.id).await.unwrap();
        assert_eq!(outcome, MergeOutcome::AlreadyAssembled);
        assert_eq!(again.status, UploadStatus::Completed);
        assert_eq!(fx.read_final(&again), before);
    }

    #[tokio::test]
    async fn retry_rejects_unfinished_and_folder_objects() {
        let fx = fixture().await;
        let obj = fx
            .service
            .create_object(1, request("half.bin", 4, 2))
            .await
            .unwrap();
        fx.service
            .admit_chunk(obj.id, 0, Bytes::from_static(b"ab"))
            .await
            .unwrap();
        assert!(matches!(
            fx.service.retry_assembly(obj.id).await,
            Err(UploadError::IncompleteUpload {
                accepted: 1,
                expected: 2,
                ..
            })
        ));

        let folder = fx
            .service
            .create_folder(1, "dir".into(), None)
            .await
            .unwrap();
        assert!(matches!(
            fx.service.retry_assembly(folder.id).await,
            Err(UploadError::InvalidRequest(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_final_chunks_assemble_once() {
        for round in 0..8 {
            let fx = fixture().await;
            let obj = fx
                .service
                .create_object(1, request(&format!("race-{round}.bin"), 6, 3))
                .await
                .unwrap();
            fx.service
                .admit_chunk(obj.id, 0, Bytes::from_static(b"AA"))
                .await
                .unwrap();

            let id = obj.id;
            let tasks = [(1i64, &b"BB"[..]), (2i64, &b"CC"[..])].map(|(i, data)| {
                let service = fx.service.clone();
                tokio::spawn(async move {
                    service
                        .admit_chunk(id, i, Bytes::from_static(data))
                        .await
                })
            });
            let mut outcomes = Vec::new();
            for task in tasks {
                outcomes.push(task.await.unwrap().unwrap());
            }

            let completed = outcomes
                .iter()
                .filter(|o| **o == AdmitOutcome::Completed)
                .count();
            assert_eq!(completed, 1, "round {round}: {outcomes:?}");
            assert_eq!(fx.removals(), 1);

            let done = fx.service.object(1, obj.id).await.unwrap();
            assert_eq!(done.status, UploadStatus::Completed);
            assert_eq!(fx.read_final(&done), b"AABBCC");
        }
    }

    #[tokio::test]
    async fn rename_and_move_keep_physical_path() {
        let fx = fixture().await;
        let folder = fx
            .service
            .create_folder(1, "photos".into(), None)
            .await
            .unwrap();
        let obj = fx
            .service
            .create_object(1, request("img.jpg", 2, 1))
            .await
            .unwrap();
        fx.service
            .create_object(1, request("taken.jpg", 2, 1))
            .await
            .unwrap();

        assert!(matches!(
            fx.service
                .rename_object(1, obj.id, "taken.jpg".into())
                .await,
            Err(UploadError::DuplicateName(_))
        ));

        let renamed = fx
            .service
            .rename_object(1, obj.id, "cover.jpg".into())
            .await
            .unwrap();
        assert_eq!(renamed.logical_name, "cover.jpg");
        assert_eq!(renamed.physical_path, obj.physical_path);

        let moved = fx
            .service
            .move_object(1, obj.id, Some(folder.id))
            .await
            .unwrap();
        assert_eq!(moved.parent_id, Some(folder.id));
        assert_eq!(moved.physical_path, obj.physical_path);

        let root = fx
            .service
            .list_children(1, &ListChildrenRequest::default())
            .await
            .unwrap();
        let names: Vec<_> = root.files.iter().map(|o| o.logical_name.as_str()).collect();
        assert_eq!(names, ["photos", "taken.jpg"]);
        let inside = fx
            .service
            .list_children(
                1,
                &ListChildrenRequest {
                    parent_id: Some(folder.id),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(inside.total, 1);
        assert_eq!(inside.files[0].id, obj.id);

        // Chunks still land in the id-keyed staging directory.
        fx.service
            .admit_chunk(obj.id, 0, Bytes::from_static(b"ok"))
            .await
            .unwrap();
        let done = fx.service.object(1, obj.id).await.unwrap();
        assert_eq!(fx.read_final(&done), b"ok");
    }

    #[tokio::test]
    async fn folders_cannot_be_moved_into_themselves() {
        let fx = fixture().await;
        let outer = fx
            .service
            .create_folder(1, "outer".into(), None)
            .await
            .unwrap();
        let inner = fx
            .service
            .create_folder(1, "inner".into(), Some(outer.id))
            .await
            .unwrap();

        for target in [outer.id, inner.id] {
            assert!(matches!(
                fx.service.move_object(1, outer.id, Some(target)).await,
                Err(UploadError::InvalidRequest(_))
            ));
        }
    }

    #[tokio::test]
    async fn other_owners_cannot_touch_an_object() {
        let fx = fixture().await;
        let obj = fx
            .service
            .create_object(1, request("mine.bin", 1, 1))
            .await
            .unwrap();
        assert!(matches!(
            fx.service.delete_object(2, obj.id).await,
            Err(UploadError::ObjectNotFound(_))
        ));
        assert!(matches!(
            fx.service.rename_object(2, obj.id, "x".into()).await,
            Err(UploadError::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn same_name_in_different_folders_keeps_separate_bytes() {
        let fx = fixture().await;
        let folder = fx
            .service
            .create_folder(1, "archive".into(), None)
            .await
            .unwrap();
        let top = fx
            .service
            .create_object(1, request("notes.txt", 3, 1))
            .await
            .unwrap();
        let mut nested = request("notes.txt", 3, 1);
        nested.parent_id = Some(folder.id);
        let inner = fx.service.create_object(1, nested).await.unwrap();
        assert_ne!(top.physical_path, inner.physical_path);

        fx.service
            .admit_chunk(top.id, 0, Bytes::from_static(b"top"))
            .await
            .unwrap();
        fx.service
            .admit_chunk(inner.id, 0, Bytes::from_static(b"low"))
            .await
            .unwrap();

        let top = fx.service.object(1, top.id).await.unwrap();
        let inner = fx.service.object(1, inner.id).await.unwrap();
        assert_eq!(fx.read_final(&top), b"top");
        assert_eq!(fx.read_final(&inner), b"low");
    }

    #[tokio::test]
    async fn taken_physical_path_is_rejected_by_the_store() {
        let fx = fixture().await;
        let first = fx
            .service
            .create_object(1, request("clash.bin", 1, 1))
            .await
            .unwrap();
        let err = fx
            .service
            .repo
            .insert(&NewUploadObject {
                owner_id: 1,
                logical_name: "other.bin".into(),
                declared_size: 1,
                content_hash: None,
                mime_type: None,
                chunk_count: 1,
                storage_kind: StorageKind::Local,
                physical_path: first.physical_path.clone(),
                status: UploadStatus::Uploading,
                parent_id: None,
                is_container: false,
                created_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::PathTaken(path) if path == first.physical_path));

        // Soft-deleted rows keep their bytes, so their path stays reserved.
        fx.service.delete_object(1, first.id).await.unwrap();
        let again = fx
            .service
            .create_object(1, request("clash.bin", 1, 1))
            .await
            .unwrap();
        assert_ne!(again.physical_path, first.physical_path);
    }

    #[tokio::test]
    async fn abandoned_caller_does_not_strand_the_merge() {
        let fx = fixture().await;
        let obj = fx
            .service
            .create_object(1, request("slow.bin", 4, 2))
            .await
            .unwrap();
        fx.service
            .admit_chunk(obj.id, 0, Bytes::from_static(b"ab"))
            .await
            .unwrap();

        fx.hooks.slow_reads.store(1, Ordering::SeqCst);
        let caller = {
            let service = fx.service.clone();
            let id = obj.id;
            tokio::spawn(async move { service.admit_chunk(id, 1, Bytes::from_static(b"cd")).await })
        };
        fx.wait_for(obj.id, UploadStatus::Merging).await;
        caller.abort();
        let _ = caller.await;

        assert!(matches!(
            fx.service.retry_assembly(obj.id).await,
            Err(UploadError::ObjectNotUploading {
                status: UploadStatus::Merging,
                ..
            })
        ));

        let done = fx.wait_for(obj.id, UploadStatus::Completed).await;
        assert_eq!(fx.read_final(&done), b"abcd");
        assert!(!fx.service.locks.merge_in_flight(obj.id));
        assert!(!staging_exists(fx.root.path(), obj.id));
    }

    #[tokio::test]
    async fn crashed_merge_can_be_retried() {
        let fx = fixture().await;
        let obj = fx
            .service
            .create_object(1, request("crash.bin", 4, 2))
            .await
            .unwrap();
        fx.service
            .admit_chunk(obj.id, 0, Bytes::from_static(b"ab"))
            .await
            .unwrap();

        fx.hooks.panicking_reads.store(1, Ordering::SeqCst);
        let err = fx
            .service
            .admit_chunk(obj.id, 1, Bytes::from_static(b"cd"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::MergeWriteFailed(_)));
        let stuck = fx.service.repo.fetch(obj.id).await.unwrap();
        assert_eq!(stuck.status, UploadStatus::Merging);
        assert!(!fx.service.locks.merge_in_flight(obj.id));

        let (done, outcome) = fx.service.retry_assembly(obj.id).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Assembled);
        assert_eq!(done.status, UploadStatus::Completed);
        assert_eq!(fx.read_final(&done), b"abcd");
    }

    #[tokio::test]
    async fn startup_fails_merges_left_by_a_previous_process() {
        let fx = fixture().await;
        let obj = fx
            .service
            .create_object(1, request("restart.bin", 4, 2))
            .await
            .unwrap();
        fx.service
            .admit_chunk(obj.id, 0, Bytes::from_static(b"ab"))
            .await
            .unwrap();
        std::fs::write(fx.chunk_path(obj.id, 1), b"cd").unwrap();
        let full: AcceptanceSet = [0u32, 1].into_iter().collect();
        fx.service.repo.save_acceptance(obj.id, &full).await.unwrap();
        assert!(
            fx.service
                .repo
                .compare_and_set_status(obj.id, UploadStatus::Uploading, UploadStatus::Merging)
                .await
                .unwrap()
        );

        assert_eq!(fx.service.recover_stale_merges().await.unwrap(), 1);
        assert_eq!(fx.service.recover_stale_merges().await.unwrap(), 0);
        let failed = fx.service.object(1, obj.id).await.unwrap();
        assert_eq!(failed.status, UploadStatus::Failed);

        let (done, _) = fx.service.retry_assembly(obj.id).await.unwrap();
        assert_eq!(fx.read_final(&done), b"abcd");
    }

    #[tokio::test]
    async fn merging_row_without_an_assembler_is_taken_over() {
        let fx = fixture().await;
        let obj = fx
            .service
            .create_object(1, request("orphan.bin", 4, 2))
            .await
            .unwrap();
        fx.service
            .admit_chunk(obj.id, 0, Bytes::from_static(b"ab"))
            .await
            .unwrap();
        std::fs::write(fx.chunk_path(obj.id, 1), b"cd").unwrap();
        let full: AcceptanceSet = [0u32, 1].into_iter().collect();
        fx.service.repo.save_acceptance(obj.id, &full).await.unwrap();
        fx.service
            .repo
            .compare_and_set_status(obj.id, UploadStatus::Uploading, UploadStatus::Merging)
            .await
            .unwrap();

        let (done, outcome) = fx.service.retry_assembly(obj.id).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Assembled);
        assert_eq!(done.status, UploadStatus::Completed);
        assert_eq!(fx.read_final(&done), b"abcd");
    }

    #[tokio::test]
    async fn late_duplicate_whose_write_fails_after_cleanup_is_replayed() {
        let fx = fixture().await;
        let obj = fx
            .service
            .create_object(1, request("late.bin", 4, 2))
            .await
            .unwrap();
        fx.service
            .admit_chunk(obj.id, 0, Bytes::from_static(b"ab"))
            .await
            .unwrap();

        fx.hooks.slow_writes.store(1, Ordering::SeqCst);
        let late = {
            let service = fx.service.clone();
            let id = obj.id;
            tokio::spawn(async move { service.admit_chunk(id, 1, Bytes::from_static(b"cd")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let twin = fx
            .service
            .admit_chunk(obj.id, 1, Bytes::from_static(b"cd"))
            .await
            .unwrap();
        assert_eq!(twin, AdmitOutcome::Completed);
        assert!(!staging_exists(fx.root.path(), obj.id));

        assert_eq!(late.await.unwrap().unwrap(), AdmitOutcome::Replayed);
        let done = fx.service.object(1, obj.id).await.unwrap();
        assert_eq!(done.status, UploadStatus::Completed);
        assert_eq!(fx.read_final(&done), b"abcd");
    }

    #[tokio::test]
    async fn late_duplicate_that_recreates_staging_cleans_it_up() {
        let fx = fixture().await;
        let obj = fx
            .service
            .create_object(1, request("stray.bin", 4, 2))
            .await
            .unwrap();
        fx.service
            .admit_chunk(obj.id, 0, Bytes::from_static(b"ab"))
            .await
            .unwrap();

        fx.hooks.slow_mkdirs.store(1, Ordering::SeqCst);
        let late = {
            let service = fx.service.clone();
            let id = obj.id;
            tokio::spawn(async move { service.admit_chunk(id, 1, Bytes::from_static(b"cd")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        fx.service
            .admit_chunk(obj.id, 1, Bytes::from_static(b"cd"))
            .await
            .unwrap();
        assert!(!fx.root.path().join("chunks").exists());

        assert_eq!(late.await.unwrap().unwrap(), AdmitOutcome::Replayed);
        assert!(!staging_exists(fx.root.path(), obj.id));
        assert!(!fx.root.path().join("chunks").exists());
        let done = fx.service.object(1, obj.id).await.unwrap();
        assert_eq!(fx.read_final(&done), b"abcd");
    }

    #[tokio::test]
    async fn failed_first_merge_leaves_no_empty_shard_directories() {
        let fx = fixture().await;
        let obj = fx
            .service
            .create_object(9, request("gone.bin", 4, 2))
            .await
            .unwrap();
        fx.service
            .admit_chunk(obj.id, 0, Bytes::from_static(b"ab"))
            .await
            .unwrap();
        std::fs::remove_file(fx.chunk_path(obj.id, 0)).unwrap();
        fx.service
            .admit_chunk(obj.id, 1, Bytes::from_static(b"cd"))
            .await
            .unwrap_err();

        assert!(fx.root.path().join("files").is_dir());
        assert!(!fx.root.path().join("files/9").exists());
    }

    #[tokio::test]
    async fn listing_pages_filters_and_sorts() {
        let fx = fixture().await;
        fx.service
            .create_folder(1, "zeta".into(), None)
            .await
            .unwrap();
        for (name, size) in [("report-a.pdf", 30), ("report_b.pdf", 10), ("photo.jpg", 20)] {
            fx.service
                .create_object(1, request(name, size, 1))
                .await
                .unwrap();
        }
        fx.service
            .create_object(2, request("report-other-owner.pdf", 1, 1))
            .await
            .unwrap();

        let names = |page: &ChildrenPage| {
            page.files
                .iter()
                .map(|o| o.logical_name.clone())
                .collect::<Vec<_>>()
        };

        let by_size = fx
            .service
            .list_children(
                1,
                &ListChildrenRequest {
                    sort_by: Some(SortField::Size),
                    sort_order: Some(SortOrder::Asc),
                    page_size: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_size.total, 4);
        assert_eq!(by_size.total_pages, 2);
        assert_eq!(names(&by_size), ["zeta", "report_b.pdf"]);

        let second = fx
            .service
            .list_children(
                1,
                &ListChildrenRequest {
                    sort_by: Some(SortField::Size),
                    sort_order: Some(SortOrder::Asc),
                    page: Some(2),
                    page_size: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(second.page, 2);
        assert_eq!(names(&second), ["photo.jpg", "report-a.pdf"]);

        let matching = fx
            .service
            .list_children(
                1,
                &ListChildrenRequest {
                    keyword: Some("report".into()),
                    sort_by: Some(SortField::Name),
                    sort_order: Some(SortOrder::Desc),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(matching.total, 2);
        assert_eq!(names(&matching), ["report_b.pdf", "report-a.pdf"]);

        // `_` is matched literally, not as a single-character wildcard.
        let literal = fx
            .service
            .list_children(
                1,
                &ListChildrenRequest {
                    keyword: Some("t_".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(names(&literal), ["report_b.pdf"]);
    }

    #[tokio::test]
    async fn connectivity_report_explains_a_missing_remote() {
        let dir = tempfile::tempdir().unwrap();
        let backends = Backends::new(Arc::new(LocalStore::new(dir.path())), None);
        let report = connectivity_report(&backends).await;
        assert!(!report.ok);
        assert!(report.detail.contains("not configured"), "{}", report.detail);
    }
}

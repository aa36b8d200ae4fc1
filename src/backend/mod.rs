//! Chunk store backends.
//!
//! A backend persists raw chunk bytes under a per-object staging directory
//! and assembles them into a final object. Two implementations exist:
//! [`local::LocalStore`] (filesystem) and [`sftp::SftpStore`] (remote host).
//! Every path handed to a backend is a `/`-separated key relative to that
//! backend's root; the backend decides where the root is.

pub mod local;
pub mod sftp;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::{io, sync::Arc};
use thiserror::Error;

use crate::models::upload_object::StorageKind;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("chunk {0} is missing from the staging directory")]
    ChunkMissing(u32),
    #[error("unsafe storage key `{0}`")]
    InvalidKey(String),
    #[error("{op} `{path}`: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub(crate) fn io(op: &'static str, path: impl Into<String>, source: io::Error) -> Self {
        StoreError::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

/// Lazy, single-pass sequence of chunk payloads in index order.
pub type ChunkStream = BoxStream<'static, StoreResult<Bytes>>;

/// Raw persistence primitives shared by every storage kind.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    fn kind(&self) -> StorageKind;

    /// Create `path` and any missing ancestors. Succeeds if it already exists.
    async fn ensure_directory(&self, path: &str) -> StoreResult<()>;

    /// Persist chunk `index` under `staging_dir`.
    ///
    /// Writing the same index twice replaces the earlier artifact.
    async fn write_chunk(&self, staging_dir: &str, index: u32, bytes: Bytes) -> StoreResult<()>;

    /// Stream chunks `0..count` in order. The first absent chunk yields
    /// [`StoreError::ChunkMissing`] and nothing after it is read.
    async fn read_chunks_in_order(&self, staging_dir: &str, count: u32)
    -> StoreResult<ChunkStream>;

    /// Open a write handle for the final object at `path`.
    ///
    /// Bytes go to a temporary sibling until [`FinalObjectWriter::close`]
    /// moves them over `path`, so readers never observe a partial object.
    async fn create_final_object(&self, path: &str) -> StoreResult<Box<dyn FinalObjectWriter>>;

    /// Remove `staging_dir` and everything below it.
    async fn remove_directory_tree(&self, staging_dir: &str) -> StoreResult<()>;

    /// Remove the directory `path`, then each of its parents, for as long as
    /// they are empty. `stop_at` and everything above it are never touched;
    /// an empty `stop_at` means the backend root. Missing directories are
    /// skipped and the walk ends at the first one that still has entries.
    async fn remove_empty_ancestors(&self, path: &str, stop_at: &str) -> StoreResult<()>;

    /// Minimal round-trip against the backend root.
    async fn test_reachability(&self) -> StoreResult<()>;
}

/// Scoped write handle for an object being assembled.
///
/// Exactly one of `close` or `abort` consumes the handle. Dropping it without
/// either removes the temporary artifact on a best-effort basis.
#[async_trait]
pub trait FinalObjectWriter: Send {
    async fn append(&mut self, bytes: &[u8]) -> StoreResult<()>;

    /// Flush and publish the object at its final path, replacing any
    /// previous version.
    async fn close(self: Box<Self>) -> StoreResult<()>;

    /// Discard everything written so far.
    async fn abort(self: Box<Self>);
}

/// Backends available to this process, looked up by an object's stored
/// [`StorageKind`].
#[derive(Clone)]
pub struct Backends {
    local: Arc<dyn ChunkStore>,
    remote: Option<Arc<dyn ChunkStore>>,
}

impl Backends {
    pub fn new(local: Arc<dyn ChunkStore>, remote: Option<Arc<dyn ChunkStore>>) -> Self {
        Self { local, remote }
    }

    pub fn resolve(&self, kind: StorageKind) -> StoreResult<Arc<dyn ChunkStore>> {
        match kind {
            StorageKind::Local => Ok(self.local.clone()),
            StorageKind::Remote => self
                .remote
                .clone()
                .ok_or_else(|| StoreError::Unavailable("remote backend is not configured".into())),
        }
    }

    pub fn local(&self) -> &Arc<dyn ChunkStore> {
        &self.local
    }

    pub fn remote(&self) -> Option<&Arc<dyn ChunkStore>> {
        self.remote.as_ref()
    }
}

/// Reject keys that could escape the backend root.
pub(crate) fn validate_key(key: &str) -> StoreResult<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.bytes().any(|b| b.is_ascii_control())
        || key.split('/').any(|part| part == ".." || part == ".")
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Parent of a `/`-separated key, or `None` for a top-level key.
pub(crate) fn parent_key(key: &str) -> Option<&str> {
    key.rsplit_once('/').map(|(parent, _)| parent)
}

/// Directories from `path` up to, but excluding, `stop_at`, innermost first.
pub(crate) fn ancestors_below(path: &str, stop_at: &str) -> StoreResult<Vec<String>> {
    let path = path.trim_end_matches('/');
    let stop_at = stop_at.trim_end_matches('/');
    validate_key(path)?;
    if !stop_at.is_empty() {
        validate_key(stop_at)?;
        let within = path == stop_at
            || path
                .strip_prefix(stop_at)
                .is_some_and(|rest| rest.starts_with('/'));
        if !within {
            return Err(StoreError::InvalidKey(path.to_string()));
        }
    }

    let mut dirs = Vec::new();
    let mut cursor = Some(path);
    while let Some(dir) = cursor {
        if dir == stop_at {
            break;
        }
        dirs.push(dir.to_string());
        cursor = parent_key(dir);
    }
    Ok(dirs)
}

/// Name of a temporary sibling used while a file is being written.
pub(crate) fn temp_name() -> String {
    format!(".tmp-{}", uuid::Uuid::new_v4())
}

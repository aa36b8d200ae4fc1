//! Local filesystem backend.
//!
//! Layout under the root: `chunks/{object_id}/chunk_{index}` for staged
//! chunks and `files/{owner}/{shard}/{shard}/{name}` for assembled objects.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;

use super::{
    ChunkStore, ChunkStream, FinalObjectWriter, StoreError, StoreResult, ancestors_below,
    temp_name, validate_key,
};
use crate::models::upload_object::StorageKind;
use crate::services::path_namer::chunk_name;

/// Attempts at creating a directory whose parent may be removed
/// concurrently by an empty-ancestor sweep.
const MKDIR_ATTEMPTS: usize = 3;

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> StoreResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

/// `create_dir_all` that tolerates a parent vanishing halfway through.
async fn create_dir_all_retrying(dir: &Path) -> std::io::Result<()> {
    let mut attempt = 1;
    loop {
        match fs::create_dir_all(dir).await {
            Err(err) if err.kind() == ErrorKind::NotFound && attempt < MKDIR_ATTEMPTS => {
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Write `data` to a temporary sibling and rename it over `path`.
async fn write_atomic(path: &Path, data: &[u8]) -> StoreResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::InvalidKey(path.display().to_string()))?;
    let tmp_path = parent.join(temp_name());
    let display = path.display().to_string();

    let result = async {
        let mut file = File::create(&tmp_path)
            .await
            .map_err(|e| StoreError::io("create", &display, e))?;
        file.write_all(data)
            .await
            .map_err(|e| StoreError::io("write", &display, e))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::io("sync", &display, e))?;
        drop(file);
        replace_file(&tmp_path, path)
            .await
            .map_err(|e| StoreError::io("rename", &display, e))
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
    }
    result
}

/// Rename `from` over `to`, replacing an existing file on platforms where
/// rename refuses to.
async fn replace_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to).await {
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            fs::remove_file(to).await?;
            fs::rename(from, to).await
        }
        other => other,
    }
}

#[async_trait]
impl ChunkStore for LocalStore {
    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    async fn ensure_directory(&self, path: &str) -> StoreResult<()> {
        let dir = self.resolve(path)?;
        create_dir_all_retrying(&dir)
            .await
            .map_err(|e| StoreError::io("mkdir", dir.display().to_string(), e))
    }

    async fn write_chunk(&self, staging_dir: &str, index: u32, bytes: Bytes) -> StoreResult<()> {
        let path = self.resolve(staging_dir)?.join(chunk_name(index));
        write_atomic(&path, &bytes).await?;
        debug!(path = %path.display(), size = bytes.len(), "wrote chunk");
        Ok(())
    }

    async fn read_chunks_in_order(
        &self,
        staging_dir: &str,
        count: u32,
    ) -> StoreResult<ChunkStream> {
        let dir = self.resolve(staging_dir)?;
        let stream = futures::stream::iter(0..count).then(move |index| {
            let path = dir.join(chunk_name(index));
            async move {
                match fs::read(&path).await {
                    Ok(data) => Ok(Bytes::from(data)),
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        Err(StoreError::ChunkMissing(index))
                    }
                    Err(err) => Err(StoreError::io("read", path.display().to_string(), err)),
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn create_final_object(&self, path: &str) -> StoreResult<Box<dyn FinalObjectWriter>> {
        let final_path = self.resolve(path)?;
        let parent = final_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| StoreError::InvalidKey(path.to_string()))?;
        let tmp_path = parent.join(temp_name());

        let mut attempt = 1;
        let file = loop {
            create_dir_all_retrying(&parent)
                .await
                .map_err(|e| StoreError::io("mkdir", parent.display().to_string(), e))?;
            match File::create(&tmp_path).await {
                Ok(file) => break file,
                Err(err) if err.kind() == ErrorKind::NotFound && attempt < MKDIR_ATTEMPTS => {
                    attempt += 1;
                }
                Err(err) => {
                    return Err(StoreError::io("create", tmp_path.display().to_string(), err));
                }
            }
        };

        Ok(Box::new(LocalFinalWriter {
            file: Some(file),
            tmp_path,
            final_path,
            finished: false,
        }))
    }

    async fn remove_directory_tree(&self, staging_dir: &str) -> StoreResult<()> {
        let dir = self.resolve(staging_dir)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(path = %dir.display(), "removed staging directory");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::io("remove", dir.display().to_string(), err)),
        }
    }

    async fn remove_empty_ancestors(&self, path: &str, stop_at: &str) -> StoreResult<()> {
        for key in ancestors_below(path, stop_at)? {
            let dir = self.root.join(&key);
            match fs::remove_dir(&dir).await {
                Ok(()) => debug!(path = %dir.display(), "removed empty directory"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::DirectoryNotEmpty | ErrorKind::AlreadyExists
                    ) =>
                {
                    break;
                }
                Err(err) => return Err(StoreError::io("rmdir", dir.display().to_string(), err)),
            }
        }
        Ok(())
    }

    /// Write, read back and delete a probe file under the root.
    async fn test_reachability(&self) -> StoreResult<()> {
        let meta = fs::metadata(&self.root).await.map_err(|e| {
            StoreError::Unavailable(format!("cannot access {}: {e}", self.root.display()))
        })?;
        if !meta.is_dir() {
            return Err(StoreError::Unavailable(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }

        let probe = self.root.join(format!(".probe-{}", uuid::Uuid::new_v4()));
        let outcome = match fs::write(&probe, b"probe").await {
            Ok(()) => match fs::read(&probe).await {
                Ok(bytes) if bytes == b"probe" => Ok(()),
                Ok(_) => Err(StoreError::Unavailable("probe file content mismatch".into())),
                Err(e) => Err(StoreError::Unavailable(format!("cannot read probe file: {e}"))),
            },
            Err(e) => Err(StoreError::Unavailable(format!("cannot write probe file: {e}"))),
        };
        let _ = fs::remove_file(&probe).await;
        outcome
    }
}

struct LocalFinalWriter {
    file: Option<File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    finished: bool,
}

#[async_trait]
impl FinalObjectWriter for LocalFinalWriter {
    async fn append(&mut self, bytes: &[u8]) -> StoreResult<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            StoreError::io(
                "write",
                self.final_path.display().to_string(),
                std::io::Error::other("writer already closed"),
            )
        })?;
        file.write_all(bytes)
            .await
            .map_err(|e| StoreError::io("write", self.final_path.display().to_string(), e))
    }

    async fn close(mut self: Box<Self>) -> StoreResult<()> {
        let display = self.final_path.display().to_string();
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| StoreError::io("flush", &display, e))?;
            file.sync_all()
                .await
                .map_err(|e| StoreError::io("sync", &display, e))?;
        }
        replace_file(&self.tmp_path, &self.final_path)
            .await
            .map_err(|e| StoreError::io("rename", &display, e))?;
        self.finished = true;
        Ok(())
    }

    async fn abort(mut self: Box<Self>) {
        self.file.take();
        if let Err(err) = fs::remove_file(&self.tmp_path).await {
            if err.kind() != ErrorKind::NotFound {
                debug!(path = %self.tmp_path.display(), "failed to remove partial object: {err}");
            }
        }
        self.finished = true;
    }
}

impl Drop for LocalFinalWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.file.take();
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

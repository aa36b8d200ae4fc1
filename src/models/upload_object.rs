//! Represents one uploaded file or folder entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use std::fmt;

use super::acceptance::AcceptanceSet;

/// Storage substrate an object's bytes live on.
///
/// Chosen once when the object is created and stored as a tag on the row;
/// it is never re-derived from configuration afterwards.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Remote,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Local => f.write_str("local"),
            StorageKind::Remote => f.write_str("remote"),
        }
    }
}

/// Lifecycle state of an [`UploadObject`].
///
/// `Merging` is the transient "completed-pending" state held by the single
/// worker that won the completion compare-and-set.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploading,
    Merging,
    Completed,
    Failed,
    Deleted,
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadStatus::Uploading => "uploading",
            UploadStatus::Merging => "merging",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// A single file (or folder) row in the metadata store.
///
/// Holds metadata only; chunk and object bytes live on the backend named by
/// `storage_kind`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UploadObject {
    /// Immutable numeric id; also keys the chunk staging directory.
    pub id: i64,

    pub owner_id: i64,

    /// Name as shown to the owner. Renames do not move stored bytes.
    pub logical_name: String,

    /// Client-declared size in bytes.
    pub declared_size: i64,

    /// Client-declared content hash, kept for future dedup. Not verified.
    pub content_hash: Option<String>,

    pub mime_type: Option<String>,

    /// Declared number of chunks. Zero only for containers.
    pub chunk_count: u32,

    pub storage_kind: StorageKind,

    /// Backend-relative key of the assembled object, frozen at creation.
    pub physical_path: String,

    pub status: UploadStatus,

    pub parent_id: Option<i64>,

    pub is_container: bool,

    /// Chunk indices durably written so far.
    pub accepted_chunks: Json<AcceptanceSet>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    pub deleted_at: Option<DateTime<Utc>>,
}

impl UploadObject {
    pub fn accepted(&self) -> &AcceptanceSet {
        &self.accepted_chunks.0
    }
}

//! Row-level access to the `upload_objects` table.
//!
//! This is the only place that talks SQL. Every operation touches a single
//! row keyed by id, except the sibling-name lookups and child listing.

use chrono::{DateTime, Utc};
use sqlx::{SqlitePool, types::Json};
use std::sync::Arc;

use super::error::{UploadError, UploadResult};
use crate::models::{
    acceptance::AcceptanceSet,
    listing::ListChildrenRequest,
    upload_object::{StorageKind, UploadObject, UploadStatus},
};

const COLUMNS: &str = "id, owner_id, logical_name, declared_size, content_hash, mime_type, \
     chunk_count, storage_kind, physical_path, status, parent_id, is_container, \
     accepted_chunks, created_at, updated_at, deleted_at";

/// Fields of a row about to be inserted.
#[derive(Debug, Clone)]
pub struct NewUploadObject {
    pub owner_id: i64,
    pub logical_name: String,
    pub declared_size: i64,
    pub content_hash: Option<String>,
    pub mime_type: Option<String>,
    pub chunk_count: u32,
    pub storage_kind: StorageKind,
    pub physical_path: String,
    pub status: UploadStatus,
    pub parent_id: Option<i64>,
    pub is_container: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct MetadataRepo {
    db: Arc<SqlitePool>,
}

impl MetadataRepo {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Fetch a row by id regardless of status.
    pub async fn fetch(&self, id: i64) -> UploadResult<UploadObject> {
        sqlx::query_as::<_, UploadObject>(&format!(
            "SELECT {COLUMNS} FROM upload_objects WHERE id = ?"
        ))
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| not_found_or(err, id))
    }

    /// Fetch a non-deleted row that belongs to `owner_id`.
    pub async fn fetch_owned(&self, owner_id: i64, id: i64) -> UploadResult<UploadObject> {
        sqlx::query_as::<_, UploadObject>(&format!(
            "SELECT {COLUMNS} FROM upload_objects
             WHERE id = ? AND owner_id = ? AND status <> 'deleted'"
        ))
        .bind(id)
        .bind(owner_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| not_found_or(err, id))
    }

    /// Whether a non-deleted sibling with this name exists under `parent_id`.
    /// `exclude_id` skips the row being renamed or moved.
    pub async fn name_taken(
        &self,
        owner_id: i64,
        logical_name: &str,
        parent_id: Option<i64>,
        exclude_id: Option<i64>,
    ) -> UploadResult<bool> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM upload_objects
             WHERE owner_id = ? AND logical_name = ? AND parent_id IS ?
               AND status <> 'deleted' AND id IS NOT ?",
        )
        .bind(owner_id)
        .bind(logical_name)
        .bind(parent_id)
        .bind(exclude_id)
        .fetch_one(&*self.db)
        .await?;
        Ok(found > 0)
    }

    /// Insert a row and return it. A concurrent insert of the same live
    /// name is reported as [`UploadError::DuplicateName`]; a physical path
    /// already owned by another row as [`UploadError::PathTaken`].
    pub async fn insert(&self, new: &NewUploadObject) -> UploadResult<UploadObject> {
        sqlx::query_as::<_, UploadObject>(&format!(
            "INSERT INTO upload_objects (
                owner_id, logical_name, declared_size, content_hash, mime_type,
                chunk_count, storage_kind, physical_path, status, parent_id,
                is_container, accepted_chunks, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {COLUMNS}"
        ))
        .bind(new.owner_id)
        .bind(&new.logical_name)
        .bind(new.declared_size)
        .bind(&new.content_hash)
        .bind(&new.mime_type)
        .bind(new.chunk_count)
        .bind(new.storage_kind)
        .bind(&new.physical_path)
        .bind(new.status)
        .bind(new.parent_id)
        .bind(new.is_container)
        .bind(Json(AcceptanceSet::new()))
        .bind(new.created_at)
        .bind(new.created_at)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| {
            if !is_unique_violation(&err) {
                UploadError::Sqlx(err)
            } else if violates_column(&err, "physical_path") {
                UploadError::PathTaken(new.physical_path.clone())
            } else {
                UploadError::DuplicateName(new.logical_name.clone())
            }
        })
    }

    /// Persist the acceptance set of an object.
    pub async fn save_acceptance(&self, id: i64, set: &AcceptanceSet) -> UploadResult<()> {
        sqlx::query("UPDATE upload_objects SET accepted_chunks = ?, updated_at = ? WHERE id = ?")
            .bind(Json(set))
            .bind(Utc::now())
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Move the row from `expected` to `next` only if it is still in
    /// `expected`. Returns whether this call made the transition.
    pub async fn compare_and_set_status(
        &self,
        id: i64,
        expected: UploadStatus,
        next: UploadStatus,
    ) -> UploadResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_objects SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(next)
        .bind(Utc::now())
        .bind(id)
        .bind(expected)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn soft_delete(&self, id: i64) -> UploadResult<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE upload_objects SET status = 'deleted', deleted_at = ?, updated_at = ?
             WHERE id = ? AND status <> 'deleted'",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Change the name and/or parent of a row. Never touches
    /// `physical_path`.
    pub async fn relocate(
        &self,
        id: i64,
        logical_name: &str,
        parent_id: Option<i64>,
    ) -> UploadResult<()> {
        sqlx::query(
            "UPDATE upload_objects SET logical_name = ?, parent_id = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(logical_name)
        .bind(parent_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                UploadError::DuplicateName(logical_name.to_string())
            } else {
                UploadError::Sqlx(err)
            }
        })?;
        Ok(())
    }

    /// One page of the non-deleted children of `parent_id` (root when
    /// `None`), folders first, and the number of matching rows.
    pub async fn list_children(
        &self,
        owner_id: i64,
        parent_id: Option<i64>,
        req: &ListChildrenRequest,
    ) -> UploadResult<(Vec<UploadObject>, i64)> {
        let pattern = req.keyword_pattern();
        let filter = "owner_id = ? AND parent_id IS ? AND status <> 'deleted'
               AND (? IS NULL OR logical_name LIKE ? ESCAPE '\\')";

        let total = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM upload_objects WHERE {filter}"
        ))
        .bind(owner_id)
        .bind(parent_id)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_one(&*self.db)
        .await?;

        // Column and direction come from closed enums, never from input text.
        let order = req.sort_order().keyword();
        let rows = sqlx::query_as::<_, UploadObject>(&format!(
            "SELECT {COLUMNS} FROM upload_objects WHERE {filter}
             ORDER BY is_container DESC, {column} {order}, id {order}
             LIMIT ? OFFSET ?",
            column = req.sort_by().column(),
        ))
        .bind(owner_id)
        .bind(parent_id)
        .bind(&pattern)
        .bind(&pattern)
        .bind(i64::from(req.page_size()))
        .bind(req.offset())
        .fetch_all(&*self.db)
        .await?;
        Ok((rows, total))
    }

    /// Mark every object still in `merging` as `failed`. Only valid while
    /// no assembly is running, i.e. at startup. Returns how many rows moved.
    pub async fn fail_stale_merges(&self) -> UploadResult<u64> {
        let result = sqlx::query(
            "UPDATE upload_objects SET status = 'failed', updated_at = ? WHERE status = 'merging'",
        )
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected())
    }
}

fn not_found_or(err: sqlx::Error, id: i64) -> UploadError {
    match err {
        sqlx::Error::RowNotFound => UploadError::ObjectNotFound(id),
        other => UploadError::Sqlx(other),
    }
}

/// Whether a constraint error names `column`.
fn violates_column(err: &sqlx::Error, column: &str) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().contains(column)
    )
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

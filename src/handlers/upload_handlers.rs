//! HTTP handlers for uploads, folders and entry management.
//!
//! Every handler resolves the caller from the `x-owner-id` header set by the
//! upstream gateway and delegates to `UploadService`.

use crate::{
    errors::AppError,
    models::{
        listing::{ChildrenPage, ListChildrenRequest},
        upload_object::UploadObject,
    },
    services::{
        merge_engine::MergeOutcome,
        tracker::Progress,
        upload_service::{AdmitOutcome, CreateObjectRequest, UploadService},
    },
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};

const OWNER_HEADER: &str = "x-owner-id";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFolderReq {
    pub folder_name: String,
    pub parent_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadReq {
    pub chunk_index: i64,
    /// Base64-encoded chunk payload.
    pub chunk_data: String,
}

/// `PATCH /objects/{id}` body. `parentId: null` moves to the root; an
/// absent `parentId` leaves the parent alone.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateObjectReq {
    pub new_name: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub parent_id: Option<Option<i64>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResp {
    pub object_id: i64,
    pub chunk_index: i64,
    pub outcome: AdmitOutcome,
    pub progress: Progress,
}

#[derive(Debug, Serialize)]
pub struct AssembleResp {
    pub object: UploadObject,
    pub outcome: MergeOutcome,
}

/// POST `/objects` — register a new upload.
pub async fn create_object(
    State(service): State<UploadService>,
    headers: HeaderMap,
    Json(req): Json<CreateObjectRequest>,
) -> Result<impl IntoResponse, AppError> {
    let owner_id = owner_id(&headers)?;
    let object = service.create_object(owner_id, req).await?;
    Ok((StatusCode::CREATED, Json(object)))
}

/// POST `/folders` — create a folder entry.
pub async fn create_folder(
    State(service): State<UploadService>,
    headers: HeaderMap,
    Json(req): Json<CreateFolderReq>,
) -> Result<impl IntoResponse, AppError> {
    let owner_id = owner_id(&headers)?;
    let folder = service
        .create_folder(owner_id, req.folder_name, req.parent_id)
        .await?;
    Ok((StatusCode::CREATED, Json(folder)))
}

/// GET `/objects?parentId=&keyword=&page=&pageSize=&sortBy=&sortOrder=` — one
/// page of a folder's entries, root when `parentId` is omitted.
pub async fn list_objects(
    State(service): State<UploadService>,
    headers: HeaderMap,
    Query(q): Query<ListChildrenRequest>,
) -> Result<Json<ChildrenPage>, AppError> {
    let owner_id = owner_id(&headers)?;
    let page = service.list_children(owner_id, &q).await?;
    Ok(Json(page))
}

/// POST `/objects/{id}/chunks` — store one chunk.
pub async fn upload_chunk(
    State(service): State<UploadService>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<ChunkUploadReq>,
) -> Result<Json<ChunkUploadResp>, AppError> {
    let owner_id = owner_id(&headers)?;
    service.object(owner_id, id).await?;
    let bytes = decode_chunk(&req.chunk_data)?;

    let outcome = service.admit_chunk(id, req.chunk_index, bytes).await?;
    let progress = service.progress(id).await?;
    Ok(Json(ChunkUploadResp {
        object_id: id,
        chunk_index: req.chunk_index,
        outcome,
        progress,
    }))
}

/// GET `/objects/{id}/progress`
pub async fn get_progress(
    State(service): State<UploadService>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Progress>, AppError> {
    let owner_id = owner_id(&headers)?;
    service.object(owner_id, id).await?;
    Ok(Json(service.progress(id).await?))
}

/// POST `/objects/{id}/assemble` — re-run assembly.
pub async fn assemble_object(
    State(service): State<UploadService>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<AssembleResp>, AppError> {
    let owner_id = owner_id(&headers)?;
    service.object(owner_id, id).await?;
    let (object, outcome) = service.retry_assembly(id).await?;
    Ok(Json(AssembleResp { object, outcome }))
}

/// PATCH `/objects/{id}` — rename and/or move.
pub async fn update_object(
    State(service): State<UploadService>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<UpdateObjectReq>,
) -> Result<Json<UploadObject>, AppError> {
    let owner_id = owner_id(&headers)?;
    if req.new_name.is_none() && req.parent_id.is_none() {
        return Err(AppError::bad_request(
            "expected `newName` and/or `parentId`",
        ));
    }

    let mut object = service.object(owner_id, id).await?;
    if let Some(name) = req.new_name {
        object = service.rename_object(owner_id, id, name).await?;
    }
    if let Some(parent_id) = req.parent_id {
        object = service.move_object(owner_id, id, parent_id).await?;
    }
    Ok(Json(object))
}

/// DELETE `/objects/{id}` — soft delete.
pub async fn delete_object(
    State(service): State<UploadService>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let owner_id = owner_id(&headers)?;
    service.delete_object(owner_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET `/backends/remote/check`
pub async fn check_remote(State(service): State<UploadService>) -> impl IntoResponse {
    let report = service.check_remote().await;
    let status = if report.ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

fn owner_id(headers: &HeaderMap) -> Result<i64, AppError> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or_else(|| AppError::bad_request(format!("missing or invalid `{OWNER_HEADER}` header")))
}

fn decode_chunk(data: &str) -> Result<Bytes, AppError> {
    general_purpose::STANDARD
        .decode(data)
        .map(Bytes::from)
        .map_err(|err| AppError::bad_request(format!("chunkData is not valid base64: {err}")))
}

fn present<'de, D>(deserializer: D) -> Result<Option<Option<i64>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<i64>::deserialize(deserializer).map(Some)
}

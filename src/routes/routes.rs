//! Defines routes for all upload operations.
//!
//! ## Structure
//! - **Entries**
//!   - `POST   /objects`                — register a chunked upload
//!   - `GET    /objects?parentId=&…`    — one page of a folder (keyword, paging, sort)
//!   - `PATCH  /objects/{id}`           — rename and/or move
//!   - `DELETE /objects/{id}`           — soft delete
//!   - `POST   /folders`                — create a folder
//!
//! - **Upload session**
//!   - `POST   /objects/{id}/chunks`    — upload one base64 chunk
//!   - `GET    /objects/{id}/progress`  — progress from accepted chunks
//!   - `POST   /objects/{id}/assemble`  — re-run assembly (failed or completed objects)
//!
//! - **Operations**
//!   - `GET    /backends/remote/check`  — remote backend connectivity
//!   - `GET    /healthz`, `GET /readyz`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{
            assemble_object, check_remote, create_folder, create_object, delete_object,
            get_progress, list_objects, update_object, upload_chunk,
        },
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    routing::{get, patch, post},
};

/// Build and return the router for all upload routes.
///
/// The router carries shared state (`UploadService`) to all handlers.
pub fn routes() -> Router<UploadService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/backends/remote/check", get(check_remote))
        // Entry routes
        .route("/objects", post(create_object).get(list_objects))
        .route("/objects/{id}", patch(update_object).delete(delete_object))
        .route("/folders", post(create_folder))
        // Upload session routes
        .route("/objects/{id}/chunks", post(upload_chunk))
        .route("/objects/{id}/progress", get(get_progress))
        .route("/objects/{id}/assemble", post(assemble_object))
}

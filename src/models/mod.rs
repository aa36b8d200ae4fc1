//! Core data models for the chunked-upload service.
//!
//! `UploadObject` maps to the `upload_objects` table via `sqlx::FromRow` and
//! serializes as JSON via `serde`. `AcceptanceSet` is the chunk-index set
//! stored inside that row. `listing` holds the paged folder-listing query.

pub mod acceptance;
pub mod listing;
pub mod upload_object;

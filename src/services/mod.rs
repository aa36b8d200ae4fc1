//! Upload engine services.
//!
//! `upload_service` is the entry point; the other modules are its parts and
//! are only used through it outside of tests.

pub mod error;
pub mod merge_engine;
pub mod metadata_repo;
pub mod object_locks;
pub mod path_namer;
pub mod tracker;
pub mod upload_service;

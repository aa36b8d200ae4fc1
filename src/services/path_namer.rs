//! Deterministic physical paths for objects and their staging areas.
//!
//! All functions are pure: given the stored fields of an object they always
//! produce the same key, so the merge step can recompute paths without the
//! original request.

use chrono::{DateTime, Utc};

const MAX_LOGICAL_NAME_LEN: usize = 255;

/// Top-level directory holding every assembled object.
pub const FILES_ROOT: &str = "files";
/// Top-level directory holding every staging area.
pub const CHUNKS_ROOT: &str = "chunks";

/// Two-level shard directories for an object.
///
/// Uses MD5 of `{owner}_{name}_{unix_micros}` and returns the first two
/// bytes as lowercase hex (`00`–`ff`). Two uploads of the same name land in
/// the same shard only when their digests agree on those two bytes; the
/// metadata store rejects that case and the caller picks a new timestamp.
fn object_shards(owner_id: i64, logical_name: &str, created_at: DateTime<Utc>) -> (String, String) {
    let digest = md5::compute(format!(
        "{}_{}_{}",
        owner_id,
        logical_name,
        created_at.timestamp_micros()
    ));
    (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
}

/// Backend-relative key of the assembled object:
/// `files/{owner}/{shard}/{shard}/{logical_name}`.
pub fn final_path(owner_id: i64, logical_name: &str, created_at: DateTime<Utc>) -> String {
    let (shard_a, shard_b) = object_shards(owner_id, logical_name, created_at);
    format!("{FILES_ROOT}/{owner_id}/{shard_a}/{shard_b}/{logical_name}")
}

/// Backend-relative staging directory for an object's chunks.
pub fn staging_dir(object_id: i64) -> String {
    format!("{CHUNKS_ROOT}/{object_id}")
}

/// File name of one staged chunk inside the staging directory.
pub fn chunk_name(index: u32) -> String {
    format!("chunk_{index}")
}

/// Check that a logical name can be used as the last path component.
///
/// Rejects empty or over-long names, separators, `.`/`..` and control
/// characters. Returns the reason on failure.
pub fn validate_logical_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name must not be empty");
    }
    if name.len() > MAX_LOGICAL_NAME_LEN {
        return Err("name must be at most 255 bytes");
    }
    if name == "." || name == ".." {
        return Err("name must not be `.` or `..`");
    }
    if name.contains('/') || name.contains('\\') {
        return Err("name must not contain path separators");
    }
    if name.chars().any(|c| c.is_control()) {
        return Err("name must not contain control characters");
    }
    Ok(())
}

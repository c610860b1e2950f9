use crate::backup_error::BackupError;
use chrono::NaiveDateTime;
use std::path::Path;


/// Format of the timestamp prefix of every snapshot name.
///
/// Fixed-width zero-padded fields, so lexical order equals chronological
/// order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

const TIMESTAMP_LEN: usize = 19;

/// Split a snapshot name into its timestamp and retention name.
///
/// * `name` - snapshot name of the form `YYYY-MM-DD-HH-MM-SS[_<retention>]`
///
pub fn parse_snapshot_name(name: &str) -> Result<(NaiveDateTime, &str), BackupError> {
    let prefix = name.get(..TIMESTAMP_LEN).ok_or_else(|| {
        BackupError::SnapshotNotFound(format!("\"{}\" is not a valid snapshot name", name))
    })?;

    let timestamp = NaiveDateTime::parse_from_str(prefix, TIMESTAMP_FORMAT).map_err(|_| {
        BackupError::SnapshotNotFound(format!(
            "\"{}\" does not start with a valid timestamp",
            name
        ))
    })?;

    Ok((timestamp, extract_retention_name(name)))
}

/// Extract the retention name from a snapshot name.
///
/// A snapshot without a suffix belongs to the unnamed retention class `""`.
pub fn extract_retention_name(name: &str) -> &str {
    match name.split_once('_') {
        Some((_, suffix)) => suffix,
        None => "",
    }
}

/// Check if a subpath is included in another path.
///
/// The subpath has to match a contiguous run of components; an absolute
/// subpath can only match at the start of the path.
///
/// * `path` - path to check
/// * `sub_path` - subpath that should be included in path
///
pub fn contains_path(path: &Path, sub_path: &Path) -> bool {
    let parts: Vec<_> = path.components().collect();
    let sub_parts: Vec<_> = sub_path.components().collect();

    if sub_parts.is_empty() {
        return false;
    }

    parts
        .windows(sub_parts.len())
        .any(|window| window == sub_parts.as_slice())
}

//! Manual counter backup file.
//!
//! The file holds the counter value as a pretty-printed JSON number. It is
//! written and read only on explicit admin request and is independent of the
//! engine snapshots.

use std::io::ErrorKind;
use std::path::Path;

use crate::error::RaftError;

/// Write the counter value to `path`, creating parent directories.
pub fn write_backup(path: &Path, counter: u64) -> Result<(), RaftError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| RaftError::Backup(e.to_string()))?;
    }
    let body = serde_json::to_string_pretty(&counter)?;
    std::fs::write(path, body).map_err(|e| RaftError::Backup(e.to_string()))
}

/// Read the counter value back from `path`.
pub fn read_backup(path: &Path) -> Result<u64, RaftError> {
    let body = match std::fs::read(path) {
        Ok(body) => body,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(RaftError::BackupNotFound(path.to_path_buf()))
        }
        Err(e) => return Err(RaftError::Backup(e.to_string())),
    };
    serde_json::from_slice(&body).map_err(|e| RaftError::Backup(format!("corrupt backup: {e}")))
}

use std::fs::create_dir_all;
use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;

use tracing::error;

use crate::Result;
use crate::StorageError;

/// Creates the directory that will hold `path`.
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.exists() {
        return Ok(());
    }
    create_dir_all(parent).map_err(|e| {
        error!("Failed to create directory {:?}: {:?}", parent, e);
        StorageError::PathError {
            path: parent.to_path_buf(),
            source: e,
        }
        .into()
    })
}

/// Opens the node's log file, creating it and its directory if needed.
pub fn open_file_for_append(path: impl AsRef<Path>) -> Result<File> {
    let path = path.as_ref();
    ensure_parent_dir(path)?;
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(|e| StorageError::IoError(e).into())
}

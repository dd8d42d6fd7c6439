//! Filesystem helpers shared by the persistent cache and the freeze store.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::StoreError;

/// Suffix of in-progress writes. Files with it are never read back.
pub(crate) const TEMP_SUFFIX: &str = "tmp";

/// Write `bytes` to `path` so readers observe either the old file or the
/// complete new one: write a uniquely named sibling, sync it, rename over.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let temp_path = temp_sibling(path);
    let result = File::create(&temp_path)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&temp_path, path));

    if let Err(source) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(StoreError::io(path, source));
    }
    Ok(())
}

/// A unique in-progress name next to `path`, in the same directory so the
/// final rename stays on one filesystem.
pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("entry");
    path.with_file_name(format!("{file_name}.{}.{TEMP_SUFFIX}", Uuid::new_v4()))
}

pub(crate) fn is_temp_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(TEMP_SUFFIX)
}

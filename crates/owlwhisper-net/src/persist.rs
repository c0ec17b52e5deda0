//! Shared write-temp-then-rename helpers used by every persisted store.

use std::io::Write;
use std::path::Path;

use crate::error::StorageError;

/// Writes `bytes` to `path` atomically: write to a sibling temp file, set its
/// mode, `fsync`, then rename over the target. The temp file lives in the
/// same directory as `path` so the rename never crosses filesystems.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> Result<(), StorageError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|source| StorageError::Io {
        path: dir.to_path_buf(),
        source
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|source| StorageError::Io {
        path: dir.to_path_buf(),
        source
    })?;
    tmp.write_all(bytes).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source
    })?;
    tmp.flush().map_err(|source| StorageError::Io { path: path.to_path_buf(), source })?;

    set_mode(tmp.path(), mode).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source
    })?;

    tmp.persist(path)
        .map_err(|e| StorageError::Io { path: path.to_path_buf(), source: e.error })?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/file.bin");
        write_atomic(&path, b"hello", 0o600).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }
}

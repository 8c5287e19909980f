use crate::config::types::{EnvError, Result};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path};

fn remove_entry(path: &Path, root_dev: u64) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(EnvError::io_at(e, format!("lstat {}", path.display()))),
    };

    // Symlinks are unlinked, never followed
    if !meta.file_type().is_dir() {
        return fs::remove_file(path)
            .map_err(|e| EnvError::io_at(e, format!("unlink {}", path.display())));
    }

    if meta.dev() != root_dev {
        return Err(EnvError::Filesystem(format!(
            "Refusing to cross filesystem boundary at directory {}",
            path.display()
        )));
    }

    let entries =
        fs::read_dir(path).map_err(|e| EnvError::io_at(e, format!("readdir {}", path.display())))?;
    for entry in entries {
        let entry = entry.map_err(|e| EnvError::io_at(e, path.display()))?;
        remove_entry(&entry.path(), root_dev)?;
    }

    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EnvError::io_at(e, format!("rmdir {}", path.display()))),
    }
}

/// Remove a tree without following symlinks or leaving the starting filesystem.
/// Missing paths are not an error, so this is safe to retry.
pub fn remove_tree_secure(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(EnvError::io_at(e, format!("lstat {}", path.display()))),
    };
    if path.parent().is_none() {
        return Err(EnvError::Filesystem(format!(
            "Cannot remove path without parent: {}",
            path.display()
        )));
    }
    remove_entry(path, meta.dev())
}

/// Guard against removing anything outside the data root
pub fn ensure_within(root: &Path, path: &Path) -> Result<()> {
    let escapes = path
        .components()
        .any(|c| matches!(c, Component::ParentDir));
    if escapes || !path.starts_with(root) || path == root {
        return Err(EnvError::Filesystem(format!(
            "Refusing to remove {} (not inside {})",
            path.display(),
            root.display()
        )));
    }
    Ok(())
}

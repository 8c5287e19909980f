/// Deriving environments from the foundation by copying its repo tree wholesale
use crate::config::types::{BuildStep, EnvError, MarkerRecord, Result, FOUNDATION};
use crate::env::layout::Environment;
use crate::safety::process::ProcessProbe;
use crate::state::markers::write_atomic;
use log::info;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Copy of the foundation's completion record taken at derive time
const ORIGIN_FILE: &str = "origin";

/// Recursively copy `src` into `dst`, preserving symlinks and permissions.
/// Entries named in `exclude` are skipped at every depth.
/// Returns the number of entries copied.
pub fn copy_tree(src: &Path, dst: &Path, exclude: &[&str]) -> Result<usize> {
    fs::create_dir_all(dst).map_err(|e| EnvError::io_at(e, dst.display()))?;
    let mut copied = 0;

    for entry in fs::read_dir(src).map_err(|e| EnvError::io_at(e, src.display()))? {
        let entry = entry.map_err(|e| EnvError::io_at(e, src.display()))?;
        let name = entry.file_name();
        if exclude.iter().any(|x| name == *x) {
            continue;
        }

        let from = entry.path();
        let to = dst.join(&name);
        let file_type = entry
            .file_type()
            .map_err(|e| EnvError::io_at(e, from.display()))?;

        if file_type.is_symlink() {
            let target = fs::read_link(&from).map_err(|e| EnvError::io_at(e, from.display()))?;
            std::os::unix::fs::symlink(&target, &to)
                .map_err(|e| EnvError::io_at(e, to.display()))?;
            copied += 1;
        } else if file_type.is_dir() {
            copied += copy_tree(&from, &to, exclude)?;
            let perms = fs::metadata(&from)
                .map_err(|e| EnvError::io_at(e, from.display()))?
                .permissions();
            fs::set_permissions(&to, perms).map_err(|e| EnvError::io_at(e, to.display()))?;
        } else {
            fs::copy(&from, &to).map_err(|e| {
                EnvError::io_at(e, format!("copying {} to {}", from.display(), to.display()))
            })?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Replace `target`'s repo with a fresh copy of the foundation's and discard its markers.
///
/// Lock records are kept; the caller holds the lock guarding this rebuild.
pub fn derive_from_foundation(
    foundation: &Environment,
    target: &Environment,
    probe: &dyn ProcessProbe,
) -> Result<usize> {
    let source = foundation.repo();
    if !source.is_dir() {
        return Err(EnvError::build(
            BuildStep::Derive,
            format!("foundation repo {} does not exist", source.display()),
        ));
    }

    target.create_dirs()?;
    target.remove_repo()?;
    let cleared = target.markers(probe).clear_all()?;

    let copied = copy_tree(&source, &target.repo(), &[])
        .map_err(|e| EnvError::build(BuildStep::Derive, e.to_string()))?;

    let origin_path = target.state_dir().join(ORIGIN_FILE);
    match foundation.markers(probe).complete_record(FOUNDATION)? {
        Some(record) => {
            let json = serde_json::to_string(&record)
                .map_err(|e| EnvError::Filesystem(format!("encoding origin: {}", e)))?;
            write_atomic(&origin_path, json.as_bytes())?;
        }
        None => match fs::remove_file(&origin_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(EnvError::io_at(e, origin_path.display())),
        },
    }
    info!(
        "Derived {} environment '{}' from foundation ({} entries, {} stale markers dropped)",
        target.kind(),
        target.name(),
        copied,
        cleared
    );
    Ok(copied)
}

/// Foundation build `env` was derived from, if recorded
pub fn origin(env: &Environment) -> Result<Option<MarkerRecord>> {
    let path = env.state_dir().join(ORIGIN_FILE);
    match fs::read_to_string(&path) {
        Ok(content) => Ok(serde_json::from_str(content.trim()).ok()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(EnvError::io_at(e, path.display())),
    }
}

/// Whether `target` was derived from the foundation build that is current now
pub fn derived_from_current(
    foundation: &Environment,
    target: &Environment,
    probe: &dyn ProcessProbe,
) -> Result<bool> {
    let current = foundation.markers(probe).complete_record(FOUNDATION)?;
    Ok(current.is_some() && origin(target)? == current)
}

/// Foundation generation: a content fingerprint of the framework tree the foundation
/// was built from. A foundation whose recorded generation no longer matches is stale.
use crate::config::types::{EnvError, Result};
use crate::state::markers::write_atomic;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

const GENERATION_FILE: &str = "generation";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub digest: String,
    pub branch: String,
}

fn hash_tree(hasher: &mut Sha256, base: &Path, dir: &Path) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| EnvError::io_at(e, dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| EnvError::io_at(e, dir.display()))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        if entry.file_name() == ".git" {
            continue;
        }
        let path = entry.path();
        let rel = path.strip_prefix(base).unwrap_or(&path);
        let file_type = entry
            .file_type()
            .map_err(|e| EnvError::io_at(e, path.display()))?;

        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        if file_type.is_symlink() {
            let target = fs::read_link(&path).map_err(|e| EnvError::io_at(e, path.display()))?;
            hasher.update(b"l:");
            hasher.update(target.to_string_lossy().as_bytes());
        } else if file_type.is_dir() {
            hasher.update(b"d:");
            hash_tree(hasher, base, &path)?;
        } else {
            let bytes = fs::read(&path).map_err(|e| EnvError::io_at(e, path.display()))?;
            hasher.update(b"f:");
            hasher.update(&bytes);
        }
        hasher.update([0u8]);
    }
    Ok(())
}

impl Generation {
    /// Fingerprint the framework working tree, `.git` excluded
    pub fn compute(framework: &Path, branch: &str) -> Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update(branch.as_bytes());
        hasher.update([0u8]);
        hash_tree(&mut hasher, framework, framework)?;
        Ok(Self {
            digest: format!("{:x}", hasher.finalize()),
            branch: branch.to_string(),
        })
    }

    pub fn load(state_dir: &Path) -> Result<Option<Self>> {
        let path = state_dir.join(GENERATION_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(content.trim()).ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EnvError::io_at(e, path.display())),
        }
    }

    pub fn store(&self, state_dir: &Path) -> Result<()> {
        let json = serde_json::to_string(self)
            .map_err(|e| EnvError::Filesystem(format!("encoding generation: {}", e)))?;
        write_atomic(&state_dir.join(GENERATION_FILE), json.as_bytes())
    }

    pub fn short(&self) -> &str {
        &self.digest[..self.digest.len().min(12)]
    }
}

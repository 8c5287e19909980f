/// Environment addressing: `<root>/<name>/{repo/, <state dir>/}`
///
/// Every path under an environment is derived here; nothing else concatenates
/// environment paths by hand.
use crate::config::types::{EnvError, EnvKind, Result};
use crate::safety::lock_manager::LockManager;
use crate::safety::process::ProcessProbe;
use crate::safety::safe_cleanup;
use crate::state::markers::{validate_unit, MarkerStore};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const REPO_DIR: &str = "repo";

/// A named workspace on disk. State is never stored here; it is derived from markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    name: String,
    kind: EnvKind,
    root: PathBuf,
}

impl Environment {
    pub fn new(data_root: &Path, name: &str, kind: EnvKind) -> Result<Self> {
        validate_unit(name)?;
        Ok(Self {
            name: name.to_string(),
            kind,
            root: data_root.join(name),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EnvKind {
        self.kind
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The project tree suites operate on
    pub fn repo(&self) -> PathBuf {
        self.root.join(REPO_DIR)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(self.kind.state_dir_name())
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// Lazily create the root and state directory
    pub fn create_dirs(&self) -> Result<()> {
        let state_dir = self.state_dir();
        fs::create_dir_all(&state_dir).map_err(|e| {
            EnvError::io_at(
                e,
                format!("creating environment directory {}", state_dir.display()),
            )
        })
    }

    /// Remove the repo tree only; markers and lock records stay in place
    pub fn remove_repo(&self) -> Result<()> {
        safe_cleanup::remove_tree_secure(&self.repo())
    }

    pub fn markers(&self, probe: &dyn ProcessProbe) -> MarkerStore {
        MarkerStore::new(self.state_dir()).with_pid(probe.current_pid())
    }

    pub fn locks(&self, probe: Arc<dyn ProcessProbe>) -> LockManager {
        LockManager::new(self.state_dir(), probe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let root = Path::new("/data");
        let foundation = Environment::new(root, "foundation", EnvKind::Foundation).unwrap();
        assert_eq!(foundation.repo(), PathBuf::from("/data/foundation/repo"));
        assert_eq!(foundation.state_dir(), PathBuf::from("/data/foundation/.state"));

        let doc = Environment::new(root, "doc", EnvKind::Independent).unwrap();
        assert_eq!(doc.state_dir(), PathBuf::from("/data/doc/.bats-state"));
    }

    #[test]
    fn test_rejects_path_like_names() {
        assert!(Environment::new(Path::new("/data"), "../etc", EnvKind::Independent).is_err());
    }

    #[test]
    fn test_create_and_remove_repo() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::new(dir.path(), "sequential", EnvKind::Sequential).unwrap();
        assert!(!env.exists());

        env.create_dirs().unwrap();
        fs::create_dir_all(env.repo().join("src")).unwrap();
        fs::write(env.state_dir().join(".start-00-validate"), b"").unwrap();
        assert!(env.exists());

        env.remove_repo().unwrap();
        assert!(!env.repo().exists());
        assert!(env.state_dir().join(".start-00-validate").exists());
    }
}

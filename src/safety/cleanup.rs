/// Global clean: remove every environment under the data root
///
/// Idempotent and safe to retry after a partial failure. Environments with a live lock
/// holder are skipped, never removed out from under a running suite. Evidence of failed
/// runs is only ever deleted here.
use crate::config::types::{EnvError, EnvKind, Result, FOUNDATION, SEQUENTIAL};
use crate::observability::events::{EventKind, EventLog};
use crate::safety::lock_manager::{LockManager, LockState};
use crate::safety::process::ProcessProbe;
use crate::safety::safe_cleanup::{ensure_within, remove_tree_secure};
use crate::state::markers::MarkerStore;
use log::{debug, info, warn};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Outcome of a clean pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanReport {
    pub removed: Vec<String>,
    /// Environment, unit and pid of live lock holders that blocked removal
    pub busy: Vec<(String, String, u32)>,
}

impl CleanReport {
    pub fn is_complete(&self) -> bool {
        self.busy.is_empty()
    }

    /// `Busy` for the first blocked environment, if any
    pub fn into_result(self) -> Result<Self> {
        match self.busy.first() {
            Some((env, unit, pid)) => Err(EnvError::Busy {
                unit: format!("{}/{}", env, unit),
                owner_pid: Some(*pid),
            }),
            None => Ok(self),
        }
    }
}

/// Independent environments first, foundation last
fn removal_rank(name: &str) -> u8 {
    match name {
        FOUNDATION => 2,
        SEQUENTIAL => 1,
        _ => 0,
    }
}

fn state_dirs(env_root: &Path) -> Vec<PathBuf> {
    [EnvKind::Foundation, EnvKind::Independent]
        .iter()
        .map(|k| env_root.join(k.state_dir_name()))
        .filter(|p| p.is_dir())
        .collect()
}

/// First live lock holder inside an environment, if any
fn live_holder(
    env_root: &Path,
    probe: &Arc<dyn ProcessProbe>,
) -> Result<Option<(String, u32)>> {
    for state_dir in state_dirs(env_root) {
        let locks = LockManager::new(state_dir.clone(), Arc::clone(probe));
        for unit in MarkerStore::new(state_dir).units()? {
            if let LockState::Held { owner, alive: true } = locks.inspect(&unit)? {
                return Ok(Some((unit, owner.pid)));
            }
        }
    }
    Ok(None)
}

/// Remove every environment directory under `root`
pub fn clean_root(
    root: &Path,
    probe: &Arc<dyn ProcessProbe>,
    events: &EventLog,
) -> Result<CleanReport> {
    let mut report = CleanReport::default();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("Nothing to clean under {}", root.display());
            return Ok(report);
        }
        Err(e) => return Err(EnvError::io_at(e, root.display())),
    };

    let mut envs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| EnvError::io_at(e, root.display()))?;
        let file_type = entry
            .file_type()
            .map_err(|e| EnvError::io_at(e, entry.path().display()))?;
        // The event log and other stray files stay
        if file_type.is_dir() {
            envs.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    envs.sort_by_key(|name| (removal_rank(name), name.clone()));

    info!("Cleaning {} environments under {}", envs.len(), root.display());
    let mut failures = Vec::new();
    for name in envs {
        let path = root.join(&name);
        ensure_within(root, &path)?;

        if let Some((unit, pid)) = live_holder(&path, probe)? {
            warn!(
                "Skipping environment {}: unit {} is held by live pid {}",
                name, unit, pid
            );
            events.emit(
                EventKind::LockBusy,
                Some(&name),
                Some(&unit),
                format!("clean skipped, held by pid {}", pid),
            );
            report.busy.push((name, unit, pid));
            continue;
        }

        match remove_tree_secure(&path) {
            Ok(()) => {
                events.emit(EventKind::Cleaned, Some(&name), None, "removed");
                report.removed.push(name);
            }
            Err(e) => {
                warn!("Failed to remove environment {}: {}", name, e);
                failures.push(format!("{}: {}", name, e));
            }
        }
    }

    if !failures.is_empty() {
        return Err(EnvError::Filesystem(format!(
            "Cleanup failed for {} environments: {}",
            failures.len(),
            failures.join("; ")
        )));
    }
    Ok(report)
}

/// Marker store: `.start-<unit>` / `.complete-<unit>` facts inside an environment's state dir
///
/// The store only records and reports; ordering between start and complete is the
/// caller's responsibility.
use crate::config::types::{EnvError, MarkerRecord, MarkerStatus, Result};
use chrono::Utc;
use log::debug;
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub(crate) const START_PREFIX: &str = ".start-";
pub(crate) const COMPLETE_PREFIX: &str = ".complete-";
pub(crate) const LOCK_PREFIX: &str = ".lock-";

/// Reject names that cannot be embedded safely in a marker file name
pub fn validate_unit(unit: &str) -> Result<()> {
    let valid = !unit.is_empty()
        && !unit.starts_with('.')
        && unit
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(EnvError::InvalidUnit(unit.to_string()))
    }
}

/// Write via a temp file + rename so readers never see a torn marker
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".tmp{}-{}", file_name, std::process::id()));
    fs::write(&tmp, contents).map_err(|e| EnvError::io_at(e, tmp.display()))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        EnvError::io_at(e, path.display())
    })
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(EnvError::io_at(e, path.display())),
    }
}

#[derive(Debug, Clone)]
pub struct MarkerStore {
    state_dir: PathBuf,
    pid: u32,
}

impl MarkerStore {
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            state_dir,
            pid: std::process::id(),
        }
    }

    /// Override the pid stamped into records
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir).map_err(|e| {
            EnvError::io_at(
                e,
                format!("creating state directory {}", self.state_dir.display()),
            )
        })
    }

    fn start_path(&self, unit: &str) -> PathBuf {
        self.state_dir.join(format!("{}{}", START_PREFIX, unit))
    }

    fn complete_path(&self, unit: &str) -> PathBuf {
        self.state_dir.join(format!("{}{}", COMPLETE_PREFIX, unit))
    }

    fn write_record(&self, path: &Path, unit: &str) -> Result<()> {
        let record = MarkerRecord {
            unit: unit.to_string(),
            pid: self.pid,
            at: Utc::now(),
        };
        let json = serde_json::to_string(&record)
            .map_err(|e| EnvError::Filesystem(format!("encoding marker: {}", e)))?;
        write_atomic(path, json.as_bytes())
    }

    /// Record that `unit` began. Any earlier completion is withdrawn first so a crash
    /// during a re-run reads as polluted.
    pub fn record_start(&self, unit: &str) -> Result<()> {
        validate_unit(unit)?;
        self.ensure_dir()?;
        remove_if_present(&self.complete_path(unit))?;
        self.write_record(&self.start_path(unit), unit)?;
        debug!("Marked {} started in {}", unit, self.state_dir.display());
        Ok(())
    }

    pub fn record_complete(&self, unit: &str) -> Result<()> {
        validate_unit(unit)?;
        self.ensure_dir()?;
        self.write_record(&self.complete_path(unit), unit)?;
        debug!("Marked {} complete in {}", unit, self.state_dir.display());
        Ok(())
    }

    pub fn clear(&self, unit: &str) -> Result<()> {
        validate_unit(unit)?;
        remove_if_present(&self.complete_path(unit))?;
        remove_if_present(&self.start_path(unit))?;
        Ok(())
    }

    /// Drop every start/complete marker; lock records are left alone
    pub fn clear_all(&self) -> Result<usize> {
        let mut removed = 0;
        for unit in self.marked_units()? {
            if remove_if_present(&self.complete_path(&unit))? {
                removed += 1;
            }
            if remove_if_present(&self.start_path(&unit))? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn status(&self, unit: &str) -> Result<MarkerStatus> {
        validate_unit(unit)?;
        if self.complete_path(unit).exists() {
            Ok(MarkerStatus::Completed)
        } else if self.start_path(unit).exists() {
            Ok(MarkerStatus::Started)
        } else {
            Ok(MarkerStatus::Absent)
        }
    }

    /// Parsed start record, if present and readable
    pub fn start_record(&self, unit: &str) -> Result<Option<MarkerRecord>> {
        self.read_record(&self.start_path(unit))
    }

    pub fn complete_record(&self, unit: &str) -> Result<Option<MarkerRecord>> {
        self.read_record(&self.complete_path(unit))
    }

    fn read_record(&self, path: &Path) -> Result<Option<MarkerRecord>> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EnvError::io_at(e, path.display())),
        };
        // Markers written by other tooling may be empty; existence is what counts.
        Ok(serde_json::from_str(content.trim()).ok())
    }

    /// Units with a start or complete marker
    pub fn marked_units(&self) -> Result<Vec<String>> {
        self.scan_prefixes(&[START_PREFIX, COMPLETE_PREFIX])
    }

    /// Units with any marker or lock artifact
    pub fn units(&self) -> Result<Vec<String>> {
        self.scan_prefixes(&[START_PREFIX, COMPLETE_PREFIX, LOCK_PREFIX])
    }

    fn scan_prefixes(&self, prefixes: &[&str]) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.state_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EnvError::io_at(e, self.state_dir.display())),
        };

        let mut units = BTreeSet::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            for prefix in prefixes {
                if let Some(unit) = name.strip_prefix(prefix) {
                    if validate_unit(unit).is_ok() {
                        units.insert(unit.to_string());
                    }
                }
            }
        }
        Ok(units.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, MarkerStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path().join(".bats-state"));
        (dir, store)
    }

    #[test]
    fn test_lifecycle() {
        let (_dir, store) = store();
        assert_eq!(store.status("01-meta").unwrap(), MarkerStatus::Absent);

        store.record_start("01-meta").unwrap();
        assert_eq!(store.status("01-meta").unwrap(), MarkerStatus::Started);

        store.record_complete("01-meta").unwrap();
        assert_eq!(store.status("01-meta").unwrap(), MarkerStatus::Completed);

        store.clear("01-meta").unwrap();
        assert_eq!(store.status("01-meta").unwrap(), MarkerStatus::Absent);
    }

    #[test]
    fn test_restart_withdraws_completion() {
        let (_dir, store) = store();
        store.record_start("doc").unwrap();
        store.record_complete("doc").unwrap();
        store.record_start("doc").unwrap();
        assert_eq!(store.status("doc").unwrap(), MarkerStatus::Started);
    }

    #[test]
    fn test_records_carry_pid() {
        let (_dir, store) = store();
        let store = store.with_pid(4242);
        store.record_start("doc").unwrap();
        let record = store.start_record("doc").unwrap().unwrap();
        assert_eq!(record.pid, 4242);
        assert_eq!(record.unit, "doc");
    }

    #[test]
    fn test_empty_marker_still_counts() {
        let (_dir, store) = store();
        fs::create_dir_all(store.state_dir()).unwrap();
        fs::write(store.state_dir().join(".start-02-dist"), b"").unwrap();
        assert_eq!(store.status("02-dist").unwrap(), MarkerStatus::Started);
        assert!(store.start_record("02-dist").unwrap().is_none());
    }

    #[test]
    fn test_units_and_clear_all() {
        let (_dir, store) = store();
        store.record_start("00-validate").unwrap();
        store.record_complete("00-validate").unwrap();
        store.record_start("01-meta").unwrap();
        fs::create_dir_all(store.state_dir().join(".lock-02-dist")).unwrap();

        assert_eq!(store.marked_units().unwrap(), vec!["00-validate", "01-meta"]);
        assert_eq!(
            store.units().unwrap(),
            vec!["00-validate", "01-meta", "02-dist"]
        );

        assert_eq!(store.clear_all().unwrap(), 3);
        assert!(store.marked_units().unwrap().is_empty());
        assert!(store.state_dir().join(".lock-02-dist").exists());
    }

    #[test]
    fn test_missing_state_dir_lists_nothing() {
        let (_dir, store) = store();
        assert!(store.units().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_unsafe_unit_names() {
        let (_dir, store) = store();
        for bad in ["", "../escape", ".hidden", "a/b", "sp ace"] {
            assert!(
                matches!(store.record_start(bad), Err(EnvError::InvalidUnit(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}

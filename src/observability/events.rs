/// Lifecycle event log
///
/// Every rebuild, reclaim, pollution verdict and suite transition is appended as one
/// JSON line to `<root>/events.jsonl` and mirrored to the standard logger. Failing to
/// write an event never fails the operation that produced it.
use chrono::{DateTime, Utc};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const EVENT_LOG_FILE: &str = "events.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    FoundationReused,
    FoundationStale,
    FoundationBuilt,
    FoundationFailed,
    EnvironmentDerived,
    EnvironmentReset,
    PollutionDetected,
    LockReclaimed,
    LockBusy,
    SuiteStarted,
    SuiteCompleted,
    SuiteFailed,
    SuiteInvalidated,
    Cleaned,
}

impl EventKind {
    fn level(self) -> log::Level {
        match self {
            Self::FoundationFailed | Self::SuiteFailed => log::Level::Error,
            Self::FoundationStale
            | Self::EnvironmentReset
            | Self::PollutionDetected
            | Self::LockReclaimed
            | Self::LockBusy => log::Level::Warn,
            Self::FoundationReused | Self::SuiteInvalidated => log::Level::Debug,
            _ => log::Level::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub pid: u32,
    pub kind: EventKind,
    pub env: Option<String>,
    pub unit: Option<String>,
    pub details: String,
}

/// Cheap to clone; clones share the run id and file handle lock
#[derive(Debug, Clone)]
pub struct EventLog {
    path: Option<PathBuf>,
    run_id: String,
    write_lock: Arc<Mutex<()>>,
}

impl EventLog {
    /// Log under `root`; the file is created on first event
    pub fn new(root: &Path) -> Self {
        Self {
            path: Some(root.join(EVENT_LOG_FILE)),
            run_id: Uuid::new_v4().to_string(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Logger-only sink
    pub fn disabled() -> Self {
        Self {
            path: None,
            run_id: Uuid::new_v4().to_string(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn emit(
        &self,
        kind: EventKind,
        env: Option<&str>,
        unit: Option<&str>,
        details: impl Into<String>,
    ) {
        let event = LifecycleEvent {
            timestamp: Utc::now(),
            run_id: self.run_id.clone(),
            pid: std::process::id(),
            kind,
            env: env.map(str::to_string),
            unit: unit.map(str::to_string),
            details: details.into(),
        };

        let target = match (&event.env, &event.unit) {
            (Some(env), Some(unit)) => format!("{}/{}", env, unit),
            (Some(env), None) => env.clone(),
            _ => "-".to_string(),
        };
        log::log!(kind.level(), "{:?} [{}] {}", kind, target, event.details);

        if let Some(path) = &self.path {
            self.append(path, &event);
        }
    }

    fn append(&self, path: &Path, event: &LifecycleEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode lifecycle event: {}", e);
                return;
            }
        };
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Event log directory unavailable: {}", e);
                return;
            }
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", line) {
                    warn!("Failed to write event log {}: {}", path.display(), e);
                }
            }
            Err(e) => warn!("Failed to open event log {}: {}", path.display(), e),
        }
    }
}

/// Read back every event, skipping lines that do not parse
pub fn read_events(path: &Path) -> std::io::Result<Vec<LifecycleEvent>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let events = content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path());
        log.emit(EventKind::FoundationBuilt, Some("foundation"), None, "built in 3s");
        log.emit(EventKind::SuiteFailed, Some("doc"), Some("doc"), "exit status 1");

        let events = read_events(log.path().unwrap()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::FoundationBuilt);
        assert_eq!(events[1].unit.as_deref(), Some("doc"));
        assert!(events.iter().all(|e| e.run_id == log.run_id()));
    }

    #[test]
    fn test_disabled_log_writes_nothing() {
        let log = EventLog::disabled();
        log.emit(EventKind::Cleaned, None, None, "nothing to see");
        assert!(log.path().is_none());
    }

    #[test]
    fn test_missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_events(&dir.path().join(EVENT_LOG_FILE)).unwrap().is_empty());
    }
}

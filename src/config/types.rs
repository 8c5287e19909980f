/// Core types and structures shared across testbox
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Environment name of the shared base environment
pub const FOUNDATION: &str = "foundation";

/// Environment name of the shared sequential environment
pub const SEQUENTIAL: &str = "sequential";

/// Lock unit guarding whole-environment derive and reset
pub const ENVIRONMENT_UNIT: &str = "_environment";

/// The three families of environment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvKind {
    /// Single shared base every other environment derives from
    Foundation,
    /// One environment shared by the numbered suite family
    Sequential,
    /// Private, disposable environment owned by exactly one suite
    Independent,
}

impl EnvKind {
    /// Name of the marker/lock directory inside the environment root
    pub fn state_dir_name(self) -> &'static str {
        match self {
            Self::Foundation => ".state",
            Self::Sequential | Self::Independent => ".bats-state",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Foundation => "foundation",
            Self::Sequential => "sequential",
            Self::Independent => "independent",
        }
    }
}

impl fmt::Display for EnvKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker state of one unit of work
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerStatus {
    Absent,
    Started,
    Completed,
}

/// Contents of a `.start-*` / `.complete-*` marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub unit: String,
    pub pid: u32,
    pub at: DateTime<Utc>,
}

/// Lock information stored in `.lock-<unit>/pid`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub unit: String,
    pub acquired_at: DateTime<Utc>,
    pub testbox_version: String,
}

/// Foundation build steps, each backed by an external collaborator call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStep {
    CloneTemplate,
    InspectFramework,
    SubtreeImport,
    CopyFramework,
    Commit,
    Setup,
    Derive,
}

impl BuildStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CloneTemplate => "clone-template",
            Self::InspectFramework => "inspect-framework",
            Self::SubtreeImport => "subtree-import",
            Self::CopyFramework => "copy-framework",
            Self::Commit => "commit",
            Self::Setup => "setup",
            Self::Derive => "derive",
        }
    }
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy for testbox
#[derive(Error, Debug)]
pub enum EnvError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("Build step '{step}' failed: {detail}")]
    Build { step: BuildStep, detail: String },

    #[error("Unit {unit} is busy (owned by PID {owner_pid:?})")]
    Busy { unit: String, owner_pid: Option<u32> },

    #[error("Lock record for {unit} is corrupted: {details}")]
    LockCorrupted { unit: String, details: String },

    #[error("Invalid unit name: {0:?}")]
    InvalidUnit(String),

    #[error("Unknown suite: {0}")]
    UnknownSuite(String),

    #[error("Suite {suite} failed: {detail}")]
    SuiteFailed { suite: String, detail: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EnvError {
    /// Wrap an IO error with the path or action it came from
    pub fn io_at(err: std::io::Error, what: impl fmt::Display) -> Self {
        EnvError::Io(std::io::Error::new(err.kind(), format!("{}: {}", what, err)))
    }

    pub fn build(step: BuildStep, detail: impl Into<String>) -> Self {
        EnvError::Build {
            step,
            detail: detail.into(),
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, EnvError::Busy { .. })
    }
}

/// Convert errors to process exit codes
impl From<&EnvError> for i32 {
    fn from(err: &EnvError) -> i32 {
        match err {
            EnvError::SuiteFailed { .. } => 1,
            EnvError::Busy { .. } => 2,        // Temporary failure
            EnvError::Build { .. } => 3,       // Collaborator step failed
            EnvError::UnknownSuite(_) => 64,   // Usage error
            EnvError::InvalidUnit(_) => 65,    // Data error
            EnvError::Io(_) => 74,             // IO error
            EnvError::Filesystem(_) => 74,     // IO error
            EnvError::LockCorrupted { .. } => 75,
            EnvError::Config(_) => 78,         // Config error
        }
    }
}

/// Result type alias for testbox operations
pub type Result<T> = std::result::Result<T, EnvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_dir_names() {
        assert_eq!(EnvKind::Foundation.state_dir_name(), ".state");
        assert_eq!(EnvKind::Sequential.state_dir_name(), ".bats-state");
        assert_eq!(EnvKind::Independent.state_dir_name(), ".bats-state");
    }

    #[test]
    fn test_exit_codes() {
        let busy = EnvError::Busy {
            unit: "sequential".to_string(),
            owner_pid: Some(42),
        };
        assert_eq!(i32::from(&busy), 2);
        assert_eq!(
            i32::from(&EnvError::build(BuildStep::Setup, "exit status 1")),
            3
        );
        assert_eq!(i32::from(&EnvError::UnknownSuite("nope".into())), 64);
    }

    #[test]
    fn test_build_error_names_step() {
        let err = EnvError::build(BuildStep::SubtreeImport, "exit status 128");
        assert_eq!(
            err.to_string(),
            "Build step 'subtree-import' failed: exit status 128"
        );
    }
}

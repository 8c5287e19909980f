/// Harness configuration: defaults, optional JSON file, `TESTBOX_*` environment overrides
use crate::config::types::{EnvError, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything a run needs to know about where things live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Root data directory holding every environment
    pub root_dir: PathBuf,
    /// Working copy of the build framework under test
    pub framework_repo: PathBuf,
    /// Branch imported when the framework working copy is clean
    pub framework_branch: String,
    /// Template project cloned into the foundation
    pub template_repo: PathBuf,
    /// Directory the framework is imported under inside the project
    pub subtree_prefix: String,
    /// One-time framework setup, run inside the foundation repo
    pub setup_command: Option<Vec<String>>,
    /// Directory holding `sequential/` and `standard/` suite files
    pub suites_dir: PathBuf,
    /// Command prefix used to execute a suite file
    pub suite_runner: Vec<String>,
    /// Diagnostic output level (0 quiet .. 3 trace)
    pub verbosity: u8,
    /// Rebuild the foundation when the framework tree fingerprint changes
    pub track_generation: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            root_dir: Self::runtime_root_dir(),
            framework_repo: cwd.clone(),
            framework_branch: "master".to_string(),
            template_repo: cwd.join("template"),
            subtree_prefix: "framework".to_string(),
            setup_command: None,
            suites_dir: cwd.join("test"),
            suite_runner: vec!["bats".to_string()],
            verbosity: 0,
            track_generation: true,
        }
    }
}

impl HarnessConfig {
    /// Per-user default root under the system temp dir
    pub fn runtime_root_dir() -> PathBuf {
        let euid = unsafe { libc::geteuid() };
        std::env::temp_dir().join(format!("testbox-uid-{}", euid))
    }

    /// Defaults, then the JSON file (if any), then the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EnvError::io_at(e, format!("reading config {}", path.display())))?;
        serde_json::from_str(&content).map_err(|e| {
            EnvError::Config(format!("Invalid config file {}: {}", path.display(), e))
        })
    }

    /// Apply `TESTBOX_*` overrides from an arbitrary lookup
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TESTBOX_ROOT") {
            self.root_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TESTBOX_FRAMEWORK_REPO") {
            self.framework_repo = PathBuf::from(v);
        }
        if let Some(v) = lookup("TESTBOX_FRAMEWORK_BRANCH") {
            self.framework_branch = v;
        }
        if let Some(v) = lookup("TESTBOX_TEMPLATE_REPO") {
            self.template_repo = PathBuf::from(v);
        }
        if let Some(v) = lookup("TESTBOX_SUBTREE_PREFIX") {
            self.subtree_prefix = v;
        }
        if let Some(v) = lookup("TESTBOX_SUITES_DIR") {
            self.suites_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TESTBOX_SUITE_RUNNER") {
            self.suite_runner = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = lookup("TESTBOX_VERBOSE") {
            match v.trim().parse::<u8>() {
                Ok(level) => self.verbosity = level,
                Err(_) => log::warn!("Ignoring non-numeric TESTBOX_VERBOSE={:?}", v),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.root_dir.is_absolute() {
            return Err(EnvError::Config(format!(
                "root_dir must be absolute, got {}",
                self.root_dir.display()
            )));
        }
        if self.framework_branch.trim().is_empty() {
            return Err(EnvError::Config("framework_branch is empty".to_string()));
        }
        if self.subtree_prefix.trim().is_empty() || self.subtree_prefix.contains("..") {
            return Err(EnvError::Config(format!(
                "invalid subtree_prefix {:?}",
                self.subtree_prefix
            )));
        }
        if self.suite_runner.is_empty() {
            return Err(EnvError::Config("suite_runner is empty".to_string()));
        }
        if matches!(&self.setup_command, Some(cmd) if cmd.is_empty()) {
            return Err(EnvError::Config("setup_command is empty".to_string()));
        }
        Ok(())
    }

    /// Setup command, defaulting to the framework's own `setup.sh`
    pub fn setup_command(&self) -> Vec<String> {
        match &self.setup_command {
            Some(cmd) => cmd.clone(),
            None => vec![
                "sh".to_string(),
                format!("{}/setup.sh", self.subtree_prefix),
            ],
        }
    }

    pub fn log_level(&self) -> LevelFilter {
        match self.verbosity {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

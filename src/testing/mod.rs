//! Test doubles for the lifecycle core
//!
//! Fakes for process liveness, the external toolchain and suite bodies, so the lock,
//! pollution and chaining logic can be exercised without git or real processes.

use crate::chain::suite::{Suite, SuiteContext};
use crate::config::types::{BuildStep, EnvError, Result};
use crate::safety::process::ProcessProbe;
use crate::toolchain::Toolchain;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Liveness probe with a scripted process table
#[derive(Debug)]
pub struct FakeProbe {
    me: u32,
    alive: Mutex<HashSet<u32>>,
}

impl FakeProbe {
    /// `me` is always alive; every other pid is dead until marked alive
    pub fn new(me: u32) -> Self {
        Self {
            me,
            alive: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_alive(&self, pid: u32, alive: bool) {
        let mut table = self.alive.lock().unwrap_or_else(|p| p.into_inner());
        if alive {
            table.insert(pid);
        } else {
            table.remove(&pid);
        }
    }
}

impl ProcessProbe for FakeProbe {
    fn is_alive(&self, pid: u32) -> bool {
        pid == self.me
            || self
                .alive
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .contains(&pid)
    }

    fn current_pid(&self) -> u32 {
        self.me
    }
}

/// Toolchain that records every call and fakes its filesystem effects
#[derive(Debug, Default)]
pub struct RecordingToolchain {
    calls: Mutex<Vec<String>>,
    dirty: bool,
    fail_at: Option<BuildStep>,
    failing_suites: Mutex<HashSet<String>>,
}

impl RecordingToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dirty_framework(mut self, dirty: bool) -> Self {
        self.dirty = dirty;
        self
    }

    /// Make one build step exit non-zero
    pub fn failing_at(mut self, step: BuildStep) -> Self {
        self.fail_at = Some(step);
        self
    }

    pub fn fail_suite(&self, suite: &str, fail: bool) {
        let mut failing = self
            .failing_suites
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if fail {
            failing.insert(suite.to_string());
        } else {
            failing.remove(suite);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Number of recorded calls starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn reset(&self) {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    fn record(&self, call: impl Into<String>) {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(call.into());
    }

    fn step(&self, call: &str, step: BuildStep) -> Result<()> {
        self.record(call);
        if self.fail_at == Some(step) {
            return Err(EnvError::build(step, "exit status 1: injected failure"));
        }
        Ok(())
    }
}

fn touch(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| EnvError::io_at(e, parent.display()))?;
    }
    fs::write(path, contents).map_err(|e| EnvError::io_at(e, path.display()))
}

impl Toolchain for RecordingToolchain {
    fn clone_template(&self, _template: &Path, dest: &Path) -> Result<()> {
        self.step("clone_template", BuildStep::CloneTemplate)?;
        touch(&dest.join("Makefile"), "include framework/base.mk\n")
    }

    fn framework_is_dirty(&self, _framework: &Path) -> Result<bool> {
        self.step("framework_is_dirty", BuildStep::InspectFramework)?;
        Ok(self.dirty)
    }

    fn subtree_import(
        &self,
        repo: &Path,
        prefix: &str,
        _framework: &Path,
        branch: &str,
    ) -> Result<()> {
        self.step("subtree_import", BuildStep::SubtreeImport)?;
        touch(&repo.join(prefix).join("base.mk"), branch)
    }

    fn copy_framework(&self, _framework: &Path, dest: &Path) -> Result<()> {
        self.step("copy_framework", BuildStep::CopyFramework)?;
        touch(&dest.join("base.mk"), "working tree\n")
    }

    fn commit_all(&self, _repo: &Path, _message: &str) -> Result<()> {
        self.step("commit_all", BuildStep::Commit)
    }

    fn run_setup(&self, repo: &Path, _command: &[String]) -> Result<()> {
        self.step("run_setup", BuildStep::Setup)?;
        touch(&repo.join(".configured"), "")
    }

    fn run_suite(
        &self,
        suite: &str,
        repo: &Path,
        _command: &[String],
        _vars: &[(String, String)],
    ) -> Result<()> {
        self.record(format!("run_suite:{}", suite));
        let failing = self
            .failing_suites
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(suite);
        if failing {
            return Err(EnvError::SuiteFailed {
                suite: suite.to_string(),
                detail: "exit status 1".to_string(),
            });
        }
        touch(&repo.join(format!("ran-{}", suite)), "")
    }
}

type SuiteBody = dyn Fn(&SuiteContext<'_>) -> Result<()> + Send + Sync;

/// Suite whose body is a closure
pub struct FnSuite {
    name: String,
    body: Box<SuiteBody>,
}

impl FnSuite {
    pub fn new<F>(name: &str, body: F) -> Self
    where
        F: Fn(&SuiteContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            body: Box::new(body),
        }
    }

    /// Appends its name to `journal` and leaves a file in the repo
    pub fn recording(name: &str, journal: Arc<Mutex<Vec<String>>>) -> Self {
        let owned = name.to_string();
        Self::new(name, move |ctx| {
            journal
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(owned.clone());
            touch(&ctx.env.repo().join(format!("ran-{}", owned)), "")
        })
    }

    pub fn failing(name: &str) -> Self {
        let owned = name.to_string();
        Self::new(name, move |_| {
            Err(EnvError::SuiteFailed {
                suite: owned.clone(),
                detail: "assertion failed".to_string(),
            })
        })
    }
}

impl Suite for FnSuite {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &SuiteContext<'_>) -> Result<()> {
        (self.body)(ctx)
    }
}

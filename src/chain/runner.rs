/// Chain runner: the single `run(suite)` entry point shared by the CLI, run-all and
/// predecessor recursion.
///
/// Sequential suites share one environment and run in strict numeric order; asking for
/// suite k first runs any predecessor that has not completed. Independent suites get a
/// fresh copy of the foundation every time.
use crate::chain::suite::{Suite, SuiteContext, SuiteRef};
use crate::config::types::{EnvError, MarkerStatus, Result};
use crate::env::layout::Environment;
use crate::env::registry::Registry;
use crate::observability::events::EventKind;
use crate::safety::lock_manager::LockHandle;
use crate::state::pollution::Verdict;
use log::{debug, error, info};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum SuiteOutcome {
    Passed,
    Failed(String),
    /// Not attempted because an earlier sequential suite failed
    Skipped(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteResult {
    pub suite: String,
    #[serde(flatten)]
    pub outcome: SuiteOutcome,
}

/// Per-suite outcomes of a full run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub results: Vec<SuiteResult>,
}

impl RunReport {
    fn push(&mut self, suite: &str, outcome: SuiteOutcome) {
        self.results.push(SuiteResult {
            suite: suite.to_string(),
            outcome,
        });
    }

    pub fn passed(&self) -> usize {
        self.count(|o| matches!(o, SuiteOutcome::Passed))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, SuiteOutcome::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, SuiteOutcome::Skipped(_)))
    }

    fn count(&self, pred: impl Fn(&SuiteOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.skipped() == 0
    }

    pub fn outcome(&self, suite: &str) -> Option<&SuiteOutcome> {
        self.results
            .iter()
            .find(|r| r.suite == suite)
            .map(|r| &r.outcome)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for result in &self.results {
            match &result.outcome {
                SuiteOutcome::Passed => writeln!(f, "ok      {}", result.suite)?,
                SuiteOutcome::Failed(detail) => {
                    writeln!(f, "FAILED  {} ({})", result.suite, detail)?
                }
                SuiteOutcome::Skipped(why) => writeln!(f, "skipped {} ({})", result.suite, why)?,
            }
        }
        write!(
            f,
            "{} passed, {} failed, {} skipped",
            self.passed(),
            self.failed(),
            self.skipped()
        )
    }
}

pub struct ChainRunner {
    registry: Registry,
}

impl ChainRunner {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run one suite, provisioning everything it depends on
    pub fn run(&self, name: &str) -> Result<()> {
        match self.registry.catalog().lookup(name)? {
            SuiteRef::Foundation => self.registry.rebuild_foundation(),
            SuiteRef::Sequential(k) => self.run_sequential(k),
            SuiteRef::Independent(i) => self.run_independent(i),
        }
    }

    fn suite(&self, suite: SuiteRef) -> Result<Arc<dyn Suite>> {
        self.registry
            .catalog()
            .get(suite)
            .cloned()
            .ok_or_else(|| EnvError::UnknownSuite(format!("{:?}", suite)))
    }

    /// True when `unit` is already running under this process tree
    fn is_reentrant(&self, env: &Environment, unit: &str) -> Result<bool> {
        if self.registry.detector().evaluate(env, unit)? == Verdict::Reentrant {
            debug!("{} is already running in {}; nothing to do", unit, env.name());
            return Ok(true);
        }
        Ok(false)
    }

    fn run_sequential(&self, k: usize) -> Result<()> {
        let suite = self.suite(SuiteRef::Sequential(k))?;
        let env = self.registry.sequential()?;
        if self.is_reentrant(&env, suite.name())? {
            return Ok(());
        }

        self.registry.ensure_foundation()?;
        self.registry.ensure_sequential()?;

        let markers = env.markers(self.registry.probe().as_ref());
        if k > 0 {
            let prev = self.suite(SuiteRef::Sequential(k - 1))?;
            if markers.status(prev.name())? != MarkerStatus::Completed {
                info!(
                    "Predecessor {} has not completed; running it before {}",
                    prev.name(),
                    suite.name()
                );
                self.run_sequential(k - 1)?;
            }
        }

        let lock = self.registry.lock(&env, suite.name())?;
        self.execute(&env, suite.as_ref(), lock)?;

        // Later suites were built on state this one just mutated
        for later in &self.registry.catalog().sequential()[k + 1..] {
            let unit = later.name();
            if markers.status(unit)? == MarkerStatus::Absent || self.is_reentrant(&env, unit)? {
                continue;
            }
            markers.clear(unit)?;
            self.registry.events().emit(
                EventKind::SuiteInvalidated,
                Some(env.name()),
                Some(unit),
                format!("{} re-ran underneath it", suite.name()),
            );
        }
        Ok(())
    }

    fn run_independent(&self, i: usize) -> Result<()> {
        let suite_ref = SuiteRef::Independent(i);
        let suite = self.suite(suite_ref)?;
        let env = self.registry.environment_for(suite_ref)?;
        if self.is_reentrant(&env, suite.name())? {
            return Ok(());
        }

        self.registry.ensure_foundation()?;
        let lock = self.registry.lock(&env, suite.name())?;
        // Isolation over speed: never reuse a previous run's tree
        self.registry.derive(&env)?;
        self.execute(&env, suite.as_ref(), lock)
    }

    /// Run a suite body between start and complete markers while holding its lock
    fn execute(&self, env: &Environment, suite: &dyn Suite, lock: LockHandle) -> Result<()> {
        let unit = suite.name();
        let events = self.registry.events();
        let markers = env.markers(self.registry.probe().as_ref());

        markers.record_start(unit)?;
        events.emit(EventKind::SuiteStarted, Some(env.name()), Some(unit), "");

        let bindings = self.registry.load(env);
        let ctx = SuiteContext {
            env,
            bindings: &bindings,
            toolchain: self.registry.toolchain(),
        };
        let started = Instant::now();
        if let Err(e) = suite.run(&ctx) {
            // Markers stay `started` and the repo stays as-is for inspection
            events.emit(EventKind::SuiteFailed, Some(env.name()), Some(unit), e.to_string());
            return Err(e);
        }

        markers.record_complete(unit)?;
        lock.release()?;
        events.emit(
            EventKind::SuiteCompleted,
            Some(env.name()),
            Some(unit),
            format!("passed in {:.1?}", started.elapsed()),
        );
        Ok(())
    }

    /// Clean everything, rebuild the foundation, then run every suite.
    ///
    /// The sequential chain stops at its first failure; independent suites all run.
    pub fn run_all(&self) -> Result<RunReport> {
        self.registry.clean_all()?.into_result()?;
        self.registry.rebuild_foundation()?;

        let mut report = RunReport::default();
        let catalog = self.registry.catalog();

        let mut broken: Option<String> = None;
        for (k, suite) in catalog.sequential().iter().enumerate() {
            if let Some(failed) = &broken {
                report.push(
                    suite.name(),
                    SuiteOutcome::Skipped(format!("{} failed", failed)),
                );
                continue;
            }
            match self.run_sequential(k) {
                Ok(()) => report.push(suite.name(), SuiteOutcome::Passed),
                Err(e) => {
                    error!("Sequential suite {} failed: {}", suite.name(), e);
                    report.push(suite.name(), SuiteOutcome::Failed(e.to_string()));
                    broken = Some(suite.name().to_string());
                }
            }
        }

        for (i, suite) in catalog.independent().iter().enumerate() {
            match self.run_independent(i) {
                Ok(()) => report.push(suite.name(), SuiteOutcome::Passed),
                Err(e) => {
                    error!("Suite {} failed: {}", suite.name(), e);
                    report.push(suite.name(), SuiteOutcome::Failed(e.to_string()));
                }
            }
        }

        info!(
            "Run complete: {} passed, {} failed, {} skipped",
            report.passed(),
            report.failed(),
            report.skipped()
        );
        Ok(report)
    }
}

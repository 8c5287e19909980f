/// Environment registry: suite name → environment, provisioning, and suite bindings
///
/// Every path that reaches a suite body is resolved here. Provisioning decisions are
/// driven by the pollution detector; the registry never trusts an environment it cannot
/// positively confirm as complete.
use crate::chain::suite::{SuiteCatalog, SuiteRef};
use crate::config::settings::HarnessConfig;
use crate::config::types::{
    BuildStep, EnvError, EnvKind, MarkerStatus, Result, ENVIRONMENT_UNIT, FOUNDATION,
    SEQUENTIAL,
};
use crate::env::bootstrap;
use crate::env::foundation::{current_generation, generation_is_current, FoundationBuilder};
use crate::env::layout::Environment;
use crate::observability::events::{EventKind, EventLog};
use crate::safety::cleanup::{self, CleanReport};
use crate::safety::lock_manager::{LockHandle, LockState};
use crate::safety::process::{ProcessProbe, OWNER_PID_VAR};
use crate::state::generation::Generation;
use crate::state::pollution::{PollutionDetector, PollutionReason, Verdict};
use crate::toolchain::Toolchain;
use log::{debug, info, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

/// Outcome of a provisioning request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    Reused,
    Built,
}

/// Process-visible context handed to a suite body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bindings {
    pub root: PathBuf,
    pub repo: PathBuf,
    pub env_name: String,
    pub framework_repo: PathBuf,
    pub framework_branch: String,
    pub template_repo: PathBuf,
    pub verbosity: u8,
    pub owner_pid: u32,
}

impl Bindings {
    /// Variables exported to suite processes
    pub fn to_vars(&self) -> Vec<(String, String)> {
        vec![
            ("TESTBOX_ROOT".to_string(), self.root.display().to_string()),
            ("TESTBOX_REPO".to_string(), self.repo.display().to_string()),
            ("TESTBOX_ENV".to_string(), self.env_name.clone()),
            (
                "TESTBOX_FRAMEWORK_REPO".to_string(),
                self.framework_repo.display().to_string(),
            ),
            (
                "TESTBOX_FRAMEWORK_BRANCH".to_string(),
                self.framework_branch.clone(),
            ),
            (
                "TESTBOX_TEMPLATE_REPO".to_string(),
                self.template_repo.display().to_string(),
            ),
            ("TESTBOX_VERBOSE".to_string(), self.verbosity.to_string()),
            (OWNER_PID_VAR.to_string(), self.owner_pid.to_string()),
        ]
    }

    /// `export K='V'` lines for sourcing from a shell
    pub fn shell_exports(&self) -> String {
        self.to_vars()
            .iter()
            .map(|(k, v)| format!("export {}='{}'\n", k, v.replace('\'', r"'\''")))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitStatus {
    pub unit: String,
    pub markers: MarkerStatus,
    pub verdict: Verdict,
    pub lock_owner: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvStatus {
    pub name: String,
    pub kind: EnvKind,
    pub exists: bool,
    pub repo: PathBuf,
    pub generation: Option<String>,
    pub units: Vec<UnitStatus>,
}

pub struct Registry {
    config: HarnessConfig,
    catalog: SuiteCatalog,
    toolchain: Arc<dyn Toolchain>,
    probe: Arc<dyn ProcessProbe>,
    detector: PollutionDetector,
    events: EventLog,
    generation: OnceLock<Option<Generation>>,
}

impl Registry {
    pub fn new(
        config: HarnessConfig,
        catalog: SuiteCatalog,
        toolchain: Arc<dyn Toolchain>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        let events = EventLog::new(&config.root_dir);
        Self {
            detector: PollutionDetector::new(Arc::clone(&probe)),
            config,
            catalog,
            toolchain,
            probe,
            events,
            generation: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn catalog(&self) -> &SuiteCatalog {
        &self.catalog
    }

    pub fn toolchain(&self) -> &dyn Toolchain {
        self.toolchain.as_ref()
    }

    pub fn probe(&self) -> &Arc<dyn ProcessProbe> {
        &self.probe
    }

    pub fn detector(&self) -> &PollutionDetector {
        &self.detector
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn foundation(&self) -> Result<Environment> {
        Environment::new(&self.config.root_dir, FOUNDATION, EnvKind::Foundation)
    }

    pub fn sequential(&self) -> Result<Environment> {
        Environment::new(&self.config.root_dir, SEQUENTIAL, EnvKind::Sequential)
    }

    /// Environment a suite runs in
    pub fn resolve(&self, suite: &str) -> Result<Environment> {
        self.environment_for(self.catalog.lookup(suite)?)
    }

    pub fn environment_for(&self, suite: SuiteRef) -> Result<Environment> {
        match suite {
            SuiteRef::Foundation => self.foundation(),
            SuiteRef::Sequential(_) => self.sequential(),
            SuiteRef::Independent(_) => {
                let name = self
                    .catalog
                    .get(suite)
                    .map(|s| s.name().to_string())
                    .ok_or_else(|| EnvError::UnknownSuite(format!("{:?}", suite)))?;
                Environment::new(&self.config.root_dir, &name, EnvKind::Independent)
            }
        }
    }

    /// Take `unit`'s lock in `env`, reporting busy and reclaimed locks as events
    pub fn lock(&self, env: &Environment, unit: &str) -> Result<LockHandle> {
        self.lock_with(env, unit, false)
    }

    fn lock_with(&self, env: &Environment, unit: &str, shared: bool) -> Result<LockHandle> {
        env.create_dirs()?;
        let locks = env.locks(Arc::clone(&self.probe));
        let acquired = if shared {
            locks.acquire_shared(unit)
        } else {
            locks.acquire(unit)
        };
        match acquired {
            Ok(handle) => {
                if let Some(pid) = handle.reclaimed_from() {
                    self.events.emit(
                        EventKind::LockReclaimed,
                        Some(env.name()),
                        Some(unit),
                        format!("abandoned by pid {}", pid),
                    );
                }
                Ok(handle)
            }
            Err(e) => {
                if e.is_busy() {
                    self.events
                        .emit(EventKind::LockBusy, Some(env.name()), Some(unit), e.to_string());
                }
                Err(e)
            }
        }
    }

    fn framework_generation(&self) -> Option<&Generation> {
        self.generation
            .get_or_init(|| match current_generation(&self.config) {
                Ok(Some(generation)) => Some(generation),
                Ok(None) => {
                    warn!(
                        "Framework source {} not found; staleness check disabled",
                        self.config.framework_repo.display()
                    );
                    None
                }
                Err(e) => {
                    warn!("Cannot fingerprint framework: {}; staleness check disabled", e);
                    None
                }
            })
            .as_ref()
    }

    fn foundation_is_current(&self, env: &Environment) -> Result<bool> {
        if !self.config.track_generation {
            return Ok(true);
        }
        generation_is_current(env, self.framework_generation())
    }

    /// Reuse the foundation when it is clean and current, otherwise rebuild it
    pub fn ensure_foundation(&self) -> Result<Provisioned> {
        let env = self.foundation()?;
        match self.detector.evaluate(&env, FOUNDATION)? {
            Verdict::Clean => {
                if self.foundation_is_current(&env)? {
                    self.events
                        .emit(EventKind::FoundationReused, Some(FOUNDATION), None, "clean");
                    return Ok(Provisioned::Reused);
                }
                self.events.emit(
                    EventKind::FoundationStale,
                    Some(FOUNDATION),
                    None,
                    "framework source changed since last build",
                );
            }
            Verdict::Reentrant => return Ok(Provisioned::Reused),
            Verdict::Missing => info!("Foundation does not exist yet"),
            Verdict::Polluted(PollutionReason::LiveOwner(pid)) => {
                self.events.emit(
                    EventKind::LockBusy,
                    Some(FOUNDATION),
                    Some(FOUNDATION),
                    format!("being built by pid {}", pid),
                );
                return Err(EnvError::Busy {
                    unit: FOUNDATION.to_string(),
                    owner_pid: Some(pid),
                });
            }
            Verdict::Polluted(reason) => {
                self.events.emit(
                    EventKind::PollutionDetected,
                    Some(FOUNDATION),
                    Some(FOUNDATION),
                    reason.to_string(),
                );
            }
        }
        self.rebuild_foundation()?;
        Ok(Provisioned::Built)
    }

    /// Unconditional foundation rebuild
    pub fn rebuild_foundation(&self) -> Result<()> {
        let env = self.foundation()?;
        FoundationBuilder::new(
            &self.config,
            self.toolchain.as_ref(),
            Arc::clone(&self.probe),
            &self.events,
        )
        .build(&env)
    }

    /// Fresh copy of the foundation repo into `env`; the caller holds the guarding lock.
    ///
    /// The copy runs under a shared `foundation` lock, so a concurrent rebuild is `Busy`
    /// rather than removing the tree mid-copy, and vice versa.
    pub fn derive(&self, env: &Environment) -> Result<()> {
        let foundation = self.foundation()?;
        if !foundation.exists() {
            return Err(EnvError::build(
                BuildStep::Derive,
                "foundation has not been built",
            ));
        }
        let source = self.lock_with(&foundation, FOUNDATION, true)?;
        let markers = foundation.markers(self.probe.as_ref());
        if markers.status(FOUNDATION)? != MarkerStatus::Completed {
            // Torn or superseded between provisioning and now
            let owner_pid = foundation
                .locks(Arc::clone(&self.probe))
                .owner(FOUNDATION)
                .ok()
                .flatten()
                .map(|o| o.pid);
            return Err(EnvError::Busy {
                unit: FOUNDATION.to_string(),
                owner_pid,
            });
        }
        let copied = bootstrap::derive_from_foundation(&foundation, env, self.probe.as_ref())?;
        source.release()?;
        for (unit, pid) in env.locks(Arc::clone(&self.probe)).reap_abandoned()? {
            self.events.emit(
                EventKind::LockReclaimed,
                Some(env.name()),
                Some(&unit),
                format!("abandoned by pid {}", pid),
            );
        }
        self.events.emit(
            EventKind::EnvironmentDerived,
            Some(env.name()),
            None,
            format!("{} entries copied from foundation", copied),
        );
        Ok(())
    }

    /// Discard `env` and derive it again under its environment lock
    pub fn reset(&self, env: &Environment) -> Result<()> {
        let lock = self.lock(env, ENVIRONMENT_UNIT)?;
        self.derive(env)?;
        lock.release()
    }

    /// Make the shared sequential environment usable: derived from the current
    /// foundation build and free of torn units. Returns `Built` when it was (re)derived.
    pub fn ensure_sequential(&self) -> Result<Provisioned> {
        let foundation = self.foundation()?;
        let env = self.sequential()?;
        let lock = self.lock(&env, ENVIRONMENT_UNIT)?;

        let reason = if !env.repo().is_dir() {
            None
        } else if let Some((unit, reason)) = self.detector.scan(&env)? {
            if let PollutionReason::LiveOwner(pid) = reason {
                return Err(EnvError::Busy {
                    unit,
                    owner_pid: Some(pid),
                });
            }
            self.events.emit(
                EventKind::PollutionDetected,
                Some(env.name()),
                Some(&unit),
                reason.to_string(),
            );
            Some(format!("unit {} {}", unit, reason))
        } else if !bootstrap::derived_from_current(&foundation, &env, self.probe.as_ref())? {
            Some("foundation rebuilt since derivation".to_string())
        } else {
            debug!("Sequential environment reusable");
            lock.release()?;
            return Ok(Provisioned::Reused);
        };

        if let Some(reason) = reason {
            self.events.emit(
                EventKind::EnvironmentReset,
                Some(env.name()),
                None,
                format!("restarting chain from suite 0: {}", reason),
            );
        }
        self.derive(&env)?;
        lock.release()?;
        Ok(Provisioned::Built)
    }

    /// Provision the environment `suite` runs in without running anything.
    ///
    /// An independent tree that already exists is left as it is, so a failed run
    /// can be inspected.
    pub fn prepare(&self, suite: &str) -> Result<Environment> {
        let suite_ref = self.catalog.lookup(suite)?;
        let env = self.environment_for(suite_ref)?;
        self.ensure_foundation()?;
        match suite_ref {
            SuiteRef::Foundation => {}
            SuiteRef::Sequential(_) => {
                self.ensure_sequential()?;
            }
            SuiteRef::Independent(_) => {
                if !env.repo().is_dir() {
                    let lock = self.lock(&env, env.name())?;
                    self.derive(&env)?;
                    lock.release()?;
                }
            }
        }
        Ok(env)
    }

    /// Bindings exported to suite bodies running in `env`
    pub fn load(&self, env: &Environment) -> Bindings {
        Bindings {
            root: self.config.root_dir.clone(),
            repo: env.repo(),
            env_name: env.name().to_string(),
            framework_repo: self.config.framework_repo.clone(),
            framework_branch: self.config.framework_branch.clone(),
            template_repo: self.config.template_repo.clone(),
            verbosity: self.config.verbosity,
            owner_pid: self.probe.current_pid(),
        }
    }

    /// Remove every environment under the root
    pub fn clean_all(&self) -> Result<CleanReport> {
        cleanup::clean_root(&self.config.root_dir, &self.probe, &self.events)
    }

    fn env_status(&self, env: &Environment) -> Result<EnvStatus> {
        let markers = env.markers(self.probe.as_ref());
        let locks = env.locks(Arc::clone(&self.probe));
        let mut units = Vec::new();
        for unit in markers.units()? {
            if unit == ENVIRONMENT_UNIT {
                continue;
            }
            let lock_owner = match locks.inspect(&unit)? {
                LockState::Held { owner, .. } => Some(owner.pid),
                LockState::Free | LockState::Corrupt(_) => None,
            };
            units.push(UnitStatus {
                markers: markers.status(&unit)?,
                verdict: self.detector.evaluate(env, &unit)?,
                lock_owner,
                unit,
            });
        }
        let generation = if env.kind() == EnvKind::Foundation {
            Generation::load(&env.state_dir())?.map(|g| g.short().to_string())
        } else {
            None
        };
        Ok(EnvStatus {
            name: env.name().to_string(),
            kind: env.kind(),
            exists: env.exists(),
            repo: env.repo(),
            generation,
            units,
        })
    }

    /// Marker state of the foundation, the sequential environment and every
    /// independent suite environment
    pub fn status(&self) -> Result<Vec<EnvStatus>> {
        let mut envs = vec![self.foundation()?, self.sequential()?];
        for i in 0..self.catalog.independent().len() {
            envs.push(self.environment_for(SuiteRef::Independent(i))?);
        }
        envs.iter().map(|env| self.env_status(env)).collect()
    }
}

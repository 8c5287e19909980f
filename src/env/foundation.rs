/// Foundation builder: the root of every dependency chain
///
/// Clone template → import framework (subtree if its working copy is clean, plain copy
/// plus commit if dirty) → framework setup → record generation → mark complete.
/// Any failing step leaves the `started` marker behind so the next run rebuilds.
use crate::config::settings::HarnessConfig;
use crate::config::types::{Result, FOUNDATION};
use crate::env::layout::Environment;
use crate::observability::events::{EventKind, EventLog};
use crate::safety::process::ProcessProbe;
use crate::state::generation::Generation;
use crate::toolchain::Toolchain;
use log::{info, warn};
use std::sync::Arc;
use std::time::Instant;

pub struct FoundationBuilder<'a> {
    config: &'a HarnessConfig,
    toolchain: &'a dyn Toolchain,
    probe: Arc<dyn ProcessProbe>,
    events: &'a EventLog,
}

impl<'a> FoundationBuilder<'a> {
    pub fn new(
        config: &'a HarnessConfig,
        toolchain: &'a dyn Toolchain,
        probe: Arc<dyn ProcessProbe>,
        events: &'a EventLog,
    ) -> Self {
        Self {
            config,
            toolchain,
            probe,
            events,
        }
    }

    /// Build `env` from scratch under the `foundation` lock
    pub fn build(&self, env: &Environment) -> Result<()> {
        let started = Instant::now();
        env.create_dirs()?;

        let lock = match env.locks(Arc::clone(&self.probe)).acquire(FOUNDATION) {
            Ok(lock) => lock,
            Err(e) => {
                if e.is_busy() {
                    self.events
                        .emit(EventKind::LockBusy, Some(env.name()), Some(FOUNDATION), e.to_string());
                }
                return Err(e);
            }
        };
        if let Some(pid) = lock.reclaimed_from() {
            self.events.emit(
                EventKind::LockReclaimed,
                Some(env.name()),
                Some(FOUNDATION),
                format!("abandoned by pid {}", pid),
            );
        }

        let markers = env.markers(self.probe.as_ref());
        markers.record_start(FOUNDATION)?;

        if let Err(e) = self.run_steps(env) {
            self.events.emit(
                EventKind::FoundationFailed,
                Some(env.name()),
                Some(FOUNDATION),
                e.to_string(),
            );
            return Err(e);
        }

        markers.record_complete(FOUNDATION)?;
        lock.release()?;

        self.events.emit(
            EventKind::FoundationBuilt,
            Some(env.name()),
            Some(FOUNDATION),
            format!("built in {:.1?}", started.elapsed()),
        );
        Ok(())
    }

    fn run_steps(&self, env: &Environment) -> Result<()> {
        let repo = env.repo();
        let framework = &self.config.framework_repo;
        let prefix = &self.config.subtree_prefix;

        env.remove_repo()?;
        info!(
            "Cloning template {} into {}",
            self.config.template_repo.display(),
            repo.display()
        );
        self.toolchain
            .clone_template(&self.config.template_repo, &repo)?;

        if self.toolchain.framework_is_dirty(framework)? {
            warn!(
                "Framework at {} has uncommitted changes; importing a plain copy",
                framework.display()
            );
            self.toolchain
                .copy_framework(framework, &repo.join(prefix))?;
            self.toolchain.commit_all(
                &repo,
                &format!("Import uncommitted framework working tree into {}", prefix),
            )?;
        } else {
            info!(
                "Importing framework branch {} under {}",
                self.config.framework_branch, prefix
            );
            self.toolchain.subtree_import(
                &repo,
                prefix,
                framework,
                &self.config.framework_branch,
            )?;
        }

        self.toolchain
            .run_setup(&repo, &self.config.setup_command())?;
        self.toolchain.commit_all(&repo, "Framework setup")?;

        if self.config.track_generation {
            match current_generation(self.config)? {
                Some(generation) => generation.store(&env.state_dir())?,
                None => warn!(
                    "Framework source {} not found; generation not recorded",
                    framework.display()
                ),
            }
        }
        Ok(())
    }
}

/// Fingerprint of the configured framework, `None` when its source is absent
pub fn current_generation(config: &HarnessConfig) -> Result<Option<Generation>> {
    if !config.framework_repo.is_dir() {
        return Ok(None);
    }
    Generation::compute(&config.framework_repo, &config.framework_branch).map(Some)
}

/// Whether the recorded generation still matches the framework source
pub fn generation_is_current(
    env: &Environment,
    current: Option<&Generation>,
) -> Result<bool> {
    let Some(current) = current else {
        return Ok(true);
    };
    match Generation::load(&env.state_dir())? {
        Some(recorded) => Ok(&recorded == current),
        None => Ok(false),
    }
}

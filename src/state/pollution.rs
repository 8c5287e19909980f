/// Pollution detection: can an environment's marker state positively confirm completeness?
///
/// Reuse is only an optimisation, so every ambiguous combination reads as polluted.
use crate::config::types::{MarkerStatus, Result};
use crate::env::layout::Environment;
use crate::safety::lock_manager::LockState;
use crate::safety::process::ProcessProbe;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "pid", rename_all = "snake_case")]
pub enum PollutionReason {
    /// No markers at all for the unit
    NeverStarted,
    /// Started, never completed, nobody holding it
    Incomplete,
    /// Lock record left by a process that no longer exists
    DeadOwner(u32),
    /// Another live process holds the unit
    LiveOwner(u32),
    CorruptLock,
}

impl fmt::Display for PollutionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeverStarted => write!(f, "never started"),
            Self::Incomplete => write!(f, "started but never completed"),
            Self::DeadOwner(pid) => write!(f, "lock left by dead pid {}", pid),
            Self::LiveOwner(pid) => write!(f, "in use by live pid {}", pid),
            Self::CorruptLock => write!(f, "corrupted lock record"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Missing,
    Clean,
    /// Started and held by this process: a nested call for a unit already running
    Reentrant,
    Polluted(PollutionReason),
}

impl Verdict {
    pub fn is_clean(&self) -> bool {
        matches!(self, Verdict::Clean)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::Clean => write!(f, "clean"),
            Self::Reentrant => write!(f, "re-entrant"),
            Self::Polluted(reason) => write!(f, "polluted ({})", reason),
        }
    }
}

pub struct PollutionDetector {
    probe: Arc<dyn ProcessProbe>,
}

impl PollutionDetector {
    pub fn new(probe: Arc<dyn ProcessProbe>) -> Self {
        Self { probe }
    }

    pub fn evaluate(&self, env: &Environment, unit: &str) -> Result<Verdict> {
        if !env.exists() {
            return Ok(Verdict::Missing);
        }
        let status = env.markers(self.probe.as_ref()).status(unit)?;
        let lock = env.locks(Arc::clone(&self.probe)).inspect(unit)?;
        let me = self.probe.current_pid();

        let verdict = match (status, lock) {
            (_, LockState::Corrupt(_)) => Verdict::Polluted(PollutionReason::CorruptLock),
            (_, LockState::Held { owner, alive: false }) => {
                Verdict::Polluted(PollutionReason::DeadOwner(owner.pid))
            }
            (MarkerStatus::Completed, LockState::Free) => Verdict::Clean,
            (MarkerStatus::Started, LockState::Held { owner, alive: true }) if owner.pid == me => {
                Verdict::Reentrant
            }
            (MarkerStatus::Started, LockState::Free) => {
                Verdict::Polluted(PollutionReason::Incomplete)
            }
            (MarkerStatus::Absent, LockState::Free) => {
                Verdict::Polluted(PollutionReason::NeverStarted)
            }
            (MarkerStatus::Absent, LockState::Held { owner, .. }) if owner.pid == me => {
                Verdict::Polluted(PollutionReason::NeverStarted)
            }
            (_, LockState::Held { owner, .. }) => {
                Verdict::Polluted(PollutionReason::LiveOwner(owner.pid))
            }
        };
        Ok(verdict)
    }

    /// First unit whose state taints the whole environment.
    ///
    /// A unit held by another live process outranks every torn unit, wherever it sorts.
    /// Units that simply have not run yet do not count.
    pub fn scan(&self, env: &Environment) -> Result<Option<(String, PollutionReason)>> {
        if !env.exists() {
            return Ok(None);
        }
        let mut torn = None;
        for unit in env.markers(self.probe.as_ref()).units()? {
            match self.evaluate(env, &unit)? {
                Verdict::Polluted(PollutionReason::LiveOwner(pid)) => {
                    return Ok(Some((unit, PollutionReason::LiveOwner(pid))));
                }
                Verdict::Polluted(PollutionReason::NeverStarted) => {}
                Verdict::Polluted(reason) => {
                    if torn.is_none() {
                        torn = Some((unit, reason));
                    }
                }
                Verdict::Clean | Verdict::Reentrant | Verdict::Missing => {}
            }
        }
        Ok(torn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::EnvKind;
    use crate::testing::FakeProbe;
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        env: Environment,
        probe: Arc<FakeProbe>,
        detector: PollutionDetector,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::new(dir.path(), "sequential", EnvKind::Sequential).unwrap();
        let probe = Arc::new(FakeProbe::new(100));
        let detector = PollutionDetector::new(probe.clone());
        Fixture {
            _dir: dir,
            env,
            probe,
            detector,
        }
    }

    fn write_lock(env: &Environment, unit: &str, pid: u32) {
        let dir = env.state_dir().join(format!(".lock-{}", unit));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("pid"), format!("{}\n", pid)).unwrap();
    }

    #[test]
    fn test_missing_environment() {
        let f = fixture();
        assert_eq!(f.detector.evaluate(&f.env, "00-validate").unwrap(), Verdict::Missing);
    }

    #[test]
    fn test_completed_is_clean() {
        let f = fixture();
        let markers = f.env.markers(f.probe.as_ref());
        markers.record_start("00-validate").unwrap();
        markers.record_complete("00-validate").unwrap();
        assert_eq!(f.detector.evaluate(&f.env, "00-validate").unwrap(), Verdict::Clean);
    }

    #[test]
    fn test_start_without_complete_is_polluted() {
        let f = fixture();
        f.env.markers(f.probe.as_ref()).record_start("01-meta").unwrap();
        assert_eq!(
            f.detector.evaluate(&f.env, "01-meta").unwrap(),
            Verdict::Polluted(PollutionReason::Incomplete)
        );
    }

    #[test]
    fn test_own_live_lock_is_reentrant() {
        let f = fixture();
        let _lock = f.env.locks(f.probe.clone()).acquire("01-meta").unwrap();
        f.env.markers(f.probe.as_ref()).record_start("01-meta").unwrap();
        assert_eq!(f.detector.evaluate(&f.env, "01-meta").unwrap(), Verdict::Reentrant);
    }

    #[test]
    fn test_dead_owner_pollutes_even_completed_units() {
        let f = fixture();
        let markers = f.env.markers(f.probe.as_ref());
        markers.record_start("02-dist").unwrap();
        markers.record_complete("02-dist").unwrap();
        write_lock(&f.env, "02-dist", 31337);
        assert_eq!(
            f.detector.evaluate(&f.env, "02-dist").unwrap(),
            Verdict::Polluted(PollutionReason::DeadOwner(31337))
        );
    }

    #[test]
    fn test_foreign_live_lock() {
        let f = fixture();
        f.probe.set_alive(200, true);
        f.env.markers(f.probe.as_ref()).record_start("02-dist").unwrap();
        write_lock(&f.env, "02-dist", 200);
        assert_eq!(
            f.detector.evaluate(&f.env, "02-dist").unwrap(),
            Verdict::Polluted(PollutionReason::LiveOwner(200))
        );
    }

    #[test]
    fn test_no_markers_is_polluted() {
        let f = fixture();
        f.env.create_dirs().unwrap();
        assert_eq!(
            f.detector.evaluate(&f.env, "foundation").unwrap(),
            Verdict::Polluted(PollutionReason::NeverStarted)
        );
    }

    #[test]
    fn test_scan_finds_first_torn_unit() {
        let f = fixture();
        let markers = f.env.markers(f.probe.as_ref());
        for unit in ["00-validate", "01-meta"] {
            markers.record_start(unit).unwrap();
            markers.record_complete(unit).unwrap();
        }
        assert_eq!(f.detector.scan(&f.env).unwrap(), None);

        markers.record_start("02-dist").unwrap();
        assert_eq!(
            f.detector.scan(&f.env).unwrap(),
            Some(("02-dist".to_string(), PollutionReason::Incomplete))
        );
    }

    #[test]
    fn test_scan_reports_live_owner_before_earlier_torn_unit() {
        let f = fixture();
        f.probe.set_alive(5000, true);
        let markers = f.env.markers(f.probe.as_ref());
        markers.record_start("01-meta").unwrap();
        write_lock(&f.env, "01-meta", 31337);
        markers.record_start("02-dist").unwrap();
        write_lock(&f.env, "02-dist", 5000);

        assert_eq!(
            f.detector.scan(&f.env).unwrap(),
            Some(("02-dist".to_string(), PollutionReason::LiveOwner(5000)))
        );
    }

    #[test]
    fn test_scan_ignores_released_locks() {
        let f = fixture();
        drop(f.env.locks(f.probe.clone()).acquire("_environment").unwrap());
        assert_eq!(f.detector.scan(&f.env).unwrap(), None);
    }
}

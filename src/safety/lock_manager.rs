/// Per-unit advisory locks: `.lock-<unit>/pid` guarded by a non-blocking flock
///
/// Acquisition polls once and never waits. The pid record is truncated on release and
/// never removed, so every contender flocks the same inode.
use crate::config::types::{EnvError, LockOwner, Result};
use crate::safety::process::ProcessProbe;
use crate::state::markers::{validate_unit, LOCK_PREFIX};
use chrono::Utc;
use log::{debug, info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const PID_FILE: &str = "pid";

/// What the lock artifact says about a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    /// No record (never taken, or released)
    Free,
    Held { owner: LockOwner, alive: bool },
    /// Record present but unreadable
    Corrupt(String),
}

pub struct LockManager {
    state_dir: PathBuf,
    probe: Arc<dyn ProcessProbe>,
}

/// RAII guard; dropping it releases the lock
#[derive(Debug)]
pub struct LockHandle {
    unit: String,
    pid: u32,
    path: PathBuf,
    file: Option<File>,
    reclaimed_from: Option<u32>,
    shared: bool,
}

/// Parse a lock record; bare pids (as written by `echo $$ > pid`) are accepted too
fn parse_owner(unit: &str, content: &str) -> std::result::Result<Option<LockOwner>, String> {
    let line = content.lines().next().unwrap_or("").trim();
    if line.is_empty() {
        return Ok(None);
    }
    if let Ok(owner) = serde_json::from_str::<LockOwner>(line) {
        return Ok(Some(owner));
    }
    match line.parse::<u32>() {
        Ok(pid) => Ok(Some(LockOwner {
            pid,
            unit: unit.to_string(),
            acquired_at: Utc::now(),
            testbox_version: String::new(),
        })),
        Err(_) => Err(format!("unrecognised lock record {:?}", line)),
    }
}

impl LockManager {
    pub fn new(state_dir: PathBuf, probe: Arc<dyn ProcessProbe>) -> Self {
        Self { state_dir, probe }
    }

    pub fn lock_dir(&self, unit: &str) -> PathBuf {
        self.state_dir.join(format!("{}{}", LOCK_PREFIX, unit))
    }

    fn pid_path(&self, unit: &str) -> PathBuf {
        self.lock_dir(unit).join(PID_FILE)
    }

    /// Open the pid file and flock it without waiting
    fn open_locked(&self, unit: &str, operation: libc::c_int) -> Result<(PathBuf, File)> {
        validate_unit(unit)?;
        let lock_dir = self.lock_dir(unit);
        fs::create_dir_all(&lock_dir)
            .map_err(|e| EnvError::io_at(e, format!("creating {}", lock_dir.display())))?;

        let path = self.pid_path(unit);
        // Never truncate before holding the flock
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| EnvError::io_at(e, path.display()))?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), operation | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                let owner_pid = self.owner(unit).ok().flatten().map(|o| o.pid);
                debug!("Lock {} busy (owner {:?})", unit, owner_pid);
                return Err(EnvError::Busy {
                    unit: unit.to_string(),
                    owner_pid,
                });
            }
            return Err(EnvError::io_at(err, format!("flock {}", path.display())));
        }
        Ok((path, file))
    }

    /// Try once to take the lock for `unit`.
    ///
    /// Fails with `Busy` if another handle holds the flock or the recorded owner is a
    /// different live process. A record left by a dead owner is reclaimed.
    pub fn acquire(&self, unit: &str) -> Result<LockHandle> {
        let (path, mut file) = self.open_locked(unit, libc::LOCK_EX)?;

        let me = self.probe.current_pid();
        let mut content = String::new();
        file.read_to_string(&mut content)
            .map_err(|e| EnvError::io_at(e, path.display()))?;

        let mut reclaimed_from = None;
        match parse_owner(unit, &content) {
            Ok(Some(prev)) if prev.pid != me && self.probe.is_alive(prev.pid) => {
                // Dropping `file` releases the flock
                return Err(EnvError::Busy {
                    unit: unit.to_string(),
                    owner_pid: Some(prev.pid),
                });
            }
            Ok(Some(prev)) if prev.pid == me => {
                // Left by an earlier handle of ours, or by the runner we act for
                debug!("Lock record for {} already names pid {}; rewriting it", unit, me);
            }
            Ok(Some(prev)) => {
                warn!(
                    "Reclaiming abandoned lock for {} (pid {} not running)",
                    unit, prev.pid
                );
                reclaimed_from = Some(prev.pid);
            }
            Ok(None) => {}
            Err(details) => {
                warn!("Overwriting corrupted lock record for {}: {}", unit, details);
            }
        }

        let owner = LockOwner {
            pid: me,
            unit: unit.to_string(),
            acquired_at: Utc::now(),
            testbox_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let json = serde_json::to_string(&owner)
            .map_err(|e| EnvError::Filesystem(format!("encoding lock record: {}", e)))?;

        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        writeln!(file, "{}", json)?;
        file.sync_all()?;

        info!("Acquired lock for {} (pid {})", unit, me);
        Ok(LockHandle {
            unit: unit.to_string(),
            pid: me,
            path,
            file: Some(file),
            reclaimed_from,
            shared: false,
        })
    }

    /// Try once to take `unit`'s lock in shared mode, for readers of what an
    /// exclusive holder builds.
    ///
    /// Shared holders coexist with each other and exclude `acquire`. No owner record is
    /// written, and release leaves the existing record alone.
    pub fn acquire_shared(&self, unit: &str) -> Result<LockHandle> {
        let (path, file) = self.open_locked(unit, libc::LOCK_SH)?;
        debug!("Acquired shared lock for {}", unit);
        Ok(LockHandle {
            unit: unit.to_string(),
            pid: self.probe.current_pid(),
            path,
            file: Some(file),
            reclaimed_from: None,
            shared: true,
        })
    }

    /// Recorded owner of `unit`, if any
    pub fn owner(&self, unit: &str) -> Result<Option<LockOwner>> {
        validate_unit(unit)?;
        let path = self.pid_path(unit);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EnvError::io_at(e, path.display())),
        };
        parse_owner(unit, &content).map_err(|details| EnvError::LockCorrupted {
            unit: unit.to_string(),
            details,
        })
    }

    /// Owner plus liveness, for the pollution detector and status output
    pub fn inspect(&self, unit: &str) -> Result<LockState> {
        match self.owner(unit) {
            Ok(None) => Ok(LockState::Free),
            Ok(Some(owner)) => {
                let alive = self.probe.is_alive(owner.pid);
                Ok(LockState::Held { owner, alive })
            }
            Err(EnvError::LockCorrupted { details, .. }) => Ok(LockState::Corrupt(details)),
            Err(e) => Err(e),
        }
    }

    pub fn probe(&self) -> &Arc<dyn ProcessProbe> {
        &self.probe
    }

    /// Reclaim and release every lock whose recorded owner is dead.
    /// Locks held by anyone alive, this process included, are left alone.
    pub fn reap_abandoned(&self) -> Result<Vec<(String, u32)>> {
        let entries = match fs::read_dir(&self.state_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EnvError::io_at(e, self.state_dir.display())),
        };

        let mut reaped = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            let Some(unit) = name.strip_prefix(LOCK_PREFIX) else {
                continue;
            };
            if validate_unit(unit).is_err() {
                continue;
            }
            match self.acquire(unit) {
                Ok(handle) => {
                    if let Some(pid) = handle.reclaimed_from() {
                        reaped.push((unit.to_string(), pid));
                    }
                    handle.release()?;
                }
                Err(EnvError::Busy { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        reaped.sort();
        Ok(reaped)
    }
}

impl LockHandle {
    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pid of the dead owner whose record this acquisition replaced
    pub fn reclaimed_from(&self) -> Option<u32> {
        self.reclaimed_from
    }

    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            // Truncate, don't unlink: the inode must stay the one contenders flock
            if !self.shared {
                file.set_len(0)?;
            }
            drop(file);
            debug!("Released lock for {}", self.unit);
        }
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!("Failed to release lock for {}: {}", self.unit, e);
        }
    }
}

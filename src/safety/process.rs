/// Process liveness, abstracted so lock and pollution logic can be tested with fakes
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Exported to suite bodies so nested `testbox` calls share the runner's identity
pub const OWNER_PID_VAR: &str = "TESTBOX_OWNER_PID";

pub trait ProcessProbe: Send + Sync {
    /// Whether a process with this id currently exists
    fn is_alive(&self, pid: u32) -> bool;

    /// Identity stamped into locks and markers taken by this process
    fn current_pid(&self) -> u32;
}

/// Real probe: signal 0 delivery check
#[derive(Debug, Clone, Copy)]
pub struct SystemProbe {
    owner: u32,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            owner: std::process::id(),
        }
    }

    /// Adopt the owner pid exported by a parent runner, if any and still alive.
    /// A suite body that calls back into testbox is then re-entrant rather than busy.
    pub fn from_env() -> Self {
        let probe = Self::new();
        match std::env::var(OWNER_PID_VAR)
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok())
        {
            Some(owner) if probe.is_alive(owner) => Self { owner },
            _ => probe,
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // Exists but belongs to someone else
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn current_pid(&self) -> u32 {
        self.owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_is_alive() {
        let probe = SystemProbe::new();
        assert!(probe.is_alive(std::process::id()));
        assert_eq!(probe.current_pid(), std::process::id());
    }

    #[test]
    fn test_reaped_child_is_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!SystemProbe::new().is_alive(pid));
    }

    #[test]
    fn test_from_env_adopts_live_runner_pid() {
        let me = std::process::id();
        let runner = std::os::unix::process::parent_id();

        std::env::set_var(OWNER_PID_VAR, runner.to_string());
        assert_eq!(SystemProbe::from_env().current_pid(), runner);

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let gone = child.id();
        child.wait().unwrap();
        std::env::set_var(OWNER_PID_VAR, gone.to_string());
        assert_eq!(SystemProbe::from_env().current_pid(), me);

        std::env::set_var(OWNER_PID_VAR, "not-a-pid");
        assert_eq!(SystemProbe::from_env().current_pid(), me);

        std::env::remove_var(OWNER_PID_VAR);
        assert_eq!(SystemProbe::from_env().current_pid(), me);
    }

    #[test]
    fn test_out_of_range_pids_are_dead() {
        let probe = SystemProbe::new();
        assert!(!probe.is_alive(0));
        assert!(!probe.is_alive(u32::MAX));
    }
}

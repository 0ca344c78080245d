//! Process liveness checks for stale-lease reclamation.

use sysinfo::{Pid, ProcessesToUpdate, System};

/// Returns `true` if a process with the given pid is currently alive on
/// this host.
///
/// Only meaningful for pids recorded by this same host: lease rows from
/// other hosts cannot be probed and are left to expire on their own.
pub fn process_alive(pid: u32) -> bool {
    let target = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]));
    system.process(target).is_some()
}

/// The hostname recorded as lease owner.
pub fn local_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn absurd_pid_is_dead() {
        // Pid namespaces top out far below this on every supported OS.
        assert!(!process_alive(u32::MAX - 1));
    }

    #[test]
    fn hostname_is_nonempty() {
        assert!(!local_host().is_empty());
    }
}

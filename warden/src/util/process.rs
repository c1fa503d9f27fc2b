//! Init-pid fallbacks.
//!
//! The lxc tools normally own process teardown. These are the last resort
//! for a machine whose monitor process is gone but whose init survived, so
//! `lxc-stop` has nothing to talk to.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Null-signal probe for process existence.
pub fn is_process_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// SIGKILL an init process directly. Returns true once the process is gone,
/// including when it already was.
pub fn force_kill(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => true,
        Err(_) => !is_process_alive(pid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_bogus_pid_is_dead() {
        assert!(!is_process_alive(999999999));
    }

    #[test]
    fn test_force_kill_of_gone_pid_reports_done() {
        assert!(force_kill(999999999));
    }
}

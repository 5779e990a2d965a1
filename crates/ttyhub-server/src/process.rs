//! Low-level process signalling helpers.
//!
//! The kill protocol signals both the process and its process group:
//! PTY-spawned children are session leaders, so the group id equals the pid.

use std::io;

/// Whether a process with the given pid currently exists.
///
/// Uses `kill(pid, 0)`. EPERM still means the process exists; ESRCH (or any
/// other failure) means it does not.
pub fn process_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Send a signal to a single process.
///
/// A process that died between the liveness check and the signal (ESRCH)
/// counts as success.
pub fn send_signal(pid: u32, signal: i32) -> io::Result<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

/// Send a signal to a process group. Best-effort: ESRCH is success.
pub fn send_signal_group(pgid: u32, signal: i32) -> io::Result<()> {
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

pub const SIGTERM: i32 = libc::SIGTERM;
pub const SIGKILL: i32 = libc::SIGKILL;

/// Force-kill and reap a direct child this process has not waited on.
///
/// Only valid when no other waiter holds the child handle; the waitpid
/// returns promptly because SIGKILL was just delivered.
pub fn kill_and_reap(pid: u32) {
    let _ = send_signal_group(pid, SIGKILL);
    let _ = send_signal(pid, SIGKILL);
    let mut status = 0;
    unsafe {
        libc::waitpid(pid as libc::pid_t, &mut status, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn bogus_pid_is_dead() {
        // Max pid on Linux is far below this.
        assert!(!process_alive(0x7fff_f000));
    }

    #[test]
    fn signalling_a_dead_pid_is_success() {
        assert!(send_signal(0x7fff_f000, SIGTERM).is_ok());
    }
}

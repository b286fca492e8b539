//! Process signalling for pause, resume and graceful termination

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

use crate::error::Result;
#[cfg(unix)]
use crate::error::SupervisorError;

/// Whether signals can suspend a process on this platform
pub const CAN_SUSPEND: bool = cfg!(unix);

#[cfg(unix)]
fn send(pid: i32, sig: Signal) -> Result<()> {
    if pid <= 0 {
        return Err(SupervisorError::Signal {
            pid,
            message: "no process".to_string(),
        });
    }
    signal::kill(Pid::from_raw(pid), sig).map_err(|e| SupervisorError::Signal {
        pid,
        message: format!("{}: {}", sig, e),
    })
}

/// Suspend the process (SIGSTOP)
#[cfg(unix)]
pub fn suspend(pid: i32) -> Result<()> {
    send(pid, Signal::SIGSTOP)
}

/// Continue a suspended process (SIGCONT)
#[cfg(unix)]
pub fn resume(pid: i32) -> Result<()> {
    send(pid, Signal::SIGCONT)
}

/// Ask the process to exit (SIGTERM). A stopped process is continued first
/// so it can act on the signal.
#[cfg(unix)]
pub fn terminate(pid: i32) -> Result<()> {
    send(pid, Signal::SIGTERM)?;
    let _ = send(pid, Signal::SIGCONT);
    Ok(())
}

/// Liveness check via signal 0. EPERM means the process exists but belongs
/// to someone else.
#[cfg(unix)]
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn suspend(_pid: i32) -> Result<()> {
    Ok(())
}

#[cfg(not(unix))]
pub fn resume(_pid: i32) -> Result<()> {
    Ok(())
}

/// No graceful signal exists here; the caller falls through to a hard kill
/// once the grace period ends.
#[cfg(not(unix))]
pub fn terminate(_pid: i32) -> Result<()> {
    Ok(())
}

#[cfg(not(unix))]
pub fn is_alive(pid: i32) -> bool {
    pid > 0
}

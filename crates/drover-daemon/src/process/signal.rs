//! Signals for worker processes.

use tokio::process::Child;

/// SIGTERM `child` if it is still running. Returns `false` without
/// signalling once the child has been reaped, because its pid may already
/// belong to another process.
pub fn terminate_child(child: &mut Child) -> std::io::Result<bool> {
    if child.try_wait()?.is_some() {
        return Ok(false);
    }
    match child.id() {
        Some(pid) => terminate(pid).map(|()| true),
        None => Ok(false),
    }
}

/// Ask a process to shut down gracefully (SIGTERM).
#[cfg(unix)]
pub fn terminate(pid: u32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Graceful termination needs POSIX signals; elsewhere the caller falls back
/// to the forced kill at the drain deadline.
#[cfg(not(unix))]
pub fn terminate(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "graceful termination requires unix signals",
    ))
}

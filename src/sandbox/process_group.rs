//! Process-group cleanup for sandboxed children
//!
//! Children are spawned as leaders of their own process group so the whole
//! tree (the sandbox tool and everything it started) can be signalled at once.

use std::io;

/// Kill every process in the group led by `pid`
///
/// A group that no longer exists is not an error.
#[cfg(unix)]
pub fn kill_process_group(pid: u32) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let pgid = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => {
            tracing::debug!("Killed process group {}", pgid);
            Ok(())
        }
        Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pid: u32) -> io::Result<()> {
    Ok(())
}

/// Kills a process group when dropped unless disarmed
#[derive(Debug)]
pub struct ProcessGroupGuard {
    pid: Option<u32>,
}

impl ProcessGroupGuard {
    pub fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Kill the group now
    pub fn kill(&mut self) -> io::Result<()> {
        match self.pid.take() {
            Some(pid) => kill_process_group(pid),
            None => Ok(()),
        }
    }

    /// Leave the group running
    pub fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Err(e) = self.kill() {
            tracing::warn!("Failed to kill process group: {}", e);
        }
    }
}

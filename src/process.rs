//! Child processes in their own process group.
//!
//! Services and test tools are spawned as process-group leaders so that a
//! stop reaches every descendant: SIGTERM to the group, a grace period, then
//! SIGKILL to whatever is left.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, warn};

#[cfg(unix)]
const GROUP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct GroupChild {
    child: Child,
    pid: Option<u32>,
}

impl GroupChild {
    /// Spawn `cmd` as the leader of a new process group.
    pub fn spawn(cmd: &mut Command) -> io::Result<Self> {
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.kill_on_drop(true);

        let child = cmd.spawn()?;
        let pid = child.id();
        debug!(pid = ?pid, "spawned process group");
        Ok(Self { child, pid })
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Graceful stop: SIGTERM the group, wait up to `grace`, then SIGKILL.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }

        self.signal_term()?;
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(pid = ?self.pid, %status, "process group exited after SIGTERM");
                Ok(status)
            }
            Err(_) => {
                warn!(pid = ?self.pid, ?grace, "process group ignored SIGTERM, killing");
                self.kill().await
            }
        }
    }

    /// Immediate SIGKILL to the group.
    pub async fn kill(&mut self) -> io::Result<ExitStatus> {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            unix::signal_group(pid, nix::sys::signal::Signal::SIGKILL)?;
        }
        #[cfg(not(unix))]
        self.child.start_kill()?;

        self.child.wait().await
    }

    /// Stop descendants left in the group after the leader exited: SIGTERM,
    /// wait up to `grace` for the group to empty, then SIGKILL.
    pub async fn reap_group(&self, grace: Duration) -> io::Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            if !unix::group_alive(pid) {
                return Ok(());
            }
            debug!(pid, "stray processes left in group, terminating");
            unix::signal_group(pid, nix::sys::signal::Signal::SIGTERM)?;
            let deadline = tokio::time::Instant::now() + grace;
            while unix::group_alive(pid) {
                if tokio::time::Instant::now() >= deadline {
                    warn!(pid, ?grace, "stray processes ignored SIGTERM, killing");
                    return unix::signal_group(pid, nix::sys::signal::Signal::SIGKILL);
                }
                tokio::time::sleep(GROUP_POLL).await;
            }
        }
        #[cfg(not(unix))]
        let _ = grace;
        Ok(())
    }

    /// Immediate SIGKILL to whatever is left in the group, without waiting.
    pub fn kill_group(&self) -> io::Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            return unix::signal_group(pid, nix::sys::signal::Signal::SIGKILL);
        }
        Ok(())
    }

    #[cfg(unix)]
    fn signal_term(&self) -> io::Result<()> {
        match self.pid {
            Some(pid) => unix::signal_group(pid, nix::sys::signal::Signal::SIGTERM),
            None => Ok(()),
        }
    }

    #[cfg(not(unix))]
    fn signal_term(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

#[cfg(unix)]
mod unix {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;
    use std::io;
    use tracing::debug;

    /// ESRCH and EPERM mean the group is already gone.
    pub(super) fn signal_group(pid: u32, signal: Signal) -> io::Result<()> {
        let pgid = Pid::from_raw(pid as i32);
        match killpg(pgid, signal) {
            Ok(()) => {
                debug!(%pgid, ?signal, "signalled process group");
                Ok(())
            }
            Err(Errno::ESRCH) | Err(Errno::EPERM) => {
                debug!(%pgid, ?signal, "process group already exited");
                Ok(())
            }
            Err(err) => Err(io::Error::from(err)),
        }
    }

    /// Whether any process is still a member of the group.
    pub(super) fn group_alive(pid: u32) -> bool {
        killpg(Pid::from_raw(pid as i32), None).is_ok()
    }
}

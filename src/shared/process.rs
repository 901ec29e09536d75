use anyhow::{Result, anyhow};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

/// How a child process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

impl ProcessExit {
    pub fn code(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A running child that can be written to and terminated. Processes are
/// started as their own group leader, so `kill_group` reaches every
/// descendant the child spawned.
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    fn write(&self, data: &[u8]) -> Result<()>;

    /// SIGKILL to the child itself.
    fn kill(&self) -> Result<()>;

    /// SIGKILL to the child's whole process group.
    fn kill_group(&self) -> Result<()> {
        let pid = self.pid().ok_or_else(|| anyhow!("process has no pid"))?;
        signal_group(pid, Signal::SIGKILL)
    }

    /// `None` until the process has exited.
    fn on_exit(&self) -> watch::Receiver<Option<ProcessExit>>;

    fn has_exited(&self) -> bool {
        self.on_exit().borrow().is_some()
    }
}

pub fn signal_group(pid: u32, signal: Signal) -> Result<()> {
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow!("killpg({pid}, {signal}) failed: {e}")),
    }
}

pub fn signal_process(pid: u32, signal: Signal) -> Result<()> {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow!("kill({pid}, {signal}) failed: {e}")),
    }
}

/// Kills the process group, falling back to the direct child when the group
/// signal is refused. Never fails; a process that is already gone is fine.
pub fn kill_process_tree(handle: &dyn ProcessHandle) {
    if handle.has_exited() {
        debug!("Process {:?} already exited; nothing to kill", handle.pid());
        return;
    }
    if let Err(group_err) = handle.kill_group() {
        warn!(
            "Failed to kill process group of {:?}: {group_err:#}; killing the child directly",
            handle.pid()
        );
        if let Err(err) = handle.kill() {
            warn!("Failed to kill process {:?}: {err:#}", handle.pid());
        }
    }
}

/// Waits up to `timeout` for the process to report its exit.
pub async fn wait_for_exit(handle: &dyn ProcessHandle, timeout: Duration) -> Option<ProcessExit> {
    let mut rx = handle.on_exit();
    let waited = tokio::time::timeout(timeout, async {
        loop {
            if let Some(exit) = rx.borrow_and_update().clone() {
                return Some(exit);
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    })
    .await;
    waited.unwrap_or(None)
}

#[cfg(unix)]
pub fn describe_exit_status(status: &std::process::ExitStatus) -> ProcessExit {
    use std::os::unix::process::ExitStatusExt;
    ProcessExit {
        exit_code: status.code(),
        signal: status
            .signal()
            .map(|s| Signal::try_from(s).map(|sig| sig.to_string()).unwrap_or_else(|_| s.to_string())),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::FakeProcessHandle;
    use super::*;

    #[test]
    fn tree_kill_prefers_the_group() {
        let handle = FakeProcessHandle::new(42);
        kill_process_tree(&handle);
        assert_eq!(*handle.group_kills.lock().unwrap(), 1);
        assert_eq!(*handle.kills.lock().unwrap(), 0);
        assert!(handle.has_exited());
    }

    #[test]
    fn tree_kill_falls_back_to_the_child() {
        let handle = FakeProcessHandle::failing_group_kill(42);
        kill_process_tree(&handle);
        assert_eq!(*handle.kills.lock().unwrap(), 1);
        assert!(handle.has_exited());
    }

    #[test]
    fn exited_process_is_left_alone() {
        let handle = FakeProcessHandle::new(42);
        handle.exit(ProcessExit::code(0));
        kill_process_tree(&handle);
        assert_eq!(*handle.group_kills.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn wait_for_exit_sees_late_exit_and_times_out() {
        let handle = std::sync::Arc::new(FakeProcessHandle::new(7));
        assert_eq!(
            wait_for_exit(handle.as_ref(), Duration::from_millis(20)).await,
            None
        );

        let exiting = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            exiting.exit(ProcessExit::code(3));
        });
        let exit = wait_for_exit(handle.as_ref(), Duration::from_secs(2)).await;
        assert_eq!(exit, Some(ProcessExit::code(3)));
    }

    #[test]
    fn signalling_a_dead_pid_is_not_an_error() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(signal_process(pid, Signal::SIGKILL).is_ok());
    }
}

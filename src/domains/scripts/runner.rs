use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::tracker::{RunningScript, ScriptExecutionTracker, ScriptOwner};
use crate::domains::settings::RunCommand;
use crate::errors::GroveError;
use crate::events::{OutputKind, ScriptEvent};
use crate::infrastructure::events::EventSource;
use crate::shared::process::{
    ProcessExit, ProcessHandle, describe_exit_status, kill_process_tree, signal_group,
    signal_process, wait_for_exit,
};

const STOP_GRACE: Duration = Duration::from_secs(5);
/// How long output is still read after a command exits. Jobs it left in the
/// background keep the pipes open past that.
const OUTPUT_DRAIN: Duration = Duration::from_secs(1);

/// A `sh -c` child started as its own process-group leader.
pub struct ChildProcessHandle {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle for ChildProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write(&self, _data: &[u8]) -> Result<()> {
        Err(anyhow!("run commands do not accept input"))
    }

    fn kill(&self) -> Result<()> {
        let pid = self.pid.ok_or_else(|| anyhow!("process has no pid"))?;
        signal_process(pid, nix::sys::signal::Signal::SIGKILL)
    }

    fn on_exit(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub index: usize,
    pub command: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub script: RunningScript,
    pub completed: Vec<CommandOutcome>,
    /// The sequence was cut short by [`RunCommandExecutor::stop`].
    pub stopped: bool,
}

struct ActiveRun {
    script: RunningScript,
    handle: Option<Arc<ChildProcessHandle>>,
    /// Process group of every command started in this run. Groups outlive
    /// their leader while backgrounded jobs are still in them.
    groups: Vec<u32>,
    stop_requested: Arc<AtomicBool>,
}

/// Runs configured commands one after another, each only after the previous
/// one exited 0.
pub struct RunCommandExecutor {
    tracker: Arc<ScriptExecutionTracker>,
    active: Mutex<Option<ActiveRun>>,
    source: EventSource,
}

fn resolve_working_dir(base: &Path, command: &RunCommand) -> PathBuf {
    match &command.working_directory {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => base.join(dir),
        None => base.to_path_buf(),
    }
}

impl RunCommandExecutor {
    pub fn new(tracker: Arc<ScriptExecutionTracker>) -> Self {
        Self {
            tracker,
            active: Mutex::new(None),
            source: EventSource::new("run-command"),
        }
    }

    pub fn tracker(&self) -> &Arc<ScriptExecutionTracker> {
        &self.tracker
    }

    fn with_active<T>(&self, f: impl FnOnce(&mut Option<ActiveRun>) -> T) -> T {
        match self.active.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn publish(&self, event: ScriptEvent) {
        self.tracker.events().publish(&self.source, event);
    }

    pub async fn run(
        &self,
        owner: ScriptOwner,
        id: &str,
        worktree_path: &Path,
        commands: &[RunCommand],
    ) -> Result<RunReport, GroveError> {
        if commands.is_empty() {
            return Err(GroveError::invalid_input(
                "run_commands",
                "no run commands are configured",
            ));
        }

        let script = self.tracker.start(owner, id).await;
        let stop_requested = Arc::new(AtomicBool::new(false));
        self.with_active(|active| {
            *active = Some(ActiveRun {
                script: script.clone(),
                handle: None,
                groups: Vec::new(),
                stop_requested: stop_requested.clone(),
            })
        });

        let result = self
            .run_sequence(&script, worktree_path, commands, &stop_requested)
            .await;

        self.with_active(|active| {
            if active.as_ref().is_some_and(|a| a.script == script) {
                *active = None;
            }
        });
        self.tracker.stop(owner, id).await;

        let (completed, stopped) = result?;
        Ok(RunReport {
            script,
            completed,
            stopped,
        })
    }

    async fn run_sequence(
        &self,
        script: &RunningScript,
        worktree_path: &Path,
        commands: &[RunCommand],
        stop_requested: &AtomicBool,
    ) -> Result<(Vec<CommandOutcome>, bool), GroveError> {
        let mut completed = Vec::with_capacity(commands.len());

        for (index, command) in commands.iter().enumerate() {
            if stop_requested.load(Ordering::SeqCst) {
                info!("Run of {} stopped before command #{}", script.id, index + 1);
                return Ok((completed, true));
            }

            let started = Instant::now();
            let exit = self
                .run_one(script, index, command, worktree_path)
                .await?;
            let outcome = CommandOutcome {
                index,
                command: command.command.clone(),
                exit_code: exit.exit_code,
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            };

            if stop_requested.load(Ordering::SeqCst) {
                completed.push(outcome);
                return Ok((completed, true));
            }
            if !exit.success() {
                warn!(
                    "Run command #{} '{}' for {} failed with {:?}; skipping the rest",
                    index + 1,
                    command.label(),
                    script.id,
                    exit
                );
                return Err(GroveError::ScriptFailed {
                    command: command.command.clone(),
                    index,
                    exit_code: exit.exit_code,
                });
            }
            completed.push(outcome);
        }

        Ok((completed, false))
    }

    async fn run_one(
        &self,
        script: &RunningScript,
        index: usize,
        command: &RunCommand,
        worktree_path: &Path,
    ) -> Result<ProcessExit, GroveError> {
        let cwd = resolve_working_dir(worktree_path, command);
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command.command)
            .current_dir(&cwd)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| GroveError::io("spawn_run_command", cwd.display(), e))?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let handle = Arc::new(ChildProcessHandle {
            pid: child.id(),
            exit_rx,
        });
        self.with_active(|active| {
            if let Some(active) = active.as_mut().filter(|a| a.script == *script) {
                active.handle = Some(handle.clone());
                active.groups.extend(handle.pid());
            }
        });

        debug!(
            "Run command #{} for {}: {} (pid {:?}) in {}",
            index + 1,
            script.id,
            command.command,
            handle.pid(),
            cwd.display()
        );
        self.publish(ScriptEvent::CommandStarted {
            script_id: script.id.clone(),
            index,
            command: command.command.clone(),
        });

        let readers: Vec<JoinHandle<()>> = [
            child
                .stdout
                .take()
                .map(|s| self.spawn_reader(script, index, OutputKind::Stdout, s)),
            child
                .stderr
                .take()
                .map(|s| self.spawn_reader(script, index, OutputKind::Stderr, s)),
        ]
        .into_iter()
        .flatten()
        .collect();

        let status = child
            .wait()
            .await
            .map_err(|e| GroveError::io("wait_run_command", cwd.display(), e))?;
        let exit = describe_exit_status(&status);
        exit_tx.send_replace(Some(exit.clone()));

        let mut readers = readers;
        let drained = tokio::time::timeout(OUTPUT_DRAIN, async {
            for reader in readers.iter_mut() {
                if let Err(e) = reader.await {
                    debug!("Output reader for {} ended abnormally: {e}", script.id);
                }
            }
        })
        .await;
        if drained.is_err() {
            debug!(
                "Run command #{} for {} exited with its output still open; detaching readers",
                index + 1,
                script.id
            );
            for reader in &readers {
                reader.abort();
            }
        }

        self.publish(ScriptEvent::CommandFinished {
            script_id: script.id.clone(),
            index,
            exit_code: exit.exit_code,
        });
        Ok(exit)
    }

    fn spawn_reader(
        &self,
        script: &RunningScript,
        index: usize,
        kind: OutputKind,
        stream: impl AsyncRead + Unpin + Send + 'static,
    ) -> JoinHandle<()> {
        let events = self.tracker.events().clone();
        let source = self.source.clone();
        let script_id = script.id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        events.publish(
                            &source,
                            ScriptEvent::Output {
                                script_id: script_id.clone(),
                                index,
                                kind,
                                line,
                            },
                        );
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!("Run command output for {script_id} unreadable: {err}");
                        break;
                    }
                }
            }
        })
    }

    /// Stops the active run: marks it closing, kills the process group of
    /// every command it started, waits for the current one to go away and
    /// clears the slot.
    pub async fn stop(&self) -> Option<RunningScript> {
        let (script, handle, groups) = self.with_active(|active| {
            active.as_ref().map(|a| {
                a.stop_requested.store(true, Ordering::SeqCst);
                (a.script.clone(), a.handle.clone(), a.groups.clone())
            })
        })?;

        self.tracker.mark_closing(script.kind, &script.id).await;

        for pgid in groups {
            if let Err(err) = signal_group(pgid, nix::sys::signal::Signal::SIGKILL) {
                warn!("Failed to kill process group {pgid} of {}: {err:#}", script.id);
            }
        }
        if let Some(handle) = handle {
            kill_process_tree(handle.as_ref());
            if wait_for_exit(handle.as_ref(), STOP_GRACE).await.is_none() {
                warn!(
                    "Run command for {} (pid {:?}) did not exit within {}s",
                    script.id,
                    handle.pid(),
                    STOP_GRACE.as_secs()
                );
            }
        }

        self.tracker.stop(script.kind, &script.id).await;
        Some(script)
    }

    pub fn is_active(&self) -> bool {
        self.with_active(|active| active.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::events::{EventBus, Subscription};
    use tempfile::TempDir;

    fn executor() -> (Arc<RunCommandExecutor>, Subscription<ScriptEvent>) {
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe();
        let tracker = Arc::new(ScriptExecutionTracker::new(bus));
        (Arc::new(RunCommandExecutor::new(tracker)), sub)
    }

    #[cfg(target_os = "linux")]
    fn process_is_gone(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit_once(") ")
                .map(|(_, rest)| rest.starts_with('Z'))
                .unwrap_or(false),
        }
    }

    #[tokio::test]
    async fn runs_commands_in_order_in_the_worktree() {
        let dir = TempDir::new().unwrap();
        let (executor, mut sub) = executor();
        let mut second = RunCommand::new("echo two >> order.txt; echo $GREETING");
        second.env.insert("GREETING".into(), "hi".into());
        let commands = vec![RunCommand::new("echo one > order.txt"), second];

        let report = executor
            .run(ScriptOwner::Session, "s1", dir.path(), &commands)
            .await
            .unwrap();

        assert!(!report.stopped);
        assert_eq!(report.completed.len(), 2);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("order.txt")).unwrap(),
            "one\ntwo\n"
        );
        assert!(executor.tracker().current().await.is_none());
        let lines: Vec<String> = sub
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                ScriptEvent::Output { line, .. } => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec!["hi".to_string()]);
    }

    #[tokio::test]
    async fn failure_stops_the_remaining_sequence() {
        let dir = TempDir::new().unwrap();
        let (executor, _sub) = executor();
        let commands = vec![
            RunCommand::new("true"),
            RunCommand::new("exit 4"),
            RunCommand::new("touch never.txt"),
        ];

        let err = executor
            .run(ScriptOwner::Project, "p", dir.path(), &commands)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GroveError::ScriptFailed {
                command: "exit 4".into(),
                index: 1,
                exit_code: Some(4),
            }
        );
        assert!(!dir.path().join("never.txt").exists());
        assert!(executor.tracker().current().await.is_none());
    }

    #[tokio::test]
    async fn relative_working_directory_is_resolved_against_worktree() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let (executor, _sub) = executor();
        let mut command = RunCommand::new("pwd > where.txt");
        command.working_directory = Some(PathBuf::from("sub"));

        executor
            .run(ScriptOwner::Session, "s", dir.path(), &[command])
            .await
            .unwrap();
        assert!(dir.path().join("sub/where.txt").exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_kills_backgrounded_children() {
        let dir = TempDir::new().unwrap();
        let (executor, _sub) = executor();
        let commands = vec![
            RunCommand::new("sleep 30 & echo $! > bg.pid; wait"),
            RunCommand::new("touch never.txt"),
        ];

        let runner = executor.clone();
        let path = dir.path().to_path_buf();
        let run = tokio::spawn(async move {
            runner
                .run(ScriptOwner::Session, "s1", &path, &commands)
                .await
        });

        let pid_file = dir.path().join("bg.pid");
        let deadline = Instant::now() + Duration::from_secs(10);
        while !pid_file.exists() || std::fs::read_to_string(&pid_file).unwrap().trim().is_empty() {
            assert!(Instant::now() < deadline, "background job never started");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let bg_pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();

        let stopped = executor.stop().await.unwrap();
        assert_eq!(stopped.id, "s1");

        let report = run.await.unwrap().unwrap();
        assert!(report.stopped);
        assert!(!dir.path().join("never.txt").exists());
        assert!(executor.tracker().current().await.is_none());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !process_is_gone(bg_pid) {
            assert!(Instant::now() < deadline, "background child {bg_pid} survived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[cfg(target_os = "linux")]
    async fn wait_for_pid_file(path: &Path) -> i32 {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Ok(contents) = std::fs::read_to_string(path)
                && let Ok(pid) = contents.trim().parse()
            {
                return pid;
            }
            assert!(Instant::now() < deadline, "background job never started");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn command_leaving_a_background_job_does_not_block_the_next() {
        let dir = TempDir::new().unwrap();
        let (executor, _sub) = executor();
        let commands = vec![
            RunCommand::new("sleep 30 & echo $! > bg.pid"),
            RunCommand::new("touch next.txt"),
        ];

        let report = tokio::time::timeout(
            Duration::from_secs(10),
            executor.run(ScriptOwner::Session, "s1", dir.path(), &commands),
        )
        .await
        .expect("run finished")
        .unwrap();
        assert_eq!(report.completed.len(), 2);
        assert!(dir.path().join("next.txt").exists());

        let bg_pid = wait_for_pid_file(&dir.path().join("bg.pid")).await;
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(bg_pid),
            nix::sys::signal::Signal::SIGKILL,
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_kills_jobs_left_behind_by_finished_commands() {
        let dir = TempDir::new().unwrap();
        let (executor, _sub) = executor();
        let commands = vec![
            RunCommand::new("sleep 30 & echo $! > bg.pid"),
            RunCommand::new("sleep 30"),
            RunCommand::new("touch never.txt"),
        ];

        let runner = executor.clone();
        let path = dir.path().to_path_buf();
        let run = tokio::spawn(async move {
            runner
                .run(ScriptOwner::Session, "s1", &path, &commands)
                .await
        });

        let bg_pid = wait_for_pid_file(&dir.path().join("bg.pid")).await;
        let deadline = Instant::now() + Duration::from_secs(10);
        while executor.with_active(|a| a.as_ref().map_or(0, |a| a.groups.len())) < 2 {
            assert!(Instant::now() < deadline, "second command never started");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        executor.stop().await.unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run finished after stop")
            .unwrap()
            .unwrap();
        assert!(report.stopped);
        assert_eq!(report.completed[0].exit_code, Some(0));
        assert!(!dir.path().join("never.txt").exists());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !process_is_gone(bg_pid) {
            assert!(Instant::now() < deadline, "background child {bg_pid} survived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn stop_without_active_run_is_none() {
        let (executor, _sub) = executor();
        assert!(executor.stop().await.is_none());
        assert!(!executor.is_active());
    }
}

use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use super::protocol::{StreamDecoder, StreamSignal};
use super::pty::{AgentLauncher, LaunchRequest};
use crate::domains::settings::AgentSettings;
use crate::errors::GroveError;
use crate::events::{AgentOutput, OutputKind, ProcessEvent};
use crate::infrastructure::events::{EventBus, EventSource};
use crate::shared::process::{ProcessExit, ProcessHandle, kill_process_tree};

const LAST_OUTPUT_LINES: usize = 20;

struct ManagedProcess {
    generation: u64,
    handle: Arc<dyn ProcessHandle>,
}

/// How to start the agent for one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnOptions {
    pub prompt: String,
    /// Agent conversation id to resume instead of starting fresh.
    pub resume_handle: Option<String>,
}

/// Owns at most one agent process per session and turns its output into
/// [`ProcessEvent`]s.
pub struct AgentProcessSupervisor {
    launcher: Arc<dyn AgentLauncher>,
    agent: AgentSettings,
    events: Arc<EventBus<ProcessEvent>>,
    processes: Arc<DashMap<String, ManagedProcess>>,
    next_generation: AtomicU64,
    source: EventSource,
}

impl AgentProcessSupervisor {
    pub fn new(
        launcher: Arc<dyn AgentLauncher>,
        agent: AgentSettings,
        events: Arc<EventBus<ProcessEvent>>,
    ) -> Self {
        Self {
            launcher,
            agent,
            events,
            processes: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
            source: EventSource::new("agent-supervisor"),
        }
    }

    pub fn events(&self) -> &Arc<EventBus<ProcessEvent>> {
        &self.events
    }

    fn build_request(&self, session_id: &str, worktree_path: &Path, options: &SpawnOptions) -> LaunchRequest {
        let mut args = self.agent.args.clone();
        if let Some(handle) = options.resume_handle.as_deref().filter(|h| !h.is_empty()) {
            args.push(self.agent.resume_flag.clone());
            args.push(handle.to_string());
        }
        if !options.prompt.is_empty() {
            if !self.agent.prompt_flag.is_empty() {
                args.push(self.agent.prompt_flag.clone());
            }
            args.push(options.prompt.clone());
        }

        LaunchRequest {
            session_id: session_id.to_string(),
            worktree_path: worktree_path.to_path_buf(),
            program: self.agent.command.clone(),
            args,
            env: self.agent.env.clone(),
        }
    }

    /// Starts the agent in `worktree_path`. An existing process for the session
    /// is killed first. Output handlers are attached before this returns.
    pub async fn spawn(
        &self,
        session_id: &str,
        worktree_path: &Path,
        options: SpawnOptions,
    ) -> Result<Option<u32>, GroveError> {
        if self.is_running(session_id) {
            warn!("Session {session_id} already has a running agent; replacing it");
            self.kill(session_id);
        }

        let request = self.build_request(session_id, worktree_path, &options);
        let launched = match self.launcher.launch(request).await {
            Ok(launched) => launched,
            Err(err) => {
                error!("Failed to start agent for session {session_id}: {err:#}");
                self.events.publish(
                    &self.source,
                    ProcessEvent::Error {
                        session_id: session_id.to_string(),
                        message: format!("{err:#}"),
                    },
                );
                return Err(GroveError::ProcessFailure {
                    session_id: session_id.to_string(),
                    exit_code: None,
                    signal: None,
                    last_output: vec![format!("{err:#}")],
                });
            }
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let pid = launched.handle.pid();
        self.processes.insert(
            session_id.to_string(),
            ManagedProcess {
                generation,
                handle: launched.handle.clone(),
            },
        );

        tokio::spawn(pump_output(
            session_id.to_string(),
            generation,
            launched.handle,
            launched.output,
            self.events.clone(),
            self.processes.clone(),
            self.source.clone(),
        ));

        self.events.publish(
            &self.source,
            ProcessEvent::Spawned {
                session_id: session_id.to_string(),
                pid,
            },
        );
        Ok(pid)
    }

    /// Writes `text` followed by a newline to the agent's terminal.
    pub fn send_input(&self, session_id: &str, text: &str) -> Result<(), GroveError> {
        let handle = self
            .live_handle(session_id)
            .ok_or_else(|| GroveError::ProcessNotFound {
                session_id: session_id.to_string(),
            })?;

        let mut payload = text.as_bytes().to_vec();
        if !text.ends_with('\n') {
            payload.push(b'\n');
        }
        handle.write(&payload).map_err(|err| {
            warn!("Failed to write to agent of session {session_id}: {err:#}");
            GroveError::ProcessNotFound {
                session_id: session_id.to_string(),
            }
        })
    }

    /// Kills the agent's process tree. A session without a process is a no-op.
    pub fn kill(&self, session_id: &str) -> bool {
        let Some((_, managed)) = self.processes.remove(session_id) else {
            debug!("No agent process for session {session_id}; nothing to kill");
            return false;
        };
        info!(
            "Killing agent for session {session_id} (pid {:?})",
            managed.handle.pid()
        );
        kill_process_tree(managed.handle.as_ref());
        true
    }

    fn live_handle(&self, session_id: &str) -> Option<Arc<dyn ProcessHandle>> {
        self.processes
            .get(session_id)
            .map(|entry| entry.handle.clone())
            .filter(|handle| !handle.has_exited())
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.live_handle(session_id).is_some()
    }

    pub fn pid(&self, session_id: &str) -> Option<u32> {
        self.live_handle(session_id).and_then(|h| h.pid())
    }

    pub fn running_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .processes
            .iter()
            .filter(|entry| !entry.handle.has_exited())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Kills every agent; used on shutdown.
    pub fn kill_all(&self) {
        for id in self.running_sessions() {
            self.kill(&id);
        }
    }
}

struct OutputTail {
    lines: VecDeque<String>,
}

impl OutputTail {
    fn new() -> Self {
        Self {
            lines: VecDeque::with_capacity(LAST_OUTPUT_LINES),
        }
    }

    fn push(&mut self, line: &str) {
        if self.lines.len() == LAST_OUTPUT_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    fn into_vec(self) -> Vec<String> {
        self.lines.into_iter().collect()
    }
}

fn publish_signals(
    session_id: &str,
    signals: Vec<StreamSignal>,
    tail: &mut OutputTail,
    events: &EventBus<ProcessEvent>,
    source: &EventSource,
) {
    for signal in signals {
        let event = match signal {
            StreamSignal::Output { kind, data } => {
                if kind != OutputKind::Json {
                    tail.push(&data);
                }
                ProcessEvent::Output(AgentOutput::new(session_id, kind, data))
            }
            StreamSignal::Initialized { agent_session_id } => ProcessEvent::AgentInitialized {
                session_id: session_id.to_string(),
                agent_session_id,
            },
            StreamSignal::TurnCompleted => ProcessEvent::TurnCompleted {
                session_id: session_id.to_string(),
            },
        };
        events.publish(source, event);
    }
}

async fn pump_output(
    session_id: String,
    generation: u64,
    handle: Arc<dyn ProcessHandle>,
    mut output: mpsc::UnboundedReceiver<Vec<u8>>,
    events: Arc<EventBus<ProcessEvent>>,
    processes: Arc<DashMap<String, ManagedProcess>>,
    source: EventSource,
) {
    let mut decoder = StreamDecoder::new();
    let mut tail = OutputTail::new();
    let mut exit_rx = handle.on_exit();

    // Reads until the stream closes or the process is known to be gone, in
    // which case whatever is already queued is still delivered.
    loop {
        if exit_rx.borrow_and_update().is_some() {
            while let Ok(chunk) = output.try_recv() {
                let signals = decoder.push(&chunk);
                publish_signals(&session_id, signals, &mut tail, &events, &source);
            }
            break;
        }
        tokio::select! {
            biased;
            chunk = output.recv() => match chunk {
                Some(chunk) => {
                    let signals = decoder.push(&chunk);
                    publish_signals(&session_id, signals, &mut tail, &events, &source);
                }
                None => break,
            },
            changed = exit_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    let rest = decoder.finish();
    publish_signals(&session_id, rest, &mut tail, &events, &source);

    let exit = loop {
        if let Some(exit) = exit_rx.borrow_and_update().clone() {
            break exit;
        }
        if exit_rx.changed().await.is_err() {
            break exit_rx.borrow().clone().unwrap_or_default();
        }
    };

    let last_output = tail.into_vec();
    log_exit(&session_id, &exit, &last_output);

    processes.remove_if(&session_id, |_, managed| managed.generation == generation);

    events.publish(
        &source,
        ProcessEvent::Exit {
            session_id,
            exit_code: exit.exit_code,
            signal: exit.signal,
            last_output,
        },
    );
}

fn log_exit(session_id: &str, exit: &ProcessExit, last_output: &[String]) {
    if exit.success() {
        info!("Agent for session {session_id} exited cleanly");
        return;
    }
    warn!(
        "Agent for session {session_id} exited with code {:?} (signal {:?}); last output:\n{}",
        exit.exit_code,
        exit.signal,
        last_output.join("\n")
    );
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::domains::agents::pty::LaunchedProcess;
    use crate::shared::process::test_support::FakeProcessHandle;
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// A launched fake: push output through `output`, finish with `handle.exit`.
    pub struct FakeAgent {
        pub request: LaunchRequest,
        pub handle: Arc<FakeProcessHandle>,
        pub output: mpsc::UnboundedSender<Vec<u8>>,
    }

    impl FakeAgent {
        pub fn emit(&self, line: &str) {
            let _ = self.output.send(format!("{line}\n").into_bytes());
        }

        /// Closes the output stream and reports `exit`.
        pub fn finish(self, exit: ProcessExit) -> Arc<FakeProcessHandle> {
            drop(self.output);
            self.handle.exit(exit);
            self.handle
        }
    }

    #[derive(Default)]
    pub struct FakeLauncher {
        pub launched: Mutex<Vec<FakeAgent>>,
        pub fail_next: Mutex<bool>,
        pub next_pid: Mutex<u32>,
    }

    impl FakeLauncher {
        pub fn take(&self) -> Option<FakeAgent> {
            let mut launched = self.launched.lock().unwrap();
            if launched.is_empty() {
                None
            } else {
                Some(launched.remove(0))
            }
        }

        pub fn launch_count(&self) -> usize {
            self.launched.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl AgentLauncher for FakeLauncher {
        async fn launch(&self, request: LaunchRequest) -> Result<LaunchedProcess> {
            if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
                return Err(anyhow!("command not found: {}", request.program));
            }
            let pid = {
                let mut next = self.next_pid.lock().unwrap();
                *next += 1;
                1000 + *next
            };
            let handle = Arc::new(FakeProcessHandle::new(pid));
            let (tx, rx) = mpsc::unbounded_channel();
            self.launched.lock().unwrap().push(FakeAgent {
                request,
                handle: handle.clone(),
                output: tx,
            });
            Ok(LaunchedProcess { handle, output: rx })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeLauncher;
    use super::*;
    use crate::infrastructure::events::Subscription;
    use std::path::PathBuf;
    use std::time::Duration;

    fn supervisor(launcher: Arc<FakeLauncher>) -> (AgentProcessSupervisor, Subscription<ProcessEvent>) {
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe();
        (
            AgentProcessSupervisor::new(launcher, AgentSettings::default(), bus),
            sub,
        )
    }

    async fn next_event(sub: &mut Subscription<ProcessEvent>) -> ProcessEvent {
        tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for event")
            .expect("bus closed")
    }

    async fn wait_for_exit_event(sub: &mut Subscription<ProcessEvent>) -> (Vec<ProcessEvent>, ProcessEvent) {
        let mut seen = Vec::new();
        loop {
            let event = next_event(sub).await;
            if matches!(event, ProcessEvent::Exit { .. }) {
                return (seen, event);
            }
            seen.push(event);
        }
    }

    #[tokio::test]
    async fn builds_command_line_from_settings() {
        let launcher = Arc::new(FakeLauncher::default());
        let (supervisor, _sub) = supervisor(launcher.clone());

        supervisor
            .spawn(
                "s1",
                &PathBuf::from("/tmp/wt"),
                SpawnOptions {
                    prompt: "add a README".into(),
                    resume_handle: Some("agent-1".into()),
                },
            )
            .await
            .unwrap();

        let agent = launcher.take().unwrap();
        assert_eq!(agent.request.program, "claude");
        assert_eq!(
            agent.request.args,
            vec![
                "--output-format",
                "stream-json",
                "--verbose",
                "--resume",
                "agent-1",
                "-p",
                "add a README"
            ]
        );
        assert_eq!(agent.request.worktree_path, PathBuf::from("/tmp/wt"));
    }

    #[tokio::test]
    async fn streams_lines_in_order_and_reports_exit() {
        let launcher = Arc::new(FakeLauncher::default());
        let (supervisor, mut sub) = supervisor(launcher.clone());
        supervisor
            .spawn("s1", Path::new("/tmp"), SpawnOptions::default())
            .await
            .unwrap();
        assert!(matches!(next_event(&mut sub).await, ProcessEvent::Spawned { .. }));
        assert!(supervisor.is_running("s1"));

        let agent = launcher.take().unwrap();
        agent.emit("plain one");
        let _ = agent.output.send(b"plain ".to_vec());
        let _ = agent.output.send(b"two\n{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"a1\"}\n".to_vec());
        let _ = agent.output.send(b"tail without newline".to_vec());
        agent.finish(ProcessExit::code(0));

        let (seen, exit) = wait_for_exit_event(&mut sub).await;
        let stdout: Vec<String> = seen
            .iter()
            .filter_map(|e| match e {
                ProcessEvent::Output(o) if o.kind == OutputKind::Stdout => Some(o.data.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            stdout,
            vec![
                "plain one",
                "plain two",
                "[system] session started (0 tools available)",
                "tail without newline"
            ]
        );
        assert!(seen.iter().any(|e| matches!(
            e,
            ProcessEvent::AgentInitialized { agent_session_id, .. } if agent_session_id == "a1"
        )));
        match exit {
            ProcessEvent::Exit { exit_code, .. } => assert_eq!(exit_code, Some(0)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!supervisor.is_running("s1"));
        assert!(supervisor.running_sessions().is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_carries_last_output() {
        let launcher = Arc::new(FakeLauncher::default());
        let (supervisor, mut sub) = supervisor(launcher.clone());
        supervisor
            .spawn("s1", Path::new("/tmp"), SpawnOptions::default())
            .await
            .unwrap();
        let agent = launcher.take().unwrap();
        for i in 0..25 {
            agent.emit(&format!("line {i}"));
        }
        agent.finish(ProcessExit::code(2));

        let (_, exit) = wait_for_exit_event(&mut sub).await;
        match exit {
            ProcessEvent::Exit {
                exit_code,
                last_output,
                ..
            } => {
                assert_eq!(exit_code, Some(2));
                assert_eq!(last_output.len(), LAST_OUTPUT_LINES);
                assert_eq!(last_output.first().map(String::as_str), Some("line 5"));
                assert_eq!(last_output.last().map(String::as_str), Some("line 24"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_input_requires_a_live_process() {
        let launcher = Arc::new(FakeLauncher::default());
        let (supervisor, _sub) = supervisor(launcher.clone());

        let err = supervisor.send_input("nobody", "hi").unwrap_err();
        assert!(matches!(err, GroveError::ProcessNotFound { .. }));

        supervisor
            .spawn("s1", Path::new("/tmp"), SpawnOptions::default())
            .await
            .unwrap();
        supervisor.send_input("s1", "hello").unwrap();
        let agent = launcher.take().unwrap();
        assert_eq!(agent.handle.written_text(), "hello\n");

        let handle = agent.finish(ProcessExit::code(0));
        assert!(handle.has_exited());
        let err = supervisor.send_input("s1", "again").unwrap_err();
        assert!(matches!(err, GroveError::ProcessNotFound { .. }));
    }

    #[tokio::test]
    async fn kill_is_idempotent_and_kills_the_group() {
        let launcher = Arc::new(FakeLauncher::default());
        let (supervisor, _sub) = supervisor(launcher.clone());
        assert!(!supervisor.kill("absent"));

        supervisor
            .spawn("s1", Path::new("/tmp"), SpawnOptions::default())
            .await
            .unwrap();
        let agent = launcher.take().unwrap();
        assert!(supervisor.kill("s1"));
        assert_eq!(*agent.handle.group_kills.lock().unwrap(), 1);
        assert!(!supervisor.kill("s1"));
        assert!(!supervisor.is_running("s1"));
    }

    #[tokio::test]
    async fn spawn_failure_emits_error_and_fails() {
        let launcher = Arc::new(FakeLauncher::default());
        *launcher.fail_next.lock().unwrap() = true;
        let (supervisor, mut sub) = supervisor(launcher.clone());

        let err = supervisor
            .spawn("s1", Path::new("/tmp"), SpawnOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GroveError::ProcessFailure { .. }));
        assert!(matches!(next_event(&mut sub).await, ProcessEvent::Error { .. }));
        assert!(!supervisor.is_running("s1"));
    }

    #[tokio::test]
    async fn respawn_does_not_lose_new_process_to_old_exit() {
        let launcher = Arc::new(FakeLauncher::default());
        let (supervisor, mut sub) = supervisor(launcher.clone());
        supervisor
            .spawn("s1", Path::new("/tmp"), SpawnOptions::default())
            .await
            .unwrap();
        supervisor
            .spawn("s1", Path::new("/tmp"), SpawnOptions::default())
            .await
            .unwrap();

        // The first process was killed on respawn; its exit must not evict the second.
        let _first = launcher.take().unwrap();
        let _ = wait_for_exit_event(&mut sub).await;
        assert!(supervisor.is_running("s1"));
        assert_eq!(supervisor.pid("s1"), Some(1002));
    }
}

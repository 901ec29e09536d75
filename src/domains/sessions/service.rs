use chrono::Utc;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::entity::{
    ConversationMessage, MessageRole, PromptMarker, Session, SessionOutput, SessionStatus,
    SessionUpdate,
};
use super::repository::SessionRepository;
use crate::domains::agents::supervisor::{AgentProcessSupervisor, SpawnOptions};
use crate::domains::execution::ExecutionTracker;
use crate::domains::git::worktrees::WorktreeManager;
use crate::domains::settings::GroveSettings;
use crate::errors::GroveError;
use crate::events::{EventHub, GitEvent, SessionEvent};
use crate::infrastructure::events::{EventBus, EventSource};
use crate::shared::naming::sanitize_or_default;

/// Bound on numeric-suffix retries when a session name is taken.
pub const MAX_NAME_ATTEMPTS: u32 = 10;

/// Drives sessions through their lifecycle and keeps the persisted state in
/// step with the agent process and the worktree.
pub struct SessionLifecycleManager {
    pub(super) repository: Arc<dyn SessionRepository>,
    pub(super) worktrees: Arc<WorktreeManager>,
    pub(super) supervisor: Arc<AgentProcessSupervisor>,
    pub(super) executions: Arc<ExecutionTracker>,
    pub(super) session_events: Arc<EventBus<SessionEvent>>,
    pub(super) git_events: Arc<EventBus<GitEvent>>,
    pub(super) main_branch: String,
    pub(super) history_limit: usize,
    pub(super) source: EventSource,
    /// Serialises lifecycle actions and event handling per session.
    pub(super) locks: DashMap<String, Arc<Mutex<()>>>,
    /// Reconciliations touching main run one at a time.
    pub(super) main_lock: Mutex<()>,
    /// Plain-text line counter per session, used as a marker's `output_line`.
    pub(super) stdout_lines: DashMap<String, i64>,
}

impl SessionLifecycleManager {
    pub fn new(
        repository: Arc<dyn SessionRepository>,
        worktrees: Arc<WorktreeManager>,
        supervisor: Arc<AgentProcessSupervisor>,
        executions: Arc<ExecutionTracker>,
        events: &EventHub,
        settings: &GroveSettings,
    ) -> Self {
        Self {
            repository,
            worktrees,
            supervisor,
            executions,
            session_events: events.session.clone(),
            git_events: events.git.clone(),
            main_branch: settings.main_branch.clone(),
            history_limit: settings.history_limit,
            source: EventSource::new("session-lifecycle"),
            locks: DashMap::new(),
            main_lock: Mutex::new(()),
            stdout_lines: DashMap::new(),
        }
    }

    pub fn supervisor(&self) -> &Arc<AgentProcessSupervisor> {
        &self.supervisor
    }

    pub fn executions(&self) -> &Arc<ExecutionTracker> {
        &self.executions
    }

    pub fn worktrees(&self) -> &Arc<WorktreeManager> {
        &self.worktrees
    }

    pub(super) fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    pub(super) fn publish(&self, event: SessionEvent) {
        self.session_events.publish(&self.source, event);
    }

    pub(super) fn require_session(&self, session_id: &str) -> Result<Session, GroveError> {
        self.repository
            .get_session(session_id)
            .map_err(|e| GroveError::from_session_lookup(session_id, e))?
            .ok_or_else(|| GroveError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    pub(super) fn require_live_session(&self, session_id: &str) -> Result<Session, GroveError> {
        let session = self.require_session(session_id)?;
        if session.archived {
            return Err(GroveError::InvalidSessionState {
                session_id: session_id.to_string(),
                current_state: "archived".to_string(),
                expected_state: "live".to_string(),
            });
        }
        Ok(session)
    }

    /// Applies `update` and announces a status change when there is one.
    pub(super) fn apply_update(
        &self,
        session_id: &str,
        update: SessionUpdate,
    ) -> Result<Session, GroveError> {
        let before = self.require_session(session_id)?.status;
        let updated = self
            .repository
            .update_session(session_id, &update)
            .map_err(|e| GroveError::from_session_lookup(session_id, e))?;
        if updated.status != before {
            info!(
                "Session {session_id}: {} -> {}",
                before.as_str(),
                updated.status.as_str()
            );
            self.publish(SessionEvent::StatusChanged {
                session_id: session_id.to_string(),
                status: updated.status,
            });
        }
        Ok(updated)
    }

    /// Creates a session named after `name`, or after the prompt when no
    /// name is given, and starts its agent.
    pub async fn create(&self, name: Option<&str>, prompt: &str) -> Result<Session, GroveError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(GroveError::invalid_input("prompt", "Prompt cannot be empty"));
        }
        let base = sanitize_or_default(name.filter(|n| !n.trim().is_empty()).unwrap_or(prompt));
        self.create_from_base(&base, prompt).await
    }

    /// `count` sessions for the same prompt, named `name-1 .. name-count`.
    pub async fn create_batch(
        &self,
        name: Option<&str>,
        prompt: &str,
        count: usize,
    ) -> Result<Vec<Session>, GroveError> {
        match count {
            0 => Err(GroveError::invalid_input("count", "Count must be at least 1")),
            1 => Ok(vec![self.create(name, prompt).await?]),
            _ => {
                let prompt = prompt.trim();
                if prompt.is_empty() {
                    return Err(GroveError::invalid_input("prompt", "Prompt cannot be empty"));
                }
                let base =
                    sanitize_or_default(name.filter(|n| !n.trim().is_empty()).unwrap_or(prompt));
                let mut sessions = Vec::with_capacity(count);
                for version in 1..=count {
                    let session = self
                        .create_from_base(&format!("{base}-{version}"), prompt)
                        .await?;
                    sessions.push(session);
                }
                Ok(sessions)
            }
        }
    }

    async fn create_from_base(&self, base: &str, prompt: &str) -> Result<Session, GroveError> {
        let (name, worktree_path) = self.allocate_worktree(base).await?;
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            name: name.clone(),
            worktree_name: name.clone(),
            worktree_path,
            branch: self.worktrees.branch_name(&name),
            initial_prompt: Some(prompt.to_string()),
            status: SessionStatus::Pending,
            pid: None,
            last_exit_code: None,
            resume_handle: None,
            created_at: now,
            updated_at: now,
            last_viewed_at: None,
            archived: false,
        };

        if let Err(e) = self.repository.create_session(&session) {
            error!("Failed to persist session '{name}': {e:#}");
            if let Err(cleanup) = self.worktrees.remove_worktree_at(&session.worktree_path).await {
                warn!("Failed to remove worktree of unsaved session '{name}': {cleanup}");
            }
            return Err(GroveError::database(format!("{e:#}")));
        }
        info!(
            "Created session '{name}' ({}) at {}",
            session.id,
            session.worktree_path.display()
        );
        self.publish(SessionEvent::Added {
            session: session.clone(),
        });

        self.repository
            .add_conversation_message(&session.id, MessageRole::User, prompt)
            .map_err(GroveError::database)?;
        let marker = self
            .repository
            .add_prompt_marker(&session.id, prompt, 0, None)
            .map_err(GroveError::database)?;
        self.publish(SessionEvent::PromptMarked {
            session_id: session.id.clone(),
            marker_id: marker.id,
            output_index: marker.output_index,
        });

        let lock = self.session_lock(&session.id);
        let _guard = lock.lock().await;
        self.start_turn(&session, prompt, Some(marker.id), None).await
    }

    /// Finds a free worktree name starting at `base`, adding `-2`, `-3`, ...
    /// while the name is taken.
    async fn allocate_worktree(&self, base: &str) -> Result<(String, PathBuf), GroveError> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let candidate = if attempt == 0 {
                base.to_string()
            } else {
                format!("{base}-{}", attempt + 1)
            };

            let taken = self
                .repository
                .session_name_exists(&candidate)
                .map_err(GroveError::database)?;
            if taken {
                debug!("Session name '{candidate}' is taken");
                continue;
            }

            match self.worktrees.create_worktree(&candidate).await {
                Ok(path) => return Ok((candidate, path)),
                Err(err) if is_name_collision(&err) => {
                    warn!("Worktree '{candidate}' collides with an existing one: {err}");
                }
                Err(err) => return Err(err),
            }
        }

        Err(GroveError::NameCollision {
            name: base.to_string(),
            attempts: MAX_NAME_ATTEMPTS,
        })
    }

    /// Starts execution tracking and the agent. On spawn failure the
    /// execution is discarded and the session is marked failed; its
    /// worktree is kept.
    async fn start_turn(
        &self,
        session: &Session,
        prompt: &str,
        marker_id: Option<i64>,
        resume_handle: Option<String>,
    ) -> Result<Session, GroveError> {
        self.executions
            .start_execution(&session.id, &session.worktree_path, marker_id)
            .await?;

        let spawned = self
            .supervisor
            .spawn(
                &session.id,
                &session.worktree_path,
                SpawnOptions {
                    prompt: prompt.to_string(),
                    resume_handle,
                },
            )
            .await;

        match spawned {
            Ok(pid) => self.apply_update(
                &session.id,
                SessionUpdate {
                    status: Some(SessionStatus::Running),
                    pid: Some(pid),
                    ..Default::default()
                },
            ),
            Err(err) => {
                self.executions.cancel_execution(&session.id);
                if let Err(update_err) = self.apply_update(
                    &session.id,
                    SessionUpdate {
                        status: Some(SessionStatus::Failed),
                        pid: Some(None),
                        ..Default::default()
                    },
                ) {
                    warn!(
                        "Failed to mark session {} as failed: {update_err}",
                        session.id
                    );
                }
                Err(err)
            }
        }
    }

    /// Sends a follow-up message. A session whose agent is gone is resumed
    /// with a fresh process.
    pub async fn continue_session(
        &self,
        session_id: &str,
        message: &str,
    ) -> Result<Session, GroveError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(GroveError::invalid_input("message", "Message cannot be empty"));
        }
        let session = self.require_live_session(session_id)?;
        if !session.status.accepts_input() {
            return Err(GroveError::InvalidSessionState {
                session_id: session_id.to_string(),
                current_state: session.status.as_str().to_string(),
                expected_state: "running, waiting or stopped".to_string(),
            });
        }
        if !session.worktree_path.exists() {
            return Err(GroveError::WorktreeNotFound {
                path: session.worktree_path.display().to_string(),
            });
        }

        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        self.repository
            .add_conversation_message(session_id, MessageRole::User, message)
            .map_err(GroveError::database)?;
        let output_index = self
            .repository
            .session_output_count(session_id)
            .map_err(GroveError::database)?;
        let marker = self
            .repository
            .add_prompt_marker(session_id, message, output_index, None)
            .map_err(GroveError::database)?;
        self.publish(SessionEvent::PromptMarked {
            session_id: session_id.to_string(),
            marker_id: marker.id,
            output_index,
        });

        if self.executions.is_tracking(session_id)
            && let Err(e) = self.executions.end_execution(session_id).await
        {
            warn!("Failed to close previous execution of {session_id}: {e}");
        }

        if !self.supervisor.is_running(session_id) {
            info!("Resuming agent for session {session_id}");
            return self
                .start_turn(&session, message, Some(marker.id), session.resume_handle.clone())
                .await;
        }

        self.executions
            .start_execution(session_id, &session.worktree_path, Some(marker.id))
            .await?;
        if let Err(err) = self.supervisor.send_input(session_id, message) {
            self.executions.cancel_execution(session_id);
            return Err(err);
        }
        self.apply_update(
            session_id,
            SessionUpdate {
                status: Some(SessionStatus::Running),
                pid: Some(self.supervisor.pid(session_id)),
                ..Default::default()
            },
        )
    }

    /// Kills the agent and marks the session stopped. Stopping a session
    /// without a live process only updates its status.
    pub async fn stop(&self, session_id: &str) -> Result<Session, GroveError> {
        self.require_live_session(session_id)?;
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        if !self.supervisor.kill(session_id) {
            debug!("Session {session_id} had no agent process to stop");
        }
        self.executions.cancel_execution(session_id);
        self.apply_update(
            session_id,
            SessionUpdate {
                status: Some(SessionStatus::Stopped),
                pid: Some(None),
                ..Default::default()
            },
        )
    }

    pub fn get_session(&self, session_id: &str) -> Result<Session, GroveError> {
        self.require_session(session_id)
    }

    pub fn list_sessions(&self, include_archived: bool) -> Result<Vec<Session>, GroveError> {
        self.repository
            .get_all_sessions(include_archived)
            .map_err(GroveError::database)
    }

    pub fn mark_viewed(&self, session_id: &str) -> Result<(), GroveError> {
        self.repository
            .touch_last_viewed(session_id, Utc::now())
            .map_err(|e| GroveError::from_session_lookup(session_id, e))
    }

    pub fn get_outputs(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SessionOutput>, GroveError> {
        self.repository
            .get_session_outputs(session_id, limit)
            .map_err(GroveError::database)
    }

    pub fn get_prompt_markers(&self, session_id: &str) -> Result<Vec<PromptMarker>, GroveError> {
        self.repository
            .get_prompt_markers(session_id)
            .map_err(GroveError::database)
    }

    pub fn get_conversation(
        &self,
        session_id: &str,
    ) -> Result<Vec<ConversationMessage>, GroveError> {
        self.repository
            .get_conversation_messages(session_id)
            .map_err(GroveError::database)
    }

    /// Kills every agent process; sessions keep their persisted status.
    pub fn shutdown(&self) {
        let running = self.supervisor.running_sessions();
        if !running.is_empty() {
            info!("Stopping {} agent process(es) on shutdown", running.len());
        }
        self.supervisor.kill_all();
    }
}

fn is_name_collision(err: &GroveError) -> bool {
    let text = match err {
        GroveError::GitCommandFailed { output, .. } => output,
        GroveError::GitOperationFailed { message, .. } => message,
        _ => return false,
    };
    let lowered = text.to_lowercase();
    lowered.contains("already exists")
        || lowered.contains("already checked out")
        || lowered.contains("is already used by worktree")
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::domains::agents::supervisor::test_support::FakeLauncher;
    use crate::domains::git::command::test_support::init_repo;
    use crate::domains::git::diff::GitDiffManager;
    use crate::domains::git::worktrees::WorktreeLayout;
    use crate::domains::sessions::repository::InMemorySessionRepository;
    use crate::events::ProcessEvent;
    use crate::infrastructure::events::Subscription;
    use std::time::Duration;
    use tempfile::TempDir;

    pub struct Harness {
        pub _dir: TempDir,
        pub project: PathBuf,
        pub repository: Arc<InMemorySessionRepository>,
        pub launcher: Arc<FakeLauncher>,
        pub manager: Arc<SessionLifecycleManager>,
        pub events: EventHub,
        pub process_events: Subscription<ProcessEvent>,
    }

    pub fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("project");
        init_repo(&project);

        let settings = GroveSettings::default();
        let events = EventHub::new();
        let repository = Arc::new(InMemorySessionRepository::new());
        let launcher = Arc::new(FakeLauncher::default());
        let supervisor = Arc::new(AgentProcessSupervisor::new(
            launcher.clone(),
            settings.agent.clone(),
            events.process.clone(),
        ));
        let executions = Arc::new(ExecutionTracker::new(
            repository.clone(),
            GitDiffManager::default(),
            events.execution.clone(),
        ));
        let worktrees = Arc::new(WorktreeManager::new(
            project.clone(),
            WorktreeLayout::default(),
        ));
        let process_events = events.process.subscribe();
        let manager = Arc::new(SessionLifecycleManager::new(
            repository.clone(),
            worktrees,
            supervisor,
            executions,
            &events,
            &settings,
        ));

        Harness {
            _dir: dir,
            project,
            repository,
            launcher,
            manager,
            events,
            process_events,
        }
    }

    impl Harness {
        /// Feeds queued process events to the manager until `done` holds.
        pub async fn pump_until(&mut self, mut done: impl FnMut(&ProcessEvent) -> bool) {
            loop {
                let event = tokio::time::timeout(Duration::from_secs(10), self.process_events.recv())
                    .await
                    .expect("timed out waiting for process event")
                    .expect("process event stream closed");
                let stop = done(&event);
                self.manager.handle_process_event(event).await;
                if stop {
                    return;
                }
            }
        }
    }
}

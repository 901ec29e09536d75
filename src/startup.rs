//! Wires the orchestration layer together. Every component receives its
//! collaborators through its constructor; nothing here is global.

use anyhow::{Context, Result};
use git2::Repository;
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::domains::agents::pty::{AgentLauncher, PtyLauncher};
use crate::domains::agents::supervisor::AgentProcessSupervisor;
use crate::domains::execution::ExecutionTracker;
use crate::domains::git::diff::GitDiffManager;
use crate::domains::git::worktrees::{WorktreeLayout, WorktreeManager};
use crate::domains::scripts::{RunCommandExecutor, RunReport, RunningScript, ScriptExecutionTracker, ScriptOwner};
use crate::domains::sessions::repository::{InMemorySessionRepository, SessionRepository};
use crate::domains::sessions::service::SessionLifecycleManager;
use crate::domains::settings::GroveSettings;
use crate::errors::GroveError;
use crate::events::EventHub;
use crate::infrastructure::database::Database;

pub const PROJECT_PATH_ENV: &str = "GROVE_PROJECT_PATH";

/// The project to orchestrate: an explicit path, then `GROVE_PROJECT_PATH`,
/// then the repository containing the current directory.
pub fn resolve_project_directory(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(resolve_env_project_path)
        .or_else(resolve_repo_from_cwd)
}

fn resolve_env_project_path() -> Option<PathBuf> {
    let value = std::env::var_os(PROJECT_PATH_ENV)?;
    if value.is_empty() {
        return None;
    }
    let candidate = PathBuf::from(value);
    candidate.exists().then_some(candidate)
}

fn resolve_repo_from_cwd() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    Repository::discover(&cwd)
        .ok()
        .and_then(|repo| repo.workdir().map(Path::to_path_buf))
}

/// Where session state lives.
#[derive(Debug, Clone, Default)]
pub enum Storage {
    /// Nothing survives the process.
    InMemory,
    /// SQLite in the per-user data directory.
    #[default]
    Sqlite,
    SqliteAt(PathBuf),
}

impl Storage {
    fn open(&self) -> Result<Arc<dyn SessionRepository>> {
        Ok(match self {
            Storage::InMemory => Arc::new(InMemorySessionRepository::new()),
            Storage::Sqlite => Arc::new(Database::new(None)?),
            Storage::SqliteAt(path) => Arc::new(Database::new(Some(path.clone()))?),
        })
    }
}

pub struct Orchestrator {
    settings: GroveSettings,
    events: EventHub,
    sessions: Arc<SessionLifecycleManager>,
    scripts: Arc<RunCommandExecutor>,
    event_loop: JoinHandle<()>,
}

impl Orchestrator {
    /// Builds every component for `project_path` with a PTY-backed agent
    /// launcher. Must be called inside a tokio runtime.
    pub fn start(project_path: &Path, settings: GroveSettings, storage: &Storage) -> Result<Self> {
        let repository = storage
            .open()
            .with_context(|| format!("Failed to open session storage ({storage:?})"))?;
        Ok(Self::with_components(
            project_path,
            settings,
            repository,
            Arc::new(PtyLauncher::new()),
        ))
    }

    pub fn with_components(
        project_path: &Path,
        settings: GroveSettings,
        repository: Arc<dyn SessionRepository>,
        launcher: Arc<dyn AgentLauncher>,
    ) -> Self {
        let events = EventHub::new();
        let timeout = settings.git_timeout();

        let worktrees = Arc::new(
            WorktreeManager::new(
                project_path.to_path_buf(),
                WorktreeLayout {
                    worktrees_dir: settings.worktrees_dir.clone(),
                    branch_prefix: settings.branch_prefix.clone(),
                    remote_name: settings.remote_name.clone(),
                },
            )
            .with_timeout(timeout),
        );
        let supervisor = Arc::new(AgentProcessSupervisor::new(
            launcher,
            settings.agent.clone(),
            events.process.clone(),
        ));
        let executions = Arc::new(ExecutionTracker::new(
            repository.clone(),
            GitDiffManager::new(timeout),
            events.execution.clone(),
        ));
        let sessions = Arc::new(SessionLifecycleManager::new(
            repository,
            worktrees,
            supervisor,
            executions,
            &events,
            &settings,
        ));
        let scripts = Arc::new(RunCommandExecutor::new(Arc::new(ScriptExecutionTracker::new(
            events.script.clone(),
        ))));
        let event_loop = sessions.spawn_event_loop();

        info!("Orchestrator ready for {}", project_path.display());
        Self {
            settings,
            events,
            sessions,
            scripts,
            event_loop,
        }
    }

    pub fn settings(&self) -> &GroveSettings {
        &self.settings
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn sessions(&self) -> &Arc<SessionLifecycleManager> {
        &self.sessions
    }

    pub fn scripts(&self) -> &Arc<RunCommandExecutor> {
        &self.scripts
    }

    /// Runs the configured run commands in the session's worktree.
    pub async fn run_session_commands(&self, session_id: &str) -> Result<RunReport, GroveError> {
        let session = self.sessions.get_session(session_id)?;
        self.scripts
            .run(
                ScriptOwner::Session,
                session_id,
                &session.worktree_path,
                &self.settings.run_commands,
            )
            .await
    }

    /// Runs the configured run commands in the project checkout.
    pub async fn run_project_commands(&self) -> Result<RunReport, GroveError> {
        let project = self.sessions.worktrees().project_path().to_path_buf();
        self.scripts
            .run(
                ScriptOwner::Project,
                &project.display().to_string(),
                &project,
                &self.settings.run_commands,
            )
            .await
    }

    pub async fn stop_run_commands(&self) -> Option<RunningScript> {
        self.scripts.stop().await
    }

    /// Stops run commands and agents. Persisted session state is untouched.
    pub async fn shutdown(self) {
        self.scripts.stop().await;
        self.sessions.shutdown();
        self.event_loop.abort();
        info!("Orchestrator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::agents::supervisor::test_support::FakeLauncher;
    use crate::domains::git::command::test_support::init_repo;
    use crate::domains::sessions::entity::SessionStatus;
    use crate::domains::settings::RunCommand;
    use serial_test::serial;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn explicit_directory_wins() {
        let explicit = Path::new("/projects/alpha");
        assert_eq!(
            resolve_project_directory(Some(explicit)),
            Some(explicit.to_path_buf())
        );
    }

    #[test]
    #[serial]
    fn env_directory_is_used_when_it_exists() {
        let dir = TempDir::new().unwrap();
        unsafe { std::env::set_var(PROJECT_PATH_ENV, dir.path()) };
        let resolved = resolve_project_directory(None);
        unsafe { std::env::remove_var(PROJECT_PATH_ENV) };
        assert_eq!(resolved, Some(dir.path().to_path_buf()));
    }

    #[test]
    #[serial]
    fn missing_env_directory_is_ignored() {
        unsafe { std::env::set_var(PROJECT_PATH_ENV, "/definitely/not/here") };
        let resolved = resolve_project_directory(None);
        unsafe { std::env::remove_var(PROJECT_PATH_ENV) };
        assert_ne!(resolved, Some(PathBuf::from("/definitely/not/here")));
    }

    #[tokio::test]
    async fn sqlite_orchestrator_runs_session_commands_in_worktree() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("project");
        init_repo(&project);

        let mut settings = GroveSettings::default();
        settings.run_commands = vec![RunCommand::new("pwd > where.txt")];
        let repository = Arc::new(Database::new(Some(dir.path().join("grove.db"))).unwrap());
        let launcher = Arc::new(FakeLauncher::default());
        let orchestrator =
            Orchestrator::with_components(&project, settings, repository, launcher.clone());

        let session = orchestrator.sessions().create(None, "build it").await.unwrap();
        assert_eq!(session.status, SessionStatus::Running);

        let report = orchestrator.run_session_commands(&session.id).await.unwrap();
        assert_eq!(report.completed.len(), 1);
        let recorded = std::fs::read_to_string(session.worktree_path.join("where.txt")).unwrap();
        assert_eq!(
            Path::new(recorded.trim()).canonicalize().unwrap(),
            session.worktree_path.canonicalize().unwrap()
        );

        let agent = launcher.take().unwrap();
        agent.emit(r#"{"type":"result","subtype":"success","is_error":false}"#);
        let mut status = SessionStatus::Running;
        for _ in 0..100 {
            status = orchestrator.sessions().get_session(&session.id).unwrap().status;
            if status == SessionStatus::Waiting {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, SessionStatus::Waiting);

        orchestrator.shutdown().await;
    }
}

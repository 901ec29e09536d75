use log::{info, warn};
use std::future::Future;

use crate::domains::git::diff::CombinedDiff;
use crate::domains::git::history::CommitHistory;
use crate::domains::merge::types::{CommitSummary, ConflictCheck, GitOperationReport};
use crate::domains::sessions::entity::{Session, SessionStatus, SessionUpdate};
use crate::domains::sessions::service::SessionLifecycleManager;
use crate::errors::GroveError;
use crate::events::GitEvent;

fn render_commits(commits: &[CommitSummary]) -> Vec<String> {
    commits
        .iter()
        .map(|c| format!("{} {}", c.short_hash, c.subject))
        .collect()
}

impl SessionLifecycleManager {
    fn require_worktree(&self, session_id: &str) -> Result<Session, GroveError> {
        let session = self.require_live_session(session_id)?;
        if !session.worktree_path.exists() {
            return Err(GroveError::WorktreeNotFound {
                path: session.worktree_path.display().to_string(),
            });
        }
        Ok(session)
    }

    /// Publishes start/completion/failure around one git operation.
    async fn tracked<F>(
        &self,
        session_id: &str,
        operation: &str,
        run: F,
    ) -> Result<GitOperationReport, GroveError>
    where
        F: Future<Output = Result<GitOperationReport, GroveError>>,
    {
        self.git_events.publish(
            &self.source,
            GitEvent::OperationStarted {
                session_id: session_id.to_string(),
                operation: operation.to_string(),
            },
        );
        match run.await {
            Ok(report) => {
                self.git_events.publish(
                    &self.source,
                    GitEvent::OperationCompleted {
                        session_id: session_id.to_string(),
                        operation: operation.to_string(),
                        commands: report.commands.clone(),
                    },
                );
                Ok(report)
            }
            Err(error) => {
                warn!("{operation} for session {session_id} failed: {error}");
                self.git_events.publish(
                    &self.source,
                    GitEvent::OperationFailed {
                        session_id: session_id.to_string(),
                        operation: operation.to_string(),
                        error: error.clone(),
                    },
                );
                Err(error)
            }
        }
    }

    pub async fn check_rebase_conflicts(&self, session_id: &str) -> Result<ConflictCheck, GroveError> {
        let session = self.require_worktree(session_id)?;
        self.worktrees
            .check_for_rebase_conflicts(&session.worktree_path, &self.main_branch)
            .await
    }

    /// Rebases the session branch onto main. A predicted conflict is
    /// reported without touching the worktree.
    pub async fn rebase_session(&self, session_id: &str) -> Result<GitOperationReport, GroveError> {
        let session = self.require_worktree(session_id)?;
        let _main = self.main_lock.lock().await;
        let main_branch = self.main_branch.clone();

        self.tracked(session_id, "rebase", async {
            let check = self
                .worktrees
                .check_for_rebase_conflicts(&session.worktree_path, &main_branch)
                .await?;
            if check.has_conflicts {
                let files = check.conflicting_files.unwrap_or_default();
                let commits = check.conflicting_commits.unwrap_or_default();
                return Err(GroveError::MergeConflict {
                    output: format!(
                        "Rebasing '{}' onto '{main_branch}' would conflict in: {}. Nothing was changed.",
                        session.branch,
                        files.join(", ")
                    ),
                    files,
                    ours: render_commits(&commits.ours),
                    theirs: render_commits(&commits.theirs),
                    commands: vec![format!("git rebase {main_branch}")],
                });
            }
            self.worktrees
                .rebase_main_into_worktree(&session.worktree_path, &main_branch)
                .await
        })
        .await
    }

    /// Merges the session branch into main and completes the session.
    pub async fn merge_session(&self, session_id: &str) -> Result<GitOperationReport, GroveError> {
        let session = self.require_worktree(session_id)?;
        let _main = self.main_lock.lock().await;
        let report = self
            .tracked(
                session_id,
                "merge",
                self.worktrees.merge_worktree_to_main(
                    self.worktrees.project_path(),
                    &session.worktree_path,
                    &self.main_branch,
                ),
            )
            .await?;
        self.complete(session_id).await?;
        Ok(report)
    }

    /// Squashes the session branch into one commit on main and completes the
    /// session.
    pub async fn squash_merge_session(
        &self,
        session_id: &str,
        commit_message: &str,
    ) -> Result<GitOperationReport, GroveError> {
        let session = self.require_worktree(session_id)?;
        let _main = self.main_lock.lock().await;
        let report = self
            .tracked(
                session_id,
                "squash_merge",
                self.worktrees.squash_and_merge_worktree_to_main(
                    self.worktrees.project_path(),
                    &session.worktree_path,
                    &self.main_branch,
                    commit_message,
                ),
            )
            .await?;
        self.complete(session_id).await?;
        Ok(report)
    }

    async fn complete(&self, session_id: &str) -> Result<Session, GroveError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;
        if self.supervisor.kill(session_id) {
            info!("Stopped agent of {session_id} after its branch reached main");
        }
        self.executions.cancel_execution(session_id);
        self.apply_update(
            session_id,
            SessionUpdate {
                status: Some(SessionStatus::Completed),
                pid: Some(None),
                ..Default::default()
            },
        )
    }

    pub async fn commit_history(&self, session_id: &str) -> Result<CommitHistory, GroveError> {
        let session = self.require_worktree(session_id)?;
        self.worktrees
            .get_commit_history(&session.worktree_path, &self.main_branch, self.history_limit)
            .await
    }

    /// The union of the session's recorded execution diffs, optionally
    /// restricted to `execution_ids`.
    pub fn combined_diff(
        &self,
        session_id: &str,
        execution_ids: Option<&[i64]>,
    ) -> Result<CombinedDiff, GroveError> {
        self.require_session(session_id)?;
        self.executions.get_combined_diff(session_id, execution_ids)
    }
}

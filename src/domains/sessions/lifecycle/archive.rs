use log::{info, warn};
use serde::Serialize;

use crate::domains::sessions::entity::{SessionStatus, SessionUpdate};
use crate::domains::sessions::service::SessionLifecycleManager;
use crate::errors::GroveError;
use crate::events::SessionEvent;

/// What archiving actually managed to clean up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveReport {
    pub session_id: String,
    pub process_killed: bool,
    pub worktree_removed: bool,
    pub errors: Vec<String>,
}

impl SessionLifecycleManager {
    /// Archives a session. Cleanup is best effort: failures are collected in
    /// the report and the session is archived regardless. Archiving an
    /// archived session is a no-op.
    pub async fn archive(&self, session_id: &str) -> Result<ArchiveReport, GroveError> {
        let session = self.require_session(session_id)?;
        let mut report = ArchiveReport {
            session_id: session_id.to_string(),
            ..Default::default()
        };
        if session.archived {
            info!("Session {session_id} is already archived");
            return Ok(report);
        }

        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        report.process_killed = self.supervisor.kill(session_id);
        if self.executions.cancel_execution(session_id) {
            info!("Discarded in-flight execution of {session_id} on archive");
        }

        if !session.status.is_terminal()
            && let Err(e) = self.apply_update(
                session_id,
                SessionUpdate {
                    status: Some(SessionStatus::Stopped),
                    pid: Some(None),
                    ..Default::default()
                },
            )
        {
            report.errors.push(format!("Status update failed: {e}"));
        }

        match self.worktrees.remove_worktree_at(&session.worktree_path).await {
            Ok(()) => report.worktree_removed = true,
            Err(e) => {
                warn!(
                    "Failed to remove worktree {} of {session_id}: {e}",
                    session.worktree_path.display()
                );
                report.errors.push(format!("Worktree removal failed: {e}"));
            }
        }

        self.repository
            .archive_session(session_id)
            .map_err(|e| GroveError::from_session_lookup(session_id, e))?;
        self.stdout_lines.remove(session_id);

        info!(
            "Archived session '{}' ({} cleanup error(s))",
            session.name,
            report.errors.len()
        );
        self.publish(SessionEvent::Archived {
            session_id: session_id.to_string(),
            errors: report.errors.clone(),
        });
        Ok(report)
    }
}

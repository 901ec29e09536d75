use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::domains::git::diff::{
    CapturedDiff, CombinedDiff, DiffStats, GitDiffManager, subtract_unchanged,
};
use crate::domains::sessions::entity::{ExecutionDiff, NewExecutionDiff};
use crate::domains::sessions::repository::SessionRepository;
use crate::errors::GroveError;
use crate::events::ExecutionEvent;
use crate::infrastructure::events::{EventBus, EventSource};

/// An agent turn between `start_execution` and `end_execution`.
#[derive(Debug, Clone)]
struct InFlight {
    worktree_path: PathBuf,
    prompt_marker_id: Option<i64>,
    sequence: i64,
    base_commit: Option<String>,
    before: Option<CapturedDiff>,
    started_at: DateTime<Utc>,
}

/// Brackets one agent turn with before/after snapshots and persists the net
/// change. Assumes a single writer per session.
pub struct ExecutionTracker {
    repository: Arc<dyn SessionRepository>,
    diff: GitDiffManager,
    events: Arc<EventBus<ExecutionEvent>>,
    source: EventSource,
    active: Mutex<HashMap<String, InFlight>>,
}

impl ExecutionTracker {
    pub fn new(
        repository: Arc<dyn SessionRepository>,
        diff: GitDiffManager,
        events: Arc<EventBus<ExecutionEvent>>,
    ) -> Self {
        Self {
            repository,
            diff,
            events,
            source: EventSource::new("execution-tracker"),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn events(&self) -> &Arc<EventBus<ExecutionEvent>> {
        &self.events
    }

    fn with_active<T>(&self, f: impl FnOnce(&mut HashMap<String, InFlight>) -> T) -> T {
        match self.active.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn is_tracking(&self, session_id: &str) -> bool {
        self.with_active(|active| active.contains_key(session_id))
    }

    pub fn current_sequence(&self, session_id: &str) -> Option<i64> {
        self.with_active(|active| active.get(session_id).map(|e| e.sequence))
    }

    /// Allocates the next sequence for the session and snapshots any
    /// uncommitted work already present in the worktree.
    pub async fn start_execution(
        &self,
        session_id: &str,
        worktree_path: &Path,
        prompt_marker_id: Option<i64>,
    ) -> Result<i64, GroveError> {
        if let Some(previous) = self.with_active(|active| active.remove(session_id)) {
            warn!(
                "Execution #{} for session {session_id} was still in flight; discarding it",
                previous.sequence
            );
        }

        let sequence = self
            .repository
            .get_next_execution_sequence(session_id)
            .map_err(|e| GroveError::from_session_lookup(session_id, e))?;
        let base_commit = self.diff.head_commit(worktree_path).await;

        let before = if self.diff.has_changes(worktree_path).await? {
            let snapshot = self.diff.capture_working_directory_diff(worktree_path).await?;
            debug!(
                "Session {session_id} starts execution #{sequence} with {} pre-existing changed file(s)",
                snapshot.changed_files.len()
            );
            Some(snapshot)
        } else {
            None
        };

        self.with_active(|active| {
            active.insert(
                session_id.to_string(),
                InFlight {
                    worktree_path: worktree_path.to_path_buf(),
                    prompt_marker_id,
                    sequence,
                    base_commit,
                    before,
                    started_at: Utc::now(),
                },
            )
        });

        info!("Execution #{sequence} started for session {session_id}");
        self.events.publish(
            &self.source,
            ExecutionEvent::Started {
                session_id: session_id.to_string(),
                execution_sequence: sequence,
            },
        );
        Ok(sequence)
    }

    /// Captures the after snapshot and persists an `ExecutionDiff` when the
    /// turn changed at least one file. The in-flight entry is cleared even
    /// when capturing or persisting fails.
    pub async fn end_execution(
        &self,
        session_id: &str,
    ) -> Result<Option<ExecutionDiff>, GroveError> {
        let execution = self
            .with_active(|active| active.remove(session_id))
            .ok_or_else(|| GroveError::ExecutionNotFound {
                session_id: session_id.to_string(),
            })?;

        let net = self.capture_net_change(&execution).await?;
        let elapsed = Utc::now() - execution.started_at;

        if net.stats.files_changed == 0 {
            info!(
                "Execution #{} for session {session_id} finished in {}ms without file changes",
                execution.sequence,
                elapsed.num_milliseconds()
            );
            self.publish_completed(session_id, execution.sequence, DiffStats::default(), false);
            return Ok(None);
        }

        let stats = net.stats;
        let record = self
            .repository
            .create_execution_diff(NewExecutionDiff {
                session_id: session_id.to_string(),
                prompt_marker_id: execution.prompt_marker_id,
                execution_sequence: execution.sequence,
                diff: net.diff,
                changed_files: net.changed_files,
                stats,
                before_hash: net.before_hash,
                after_hash: net.after_hash,
            })
            .map_err(GroveError::database)?;

        info!(
            "Execution #{} for session {session_id} changed {} file(s) (+{} -{})",
            execution.sequence, stats.files_changed, stats.additions, stats.deletions
        );
        self.publish_completed(session_id, execution.sequence, stats, true);
        Ok(Some(record))
    }

    async fn capture_net_change(&self, execution: &InFlight) -> Result<CapturedDiff, GroveError> {
        let after = match execution.base_commit.as_deref() {
            Some(base) => {
                self.diff
                    .capture_working_directory_diff_since(&execution.worktree_path, base)
                    .await?
            }
            None => {
                self.diff
                    .capture_working_directory_diff(&execution.worktree_path)
                    .await?
            }
        };

        Ok(match execution.before.as_ref() {
            Some(before) => subtract_unchanged(before, &after),
            None => after,
        })
    }

    fn publish_completed(&self, session_id: &str, sequence: i64, stats: DiffStats, persisted: bool) {
        self.events.publish(
            &self.source,
            ExecutionEvent::Completed {
                session_id: session_id.to_string(),
                execution_sequence: sequence,
                stats,
                persisted,
            },
        );
    }

    /// Drops the in-flight entry without persisting anything.
    pub fn cancel_execution(&self, session_id: &str) -> bool {
        let Some(execution) = self.with_active(|active| active.remove(session_id)) else {
            return false;
        };
        info!(
            "Execution #{} for session {session_id} cancelled",
            execution.sequence
        );
        self.events.publish(
            &self.source,
            ExecutionEvent::Cancelled {
                session_id: session_id.to_string(),
                execution_sequence: execution.sequence,
            },
        );
        true
    }

    /// Persisted diffs of the session, optionally restricted to the given
    /// record ids, merged in sequence order.
    pub fn get_combined_diff(
        &self,
        session_id: &str,
        execution_ids: Option<&[i64]>,
    ) -> Result<CombinedDiff, GroveError> {
        let mut diffs = self
            .repository
            .get_execution_diffs(session_id)
            .map_err(|e| GroveError::from_session_lookup(session_id, e))?;
        if let Some(ids) = execution_ids {
            diffs.retain(|d| ids.contains(&d.id));
        }
        diffs.sort_by_key(|d| d.execution_sequence);

        let captured: Vec<CapturedDiff> = diffs.iter().map(ExecutionDiff::to_captured).collect();
        Ok(self.diff.combine_diffs(&captured))
    }
}

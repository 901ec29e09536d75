use log::{debug, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::domains::sessions::entity::{MessageRole, Session, SessionStatus, SessionUpdate};
use crate::domains::sessions::prompt_markers::{
    PromptText, extract_prompt_text, is_duplicate_of_last,
};
use crate::domains::sessions::service::SessionLifecycleManager;
use crate::events::{AgentOutput, OutputKind, ProcessEvent, SessionEvent};

const ASSISTANT_PREFIX: &str = "[assistant] ";

impl SessionLifecycleManager {
    /// Feeds supervisor events into [`Self::handle_process_event`] in arrival
    /// order. The subscription exists once this returns.
    pub fn spawn_event_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.supervisor.events().subscribe_as(self.source.clone());
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                manager.handle_process_event(event).await;
            }
            debug!("Process event stream closed; lifecycle event loop exiting");
        })
    }

    pub async fn handle_process_event(&self, event: ProcessEvent) {
        let lock = self.session_lock(event.session_id());
        let _guard = lock.lock().await;

        match event {
            ProcessEvent::Spawned { session_id, pid } => {
                debug!("Agent for {session_id} spawned with pid {pid:?}");
            }
            ProcessEvent::Output(output) => self.ingest_output(output),
            ProcessEvent::AgentInitialized {
                session_id,
                agent_session_id,
            } => {
                debug!("Session {session_id} agent conversation id: {agent_session_id}");
                if let Err(e) = self.repository.update_session(
                    &session_id,
                    &SessionUpdate {
                        resume_handle: Some(Some(agent_session_id)),
                        ..Default::default()
                    },
                ) {
                    warn!("Failed to store resume handle for {session_id}: {e:#}");
                }
            }
            ProcessEvent::TurnCompleted { session_id } => {
                let Some(session) = self.live_session(&session_id) else {
                    return;
                };
                if session.status != SessionStatus::Running {
                    debug!(
                        "Turn completed for {session_id} while {}; ignoring",
                        session.status.as_str()
                    );
                    return;
                }
                self.finish_execution(&session_id).await;
                self.update_quietly(&session_id, SessionUpdate::status(SessionStatus::Waiting));
            }
            ProcessEvent::Error { session_id, message } => {
                warn!("Agent error for session {session_id}: {message}");
            }
            ProcessEvent::Exit {
                session_id,
                exit_code,
                signal,
                last_output,
            } => {
                // A replacement process already owns the session.
                if self.supervisor.is_running(&session_id) {
                    debug!("Ignoring exit of a replaced agent for {session_id}");
                    return;
                }
                let Some(session) = self.live_session(&session_id) else {
                    return;
                };
                if session.status.is_terminal() {
                    debug!(
                        "Agent for {session_id} exited after the session became {}",
                        session.status.as_str()
                    );
                    self.executions.cancel_execution(&session_id);
                    return;
                }

                let status = if exit_code == Some(0) {
                    self.finish_execution(&session_id).await;
                    SessionStatus::Waiting
                } else {
                    self.executions.cancel_execution(&session_id);
                    info!(
                        "Session {session_id} agent failed (code {exit_code:?}, signal {signal:?}, {} trailing line(s))",
                        last_output.len()
                    );
                    SessionStatus::Failed
                };
                self.update_quietly(
                    &session_id,
                    SessionUpdate {
                        status: Some(status),
                        pid: Some(None),
                        last_exit_code: Some(exit_code),
                        ..Default::default()
                    },
                );
            }
        }
    }

    fn live_session(&self, session_id: &str) -> Option<Session> {
        match self.repository.get_session(session_id) {
            Ok(Some(session)) if !session.archived => Some(session),
            Ok(_) => {
                debug!("Dropping process event for unknown or archived session {session_id}");
                None
            }
            Err(e) => {
                warn!("Failed to load session {session_id}: {e:#}");
                None
            }
        }
    }

    async fn finish_execution(&self, session_id: &str) {
        if !self.executions.is_tracking(session_id) {
            return;
        }
        match self.executions.end_execution(session_id).await {
            Ok(Some(diff)) => debug!(
                "Execution {} of {session_id} changed {} file(s)",
                diff.execution_sequence,
                diff.changed_files.len()
            ),
            Ok(None) => debug!("Execution of {session_id} left no changes"),
            Err(e) => warn!("Failed to capture execution diff for {session_id}: {e}"),
        }
    }

    fn update_quietly(&self, session_id: &str, update: SessionUpdate) {
        if let Err(e) = self.apply_update(session_id, update) {
            warn!("Failed to update session {session_id}: {e}");
        }
    }

    /// Appends the output record, then mines plain-text lines for echoed
    /// prompts. Mining never affects whether the output is stored.
    fn ingest_output(&self, output: AgentOutput) {
        let session_id = output.session_id.as_str();
        let index = match self
            .repository
            .add_session_output(session_id, output.kind.as_str(), &output.data)
        {
            Ok(index) => index,
            Err(e) => {
                warn!("Dropping output for session {session_id}: {e:#}");
                return;
            }
        };

        if output.kind != OutputKind::Stdout {
            return;
        }

        if let Some(reply) = output.data.strip_prefix(ASSISTANT_PREFIX)
            && let Err(e) =
                self.repository
                    .add_conversation_message(session_id, MessageRole::Assistant, reply)
        {
            warn!("Failed to record assistant message for {session_id}: {e:#}");
        }

        for line in output.data.lines() {
            let line_number = {
                let mut counter = self.stdout_lines.entry(session_id.to_string()).or_insert(0);
                let current = *counter;
                *counter += 1;
                current
            };
            let Some(text) = extract_prompt_text(line) else {
                continue;
            };
            self.record_mined_prompt(session_id, &text, index, line_number);
        }
    }

    fn record_mined_prompt(
        &self,
        session_id: &str,
        text: &PromptText,
        output_index: i64,
        output_line: i64,
    ) {
        let markers = match self.repository.get_prompt_markers(session_id) {
            Ok(markers) => markers,
            Err(e) => {
                warn!("Skipping prompt mining for {session_id}: {e:#}");
                return;
            }
        };
        if is_duplicate_of_last(&markers, text) {
            return;
        }
        match self
            .repository
            .add_prompt_marker(session_id, text.as_str(), output_index, Some(output_line))
        {
            Ok(marker) => self.publish(SessionEvent::PromptMarked {
                session_id: session_id.to_string(),
                marker_id: marker.id,
                output_index,
            }),
            Err(e) => warn!("Failed to store mined prompt for {session_id}: {e:#}"),
        }
    }
}

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::events::ScriptEvent;
use crate::infrastructure::events::{EventBus, EventSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptOwner {
    Session,
    Project,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningScript {
    #[serde(rename = "type")]
    pub kind: ScriptOwner,
    pub id: String,
    pub started_at: DateTime<Utc>,
}

impl RunningScript {
    pub fn new(kind: ScriptOwner, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            started_at: Utc::now(),
        }
    }

    pub fn is(&self, kind: ScriptOwner, id: &str) -> bool {
        self.kind == kind && self.id == id
    }
}

#[derive(Debug, Default)]
struct Slot {
    running: Option<RunningScript>,
    closing: Option<RunningScript>,
}

/// Bookkeeping for the single script allowed to run at a time. The tracker
/// records and announces; it never preempts a running script itself.
pub struct ScriptExecutionTracker {
    slot: RwLock<Slot>,
    events: Arc<EventBus<ScriptEvent>>,
    source: EventSource,
}

impl ScriptExecutionTracker {
    pub fn new(events: Arc<EventBus<ScriptEvent>>) -> Self {
        Self {
            slot: RwLock::new(Slot::default()),
            events,
            source: EventSource::new("script-tracker"),
        }
    }

    pub fn events(&self) -> &Arc<EventBus<ScriptEvent>> {
        &self.events
    }

    /// Records `kind/id` as the running script. Whatever was recorded before is
    /// replaced with a warning; callers are expected to stop it first.
    pub async fn start(&self, kind: ScriptOwner, id: &str) -> RunningScript {
        let script = RunningScript::new(kind, id);
        {
            let mut slot = self.slot.write().await;
            if let Some(previous) = slot.running.as_ref() {
                warn!(
                    "Starting script {kind:?}/{id} while {:?}/{} is still running",
                    previous.kind, previous.id
                );
            }
            slot.running = Some(script.clone());
            if slot.closing.as_ref().is_some_and(|c| c.is(kind, id)) {
                slot.closing = None;
            }
        }
        info!("Script {kind:?}/{id} started");
        self.events.publish(
            &self.source,
            ScriptEvent::Started {
                script: script.clone(),
            },
        );
        script
    }

    /// Stop was requested but the process may still be shutting down.
    pub async fn mark_closing(&self, kind: ScriptOwner, id: &str) -> Option<RunningScript> {
        let script = {
            let mut slot = self.slot.write().await;
            let script = slot.running.as_ref().filter(|r| r.is(kind, id)).cloned()?;
            slot.closing = Some(script.clone());
            script
        };
        debug!("Script {kind:?}/{id} closing");
        self.events.publish(
            &self.source,
            ScriptEvent::Closing {
                script: script.clone(),
            },
        );
        Some(script)
    }

    /// The process is fully gone. Stopping a script that is not the recorded
    /// one leaves the slot untouched.
    pub async fn stop(&self, kind: ScriptOwner, id: &str) -> Option<RunningScript> {
        let script = {
            let mut slot = self.slot.write().await;
            if slot.closing.as_ref().is_some_and(|c| c.is(kind, id)) {
                slot.closing = None;
            }
            match slot.running.as_ref() {
                Some(running) if running.is(kind, id) => slot.running.take(),
                _ => None,
            }
        }?;
        info!("Script {kind:?}/{id} stopped");
        self.events.publish(
            &self.source,
            ScriptEvent::Stopped {
                script: script.clone(),
            },
        );
        Some(script)
    }

    pub async fn current(&self) -> Option<RunningScript> {
        self.slot.read().await.running.clone()
    }

    pub async fn closing(&self) -> Option<RunningScript> {
        self.slot.read().await.closing.clone()
    }

    pub async fn is_running(&self, kind: ScriptOwner, id: &str) -> bool {
        self.slot
            .read()
            .await
            .running
            .as_ref()
            .is_some_and(|r| r.is(kind, id))
    }

    pub async fn is_closing(&self, kind: ScriptOwner, id: &str) -> bool {
        self.slot
            .read()
            .await
            .closing
            .as_ref()
            .is_some_and(|r| r.is(kind, id))
    }
}

//! Typed publish/subscribe channels.
//!
//! Every event category gets its own [`EventBus`]. Subscribers register an
//! optional [`EventSource`]; a publisher never receives its own events back.

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventSource(String);

impl EventSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct Subscriber<E> {
    id: u64,
    source: Option<EventSource>,
    sender: mpsc::UnboundedSender<E>,
}

pub struct EventBus<E> {
    subscribers: Mutex<Vec<Subscriber<E>>>,
    next_id: AtomicU64,
}

impl<E> Default for EventBus<E>
where
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventBus<E>
where
    E: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe without a source identity; receives everything.
    pub fn subscribe(&self) -> Subscription<E> {
        self.register(None)
    }

    /// Subscribe as `source`; events published by the same source are filtered out.
    pub fn subscribe_as(&self, source: EventSource) -> Subscription<E> {
        self.register(Some(source))
    }

    fn register(&self, source: Option<EventSource>) -> Subscription<E> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(Subscriber { id, source, sender }),
            Err(poisoned) => poisoned
                .into_inner()
                .push(Subscriber { id, source, sender }),
        }
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.retain(|sub| sub.id != id);
    }

    /// Returns how many subscribers the event was delivered to.
    pub fn publish(&self, source: &EventSource, event: E) -> usize {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        subscribers.retain(|sub| !sub.sender.is_closed());

        let mut delivered = 0;
        for sub in subscribers.iter() {
            if sub.source.as_ref() == Some(source) {
                continue;
            }
            if sub.sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }

        if delivered == 0 {
            log::trace!("Event from '{source}' had no eligible subscribers");
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.lock() {
            Ok(guard) => guard.iter().filter(|s| !s.sender.is_closed()).count(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .filter(|s| !s.sender.is_closed())
                .count(),
        }
    }
}

pub struct Subscription<E> {
    id: u64,
    receiver: mpsc::UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<E> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.receiver.try_recv().ok()
    }

    /// Drains everything currently queued.
    pub fn drain(&mut self) -> Vec<E> {
        let mut out = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            out.push(event);
        }
        out
    }
}

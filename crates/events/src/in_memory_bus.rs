//! In-memory event bus for tests/dev.

use std::sync::{Mutex, mpsc};

use thiserror::Error;

use crate::bus::{EventBus, Subscription};
use crate::envelope::EventEnvelope;

#[derive(Debug, Error)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("in-memory bus lock poisoned")]
    Poisoned,
}

#[derive(Debug)]
struct Subscriber<P> {
    /// `None` receives every topic.
    topic: Option<String>,
    sender: mpsc::Sender<EventEnvelope<P>>,
}

impl<P> Subscriber<P> {
    fn accepts(&self, topic: &str) -> bool {
        self.topic.as_deref().is_none_or(|t| t == topic)
    }
}

/// In-memory, topic-routed pub/sub bus.
///
/// - No IO, no async
/// - Fan-out to every subscriber whose topic matches
/// - Subscribers that hung up are dropped on the next matching publish
#[derive(Debug)]
pub struct InMemoryEventBus<P> {
    subscribers: Mutex<Vec<Subscriber<P>>>,
}

impl<P> InMemoryEventBus<P> {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, topic: Option<String>) -> Subscription<EventEnvelope<P>> {
        let (sender, receiver) = mpsc::channel();

        // A poisoned lock still yields a subscription; it just never receives.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(Subscriber { topic, sender });
        }

        Subscription::new(receiver)
    }
}

impl<P> Default for InMemoryEventBus<P> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<P> EventBus<EventEnvelope<P>> for InMemoryEventBus<P>
where
    P: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: EventEnvelope<P>) -> Result<(), Self::Error> {
        let mut subs = self.subscribers.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        subs.retain(|sub| {
            if !sub.accepts(message.topic()) {
                return true;
            }
            sub.sender.send(message.clone()).is_ok()
        });

        Ok(())
    }

    fn subscribe(&self) -> Subscription<EventEnvelope<P>> {
        self.register(None)
    }

    fn subscribe_topic(&self, topic: &str) -> Subscription<EventEnvelope<P>> {
        self.register(Some(topic.to_string()))
    }
}

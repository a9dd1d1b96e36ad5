//! Redis pub/sub-backed event bus (optional).
//!
//! Each topic maps to the channel `{prefix}{topic}`. Pub/sub is not durable:
//! subscribers that are offline miss messages. Durability comes from the ledger
//! outbox, which republishes anything not acknowledged by a successful publish.
//!
//! Publishing uses one cached blocking connection, reopened after any error. The
//! outbox relay calls [`EventBus::publish`] from a blocking task, never directly on
//! a runtime worker.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;

use redis::Commands;
use serde_json::Value as JsonValue;
use thiserror::Error;

use smfg_events::{EventBus, EventEnvelope, Subscription};

#[derive(Debug, Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Redis pub/sub bus for JSON event envelopes.
#[derive(Clone)]
pub struct RedisPubSubEventBus {
    client: redis::Client,
    channel_prefix: String,
    publisher: Arc<Mutex<Option<redis::Connection>>>,
}

impl fmt::Debug for RedisPubSubEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisPubSubEventBus")
            .field("client", &self.client)
            .field("channel_prefix", &self.channel_prefix)
            .finish_non_exhaustive()
    }
}

enum Channel {
    Exact(String),
    Pattern(String),
}

impl RedisPubSubEventBus {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())?;
        Ok(Self {
            client,
            channel_prefix: String::new(),
            publisher: Arc::new(Mutex::new(None)),
        })
    }

    /// Namespace every channel, e.g. `"smfg:"`.
    pub fn with_channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = prefix.into();
        self
    }

    pub fn channel_for(&self, topic: &str) -> String {
        format!("{}{}", self.channel_prefix, topic)
    }

    /// Round-trip a `PING` on the publishing connection; used by startup retry.
    pub fn ping(&self) -> Result<(), RedisBusError> {
        self.with_publisher(|conn| redis::cmd("PING").query::<String>(conn).map(|_| ()))
    }

    /// Run `f` on the cached publishing connection, opening it if needed.
    ///
    /// A failed command drops the connection so the next call reconnects.
    fn with_publisher<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, RedisBusError> {
        let mut slot = self.publisher.lock().unwrap_or_else(PoisonError::into_inner);
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.client.get_connection()?,
        };
        let result = f(&mut conn);
        if result.is_ok() {
            *slot = Some(conn);
        }
        result.map_err(RedisBusError::from)
    }

    fn listen(&self, channel: Channel) -> Subscription<EventEnvelope<JsonValue>> {
        let (tx, rx) = mpsc::channel();
        let client = self.client.clone();

        // Background thread that receives pub/sub messages and forwards them.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, "redis subscriber could not connect");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            let subscribed = match &channel {
                Channel::Exact(name) => pubsub.subscribe(name),
                Channel::Pattern(pattern) => pubsub.psubscribe(pattern),
            };
            if let Err(e) = subscribed {
                tracing::warn!(error = %e, "redis subscribe failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(_) => return,
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let envelope: EventEnvelope<JsonValue> = match serde_json::from_str(&payload) {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping undecodable pub/sub message");
                        continue;
                    }
                };

                if tx.send(envelope).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}

impl EventBus<EventEnvelope<JsonValue>> for RedisPubSubEventBus {
    type Error = RedisBusError;

    fn publish(&self, message: EventEnvelope<JsonValue>) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&message)?;
        let channel = self.channel_for(message.topic());
        self.with_publisher(|conn| conn.publish::<_, _, i64>(channel, payload).map(|_| ()))
    }

    fn subscribe(&self) -> Subscription<EventEnvelope<JsonValue>> {
        self.listen(Channel::Pattern(format!("{}*", self.channel_prefix)))
    }

    fn subscribe_topic(&self, topic: &str) -> Subscription<EventEnvelope<JsonValue>> {
        self.listen(Channel::Exact(self.channel_for(topic)))
    }
}

//! Transactional outbox and its relay.
//!
//! Engine steps enqueue [`OutboxEvent`]s in the same ledger transaction as the
//! state change they describe. The [`OutboxRelay`] publishes committed rows to an
//! [`EventBus`] afterwards and marks them published.
//!
//! Delivery is at-least-once: a crash between publish and commit republishes the
//! same `event_id` on the next drain.
//!
//! Bus publishes are synchronous and may block on the broker, so each batch is
//! published from `spawn_blocking`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use smfg_events::{Event, EventBus, EventEnvelope};
use smfg_inventory::InventoryEvent;

use crate::ledger::{LedgerError, LedgerStore, LedgerTx};

/// Default page size for one relay claim.
pub const DEFAULT_RELAY_BATCH: u32 = 100;

/// Topic names the two logical event streams publish to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// Inventory-changed events (payload: full product).
    pub inventory: String,
    /// Reservation-filled events (payload: full closed reservation).
    pub reservation: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            inventory: "inventory.product".to_string(),
            reservation: "inventory.reservation".to_string(),
        }
    }
}

impl Topics {
    pub fn for_event(&self, event: &InventoryEvent) -> &str {
        match event {
            InventoryEvent::InventoryChanged(_) => &self.inventory,
            InventoryEvent::ReservationFilled(_) => &self.reservation,
        }
    }
}

/// A committed-or-staged event awaiting publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub topic: String,
    pub key: String,
    pub event_type: String,
    pub payload: JsonValue,
    pub occurred_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Build the outbox row for `event`.
    ///
    /// The payload is the bare entity (product or reservation), not the event wrapper.
    pub fn record(event: &InventoryEvent, topics: &Topics) -> Result<Self, serde_json::Error> {
        let payload = match event {
            InventoryEvent::InventoryChanged(e) => serde_json::to_value(&e.product)?,
            InventoryEvent::ReservationFilled(e) => serde_json::to_value(&e.reservation)?,
        };

        Ok(Self {
            id: Uuid::now_v7(),
            topic: topics.for_event(event).to_string(),
            key: event.key().to_string(),
            event_type: event.event_type().to_string(),
            payload,
            occurred_at: event.occurred_at(),
        })
    }

    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.id,
            self.topic.clone(),
            self.key.clone(),
            self.event_type.clone(),
            self.occurred_at,
            self.payload.clone(),
        )
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("publish failed for event {event_id}: {message}")]
    Publish { event_id: Uuid, message: String },
}

/// Moves committed outbox rows onto the event bus.
pub struct OutboxRelay<S, B> {
    store: Arc<S>,
    bus: Arc<B>,
    batch_size: u32,
}

impl<S, B> OutboxRelay<S, B>
where
    S: LedgerStore,
    B: EventBus<EventEnvelope<JsonValue>> + 'static,
{
    pub fn new(store: Arc<S>, bus: B) -> Self {
        Self {
            store,
            bus: Arc::new(bus),
            batch_size: DEFAULT_RELAY_BATCH,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Publish every pending outbox row; returns how many were published.
    ///
    /// Each batch is one transaction: claim, publish, mark, commit. A publish
    /// failure rolls the batch back so its rows stay pending.
    pub async fn drain(&self) -> Result<usize, RelayError> {
        let mut published = 0;

        loop {
            let mut tx = self.store.begin().await?;
            let batch = tx.claim_outbox(self.batch_size).await?;
            if batch.is_empty() {
                tx.commit().await?;
                return Ok(published);
            }

            let claimed = batch.len();
            let first_id = batch[0].id;
            let envelopes: Vec<_> = batch.iter().map(OutboxEvent::to_envelope).collect();
            let bus = self.bus.clone();
            let outcome = tokio::task::spawn_blocking(move || publish_batch(&*bus, envelopes))
                .await
                .unwrap_or_else(|join| {
                    Err(RelayError::Publish {
                        event_id: first_id,
                        message: format!("publish task failed: {join}"),
                    })
                });

            let ids = match outcome {
                Ok(ids) => ids,
                Err(e) => {
                    if let Err(rb) = tx.rollback().await {
                        tracing::warn!(error = %rb, "outbox rollback failed after publish error");
                    }
                    return Err(e);
                }
            };

            tx.mark_published(&ids).await?;
            tx.commit().await?;
            published += ids.len();
            tracing::debug!(count = ids.len(), "outbox batch published");

            if claimed < self.batch_size as usize {
                return Ok(published);
            }
        }
    }

    /// [`drain`](Self::drain), logging instead of returning failures.
    pub async fn drain_logged(&self) -> usize {
        match self.drain().await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "outbox drain failed; rows remain pending");
                0
            }
        }
    }
}

/// Publish `envelopes` in order, stopping at the first failure.
fn publish_batch<B>(bus: &B, envelopes: Vec<EventEnvelope<JsonValue>>) -> Result<Vec<Uuid>, RelayError>
where
    B: EventBus<EventEnvelope<JsonValue>>,
{
    let mut ids = Vec::with_capacity(envelopes.len());
    for envelope in envelopes {
        let event_id = envelope.event_id();
        bus.publish(envelope).map_err(|e| RelayError::Publish {
            event_id,
            message: e.to_string(),
        })?;
        ids.push(event_id);
    }
    Ok(ids)
}

/// Handle to a background relay task.
#[derive(Debug)]
pub struct RelayHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl RelayHandle {
    /// Request graceful shutdown and wait for the relay to stop.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.join.await;
    }
}

impl<S, B> OutboxRelay<S, B>
where
    S: LedgerStore,
    B: EventBus<EventEnvelope<JsonValue>> + 'static,
{
    /// Drain every `interval` until shut down. Picks up rows left pending by a
    /// failed post-commit drain.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> RelayHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_ms = interval.as_millis() as u64, "outbox relay started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        self.drain_logged().await;
                    }
                }
            }

            tracing::info!("outbox relay stopped");
        });

        RelayHandle {
            shutdown: Some(shutdown_tx),
            join,
        }
    }
}

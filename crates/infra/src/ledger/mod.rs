//! Ledger Store port: transactional storage for products, production events,
//! reservations, and the event outbox.
//!
//! The ledger is passive storage. Business rules live in `smfg-inventory` and are
//! orchestrated by the [`AllocationEngine`](crate::engine::AllocationEngine).
//!
//! Lookups return `Ok(None)` for absence. `Err` is reserved for genuine failures, so
//! "no prior record for this request id" can never be mistaken for a storage error.

mod in_memory;
mod postgres;

pub use in_memory::{InMemoryLedgerStore, InMemoryLedgerTx};
pub use postgres::{PostgresLedgerStore, PostgresLedgerTx};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use smfg_core::Page;
use smfg_inventory::{Product, ProductionEvent, Reservation, ReserveState};

use crate::outbox::OutboxEvent;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// A concurrent writer won (duplicate request id, serialization failure, deadlock).
    /// Safe to retry the whole transaction.
    #[error("ledger conflict: {0}")]
    Conflict(String),

    /// Any other storage failure.
    #[error("ledger storage failure in {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },
}

impl LedgerError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn storage(operation: &'static str, message: impl core::fmt::Display) -> Self {
        Self::Storage {
            operation,
            message: message.to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict(_))
    }
}

/// Non-transactional reads plus the transaction factory.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    type Tx: LedgerTx;

    async fn begin(&self) -> Result<Self::Tx, LedgerError>;

    async fn get_product(&self, sku: &str) -> Result<Option<Product>, LedgerError>;

    /// Products ordered by `sku` ascending.
    async fn get_all_products(&self, page: Page) -> Result<Vec<Product>, LedgerError>;

    async fn get_reservation_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<Reservation>, LedgerError>;

    /// Reservations for `sku` in `state`, oldest `created` first (ties by `id`).
    async fn get_sku_reservations_by_state(
        &self,
        sku: &str,
        state: ReserveState,
        page: Page,
    ) -> Result<Vec<Reservation>, LedgerError>;
}

/// One unit of work against the ledger.
///
/// Writes become visible to other transactions only on [`commit`](LedgerTx::commit).
/// Dropping a transaction without committing discards it and releases its locks.
#[async_trait]
pub trait LedgerTx: Send + Sized {
    /// Read a product and hold an exclusive lock on its SKU until commit/rollback.
    async fn lock_product(&mut self, sku: &str) -> Result<Option<Product>, LedgerError>;

    /// Upsert keyed by `sku`.
    async fn save_product(&mut self, product: &Product) -> Result<(), LedgerError>;

    /// Insert-only; `Ok(false)` when the sku already exists, leaving it untouched.
    async fn insert_product(&mut self, product: &Product) -> Result<bool, LedgerError>;

    async fn get_production_event_by_request_id(
        &mut self,
        request_id: &str,
    ) -> Result<Option<ProductionEvent>, LedgerError>;

    /// Insert-only; assigns `event.id`.
    async fn save_production_event(&mut self, event: &mut ProductionEvent) -> Result<(), LedgerError>;

    async fn get_reservation_by_request_id(
        &mut self,
        request_id: &str,
    ) -> Result<Option<Reservation>, LedgerError>;

    /// Insert-only; assigns `reservation.id`.
    async fn save_reservation(&mut self, reservation: &mut Reservation) -> Result<(), LedgerError>;

    async fn update_reservation(
        &mut self,
        id: i64,
        state: ReserveState,
        reserved_quantity: i64,
    ) -> Result<(), LedgerError>;

    /// Stage an event for publication once this transaction commits.
    async fn enqueue(&mut self, event: OutboxEvent) -> Result<(), LedgerError>;

    /// Claim up to `limit` unpublished outbox events, oldest first.
    ///
    /// Claimed rows are invisible to other claimers until this transaction ends.
    async fn claim_outbox(&mut self, limit: u32) -> Result<Vec<OutboxEvent>, LedgerError>;

    async fn mark_published(&mut self, ids: &[Uuid]) -> Result<(), LedgerError>;

    async fn commit(self) -> Result<(), LedgerError>;

    async fn rollback(self) -> Result<(), LedgerError>;
}

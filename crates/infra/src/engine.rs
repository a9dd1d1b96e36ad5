//! Allocation engine: idempotent production/reservation intake and the FIFO
//! fulfillment sweep.
//!
//! Every engine step is one ledger transaction that starts by locking the product
//! row, so read-modify-write cycles on a SKU never interleave. Events are written
//! to the outbox inside that transaction and published by the [`OutboxRelay`]
//! after commit.
//!
//! Sweep failures never undo the intake that triggered them: [`produce`] and
//! [`reserve`] report them in [`SweepOutcome::Aborted`] alongside the committed
//! result.
//!
//! [`produce`]: AllocationEngine::produce
//! [`reserve`]: AllocationEngine::reserve

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::instrument;

use smfg_core::{DomainError, Page};
use smfg_events::{EventBus, EventEnvelope};
use smfg_inventory::{
    Allocation, InventoryEvent, Product, ProductionEvent, ProductionRequest, Reservation,
    ReservationRequest, ReserveState,
};

use crate::ledger::{LedgerError, LedgerStore, LedgerTx};
use crate::outbox::{OutboxEvent, OutboxRelay, Topics};
use crate::retry::{RetryPolicy, retry_async};

/// Default number of open reservations fetched per sweep page.
pub const DEFAULT_SWEEP_BATCH_SIZE: u32 = 50;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sweep_batch_size: u32,
    /// Applied to each transaction that fails with a ledger conflict.
    pub conflict_retry: RetryPolicy,
    pub topics: Topics,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            conflict_retry: RetryPolicy::default(),
            topics: Topics::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("product {sku} not found")]
    NotFound { sku: String },

    #[error("product {sku} already exists")]
    AlreadyExists { sku: String },

    /// A concurrent writer won and retries were exhausted.
    #[error("concurrent update conflict: {0}")]
    Concurrency(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("{step} failed (sku {sku}, request {request_id}): {source}")]
    Storage {
        step: &'static str,
        sku: String,
        request_id: String,
        #[source]
        source: LedgerError,
    },
}

impl AllocationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AllocationError::Concurrency(_))
    }
}

/// Correlation context attached to engine failures.
#[derive(Debug, Clone, Copy)]
struct Step<'a> {
    sku: &'a str,
    request_id: &'a str,
}

impl<'a> Step<'a> {
    fn new(sku: &'a str, request_id: &'a str) -> Self {
        Self { sku, request_id }
    }

    fn ledger(self, step: &'static str) -> impl FnOnce(LedgerError) -> AllocationError + 'a {
        move |err| match err {
            LedgerError::Conflict(msg) => AllocationError::Concurrency(msg),
            source => AllocationError::Storage {
                step,
                sku: self.sku.to_string(),
                request_id: self.request_id.to_string(),
                source,
            },
        }
    }

    fn domain(self) -> impl FnOnce(DomainError) -> AllocationError {
        |err| match err {
            DomainError::Validation(msg) => AllocationError::Validation(msg),
            DomainError::InvariantViolation(msg) => AllocationError::InvariantViolation(msg),
        }
    }

    fn not_found(self) -> AllocationError {
        AllocationError::NotFound {
            sku: self.sku.to_string(),
        }
    }
}

/// Whether a finished transaction body wants its writes kept.
enum TxOutcome<T> {
    Commit(T),
    Discard(T),
}

/// Totals for one fulfillment pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Units moved from `available` to reservations.
    pub allocated_units: i64,
    /// Reservations that received stock.
    pub touched: usize,
    /// Reservations closed by this pass.
    pub closed: usize,
}

#[derive(Debug)]
pub enum SweepOutcome {
    /// Idempotent replay; nothing changed so no sweep ran.
    NotRun,
    Completed(SweepReport),
    /// The sweep stopped early. Iterations before the failure stay committed.
    Aborted(AllocationError),
}

impl SweepOutcome {
    pub fn report(&self) -> Option<&SweepReport> {
        match self {
            SweepOutcome::Completed(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct ProductionOutcome {
    pub event: ProductionEvent,
    /// Product as committed by the intake step (before the sweep).
    pub product: Product,
    pub replayed: bool,
    pub sweep: SweepOutcome,
}

#[derive(Debug)]
pub struct ReservationOutcome {
    /// Re-read after the sweep, so it includes any immediate allocation.
    pub reservation: Reservation,
    pub replayed: bool,
    pub sweep: SweepOutcome,
}

struct Produced {
    event: ProductionEvent,
    product: Product,
    replayed: bool,
}

struct Reserved {
    reservation: Reservation,
    replayed: bool,
}

enum Fill {
    /// `available` is zero; the sweep stops.
    Exhausted,
    /// Closed since the page was read.
    Skipped,
    Allocated(Allocation),
}

pub struct AllocationEngine<S, B> {
    store: Arc<S>,
    relay: Arc<OutboxRelay<S, B>>,
    config: EngineConfig,
}

impl<S, B> AllocationEngine<S, B>
where
    S: LedgerStore,
    B: EventBus<EventEnvelope<JsonValue>> + 'static,
{
    pub fn new(store: Arc<S>, relay: Arc<OutboxRelay<S, B>>, config: EngineConfig) -> Self {
        Self {
            store,
            relay,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn relay(&self) -> &Arc<OutboxRelay<S, B>> {
        &self.relay
    }

    /// Record produced stock for `sku` and allocate it to open reservations.
    ///
    /// Replaying a `request_id` returns the stored event and changes nothing.
    #[instrument(skip(self, request), fields(sku = %sku, request_id = %request.request_id), err)]
    pub async fn produce(
        &self,
        sku: &str,
        request: ProductionRequest,
    ) -> Result<ProductionOutcome, AllocationError> {
        let step = Step::new(sku, &request.request_id);
        request.validate().map_err(step.domain())?;

        let request = &request;
        let produced = retry_async(
            &self.config.conflict_retry,
            "produce",
            AllocationError::is_retryable,
            move || self.produce_once(sku, request),
        )
        .await?;

        if produced.replayed {
            tracing::info!(event_id = produced.event.id, "production request replayed");
            return Ok(ProductionOutcome {
                event: produced.event,
                product: produced.product,
                replayed: true,
                sweep: SweepOutcome::NotRun,
            });
        }

        tracing::info!(
            event_id = produced.event.id,
            quantity = produced.event.quantity,
            available = produced.product.available,
            "production recorded"
        );
        self.relay.drain_logged().await;
        let sweep = self.sweep_after_intake(sku).await;

        Ok(ProductionOutcome {
            event: produced.event,
            product: produced.product,
            replayed: false,
            sweep,
        })
    }

    async fn produce_once(
        &self,
        sku: &str,
        request: &ProductionRequest,
    ) -> Result<Produced, AllocationError> {
        let step = Step::new(sku, &request.request_id);
        let mut tx = self.store.begin().await.map_err(step.ledger("begin_transaction"))?;
        let body = self.produce_in_tx(&mut tx, step, request).await;
        finish(tx, step, body).await
    }

    async fn produce_in_tx(
        &self,
        tx: &mut S::Tx,
        step: Step<'_>,
        request: &ProductionRequest,
    ) -> Result<TxOutcome<Produced>, AllocationError> {
        let mut product = tx
            .lock_product(step.sku)
            .await
            .map_err(step.ledger("lock_product"))?
            .ok_or_else(|| step.not_found())?;

        if let Some(event) = tx
            .get_production_event_by_request_id(&request.request_id)
            .await
            .map_err(step.ledger("get_production_event_by_request_id"))?
        {
            return Ok(TxOutcome::Discard(Produced {
                event,
                product,
                replayed: true,
            }));
        }

        let mut event = ProductionEvent::accept(step.sku, request, Utc::now());
        tx.save_production_event(&mut event)
            .await
            .map_err(step.ledger("save_production_event"))?;

        product.receive(event.quantity).map_err(step.domain())?;
        tx.save_product(&product).await.map_err(step.ledger("save_product"))?;

        self.enqueue(
            tx,
            step,
            InventoryEvent::inventory_changed(product.clone(), event.created),
        )
        .await?;

        Ok(TxOutcome::Commit(Produced {
            event,
            product,
            replayed: false,
        }))
    }

    /// Admit a reservation for `sku` and try to fill it from available stock.
    ///
    /// Replaying a `request_id` returns the stored reservation and changes nothing.
    #[instrument(skip(self, request), fields(sku = %sku, request_id = %request.request_id), err)]
    pub async fn reserve(
        &self,
        sku: &str,
        request: ReservationRequest,
    ) -> Result<ReservationOutcome, AllocationError> {
        let step = Step::new(sku, &request.request_id);
        request.validate().map_err(step.domain())?;

        let request = &request;
        let reserved = retry_async(
            &self.config.conflict_retry,
            "reserve",
            AllocationError::is_retryable,
            move || self.reserve_once(sku, request),
        )
        .await?;

        if reserved.replayed {
            tracing::info!(reservation_id = reserved.reservation.id, "reservation request replayed");
            return Ok(ReservationOutcome {
                reservation: reserved.reservation,
                replayed: true,
                sweep: SweepOutcome::NotRun,
            });
        }

        tracing::info!(
            reservation_id = reserved.reservation.id,
            requested = reserved.reservation.requested_quantity,
            "reservation opened"
        );
        let sweep = self.sweep_after_intake(sku).await;

        let reservation = match self
            .store
            .get_reservation_by_request_id(&request.request_id)
            .await
        {
            Ok(Some(current)) => current,
            Ok(None) => reserved.reservation,
            Err(e) => {
                tracing::warn!(error = %e, "re-reading reservation after sweep failed");
                reserved.reservation
            }
        };

        Ok(ReservationOutcome {
            reservation,
            replayed: false,
            sweep,
        })
    }

    async fn reserve_once(
        &self,
        sku: &str,
        request: &ReservationRequest,
    ) -> Result<Reserved, AllocationError> {
        let step = Step::new(sku, &request.request_id);
        let mut tx = self.store.begin().await.map_err(step.ledger("begin_transaction"))?;
        let body = Self::reserve_in_tx(&mut tx, step, request).await;
        finish(tx, step, body).await
    }

    async fn reserve_in_tx(
        tx: &mut S::Tx,
        step: Step<'_>,
        request: &ReservationRequest,
    ) -> Result<TxOutcome<Reserved>, AllocationError> {
        tx.lock_product(step.sku)
            .await
            .map_err(step.ledger("lock_product"))?
            .ok_or_else(|| step.not_found())?;

        if let Some(reservation) = tx
            .get_reservation_by_request_id(&request.request_id)
            .await
            .map_err(step.ledger("get_reservation_by_request_id"))?
        {
            return Ok(TxOutcome::Discard(Reserved {
                reservation,
                replayed: true,
            }));
        }

        let mut reservation = Reservation::open(step.sku, request, Utc::now());
        tx.save_reservation(&mut reservation)
            .await
            .map_err(step.ledger("save_reservation"))?;

        Ok(TxOutcome::Commit(Reserved {
            reservation,
            replayed: false,
        }))
    }

    async fn sweep_after_intake(&self, sku: &str) -> SweepOutcome {
        match self.fill_reserves(sku).await {
            Ok(report) => SweepOutcome::Completed(report),
            Err(e) => {
                tracing::warn!(sku, error = %e, "fulfillment sweep aborted");
                SweepOutcome::Aborted(e)
            }
        }
    }

    /// Allocate available stock to open reservations for `sku`, oldest first.
    ///
    /// Walks pages of `sweep_batch_size` until there are no open reservations left
    /// or `available` reaches zero. Each reservation is its own transaction; a
    /// failure stops the pass and earlier iterations stay committed.
    #[instrument(skip(self), fields(sku = %sku), err)]
    pub async fn fill_reserves(&self, sku: &str) -> Result<SweepReport, AllocationError> {
        let mut report = SweepReport::default();
        let result = self.sweep(sku, &mut report).await;
        self.relay.drain_logged().await;
        result.map(|()| report)
    }

    async fn sweep(&self, sku: &str, report: &mut SweepReport) -> Result<(), AllocationError> {
        let step = Step::new(sku, "");
        let page = Page::first(self.config.sweep_batch_size.max(1));

        loop {
            // Closed reservations leave the open set, so every page starts at offset 0.
            let open = self
                .store
                .get_sku_reservations_by_state(sku, ReserveState::Open, page)
                .await
                .map_err(step.ledger("get_sku_reservations_by_state"))?;
            if open.is_empty() {
                return Ok(());
            }

            let mut closed_any = false;
            for reservation in &open {
                let request_id = reservation.request_id.as_str();
                let fill = retry_async(
                    &self.config.conflict_retry,
                    "fill_reservation",
                    AllocationError::is_retryable,
                    move || self.fill_one(sku, request_id),
                )
                .await?;

                match fill {
                    Fill::Exhausted => return Ok(()),
                    Fill::Skipped => closed_any = true,
                    Fill::Allocated(allocation) => {
                        report.allocated_units += allocation.quantity;
                        report.touched += 1;
                        tracing::debug!(
                            request_id,
                            quantity = allocation.quantity,
                            closed = allocation.closed,
                            "reservation allocated"
                        );
                        if !allocation.closed {
                            // A partial fill drains `available` to zero.
                            return Ok(());
                        }
                        report.closed += 1;
                        closed_any = true;
                    }
                }
            }

            if !closed_any {
                return Ok(());
            }
        }
    }

    async fn fill_one(&self, sku: &str, request_id: &str) -> Result<Fill, AllocationError> {
        let step = Step::new(sku, request_id);
        let mut tx = self.store.begin().await.map_err(step.ledger("begin_transaction"))?;
        let body = self.fill_in_tx(&mut tx, step).await;
        finish(tx, step, body).await
    }

    async fn fill_in_tx(&self, tx: &mut S::Tx, step: Step<'_>) -> Result<TxOutcome<Fill>, AllocationError> {
        let mut product = tx
            .lock_product(step.sku)
            .await
            .map_err(step.ledger("lock_product"))?
            .ok_or_else(|| step.not_found())?;
        if product.available == 0 {
            return Ok(TxOutcome::Discard(Fill::Exhausted));
        }

        let Some(mut reservation) = tx
            .get_reservation_by_request_id(step.request_id)
            .await
            .map_err(step.ledger("get_reservation_by_request_id"))?
            .filter(Reservation::is_open)
        else {
            return Ok(TxOutcome::Discard(Fill::Skipped));
        };

        let allocation = product.allocate(&mut reservation).map_err(step.domain())?;

        tx.save_product(&product).await.map_err(step.ledger("save_product"))?;
        tx.update_reservation(reservation.id, reservation.state, reservation.reserved_quantity)
            .await
            .map_err(step.ledger("update_reservation"))?;

        let now = Utc::now();
        if allocation.closed {
            self.enqueue(tx, step, InventoryEvent::reservation_filled(reservation, now))
                .await?;
        }
        self.enqueue(tx, step, InventoryEvent::inventory_changed(product, now))
            .await?;

        Ok(TxOutcome::Commit(Fill::Allocated(allocation)))
    }

    async fn enqueue(
        &self,
        tx: &mut S::Tx,
        step: Step<'_>,
        event: InventoryEvent,
    ) -> Result<(), AllocationError> {
        let row = OutboxEvent::record(&event, &self.config.topics)
            .map_err(|e| LedgerError::storage("encode_event", e))
            .map_err(step.ledger("encode_event"))?;
        tx.enqueue(row).await.map_err(step.ledger("enqueue_event"))
    }

    /// Returns [`AllocationError::NotFound`] when the SKU is unknown.
    pub async fn get_product(&self, sku: &str) -> Result<Product, AllocationError> {
        let step = Step::new(sku, "");
        self.store
            .get_product(sku)
            .await
            .map_err(step.ledger("get_product"))?
            .ok_or_else(|| step.not_found())
    }

    pub async fn get_all_products(&self, page: Page) -> Result<Vec<Product>, AllocationError> {
        self.store
            .get_all_products(page)
            .await
            .map_err(Step::new("", "").ledger("get_all_products"))
    }

    /// Insert a new product; [`AllocationError::AlreadyExists`] if the SKU is taken.
    ///
    /// The existence check and the insert happen under the product lock in one
    /// transaction, so an existing product's counters are never overwritten.
    #[instrument(skip(self, product), fields(sku = %product.sku), err)]
    pub async fn register_product(&self, product: Product) -> Result<Product, AllocationError> {
        let sku = product.sku.clone();
        let step = Step::new(&sku, "");
        let already_exists = || AllocationError::AlreadyExists { sku: sku.clone() };

        let mut tx = self.store.begin().await.map_err(step.ledger("begin_transaction"))?;
        let body = async {
            if tx.lock_product(&sku).await.map_err(step.ledger("lock_product"))?.is_some() {
                return Err(already_exists());
            }
            if !tx.insert_product(&product).await.map_err(step.ledger("insert_product"))? {
                return Err(already_exists());
            }
            Ok::<_, AllocationError>(TxOutcome::Commit(product))
        }
        .await;

        match finish(tx, step, body).await {
            // Lost a race with a concurrent insert of the same SKU.
            Err(AllocationError::Concurrency(_)) => Err(already_exists()),
            other => other,
        }
    }

    /// Upsert `product` as given; counters are not consulted or reset.
    #[instrument(skip(self, product), fields(sku = %product.sku), err)]
    pub async fn create_product(&self, product: Product) -> Result<Product, AllocationError> {
        let sku = product.sku.clone();
        let step = Step::new(&sku, "");
        let mut tx = self.store.begin().await.map_err(step.ledger("begin_transaction"))?;
        let body = async {
            tx.lock_product(&sku).await.map_err(step.ledger("lock_product"))?;
            tx.save_product(&product).await.map_err(step.ledger("save_product"))?;
            Ok::<_, AllocationError>(TxOutcome::Commit(product))
        }
        .await;
        finish(tx, step, body).await
    }
}

/// Commit or roll back `tx` according to `body`.
///
/// A rollback failure is logged and never replaces the error that caused it.
async fn finish<Tx, T>(
    tx: Tx,
    step: Step<'_>,
    body: Result<TxOutcome<T>, AllocationError>,
) -> Result<T, AllocationError>
where
    Tx: LedgerTx,
{
    match body {
        Ok(TxOutcome::Commit(value)) => {
            tx.commit().await.map_err(step.ledger("commit_transaction"))?;
            Ok(value)
        }
        Ok(TxOutcome::Discard(value)) => {
            rollback_logged(tx, step).await;
            Ok(value)
        }
        Err(err) => {
            rollback_logged(tx, step).await;
            Err(err)
        }
    }
}

async fn rollback_logged<Tx: LedgerTx>(tx: Tx, step: Step<'_>) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(sku = step.sku, request_id = step.request_id, error = %e, "rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use uuid::Uuid;

    use smfg_events::{InMemoryEventBus, Subscription};

    use crate::ledger::{InMemoryLedgerStore, InMemoryLedgerTx};

    type Bus = Arc<InMemoryEventBus<JsonValue>>;
    type Engine = AllocationEngine<InMemoryLedgerStore, Bus>;

    fn engine_with(products: Vec<Product>, sweep_batch_size: u32) -> (Arc<Engine>, Bus) {
        let store = Arc::new(InMemoryLedgerStore::with_products(products));
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let relay = Arc::new(OutboxRelay::new(store.clone(), bus.clone()));
        let config = EngineConfig {
            sweep_batch_size,
            ..EngineConfig::default()
        };
        (Arc::new(AllocationEngine::new(store, relay, config)), bus)
    }

    fn engine(sku: &str, available: i64) -> (Arc<Engine>, Bus) {
        let mut p = Product::new(sku, "0001", "Sprocket");
        p.available = available;
        engine_with(vec![p], DEFAULT_SWEEP_BATCH_SIZE)
    }

    async fn reservation(engine: &Engine, request_id: &str) -> Reservation {
        engine
            .store()
            .get_reservation_by_request_id(request_id)
            .await
            .unwrap()
            .unwrap()
    }

    /// Distinct `created` stamps for FIFO tests.
    async fn reserve(engine: &Engine, sku: &str, request_id: &str, qty: i64) -> ReservationOutcome {
        let out = engine
            .reserve(sku, ReservationRequest::new(request_id, "acme", qty))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        out
    }

    #[tokio::test]
    async fn produce_is_idempotent_per_request_id() {
        let (engine, _bus) = engine("X", 0);

        let first = engine.produce("X", ProductionRequest::new("p1", 5)).await.unwrap();
        let second = engine.produce("X", ProductionRequest::new("p1", 5)).await.unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert!(matches!(second.sweep, SweepOutcome::NotRun));
        assert_eq!(first.event, second.event);
        assert_eq!(engine.get_product("X").await.unwrap().available, 5);
    }

    #[tokio::test]
    async fn replay_ignores_a_different_quantity() {
        let (engine, _bus) = engine("X", 0);

        let first = engine.produce("X", ProductionRequest::new("p1", 5)).await.unwrap();
        let again = engine.produce("X", ProductionRequest::new("p1", 99)).await.unwrap();

        assert_eq!(again.event.quantity, 5);
        assert_eq!(again.event.created, first.event.created);
        assert_eq!(engine.get_product("X").await.unwrap().available, 5);
    }

    #[tokio::test]
    async fn reserve_is_idempotent_per_request_id() {
        let (engine, _bus) = engine("X", 0);

        let first = reserve(&engine, "X", "r1", 3).await;
        let second = reserve(&engine, "X", "r1", 3).await;

        assert!(second.replayed);
        assert_eq!(first.reservation, second.reservation);
        let open = engine
            .store()
            .get_sku_reservations_by_state("X", ReserveState::Open, Page::default())
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn intake_validation_rejects_before_any_write() {
        let (engine, bus) = engine("X", 0);
        let sub = bus.subscribe();

        let err = engine.produce("X", ProductionRequest::new("", 5)).await.unwrap_err();
        assert!(matches!(err, AllocationError::Validation(_)));
        let err = engine.produce("X", ProductionRequest::new("p1", 0)).await.unwrap_err();
        assert!(matches!(err, AllocationError::Validation(_)));
        let err = engine
            .reserve("X", ReservationRequest::new("r1", "acme", -4))
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::Validation(_)));

        assert_eq!(engine.get_product("X").await.unwrap().available, 0);
        assert!(sub.drain().is_empty());
    }

    #[tokio::test]
    async fn unknown_sku_is_not_found() {
        let (engine, _bus) = engine("X", 0);

        let err = engine.produce("NOPE", ProductionRequest::new("p1", 1)).await.unwrap_err();
        assert!(matches!(err, AllocationError::NotFound { ref sku } if sku == "NOPE"));
        let err = engine.get_product("NOPE").await.unwrap_err();
        assert!(matches!(err, AllocationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn sweep_is_fifo_by_arrival() {
        let (engine, _bus) = engine("X", 0);
        reserve(&engine, "X", "r1", 10).await;
        reserve(&engine, "X", "r2", 5).await;

        let out = engine.produce("X", ProductionRequest::new("p1", 12)).await.unwrap();

        let r1 = reservation(&engine, "r1").await;
        let r2 = reservation(&engine, "r2").await;
        assert_eq!((r1.state, r1.reserved_quantity), (ReserveState::Closed, 10));
        assert_eq!((r2.state, r2.reserved_quantity), (ReserveState::Open, 2));

        let report = out.sweep.report().copied().unwrap();
        assert_eq!(report, SweepReport { allocated_units: 12, touched: 2, closed: 1 });

        let product = engine.get_product("X").await.unwrap();
        assert_eq!((product.available, product.reserved), (0, 2));
    }

    #[tokio::test]
    async fn reservation_closes_exactly_at_requested_quantity() {
        let (engine, _bus) = engine("X", 0);
        reserve(&engine, "X", "r1", 4).await;

        engine.produce("X", ProductionRequest::new("p1", 3)).await.unwrap();
        let r = reservation(&engine, "r1").await;
        assert_eq!((r.state, r.reserved_quantity), (ReserveState::Open, 3));

        engine.produce("X", ProductionRequest::new("p2", 1)).await.unwrap();
        let r = reservation(&engine, "r1").await;
        assert_eq!((r.state, r.reserved_quantity), (ReserveState::Closed, 4));

        engine.produce("X", ProductionRequest::new("p3", 6)).await.unwrap();
        let r = reservation(&engine, "r1").await;
        assert_eq!(r.reserved_quantity, 4);
        assert_eq!(engine.get_product("X").await.unwrap().available, 6);
    }

    #[tokio::test]
    async fn zero_stock_sweep_leaves_reservations_untouched() {
        let (engine, _bus) = engine("X", 0);
        let out = reserve(&engine, "X", "r1", 2).await;

        assert_eq!(out.reservation.reserved_quantity, 0);
        assert_eq!(out.sweep.report().copied(), Some(SweepReport::default()));
        assert_eq!(engine.fill_reserves("X").await.unwrap(), SweepReport::default());
        assert_eq!(reservation(&engine, "r1").await.reserved_quantity, 0);
    }

    #[tokio::test]
    async fn reserve_then_produce_scenario() {
        let (engine, _bus) = engine("X", 0);

        let r1 = reserve(&engine, "X", "r1", 30).await;
        assert_eq!(r1.reservation.state, ReserveState::Open);
        assert_eq!(r1.reservation.reserved_quantity, 0);

        let p1 = engine.produce("X", ProductionRequest::new("p1", 50)).await.unwrap();
        assert_eq!(p1.product.available, 50);

        let r1 = reservation(&engine, "r1").await;
        assert_eq!((r1.state, r1.reserved_quantity), (ReserveState::Closed, 30));
        let product = engine.get_product("X").await.unwrap();
        assert_eq!((product.available, product.reserved), (20, 0));
    }

    #[tokio::test]
    async fn new_reservation_is_filled_from_stock_on_hand() {
        let (engine, _bus) = engine("X", 5);

        let out = reserve(&engine, "X", "r1", 3).await;

        assert_eq!(out.reservation.state, ReserveState::Closed);
        assert_eq!(out.reservation.reserved_quantity, 3);
        assert_eq!(engine.get_product("X").await.unwrap().available, 2);
    }

    #[tokio::test]
    async fn sweep_walks_past_the_first_page() {
        let mut p = Product::new("X", "0001", "Sprocket");
        p.available = 0;
        let (engine, _bus) = engine_with(vec![p], 2);
        for i in 0..5 {
            reserve(&engine, "X", &format!("r{i}"), 1).await;
        }

        let out = engine.produce("X", ProductionRequest::new("p1", 5)).await.unwrap();

        assert_eq!(out.sweep.report().map(|r| r.closed), Some(5));
        for i in 0..5 {
            assert_eq!(reservation(&engine, &format!("r{i}")).await.state, ReserveState::Closed);
        }
    }

    #[tokio::test]
    async fn events_reach_the_bus_after_commit() {
        let (engine, bus) = engine("X", 0);
        let inventory: Subscription<EventEnvelope<JsonValue>> = bus.subscribe_topic("inventory.product");
        let filled = bus.subscribe_topic("inventory.reservation");

        reserve(&engine, "X", "r1", 2).await;
        engine.produce("X", ProductionRequest::new("p1", 3)).await.unwrap();

        let changes = inventory.drain();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].payload()["available"], 3);
        assert_eq!(changes[1].payload()["available"], 1);

        let filled = filled.drain();
        assert_eq!(filled.len(), 1);
        assert_eq!(filled[0].event_type(), "inventory.reservation.filled");
        assert_eq!(filled[0].payload()["requestID"], "r1");
        assert_eq!(filled[0].payload()["state"], "Closed");
        assert_eq!(engine.store().pending_outbox(), 0);
    }

    #[tokio::test]
    async fn create_product_keeps_supplied_counters() {
        let (engine, _bus) = engine("X", 0);
        let mut p = Product::new("NEW", "42", "New Sprocket");
        p.available = 9;

        engine.create_product(p.clone()).await.unwrap();

        assert_eq!(engine.get_product("NEW").await.unwrap(), p);
        let all = engine.get_all_products(Page::default()).await.unwrap();
        let skus: Vec<&str> = all.iter().map(|p| p.sku.as_str()).collect();
        assert_eq!(skus, ["NEW", "X"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_production_never_loses_an_update() {
        let (engine, _bus) = engine("X", 0);

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .produce("X", ProductionRequest::new(format!("p{i}"), 1))
                        .await
                        .map(|_| ())
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        assert_eq!(engine.get_product("X").await.unwrap().available, 32);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_intake_conserves_stock() {
        let (engine, _bus) = engine("X", 0);

        let mut tasks = Vec::new();
        for i in 0..16 {
            let e = engine.clone();
            tasks.push(tokio::spawn(async move {
                e.reserve("X", ReservationRequest::new(format!("r{i}"), "acme", 2))
                    .await
                    .map(|_| ())
            }));
            let e = engine.clone();
            tasks.push(tokio::spawn(async move {
                e.produce("X", ProductionRequest::new(format!("p{i}"), 1))
                    .await
                    .map(|_| ())
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        engine.fill_reserves("X").await.unwrap();

        let product = engine.get_product("X").await.unwrap();
        let open = engine
            .store()
            .get_sku_reservations_by_state("X", ReserveState::Open, Page::first(100))
            .await
            .unwrap();
        let closed = engine
            .store()
            .get_sku_reservations_by_state("X", ReserveState::Closed, Page::first(100))
            .await
            .unwrap();

        assert!(product.available >= 0 && product.reserved >= 0);
        // 16 units produced and 32 requested: every unit ends up reserved or shipped.
        assert_eq!(product.available, 0);
        let shipped: i64 = closed.iter().map(|r| r.requested_quantity).sum();
        assert_eq!(product.reserved + shipped, 16);
        assert_eq!(product.reserved, open.iter().map(|r| r.reserved_quantity).sum::<i64>());
    }

    #[tokio::test]
    async fn intake_stamps_match_what_the_ledger_stores() {
        let (engine, _bus) = engine("X", 0);

        for i in 0..20 {
            let out = engine.produce("X", ProductionRequest::new(format!("p{i}"), 1)).await.unwrap();
            assert_eq!(out.event.created.timestamp_subsec_nanos() % 1_000, 0);
        }
        let out = reserve(&engine, "X", "r1", 1).await;
        assert_eq!(out.reservation.created.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[tokio::test]
    async fn register_product_refuses_an_existing_sku_and_keeps_its_counters() {
        let (engine, _bus) = engine("X", 0);
        let new = Product::new("NEW", "42", "New Sprocket");

        engine.register_product(new.clone()).await.unwrap();
        engine.produce("NEW", ProductionRequest::new("p1", 50)).await.unwrap();

        let err = engine.register_product(new).await.unwrap_err();
        assert!(matches!(err, AllocationError::AlreadyExists { ref sku } if sku == "NEW"));
        assert_eq!(engine.get_product("NEW").await.unwrap().available, 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registrations_admit_exactly_one() {
        let (engine, _bus) = engine("X", 0);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .register_product(Product::new("NEW", format!("{i}"), "New"))
                        .await
                })
            })
            .collect();

        let mut created = 0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert!(matches!(e, AllocationError::AlreadyExists { .. })),
            }
        }
        assert_eq!(created, 1);
    }

    /// Failures to inject into a wrapped in-memory ledger.
    #[derive(Default)]
    struct Faults {
        calls: Mutex<HashMap<&'static str, usize>>,
        /// Operation name to the 1-based call that fails.
        fail_at: Mutex<HashMap<&'static str, usize>>,
        commit_conflicts: AtomicUsize,
        rollback_fails: AtomicBool,
    }

    impl Faults {
        fn fail_call(&self, operation: &'static str, nth: usize) {
            self.fail_at.lock().unwrap().insert(operation, nth);
        }

        fn calls(&self, operation: &'static str) -> usize {
            self.calls.lock().unwrap().get(operation).copied().unwrap_or(0)
        }

        fn check(&self, operation: &'static str) -> Result<(), LedgerError> {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(operation).or_default();
            *n += 1;
            if self.fail_at.lock().unwrap().get(operation) == Some(&*n) {
                return Err(LedgerError::storage(operation, "injected failure"));
            }
            Ok(())
        }

        fn take_commit_conflict(&self) -> bool {
            self.commit_conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    struct FaultyStore {
        inner: InMemoryLedgerStore,
        faults: Arc<Faults>,
    }

    struct FaultyTx {
        inner: InMemoryLedgerTx,
        faults: Arc<Faults>,
    }

    #[async_trait]
    impl LedgerStore for FaultyStore {
        type Tx = FaultyTx;

        async fn begin(&self) -> Result<FaultyTx, LedgerError> {
            Ok(FaultyTx {
                inner: self.inner.begin().await?,
                faults: self.faults.clone(),
            })
        }

        async fn get_product(&self, sku: &str) -> Result<Option<Product>, LedgerError> {
            self.inner.get_product(sku).await
        }

        async fn get_all_products(&self, page: Page) -> Result<Vec<Product>, LedgerError> {
            self.inner.get_all_products(page).await
        }

        async fn get_reservation_by_request_id(
            &self,
            request_id: &str,
        ) -> Result<Option<Reservation>, LedgerError> {
            self.inner.get_reservation_by_request_id(request_id).await
        }

        async fn get_sku_reservations_by_state(
            &self,
            sku: &str,
            state: ReserveState,
            page: Page,
        ) -> Result<Vec<Reservation>, LedgerError> {
            self.inner.get_sku_reservations_by_state(sku, state, page).await
        }
    }

    #[async_trait]
    impl LedgerTx for FaultyTx {
        async fn lock_product(&mut self, sku: &str) -> Result<Option<Product>, LedgerError> {
            self.faults.check("lock_product")?;
            self.inner.lock_product(sku).await
        }

        async fn save_product(&mut self, product: &Product) -> Result<(), LedgerError> {
            self.faults.check("save_product")?;
            self.inner.save_product(product).await
        }

        async fn insert_product(&mut self, product: &Product) -> Result<bool, LedgerError> {
            self.faults.check("insert_product")?;
            self.inner.insert_product(product).await
        }

        async fn get_production_event_by_request_id(
            &mut self,
            request_id: &str,
        ) -> Result<Option<ProductionEvent>, LedgerError> {
            self.inner.get_production_event_by_request_id(request_id).await
        }

        async fn save_production_event(&mut self, event: &mut ProductionEvent) -> Result<(), LedgerError> {
            self.faults.check("save_production_event")?;
            self.inner.save_production_event(event).await
        }

        async fn get_reservation_by_request_id(
            &mut self,
            request_id: &str,
        ) -> Result<Option<Reservation>, LedgerError> {
            self.inner.get_reservation_by_request_id(request_id).await
        }

        async fn save_reservation(&mut self, reservation: &mut Reservation) -> Result<(), LedgerError> {
            self.faults.check("save_reservation")?;
            self.inner.save_reservation(reservation).await
        }

        async fn update_reservation(
            &mut self,
            id: i64,
            state: ReserveState,
            reserved_quantity: i64,
        ) -> Result<(), LedgerError> {
            self.faults.check("update_reservation")?;
            self.inner.update_reservation(id, state, reserved_quantity).await
        }

        async fn enqueue(&mut self, event: OutboxEvent) -> Result<(), LedgerError> {
            self.inner.enqueue(event).await
        }

        async fn claim_outbox(&mut self, limit: u32) -> Result<Vec<OutboxEvent>, LedgerError> {
            self.inner.claim_outbox(limit).await
        }

        async fn mark_published(&mut self, ids: &[Uuid]) -> Result<(), LedgerError> {
            self.inner.mark_published(ids).await
        }

        async fn commit(self) -> Result<(), LedgerError> {
            self.faults.check("commit")?;
            if self.faults.take_commit_conflict() {
                self.inner.rollback().await?;
                return Err(LedgerError::conflict("could not serialize access"));
            }
            self.inner.commit().await
        }

        async fn rollback(self) -> Result<(), LedgerError> {
            self.faults.check("rollback")?;
            self.inner.rollback().await?;
            if self.faults.rollback_fails.load(Ordering::SeqCst) {
                return Err(LedgerError::storage("rollback", "connection reset"));
            }
            Ok(())
        }
    }

    type FaultyEngine = AllocationEngine<FaultyStore, Bus>;

    fn faulty_engine(available: i64) -> (FaultyEngine, Arc<Faults>) {
        let mut p = Product::new("X", "0001", "Sprocket");
        p.available = available;
        let faults = Arc::new(Faults::default());
        let store = Arc::new(FaultyStore {
            inner: InMemoryLedgerStore::with_products([p]),
            faults: faults.clone(),
        });
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let relay = Arc::new(OutboxRelay::new(store.clone(), bus));
        (AllocationEngine::new(store, relay, EngineConfig::default()), faults)
    }

    async fn committed_production(engine: &FaultyEngine, request_id: &str) -> Option<ProductionEvent> {
        let mut tx = engine.store().inner.begin().await.unwrap();
        let found = tx.get_production_event_by_request_id(request_id).await.unwrap();
        tx.rollback().await.unwrap();
        found
    }

    #[tokio::test]
    async fn failed_sweep_step_keeps_earlier_allocations_and_the_intake() {
        let (engine, faults) = faulty_engine(0);
        for id in ["r1", "r2", "r3"] {
            engine
                .reserve("X", ReservationRequest::new(id, "acme", 1))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        faults.fail_call("update_reservation", 2);

        let out = engine.produce("X", ProductionRequest::new("p1", 3)).await.unwrap();

        assert!(!out.replayed);
        assert!(matches!(
            out.sweep,
            SweepOutcome::Aborted(AllocationError::Storage { step: "update_reservation", .. })
        ));
        assert!(committed_production(&engine, "p1").await.is_some());

        let state = |r: Reservation| (r.state, r.reserved_quantity);
        let store = engine.store();
        assert_eq!(
            state(store.get_reservation_by_request_id("r1").await.unwrap().unwrap()),
            (ReserveState::Closed, 1)
        );
        assert_eq!(
            state(store.get_reservation_by_request_id("r2").await.unwrap().unwrap()),
            (ReserveState::Open, 0)
        );
        let product = engine.get_product("X").await.unwrap();
        assert_eq!((product.available, product.reserved), (2, 0));

        let report = engine.fill_reserves("X").await.unwrap();
        assert_eq!(report.closed, 2);
        assert_eq!(engine.get_product("X").await.unwrap().available, 0);
    }

    #[tokio::test]
    async fn failed_intake_step_rolls_back_every_write() {
        let (engine, faults) = faulty_engine(0);
        faults.fail_call("save_product", 1);

        let err = engine.produce("X", ProductionRequest::new("p1", 5)).await.unwrap_err();

        assert!(matches!(
            err,
            AllocationError::Storage { step: "save_product", ref request_id, .. } if request_id == "p1"
        ));
        assert_eq!(faults.calls("rollback"), 1);
        assert!(committed_production(&engine, "p1").await.is_none());
        assert_eq!(engine.get_product("X").await.unwrap().available, 0);
        assert_eq!(engine.store().inner.pending_outbox(), 0);

        // Nothing was recorded, so the same request id is accepted afresh.
        let out = engine.produce("X", ProductionRequest::new("p1", 5)).await.unwrap();
        assert!(!out.replayed);
        assert_eq!(engine.get_product("X").await.unwrap().available, 5);
    }

    #[tokio::test]
    async fn rollback_failure_does_not_mask_the_original_error() {
        let (engine, faults) = faulty_engine(0);
        faults.fail_call("save_reservation", 1);
        faults.rollback_fails.store(true, Ordering::SeqCst);

        let err = engine
            .reserve("X", ReservationRequest::new("r1", "acme", 2))
            .await
            .unwrap_err();

        match err {
            AllocationError::Storage { step, source, .. } => {
                assert_eq!(step, "save_reservation");
                assert_eq!(source, LedgerError::storage("save_reservation", "injected failure"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(faults.calls("rollback"), 1);
    }

    #[tokio::test]
    async fn commit_conflict_is_retried_until_it_succeeds() {
        let (engine, faults) = faulty_engine(0);
        faults.commit_conflicts.store(2, Ordering::SeqCst);

        let out = engine.produce("X", ProductionRequest::new("p1", 5)).await.unwrap();

        assert!(!out.replayed);
        assert_eq!(out.event.quantity, 5);
        assert_eq!(faults.calls("save_production_event"), 3);
        assert_eq!(engine.get_product("X").await.unwrap().available, 5);
    }

    #[tokio::test]
    async fn persistent_conflicts_surface_as_concurrency_after_bounded_retries() {
        let (engine, faults) = faulty_engine(0);
        let tries = RetryPolicy::default().tries();
        faults.commit_conflicts.store(tries as usize, Ordering::SeqCst);

        let err = engine.produce("X", ProductionRequest::new("p1", 5)).await.unwrap_err();

        assert!(matches!(err, AllocationError::Concurrency(_)));
        assert!(err.is_retryable());
        assert_eq!(faults.calls("save_production_event"), tries as usize);
        assert!(committed_production(&engine, "p1").await.is_none());
        assert_eq!(engine.get_product("X").await.unwrap().available, 0);
    }
}

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use smfg_core::Page;
use smfg_inventory::{Product, ProductionEvent, Reservation, ReserveState};

use super::{LedgerError, LedgerStore, LedgerTx};
use crate::outbox::OutboxEvent;

#[derive(Debug, Default)]
struct LedgerState {
    products: BTreeMap<String, Product>,
    production_events: BTreeMap<i64, ProductionEvent>,
    production_by_request: HashMap<String, i64>,
    reservations: BTreeMap<i64, Reservation>,
    reservations_by_request: HashMap<String, i64>,
    /// Committed events not yet published, oldest first.
    outbox: Vec<OutboxEvent>,
}

#[derive(Debug, Default)]
struct Shared {
    state: RwLock<LedgerState>,
    sku_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    outbox_gate: Arc<AsyncMutex<()>>,
    next_id: AtomicI64,
}

impl Shared {
    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn sku_lock(&self, sku: &str) -> Result<Arc<AsyncMutex<()>>, LedgerError> {
        let mut locks = self.sku_locks.lock().map_err(|_| poisoned("lock_product"))?;
        Ok(locks.entry(sku.to_string()).or_default().clone())
    }
}

fn poisoned(operation: &'static str) -> LedgerError {
    LedgerError::storage(operation, "in-memory ledger lock poisoned")
}

/// In-memory ledger for tests/dev.
///
/// Transactions stage their writes and apply them atomically on commit. Product
/// locks are per-SKU async mutexes held by the transaction, so concurrent
/// read-modify-write cycles on one SKU serialize the same way `SELECT … FOR UPDATE`
/// does in Postgres.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    shared: Arc<Shared>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A ledger pre-populated with `products`.
    pub fn with_products(products: impl IntoIterator<Item = Product>) -> Self {
        let store = Self::new();
        if let Ok(mut state) = store.shared.state.write() {
            for p in products {
                state.products.insert(p.sku.clone(), p);
            }
        }
        store
    }

    /// The development catalogue served when running without a database.
    pub fn demo() -> Self {
        let sprocket = |sku: &str, upc: &str, name: &str, available: i64| {
            let mut p = Product::new(sku, upc, name);
            p.available = available;
            p
        };
        Self::with_products([
            sprocket("SSPROCK01", "10235668", "Small Basic Sprocket", 1),
            sprocket("SSPROCK02", "1255506827", "Small Advanced Sprocket", 3),
            sprocket("LSPROCK01", "4670235668", "Large Simple Sprocket", 2),
        ])
    }

    /// Number of committed outbox events not yet published.
    pub fn pending_outbox(&self) -> usize {
        self.shared
            .state
            .read()
            .map(|s| s.outbox.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    type Tx = InMemoryLedgerTx;

    async fn begin(&self) -> Result<Self::Tx, LedgerError> {
        Ok(InMemoryLedgerTx::new(self.shared.clone()))
    }

    async fn get_product(&self, sku: &str) -> Result<Option<Product>, LedgerError> {
        let state = self.shared.state.read().map_err(|_| poisoned("get_product"))?;
        Ok(state.products.get(sku).cloned())
    }

    async fn get_all_products(&self, page: Page) -> Result<Vec<Product>, LedgerError> {
        let state = self.shared.state.read().map_err(|_| poisoned("get_all_products"))?;
        let ordered: Vec<Product> = state.products.values().cloned().collect();
        Ok(page.apply(&ordered))
    }

    async fn get_reservation_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<Reservation>, LedgerError> {
        let state = self
            .shared
            .state
            .read()
            .map_err(|_| poisoned("get_reservation_by_request_id"))?;
        Ok(state
            .reservations_by_request
            .get(request_id)
            .and_then(|id| state.reservations.get(id))
            .cloned())
    }

    async fn get_sku_reservations_by_state(
        &self,
        sku: &str,
        reserve_state: ReserveState,
        page: Page,
    ) -> Result<Vec<Reservation>, LedgerError> {
        let state = self
            .shared
            .state
            .read()
            .map_err(|_| poisoned("get_sku_reservations_by_state"))?;

        let mut matching: Vec<Reservation> = state
            .reservations
            .values()
            .filter(|r| r.sku == sku && r.state == reserve_state)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));

        Ok(page.apply(&matching))
    }
}

/// Transaction over an [`InMemoryLedgerStore`].
#[derive(Debug)]
pub struct InMemoryLedgerTx {
    shared: Arc<Shared>,
    sku_guards: HashMap<String, OwnedMutexGuard<()>>,
    outbox_guard: Option<OwnedMutexGuard<()>>,
    products: BTreeMap<String, Product>,
    inserted: HashSet<String>,
    production_events: Vec<ProductionEvent>,
    reservations: Vec<Reservation>,
    reservation_updates: BTreeMap<i64, (ReserveState, i64)>,
    outbox: Vec<OutboxEvent>,
    published: HashSet<Uuid>,
}

impl InMemoryLedgerTx {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            sku_guards: HashMap::new(),
            outbox_guard: None,
            products: BTreeMap::new(),
            inserted: HashSet::new(),
            production_events: Vec::new(),
            reservations: Vec::new(),
            reservation_updates: BTreeMap::new(),
            outbox: Vec::new(),
            published: HashSet::new(),
        }
    }

    fn read_state(&self, operation: &'static str) -> Result<std::sync::RwLockReadGuard<'_, LedgerState>, LedgerError> {
        self.shared.state.read().map_err(|_| poisoned(operation))
    }

    fn with_pending_update(&self, mut reservation: Reservation) -> Reservation {
        if let Some((state, qty)) = self.reservation_updates.get(&reservation.id) {
            reservation.state = *state;
            reservation.reserved_quantity = *qty;
        }
        reservation
    }
}

#[async_trait]
impl LedgerTx for InMemoryLedgerTx {
    async fn lock_product(&mut self, sku: &str) -> Result<Option<Product>, LedgerError> {
        if !self.sku_guards.contains_key(sku) {
            let lock = self.shared.sku_lock(sku)?;
            let guard = lock.lock_owned().await;
            self.sku_guards.insert(sku.to_string(), guard);
        }

        if let Some(p) = self.products.get(sku) {
            return Ok(Some(p.clone()));
        }
        let state = self.read_state("lock_product")?;
        Ok(state.products.get(sku).cloned())
    }

    async fn save_product(&mut self, product: &Product) -> Result<(), LedgerError> {
        self.products.insert(product.sku.clone(), product.clone());
        Ok(())
    }

    async fn insert_product(&mut self, product: &Product) -> Result<bool, LedgerError> {
        let exists = self.products.contains_key(&product.sku)
            || self.read_state("insert_product")?.products.contains_key(&product.sku);
        if exists {
            return Ok(false);
        }
        self.inserted.insert(product.sku.clone());
        self.products.insert(product.sku.clone(), product.clone());
        Ok(true)
    }

    async fn get_production_event_by_request_id(
        &mut self,
        request_id: &str,
    ) -> Result<Option<ProductionEvent>, LedgerError> {
        if let Some(e) = self.production_events.iter().find(|e| e.request_id == request_id) {
            return Ok(Some(e.clone()));
        }
        let state = self.read_state("get_production_event_by_request_id")?;
        Ok(state
            .production_by_request
            .get(request_id)
            .and_then(|id| state.production_events.get(id))
            .cloned())
    }

    async fn save_production_event(&mut self, event: &mut ProductionEvent) -> Result<(), LedgerError> {
        if self.production_events.iter().any(|e| e.request_id == event.request_id) {
            return Err(LedgerError::conflict(format!(
                "production event {} already staged",
                event.request_id
            )));
        }
        event.id = self.shared.next_id();
        self.production_events.push(event.clone());
        Ok(())
    }

    async fn get_reservation_by_request_id(
        &mut self,
        request_id: &str,
    ) -> Result<Option<Reservation>, LedgerError> {
        let staged = self.reservations.iter().find(|r| r.request_id == request_id).cloned();
        let found = match staged {
            Some(r) => Some(r),
            None => {
                let state = self.read_state("get_reservation_by_request_id")?;
                state
                    .reservations_by_request
                    .get(request_id)
                    .and_then(|id| state.reservations.get(id))
                    .cloned()
            }
        };
        Ok(found.map(|r| self.with_pending_update(r)))
    }

    async fn save_reservation(&mut self, reservation: &mut Reservation) -> Result<(), LedgerError> {
        if self.reservations.iter().any(|r| r.request_id == reservation.request_id) {
            return Err(LedgerError::conflict(format!(
                "reservation {} already staged",
                reservation.request_id
            )));
        }
        reservation.id = self.shared.next_id();
        self.reservations.push(reservation.clone());
        Ok(())
    }

    async fn update_reservation(
        &mut self,
        id: i64,
        state: ReserveState,
        reserved_quantity: i64,
    ) -> Result<(), LedgerError> {
        let known = self.reservations.iter().any(|r| r.id == id)
            || self.read_state("update_reservation")?.reservations.contains_key(&id);
        if !known {
            return Err(LedgerError::storage(
                "update_reservation",
                format!("reservation {id} does not exist"),
            ));
        }
        self.reservation_updates.insert(id, (state, reserved_quantity));
        Ok(())
    }

    async fn enqueue(&mut self, event: OutboxEvent) -> Result<(), LedgerError> {
        self.outbox.push(event);
        Ok(())
    }

    async fn claim_outbox(&mut self, limit: u32) -> Result<Vec<OutboxEvent>, LedgerError> {
        if self.outbox_guard.is_none() {
            let gate = self.shared.outbox_gate.clone();
            self.outbox_guard = Some(gate.lock_owned().await);
        }

        let state = self.read_state("claim_outbox")?;
        Ok(state.outbox.iter().take(limit as usize).cloned().collect())
    }

    async fn mark_published(&mut self, ids: &[Uuid]) -> Result<(), LedgerError> {
        self.published.extend(ids.iter().copied());
        Ok(())
    }

    async fn commit(self) -> Result<(), LedgerError> {
        let mut state = self.shared.state.write().map_err(|_| poisoned("commit"))?;

        for e in &self.production_events {
            if state.production_by_request.contains_key(&e.request_id) {
                return Err(LedgerError::conflict(format!(
                    "production event {} already exists",
                    e.request_id
                )));
            }
        }
        if let Some(sku) = self.inserted.iter().find(|sku| state.products.contains_key(*sku)) {
            return Err(LedgerError::conflict(format!("product {sku} already exists")));
        }
        for r in &self.reservations {
            if state.reservations_by_request.contains_key(&r.request_id) {
                return Err(LedgerError::conflict(format!(
                    "reservation {} already exists",
                    r.request_id
                )));
            }
        }

        for (sku, p) in self.products {
            state.products.insert(sku, p);
        }
        for e in self.production_events {
            state.production_by_request.insert(e.request_id.clone(), e.id);
            state.production_events.insert(e.id, e);
        }
        for r in self.reservations {
            state.reservations_by_request.insert(r.request_id.clone(), r.id);
            state.reservations.insert(r.id, r);
        }
        for (id, (reserve_state, qty)) in self.reservation_updates {
            if let Some(r) = state.reservations.get_mut(&id) {
                r.state = reserve_state;
                r.reserved_quantity = qty;
            }
        }
        if !self.published.is_empty() {
            state.outbox.retain(|event| !self.published.contains(&event.id));
        }
        state.outbox.extend(self.outbox);

        Ok(())
    }

    async fn rollback(self) -> Result<(), LedgerError> {
        Ok(())
    }
}

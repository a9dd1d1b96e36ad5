//! Postgres-backed ledger.
//!
//! Schema: `crates/infra/migrations/0001_inventory.sql` (applied by operators).
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | LedgerError | Scenario |
//! |------------|----------------------|-------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Concurrent insert of the same request id |
//! | Database (serialization failure) | `40001` | `Conflict` | Transaction lost a serialization race |
//! | Database (deadlock detected) | `40P01` | `Conflict` | Lock cycle between transactions |
//! | Database (other) | Any other | `Storage` | Constraint or query failures |
//! | Other | N/A | `Storage` | Pool closed, network errors, decode failures |
//!
//! ## Locking
//!
//! [`LedgerTx::lock_product`] issues `SELECT … FOR UPDATE`, so concurrent
//! read-modify-write cycles on a product serialize on its row. The outbox is
//! claimed with `FOR UPDATE SKIP LOCKED` so several relays can drain in parallel.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use smfg_core::Page;
use smfg_inventory::{Product, ProductionEvent, Reservation, ReserveState};

use super::{LedgerError, LedgerStore, LedgerTx};
use crate::outbox::OutboxEvent;

/// Postgres-backed ledger store.
///
/// `Send + Sync`; all access goes through the SQLx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

/// A live Postgres transaction.
pub struct PostgresLedgerTx {
    tx: Transaction<'static, Postgres>,
}

const PRODUCT_COLUMNS: &str = "sku, upc, name, available, reserved";
const RESERVATION_COLUMNS: &str =
    "id, request_id, requester, sku, state, reserved_quantity, requested_quantity, created";

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    type Tx = PostgresLedgerTx;

    async fn begin(&self) -> Result<Self::Tx, LedgerError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PostgresLedgerTx { tx })
    }

    #[instrument(skip(self), err)]
    async fn get_product(&self, sku: &str) -> Result<Option<Product>, LedgerError> {
        let row = sqlx::query(&format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE sku = $1"))
            .bind(sku)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_product", e))?;

        row.map(|r| decode::<ProductRow>("get_product", &r).map(Product::from))
            .transpose()
    }

    #[instrument(skip(self), fields(limit = page.limit, offset = page.offset), err)]
    async fn get_all_products(&self, page: Page) -> Result<Vec<Product>, LedgerError> {
        let rows = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products ORDER BY sku ASC LIMIT $1 OFFSET $2"
        ))
        .bind(page.limit_i64())
        .bind(page.offset_i64())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_all_products", e))?;

        rows.iter()
            .map(|r| decode::<ProductRow>("get_all_products", r).map(Product::from))
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn get_reservation_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<Reservation>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE request_id = $1"
        ))
        .bind(request_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_reservation_by_request_id", e))?;

        row.map(|r| reservation_from_row("get_reservation_by_request_id", &r))
            .transpose()
    }

    #[instrument(skip(self), fields(limit = page.limit, offset = page.offset), err)]
    async fn get_sku_reservations_by_state(
        &self,
        sku: &str,
        state: ReserveState,
        page: Page,
    ) -> Result<Vec<Reservation>, LedgerError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RESERVATION_COLUMNS}
            FROM reservations
            WHERE sku = $1 AND state = $2
            ORDER BY created ASC, id ASC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(sku)
        .bind(state.as_str())
        .bind(page.limit_i64())
        .bind(page.offset_i64())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_sku_reservations_by_state", e))?;

        rows.iter()
            .map(|r| reservation_from_row("get_sku_reservations_by_state", r))
            .collect()
    }
}

#[async_trait]
impl LedgerTx for PostgresLedgerTx {
    #[instrument(skip(self), err)]
    async fn lock_product(&mut self, sku: &str) -> Result<Option<Product>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE sku = $1 FOR UPDATE"
        ))
        .bind(sku)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_product", e))?;

        row.map(|r| decode::<ProductRow>("lock_product", &r).map(Product::from))
            .transpose()
    }

    #[instrument(skip(self, product), fields(sku = %product.sku), err)]
    async fn save_product(&mut self, product: &Product) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO products (sku, upc, name, available, reserved)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (sku)
            DO UPDATE SET
                upc = EXCLUDED.upc,
                name = EXCLUDED.name,
                available = EXCLUDED.available,
                reserved = EXCLUDED.reserved
            "#,
        )
        .bind(&product.sku)
        .bind(&product.upc)
        .bind(&product.name)
        .bind(product.available)
        .bind(product.reserved)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_product", e))?;

        Ok(())
    }

    #[instrument(skip(self, product), fields(sku = %product.sku), err)]
    async fn insert_product(&mut self, product: &Product) -> Result<bool, LedgerError> {
        // A concurrent insert of the same sku blocks here until the other transaction ends.
        let result = sqlx::query(
            r#"
            INSERT INTO products (sku, upc, name, available, reserved)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (sku) DO NOTHING
            "#,
        )
        .bind(&product.sku)
        .bind(&product.upc)
        .bind(&product.name)
        .bind(product.available)
        .bind(product.reserved)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_product", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn get_production_event_by_request_id(
        &mut self,
        request_id: &str,
    ) -> Result<Option<ProductionEvent>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT id, request_id, sku, quantity, created
            FROM production_events
            WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("get_production_event_by_request_id", e))?;

        row.map(|r| {
            decode::<ProductionEventRow>("get_production_event_by_request_id", &r)
                .map(ProductionEvent::from)
        })
        .transpose()
    }

    #[instrument(skip(self, event), fields(sku = %event.sku, request_id = %event.request_id), err)]
    async fn save_production_event(&mut self, event: &mut ProductionEvent) -> Result<(), LedgerError> {
        let row = sqlx::query(
            r#"
            INSERT INTO production_events (request_id, sku, quantity, created)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&event.request_id)
        .bind(&event.sku)
        .bind(event.quantity)
        .bind(event.created)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_production_event", e))?;

        event.id = row
            .try_get("id")
            .map_err(|e| LedgerError::storage("save_production_event", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_reservation_by_request_id(
        &mut self,
        request_id: &str,
    ) -> Result<Option<Reservation>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE request_id = $1"
        ))
        .bind(request_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("get_reservation_by_request_id", e))?;

        row.map(|r| reservation_from_row("get_reservation_by_request_id", &r))
            .transpose()
    }

    #[instrument(
        skip(self, reservation),
        fields(sku = %reservation.sku, request_id = %reservation.request_id),
        err
    )]
    async fn save_reservation(&mut self, reservation: &mut Reservation) -> Result<(), LedgerError> {
        let row = sqlx::query(
            r#"
            INSERT INTO reservations (
                request_id,
                requester,
                sku,
                state,
                reserved_quantity,
                requested_quantity,
                created
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(&reservation.request_id)
        .bind(&reservation.requester)
        .bind(&reservation.sku)
        .bind(reservation.state.as_str())
        .bind(reservation.reserved_quantity)
        .bind(reservation.requested_quantity)
        .bind(reservation.created)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_reservation", e))?;

        reservation.id = row
            .try_get("id")
            .map_err(|e| LedgerError::storage("save_reservation", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn update_reservation(
        &mut self,
        id: i64,
        state: ReserveState,
        reserved_quantity: i64,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE reservations SET state = $2, reserved_quantity = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(state.as_str())
        .bind(reserved_quantity)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_reservation", e))?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::storage(
                "update_reservation",
                format!("reservation {id} does not exist"),
            ));
        }
        Ok(())
    }

    #[instrument(skip(self, event), fields(event_id = %event.id, topic = %event.topic), err)]
    async fn enqueue(&mut self, event: OutboxEvent) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO outbox (id, topic, key, event_type, payload, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(&event.topic)
        .bind(&event.key)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.occurred_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("enqueue_outbox", e))?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn claim_outbox(&mut self, limit: u32) -> Result<Vec<OutboxEvent>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, key, event_type, payload, occurred_at
            FROM outbox
            WHERE published_at IS NULL
            ORDER BY occurred_at ASC, id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("claim_outbox", e))?;

        rows.iter()
            .map(|r| decode::<OutboxRow>("claim_outbox", r).map(OutboxEvent::from))
            .collect()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn mark_published(&mut self, ids: &[Uuid]) -> Result<(), LedgerError> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE outbox SET published_at = NOW() WHERE id = ANY($1)")
            .bind(ids)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("mark_published", e))?;
        Ok(())
    }

    async fn commit(self) -> Result<(), LedgerError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), LedgerError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_transaction", e))
    }
}

fn decode<'r, T: FromRow<'r, PgRow>>(operation: &'static str, row: &'r PgRow) -> Result<T, LedgerError> {
    T::from_row(row).map_err(|e| LedgerError::storage(operation, format!("failed to decode row: {e}")))
}

fn reservation_from_row(operation: &'static str, row: &PgRow) -> Result<Reservation, LedgerError> {
    let raw: ReservationRow = decode(operation, row)?;
    let state = raw
        .state
        .parse::<ReserveState>()
        .map_err(|e| LedgerError::storage(operation, e))?;
    Ok(Reservation {
        id: raw.id,
        request_id: raw.request_id,
        requester: raw.requester,
        sku: raw.sku,
        state,
        reserved_quantity: raw.reserved_quantity,
        requested_quantity: raw.requested_quantity,
        created: raw.created,
    })
}

/// Map SQLx errors to `LedgerError`.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") | Some("40P01") => LedgerError::Conflict(msg),
                _ => LedgerError::Storage {
                    operation,
                    message: msg,
                },
            }
        }
        sqlx::Error::PoolClosed => LedgerError::storage(operation, "connection pool closed"),
        other => LedgerError::storage(operation, other),
    }
}

struct ProductRow {
    sku: String,
    upc: String,
    name: String,
    available: i64,
    reserved: i64,
}

impl<'r> FromRow<'r, PgRow> for ProductRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ProductRow {
            sku: row.try_get("sku")?,
            upc: row.try_get("upc")?,
            name: row.try_get("name")?,
            available: row.try_get("available")?,
            reserved: row.try_get("reserved")?,
        })
    }
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Product {
            sku: row.sku,
            upc: row.upc,
            name: row.name,
            available: row.available,
            reserved: row.reserved,
        }
    }
}

struct ProductionEventRow {
    id: i64,
    request_id: String,
    sku: String,
    quantity: i64,
    created: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ProductionEventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ProductionEventRow {
            id: row.try_get("id")?,
            request_id: row.try_get("request_id")?,
            sku: row.try_get("sku")?,
            quantity: row.try_get("quantity")?,
            created: row.try_get("created")?,
        })
    }
}

impl From<ProductionEventRow> for ProductionEvent {
    fn from(row: ProductionEventRow) -> Self {
        ProductionEvent {
            id: row.id,
            request_id: row.request_id,
            sku: row.sku,
            quantity: row.quantity,
            created: row.created,
        }
    }
}

struct ReservationRow {
    id: i64,
    request_id: String,
    requester: String,
    sku: String,
    state: String,
    reserved_quantity: i64,
    requested_quantity: i64,
    created: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ReservationRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ReservationRow {
            id: row.try_get("id")?,
            request_id: row.try_get("request_id")?,
            requester: row.try_get("requester")?,
            sku: row.try_get("sku")?,
            state: row.try_get("state")?,
            reserved_quantity: row.try_get("reserved_quantity")?,
            requested_quantity: row.try_get("requested_quantity")?,
            created: row.try_get("created")?,
        })
    }
}

struct OutboxRow {
    id: Uuid,
    topic: String,
    key: String,
    event_type: String,
    payload: JsonValue,
    occurred_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            topic: row.try_get("topic")?,
            key: row.try_get("key")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            occurred_at: row.try_get("occurred_at")?,
        })
    }
}

impl From<OutboxRow> for OutboxEvent {
    fn from(row: OutboxRow) -> Self {
        OutboxEvent {
            id: row.id,
            topic: row.topic,
            key: row.key,
            event_type: row.event_type,
            payload: row.payload,
            occurred_at: row.occurred_at,
        }
    }
}

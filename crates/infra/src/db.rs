//! Postgres connection bootstrap.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::ledger::PostgresLedgerStore;
use crate::retry::{RetryPolicy, retry_async};

/// Connect to Postgres, retrying connection failures per `policy`.
///
/// Only the initial connect is retried; the pool handles reconnects afterwards.
pub async fn connect_with_retry(url: &str, policy: &RetryPolicy) -> Result<PgPool, sqlx::Error> {
    let pool = retry_async(policy, "connect_postgres", |_| true, || {
        PgPoolOptions::new().max_connections(10).connect(url)
    })
    .await?;
    tracing::info!("connected to postgres");
    Ok(pool)
}

/// [`connect_with_retry`] wrapped into a ledger store.
pub async fn connect_ledger(url: &str, policy: &RetryPolicy) -> Result<PostgresLedgerStore, sqlx::Error> {
    connect_with_retry(url, policy).await.map(PostgresLedgerStore::new)
}

//! Infrastructure layer: ledger storage, outbox relay, allocation engine, config.

pub mod config;
pub mod db;
pub mod engine;
pub mod event_bus;
pub mod ledger;
pub mod outbox;
pub mod retry;

pub use config::{AppConfig, ConfigError};
pub use engine::{
    AllocationEngine, AllocationError, EngineConfig, ProductionOutcome, ReservationOutcome,
    SweepOutcome, SweepReport,
};
pub use ledger::{InMemoryLedgerStore, LedgerError, LedgerStore, LedgerTx, PostgresLedgerStore};
pub use outbox::{OutboxEvent, OutboxRelay, RelayHandle, Topics};
pub use retry::{Backoff, RetryPolicy};

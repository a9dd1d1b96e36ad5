use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;

use smfg_core::Page;
use smfg_events::{EventBus, InMemoryEventBus};
use smfg_infra::{
    AllocationEngine, AllocationError, AppConfig, EngineConfig, InMemoryLedgerStore, OutboxRelay,
    ProductionOutcome, RelayHandle, ReservationOutcome,
};
use smfg_inventory::{Product, ProductionRequest, ReservationRequest};

#[cfg(feature = "redis")]
use anyhow::Context;
#[cfg(feature = "redis")]
use smfg_infra::{PostgresLedgerStore, db, event_bus::RedisPubSubEventBus, retry::retry_async};

type MemoryBus = Arc<InMemoryEventBus<JsonValue>>;

pub type InMemoryEngine = AllocationEngine<InMemoryLedgerStore, MemoryBus>;

#[cfg(feature = "redis")]
pub type PersistentEngine = AllocationEngine<PostgresLedgerStore, Arc<RedisPubSubEventBus>>;

#[derive(Clone)]
pub enum AppServices {
    InMemory {
        engine: Arc<InMemoryEngine>,
        event_bus: MemoryBus,
    },
    #[cfg(feature = "redis")]
    Persistent { engine: Arc<PersistentEngine> },
}

/// Run `$body` against whichever engine backs `$services`.
macro_rules! with_engine {
    ($services:expr, $engine:ident => $body:expr) => {
        match $services {
            AppServices::InMemory { engine: $engine, .. } => $body,
            #[cfg(feature = "redis")]
            AppServices::Persistent { engine: $engine } => $body,
        }
    };
}

impl AppServices {
    /// In-memory services over `store` (dev/test).
    pub fn in_memory(store: InMemoryLedgerStore, config: EngineConfig) -> Self {
        let store = Arc::new(store);
        let event_bus: MemoryBus = Arc::new(InMemoryEventBus::new());
        let relay = Arc::new(OutboxRelay::new(store.clone(), event_bus.clone()));
        let engine = Arc::new(AllocationEngine::new(store, relay, config));

        AppServices::InMemory { engine, event_bus }
    }

    /// In-memory services seeded with the demo catalogue.
    pub fn demo() -> Self {
        Self::in_memory(InMemoryLedgerStore::demo(), EngineConfig::default())
    }

    pub async fn produce(
        &self,
        sku: &str,
        request: ProductionRequest,
    ) -> Result<ProductionOutcome, AllocationError> {
        with_engine!(self, engine => engine.produce(sku, request).await)
    }

    pub async fn reserve(
        &self,
        sku: &str,
        request: ReservationRequest,
    ) -> Result<ReservationOutcome, AllocationError> {
        with_engine!(self, engine => engine.reserve(sku, request).await)
    }

    pub async fn get_product(&self, sku: &str) -> Result<Product, AllocationError> {
        with_engine!(self, engine => engine.get_product(sku).await)
    }

    pub async fn get_all_products(&self, page: Page) -> Result<Vec<Product>, AllocationError> {
        with_engine!(self, engine => engine.get_all_products(page).await)
    }

    /// Insert-only; an existing SKU is [`AllocationError::AlreadyExists`].
    pub async fn register_product(&self, product: Product) -> Result<Product, AllocationError> {
        with_engine!(self, engine => engine.register_product(product).await)
    }

    /// Start the background outbox relay. Must be called inside a tokio runtime.
    pub fn spawn_relay(&self, interval: Duration) -> RelayHandle {
        with_engine!(self, engine => engine.relay().clone().spawn(interval))
    }
}

pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    if config.in_memory {
        return Ok(build_in_memory_services(config));
    }

    #[cfg(feature = "redis")]
    {
        build_persistent_services(config).await
    }
    #[cfg(not(feature = "redis"))]
    {
        tracing::warn!("IN_MEMORY=false but redis feature not enabled, falling back to in-memory");
        Ok(build_in_memory_services(config))
    }
}

fn build_in_memory_services(config: &AppConfig) -> AppServices {
    // In-memory infra wiring (dev): demo catalogue + local bus.
    let services = AppServices::in_memory(InMemoryLedgerStore::demo(), config.engine());
    if let AppServices::InMemory { event_bus, .. } = &services {
        log_published_events(event_bus);
    }
    tracing::info!("in-memory services ready (demo catalogue)");
    services
}

/// Log every event the in-memory bus delivers, standing in for a broker consumer.
fn log_published_events(bus: &MemoryBus) {
    let sub = bus.subscribe();
    std::thread::spawn(move || {
        while let Ok(envelope) = sub.recv() {
            tracing::debug!(
                event_id = %envelope.event_id(),
                topic = envelope.topic(),
                key = envelope.key(),
                event_type = envelope.event_type(),
                "event published"
            );
        }
    });
}

#[cfg(feature = "redis")]
async fn build_persistent_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    let store = db::connect_ledger(&config.database.url(), &config.startup_retry)
        .await
        .context("failed to connect to postgres")?;
    let store = Arc::new(store);

    let bus = RedisPubSubEventBus::new(&config.redis_url)
        .context("invalid REDIS_URL")?
        .with_channel_prefix(&config.redis_channel_prefix);
    retry_async(&config.startup_retry, "connect_redis", |_| true, || {
        let bus = bus.clone();
        async move {
            tokio::task::spawn_blocking(move || bus.ping())
                .await
                .context("redis ping task failed")?
                .map_err(anyhow::Error::from)
        }
    })
    .await
    .context("failed to connect to redis")?;

    let relay = Arc::new(OutboxRelay::new(store.clone(), Arc::new(bus)));
    let engine = Arc::new(AllocationEngine::new(store, relay, config.engine()));

    // Publish anything a previous process committed but never delivered.
    engine.relay().drain_logged().await;

    tracing::info!("persistent services ready (postgres + redis)");
    Ok(AppServices::Persistent { engine })
}

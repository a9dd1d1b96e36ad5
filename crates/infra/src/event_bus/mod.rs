//! Infrastructure event bus implementations.
//!
//! The bus abstraction lives in `smfg-events` as pure mechanics. This module
//! provides broker-backed implementations (feature `redis`).

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBusError, RedisPubSubEventBus};

use chrono::{DateTime, Utc};

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - keyed by the entity they describe, so consumers can partition on it
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "inventory.product.changed").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// Partition key (for inventory events, the SKU).
    fn key(&self) -> &str;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}

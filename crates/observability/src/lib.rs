//! Tracing/logging setup shared by the binaries.

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use crate::tracing::{LogConfig, LogFormat, ParseLogFormatError};

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(config: &LogConfig) {
    tracing::init(config);
}

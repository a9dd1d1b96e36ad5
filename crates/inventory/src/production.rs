use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use smfg_core::{DomainError, DomainResult};

/// An addition to inventory through production of a product.
///
/// Append-only: recorded once per unique `request_id` and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionEvent {
    /// Assigned by the ledger on insert; `0` until persisted.
    pub id: i64,
    #[serde(rename = "requestID")]
    pub request_id: String,
    pub sku: String,
    pub quantity: i64,
    pub created: DateTime<Utc>,
}

impl ProductionEvent {
    /// Accept a validated request for `sku`, stamped at `created`.
    ///
    /// The stamp is cut to microseconds, the resolution the ledger stores, so a
    /// replay returns the same `created` as the first response.
    pub fn accept(sku: impl Into<String>, request: &ProductionRequest, created: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            request_id: request.request_id.clone(),
            sku: sku.into(),
            quantity: request.quantity,
            created: stored_precision(created),
        }
    }
}

/// Command: record produced units for a SKU.
///
/// The SKU comes from the route, and `id`/`created` are always assigned server-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionRequest {
    #[serde(rename = "requestID", default)]
    pub request_id: String,
    #[serde(default)]
    pub quantity: i64,
}

impl ProductionRequest {
    pub fn new(request_id: impl Into<String>, quantity: i64) -> Self {
        Self {
            request_id: request_id.into(),
            quantity,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        require_request_id(&self.request_id)?;
        if self.quantity < 1 {
            return Err(DomainError::validation("quantity must be at least 1"));
        }
        Ok(())
    }
}

/// Truncate `at` to the microsecond resolution of ledger timestamps.
pub(crate) fn stored_precision(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}

pub(crate) fn require_request_id(request_id: &str) -> DomainResult<()> {
    if request_id.trim().is_empty() {
        return Err(DomainError::validation("requestID is required"));
    }
    Ok(())
}

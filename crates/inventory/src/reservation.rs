use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use smfg_core::{DomainError, DomainResult};

use crate::production::{require_request_id, stored_precision};

/// Reservation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReserveState {
    Open,
    Closed,
}

impl ReserveState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReserveState::Open => "Open",
            ReserveState::Closed => "Closed",
        }
    }
}

impl fmt::Display for ReserveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReserveState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Open" => Ok(ReserveState::Open),
            "Closed" => Ok(ReserveState::Closed),
            other => Err(DomainError::validation(format!("unknown reservation state '{other}'"))),
        }
    }
}

/// Inventory set aside for a requester against one SKU.
///
/// Created `Open` with nothing reserved. Only allocation mutates it, and it becomes
/// `Closed` exactly when `reserved_quantity == requested_quantity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    /// Assigned by the ledger on insert; `0` until persisted.
    pub id: i64,
    #[serde(rename = "requestID")]
    pub request_id: String,
    pub requester: String,
    pub sku: String,
    pub state: ReserveState,
    pub reserved_quantity: i64,
    pub requested_quantity: i64,
    pub created: DateTime<Utc>,
}

impl Reservation {
    /// A new open reservation for `sku` built from a validated request.
    ///
    /// `created` is kept at microsecond precision, like [`ProductionEvent::accept`].
    ///
    /// [`ProductionEvent::accept`]: crate::ProductionEvent::accept
    pub fn open(sku: impl Into<String>, request: &ReservationRequest, created: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            request_id: request.request_id.clone(),
            requester: request.requester.clone(),
            sku: sku.into(),
            state: ReserveState::Open,
            reserved_quantity: 0,
            requested_quantity: request.requested_quantity,
            created: stored_precision(created),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == ReserveState::Open
    }

    /// Units still needed to close the reservation.
    pub fn remaining(&self) -> i64 {
        self.requested_quantity - self.reserved_quantity
    }
}

/// Command: reserve units of a SKU.
///
/// The SKU comes from the route; state, reserved quantity, and timestamps are server-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationRequest {
    #[serde(rename = "requestID", default)]
    pub request_id: String,
    #[serde(default)]
    pub requester: String,
    #[serde(default)]
    pub requested_quantity: i64,
}

impl ReservationRequest {
    pub fn new(request_id: impl Into<String>, requester: impl Into<String>, requested_quantity: i64) -> Self {
        Self {
            request_id: request_id.into(),
            requester: requester.into(),
            requested_quantity,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        require_request_id(&self.request_id)?;
        if self.requested_quantity < 1 {
            return Err(DomainError::validation("requestedQuantity must be at least 1"));
        }
        Ok(())
    }
}

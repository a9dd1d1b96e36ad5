use serde::{Deserialize, Serialize};

use smfg_core::{DomainError, DomainResult};

use crate::reservation::{Reservation, ReserveState};

/// A SKU the factory can produce, with its on-hand counters.
///
/// Invariant: `available >= 0 && reserved >= 0`. Counters change only through
/// [`Product::receive`] and [`Product::allocate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub sku: String,
    pub upc: String,
    pub name: String,
    pub available: i64,
    pub reserved: i64,
}

/// Result of allocating stock to one reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Allocation {
    /// Units moved from `available` to the reservation.
    pub quantity: i64,
    /// Whether the reservation was closed by this allocation.
    pub closed: bool,
}

impl Product {
    /// A catalogue entry with no stock.
    pub fn new(sku: impl Into<String>, upc: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            sku: sku.into(),
            upc: upc.into(),
            name: name.into(),
            available: 0,
            reserved: 0,
        }
    }

    /// Add produced units to `available`.
    pub fn receive(&mut self, quantity: i64) -> DomainResult<()> {
        if quantity < 1 {
            return Err(DomainError::validation("quantity must be at least 1"));
        }
        self.available = self
            .available
            .checked_add(quantity)
            .ok_or_else(|| DomainError::invariant(format!("available overflow for sku {}", self.sku)))?;
        Ok(())
    }

    /// Allocate as much available stock as possible to `reservation`.
    ///
    /// Moves `min(remaining, available)` units from `available` to `reserved` and the
    /// reservation's `reserved_quantity`. When the reservation becomes fully reserved
    /// it is closed and its `requested_quantity` leaves the reserved pool (handed off
    /// for shipment). Nothing is mutated if any check fails.
    pub fn allocate(&mut self, reservation: &mut Reservation) -> DomainResult<Allocation> {
        if reservation.sku != self.sku {
            return Err(DomainError::invariant(format!(
                "reservation {} belongs to sku {}, not {}",
                reservation.request_id, reservation.sku, self.sku
            )));
        }
        if reservation.state == ReserveState::Closed {
            return Err(DomainError::invariant(format!(
                "reservation {} is already closed",
                reservation.request_id
            )));
        }
        if self.available < 0 || self.reserved < 0 {
            return Err(DomainError::invariant(format!(
                "sku {} has negative counters (available {}, reserved {})",
                self.sku, self.available, self.reserved
            )));
        }

        let remaining = reservation.remaining();
        if remaining <= 0 {
            return Err(DomainError::invariant(format!(
                "open reservation {} has nothing left to reserve",
                reservation.request_id
            )));
        }

        let quantity = remaining.min(self.available);
        let reserved_quantity = reservation.reserved_quantity + quantity;
        let closed = reserved_quantity == reservation.requested_quantity;

        let mut reserved = self
            .reserved
            .checked_add(quantity)
            .ok_or_else(|| DomainError::invariant(format!("reserved overflow for sku {}", self.sku)))?;
        if closed {
            reserved -= reservation.requested_quantity;
            if reserved < 0 {
                return Err(DomainError::invariant(format!(
                    "closing reservation {} would leave reserved at {reserved} for sku {}",
                    reservation.request_id, self.sku
                )));
            }
        }

        self.available -= quantity;
        self.reserved = reserved;
        reservation.reserved_quantity = reserved_quantity;
        if closed {
            reservation.state = ReserveState::Closed;
        }

        Ok(Allocation { quantity, closed })
    }
}

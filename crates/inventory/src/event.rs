use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use smfg_events::Event;

use crate::product::Product;
use crate::reservation::Reservation;

/// Event: a product's counters changed (carries the full product).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryChanged {
    pub product: Product,
    pub occurred_at: DateTime<Utc>,
}

/// Event: a reservation was fully allocated and closed (carries the full reservation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationFilled {
    pub reservation: Reservation,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryEvent {
    InventoryChanged(InventoryChanged),
    ReservationFilled(ReservationFilled),
}

impl InventoryEvent {
    pub fn inventory_changed(product: Product, occurred_at: DateTime<Utc>) -> Self {
        Self::InventoryChanged(InventoryChanged { product, occurred_at })
    }

    pub fn reservation_filled(reservation: Reservation, occurred_at: DateTime<Utc>) -> Self {
        Self::ReservationFilled(ReservationFilled {
            reservation,
            occurred_at,
        })
    }
}

impl Event for InventoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::InventoryChanged(_) => "inventory.product.changed",
            InventoryEvent::ReservationFilled(_) => "inventory.reservation.filled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn key(&self) -> &str {
        match self {
            InventoryEvent::InventoryChanged(e) => &e.product.sku,
            InventoryEvent::ReservationFilled(e) => &e.reservation.sku,
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InventoryEvent::InventoryChanged(e) => e.occurred_at,
            InventoryEvent::ReservationFilled(e) => e.occurred_at,
        }
    }
}

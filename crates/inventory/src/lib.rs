//! Inventory domain module.
//!
//! This crate contains the business rules for production intake, reservations, and
//! allocation, implemented purely as deterministic domain logic (no IO, no HTTP,
//! no storage).

pub mod event;
pub mod product;
pub mod production;
pub mod reservation;

pub use event::{InventoryChanged, InventoryEvent, ReservationFilled};
pub use product::{Allocation, Product};
pub use production::{ProductionEvent, ProductionRequest};
pub use reservation::{ReservationRequest, Reservation, ReserveState};

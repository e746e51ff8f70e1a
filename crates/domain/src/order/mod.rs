//! Order aggregate and related types.
//!
//! A small sample domain that schedules its own follow-up work: placing an
//! order schedules the card charge for later and the shipment to run once
//! the charge has been recorded.

mod aggregate;
mod commands;
mod events;
mod state;
mod value_objects;

pub use aggregate::Order;
pub use commands::{AddItem, CancelOrder, ChargeCreditCard, CreateOrder, PlaceOrder, ShipOrder};
pub use events::OrderEvent;
pub use state::OrderState;
pub use value_objects::{CustomerId, Money, OrderItem, ProductId};

use thiserror::Error;

/// Errors that can occur during order operations.
#[derive(Debug, Error)]
pub enum OrderError {
    /// Order is already created.
    #[error("Order already created")]
    AlreadyCreated,

    /// Order does not exist yet.
    #[error("Order not created")]
    NotCreated,

    /// Order is not in the expected state.
    #[error("Invalid state transition: cannot {action} from {current_state} state")]
    InvalidStateTransition {
        current_state: OrderState,
        action: &'static str,
    },

    /// Invalid quantity.
    #[error("Invalid quantity: {quantity} (must be greater than 0)")]
    InvalidQuantity { quantity: u32 },

    /// Invalid price.
    #[error("Invalid price: {price} (must be greater than 0)")]
    InvalidPrice { price: i64 },

    /// Order has no items.
    #[error("Order has no items")]
    NoItems,

    /// The charge delay does not fit in a date.
    #[error("Invalid charge delay: {days} days")]
    InvalidChargeDelay { days: i64 },

    /// A follow-up command could not be serialized for scheduling.
    #[error("Could not schedule follow-up command: {0}")]
    Scheduling(#[from] serde_json::Error),
}

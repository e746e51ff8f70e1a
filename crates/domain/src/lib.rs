//! Domain layer for the event-sourcing system.
//!
//! This crate provides the core domain abstractions including:
//! - Aggregate trait for event-sourced entities
//! - DomainEvent trait for domain events
//! - Command trait and CommandHandler for command processing, including
//!   commands an aggregate schedules for later delivery
//! - A sample Order aggregate that schedules its own follow-up commands

pub mod aggregate;
pub mod command;
pub mod error;
pub mod order;
pub mod scheduled;

pub use aggregate::{Aggregate, DomainEvent};
pub use command::{Command, CommandContext, CommandHandler, CommandResult};
pub use error::{DomainError, Result};
pub use order::{
    AddItem, CancelOrder, ChargeCreditCard, CreateOrder, CustomerId, Money, Order, OrderError,
    OrderEvent, OrderItem, OrderState, PlaceOrder, ProductId, ShipOrder,
};
pub use scheduled::{CommandScheduled, SCHEDULED_EVENT_PREFIX, is_scheduled_event};

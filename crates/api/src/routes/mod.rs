//! HTTP route handlers.

pub mod clocks;
pub mod health;
pub mod metrics;
pub mod sensors;

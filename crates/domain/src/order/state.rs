//! Order state machine.

use serde::{Deserialize, Serialize};

/// The state of an order in its lifecycle.
///
/// State transitions:
/// ```text
/// Draft ──► Placed ──► Paid ──► Shipped
///   │         │         │
///   └─────────┴─────────┴──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderState {
    /// Items can be added.
    #[default]
    Draft,

    /// Order placed, payment pending.
    Placed,

    /// Payment charged, awaiting shipment.
    Paid,

    /// Shipped (terminal state).
    Shipped,

    /// Cancelled (terminal state).
    Cancelled,
}

impl OrderState {
    pub fn can_modify_items(&self) -> bool {
        matches!(self, OrderState::Draft)
    }

    pub fn can_place(&self) -> bool {
        matches!(self, OrderState::Draft)
    }

    pub fn can_charge(&self) -> bool {
        matches!(self, OrderState::Placed)
    }

    pub fn can_ship(&self) -> bool {
        matches!(self, OrderState::Paid)
    }

    pub fn can_cancel(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns true if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Shipped | OrderState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Draft => "Draft",
            OrderState::Placed => "Placed",
            OrderState::Paid => "Paid",
            OrderState::Shipped => "Shipped",
            OrderState::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_cannot_cancel() {
        assert!(OrderState::Draft.can_cancel());
        assert!(OrderState::Paid.can_cancel());
        assert!(!OrderState::Shipped.can_cancel());
        assert!(!OrderState::Cancelled.can_cancel());
    }

    #[test]
    fn only_placed_orders_can_be_charged() {
        assert!(OrderState::Placed.can_charge());
        assert!(!OrderState::Draft.can_charge());
        assert!(!OrderState::Paid.can_charge());
    }
}

//! Order commands.

use common::{AggregateId, ETag, Precondition};
use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandContext};

use super::{CustomerId, Order, OrderError, OrderEvent, OrderItem};

/// Command to create a new order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrder {
    pub order_id: AggregateId,
    pub customer_id: CustomerId,
}

impl CreateOrder {
    /// Creates a new CreateOrder command with a generated order ID.
    pub fn for_customer(customer_id: CustomerId) -> Self {
        Self {
            order_id: AggregateId::new(),
            customer_id,
        }
    }
}

impl Command for CreateOrder {
    type Aggregate = Order;
    const NAME: &'static str = "CreateOrder";

    fn aggregate_id(&self) -> AggregateId {
        self.order_id
    }

    fn execute(&self, order: &Order, ctx: &mut CommandContext) -> Result<Vec<OrderEvent>, OrderError> {
        order.create(self.order_id, self.customer_id, ctx.now())
    }
}

/// Command to add an item to an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddItem {
    pub order_id: AggregateId,
    pub item: OrderItem,
}

impl AddItem {
    pub fn new(order_id: AggregateId, item: OrderItem) -> Self {
        Self { order_id, item }
    }
}

impl Command for AddItem {
    type Aggregate = Order;
    const NAME: &'static str = "AddItem";

    fn aggregate_id(&self) -> AggregateId {
        self.order_id
    }

    fn execute(&self, order: &Order, _ctx: &mut CommandContext) -> Result<Vec<OrderEvent>, OrderError> {
        order.add_item(self.item.clone())
    }
}

/// Command to place an order.
///
/// Schedules the card charge `charge_after_days` from now (immediately when
/// zero) and the shipment to follow once the charge is recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub order_id: AggregateId,
    #[serde(default)]
    pub charge_after_days: i64,
}

impl PlaceOrder {
    pub fn new(order_id: AggregateId, charge_after_days: i64) -> Self {
        Self {
            order_id,
            charge_after_days,
        }
    }
}

impl Command for PlaceOrder {
    type Aggregate = Order;
    const NAME: &'static str = "PlaceOrder";

    fn aggregate_id(&self) -> AggregateId {
        self.order_id
    }

    fn execute(&self, order: &Order, ctx: &mut CommandContext) -> Result<Vec<OrderEvent>, OrderError> {
        let charge_etag = ETag::random();
        let events = order.place(charge_etag.clone(), ctx.now())?;

        let charge_at = if self.charge_after_days > 0 {
            let due = chrono::Duration::try_days(self.charge_after_days)
                .and_then(|delay| ctx.now().checked_add_signed(delay))
                .ok_or(OrderError::InvalidChargeDelay {
                    days: self.charge_after_days,
                })?;
            Some(due)
        } else {
            None
        };
        let charge = ChargeCreditCard {
            order_id: self.order_id,
            etag: charge_etag.clone(),
        };
        let ship = ShipOrder {
            order_id: self.order_id,
        };

        ctx.schedule(&charge, charge_at)?;
        ctx.schedule_after(&ship, None, Precondition::new(self.order_id, charge_etag))?;

        Ok(events)
    }
}

/// Command to charge the order total. Carries the etag chosen when the order
/// was placed, so a repeated delivery charges once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeCreditCard {
    pub order_id: AggregateId,
    pub etag: ETag,
}

impl Command for ChargeCreditCard {
    type Aggregate = Order;
    const NAME: &'static str = "ChargeCreditCard";

    fn aggregate_id(&self) -> AggregateId {
        self.order_id
    }

    fn etag(&self) -> Option<ETag> {
        Some(self.etag.clone())
    }

    fn execute(&self, order: &Order, ctx: &mut CommandContext) -> Result<Vec<OrderEvent>, OrderError> {
        order.charge(ctx.now())
    }
}

/// Command to ship a paid order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipOrder {
    pub order_id: AggregateId,
}

impl Command for ShipOrder {
    type Aggregate = Order;
    const NAME: &'static str = "ShipOrder";

    fn aggregate_id(&self) -> AggregateId {
        self.order_id
    }

    fn execute(&self, order: &Order, ctx: &mut CommandContext) -> Result<Vec<OrderEvent>, OrderError> {
        order.ship(ctx.now())
    }
}

/// Command to cancel an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOrder {
    pub order_id: AggregateId,
    pub reason: String,
}

impl CancelOrder {
    pub fn new(order_id: AggregateId, reason: impl Into<String>) -> Self {
        Self {
            order_id,
            reason: reason.into(),
        }
    }
}

impl Command for CancelOrder {
    type Aggregate = Order;
    const NAME: &'static str = "CancelOrder";

    fn aggregate_id(&self) -> AggregateId {
        self.order_id
    }

    fn execute(&self, order: &Order, ctx: &mut CommandContext) -> Result<Vec<OrderEvent>, OrderError> {
        order.cancel(self.reason.clone(), ctx.now())
    }
}

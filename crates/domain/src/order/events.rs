//! Order domain events.

use chrono::{DateTime, Utc};
use common::{AggregateId, ETag};
use serde::{Deserialize, Serialize};

use crate::aggregate::DomainEvent;

use super::{CustomerId, Money, OrderItem};

/// Events that can occur on an order aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrderEvent {
    OrderCreated {
        order_id: AggregateId,
        customer_id: CustomerId,
        created_at: DateTime<Utc>,
    },

    ItemAdded { item: OrderItem },

    /// Order was placed; payment is charged later under `charge_etag`.
    OrderPlaced {
        placed_at: DateTime<Utc>,
        total_amount: Money,
        charge_etag: ETag,
    },

    PaymentCharged {
        amount: Money,
        charged_at: DateTime<Utc>,
    },

    OrderShipped { shipped_at: DateTime<Utc> },

    OrderCancelled {
        reason: String,
        cancelled_at: DateTime<Utc>,
    },
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderCreated { .. } => "OrderCreated",
            OrderEvent::ItemAdded { .. } => "ItemAdded",
            OrderEvent::OrderPlaced { .. } => "OrderPlaced",
            OrderEvent::PaymentCharged { .. } => "PaymentCharged",
            OrderEvent::OrderShipped { .. } => "OrderShipped",
            OrderEvent::OrderCancelled { .. } => "OrderCancelled",
        }
    }
}

//! Order aggregate implementation.

use chrono::{DateTime, Utc};
use common::{AggregateId, ETag};

use crate::aggregate::Aggregate;

use super::{CustomerId, Money, OrderError, OrderEvent, OrderItem, OrderState};

/// Order aggregate root.
#[derive(Debug, Clone, Default)]
pub struct Order {
    id: Option<AggregateId>,
    version: i64,
    customer_id: Option<CustomerId>,
    state: OrderState,
    items: Vec<OrderItem>,
    total_amount: Money,
    charge_etag: Option<ETag>,
    amount_paid: Money,
}

impl Aggregate for Order {
    type Event = OrderEvent;
    type Error = OrderError;

    fn aggregate_type() -> &'static str {
        "Order"
    }

    fn id(&self) -> Option<AggregateId> {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            OrderEvent::OrderCreated {
                order_id,
                customer_id,
                ..
            } => {
                self.id = Some(order_id);
                self.customer_id = Some(customer_id);
                self.state = OrderState::Draft;
            }
            OrderEvent::ItemAdded { item } => {
                self.total_amount += item.total_price();
                self.items.push(item);
            }
            OrderEvent::OrderPlaced { charge_etag, .. } => {
                self.state = OrderState::Placed;
                self.charge_etag = Some(charge_etag);
            }
            OrderEvent::PaymentCharged { amount, .. } => {
                self.state = OrderState::Paid;
                self.amount_paid += amount;
            }
            OrderEvent::OrderShipped { .. } => self.state = OrderState::Shipped,
            OrderEvent::OrderCancelled { .. } => self.state = OrderState::Cancelled,
        }
    }
}

// Query methods
impl Order {
    pub fn customer_id(&self) -> Option<CustomerId> {
        self.customer_id
    }

    pub fn state(&self) -> OrderState {
        self.state
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn total_amount(&self) -> Money {
        self.total_amount
    }

    pub fn amount_paid(&self) -> Money {
        self.amount_paid
    }

    /// Etag the card charge will be recorded under once the order is placed.
    pub fn charge_etag(&self) -> Option<&ETag> {
        self.charge_etag.as_ref()
    }
}

// Command methods: each returns the events that record its effect.
impl Order {
    pub fn create(
        &self,
        order_id: AggregateId,
        customer_id: CustomerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        if self.id.is_some() {
            return Err(OrderError::AlreadyCreated);
        }
        Ok(vec![OrderEvent::OrderCreated {
            order_id,
            customer_id,
            created_at: now,
        }])
    }

    pub fn add_item(&self, item: OrderItem) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_created()?;
        self.ensure(self.state.can_modify_items(), "add items")?;
        if item.quantity == 0 {
            return Err(OrderError::InvalidQuantity {
                quantity: item.quantity,
            });
        }
        if !item.unit_price.is_positive() {
            return Err(OrderError::InvalidPrice {
                price: item.unit_price.cents(),
            });
        }
        Ok(vec![OrderEvent::ItemAdded { item }])
    }

    pub fn place(&self, charge_etag: ETag, now: DateTime<Utc>) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_created()?;
        self.ensure(self.state.can_place(), "place")?;
        if self.items.is_empty() {
            return Err(OrderError::NoItems);
        }
        Ok(vec![OrderEvent::OrderPlaced {
            placed_at: now,
            total_amount: self.total_amount,
            charge_etag,
        }])
    }

    pub fn charge(&self, now: DateTime<Utc>) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_created()?;
        self.ensure(self.state.can_charge(), "charge")?;
        Ok(vec![OrderEvent::PaymentCharged {
            amount: self.total_amount,
            charged_at: now,
        }])
    }

    pub fn ship(&self, now: DateTime<Utc>) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_created()?;
        self.ensure(self.state.can_ship(), "ship")?;
        Ok(vec![OrderEvent::OrderShipped { shipped_at: now }])
    }

    pub fn cancel(&self, reason: String, now: DateTime<Utc>) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_created()?;
        self.ensure(self.state.can_cancel(), "cancel")?;
        Ok(vec![OrderEvent::OrderCancelled {
            reason,
            cancelled_at: now,
        }])
    }

    fn ensure_created(&self) -> Result<(), OrderError> {
        if self.id.is_none() {
            return Err(OrderError::NotCreated);
        }
        Ok(())
    }

    fn ensure(&self, allowed: bool, action: &'static str) -> Result<(), OrderError> {
        if allowed {
            Ok(())
        } else {
            Err(OrderError::InvalidStateTransition {
                current_state: self.state,
                action,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created_order() -> Order {
        let mut order = Order::default();
        let events = order
            .create(AggregateId::new(), CustomerId::new(), Utc::now())
            .unwrap();
        order.apply_events(events);
        order
    }

    #[test]
    fn create_twice_fails() {
        let order = created_order();
        let result = order.create(AggregateId::new(), CustomerId::new(), Utc::now());
        assert!(matches!(result, Err(OrderError::AlreadyCreated)));
    }

    #[test]
    fn items_accumulate_total() {
        let mut order = created_order();
        for events in [
            order.add_item(OrderItem::new("A", 2, Money::from_cents(500))).unwrap(),
            order.add_item(OrderItem::new("B", 1, Money::from_cents(250))).unwrap(),
        ] {
            order.apply_events(events);
        }
        assert_eq!(order.total_amount(), Money::from_cents(1250));
        assert_eq!(order.items().len(), 2);
    }

    #[test]
    fn cannot_place_empty_order() {
        let order = created_order();
        assert!(matches!(
            order.place(ETag::random(), Utc::now()),
            Err(OrderError::NoItems)
        ));
    }

    #[test]
    fn full_lifecycle() {
        let mut order = created_order();
        let now = Utc::now();

        let events = order.add_item(OrderItem::new("A", 1, Money::from_cents(100))).unwrap();
        order.apply_events(events);
        let events = order.place(ETag::new("charge"), now).unwrap();
        order.apply_events(events);
        assert_eq!(order.charge_etag(), Some(&ETag::new("charge")));

        assert!(order.ship(now).is_err());
        let events = order.charge(now).unwrap();
        order.apply_events(events);
        assert_eq!(order.amount_paid(), Money::from_cents(100));

        let events = order.ship(now).unwrap();
        order.apply_events(events);
        assert_eq!(order.state(), OrderState::Shipped);
        assert!(order.cancel("late".to_string(), now).is_err());
    }
}

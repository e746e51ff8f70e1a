//! Handing scheduled commands to the aggregates they target.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::ETag;
use domain::{Aggregate, Command, CommandContext, CommandHandler, DomainError};
use event_store::EventStore;
use futures_util::future::BoxFuture;

use crate::command::ScheduledCommand;
use crate::retry::RetryDirective;

/// Why a delivery failed and what to do about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub error: String,
    pub retry: RetryDirective,
    /// The target was changed concurrently. Retried at once, never abandoned.
    pub concurrency: bool,
}

impl DeliveryFailure {
    pub fn new(error: impl Into<String>, retry: RetryDirective) -> Self {
        Self {
            error: error.into(),
            retry,
            concurrency: false,
        }
    }

    pub fn concurrency(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            retry: RetryDirective::After(chrono::Duration::zero()),
            concurrency: true,
        }
    }
}

/// Executes a scheduled command.
///
/// `now` is the time of the command's clock, which the command sees as the
/// current time.
#[async_trait]
pub trait CommandDeliverer: Send + Sync {
    async fn deliver(&self, command: &ScheduledCommand, now: DateTime<Utc>) -> Result<(), DeliveryFailure>;
}

/// Etag recorded by a delivered command that carries none of its own, so a
/// second delivery of the same scheduled command changes nothing.
pub fn delivery_etag(command: &ScheduledCommand) -> ETag {
    ETag::new(format!("{}:{}", command.aggregate_id, command.sequence_number))
}

type RetryFn = Arc<dyn Fn(&DomainError, i32) -> RetryDirective + Send + Sync>;

type DeliverFn =
    Box<dyn Fn(ScheduledCommand, DateTime<Utc>) -> BoxFuture<'static, Result<(), DeliveryFailure>> + Send + Sync>;

/// [`CommandDeliverer`] running domain commands through a [`CommandHandler`].
///
/// Commands are looked up by aggregate type and command name; each
/// registered command type is deserialized and executed against the event
/// store with the command's clock and its current time.
pub struct AggregateCommandDeliverer<S> {
    store: S,
    handlers: HashMap<(String, String), DeliverFn>,
}

impl<S> AggregateCommandDeliverer<S>
where
    S: EventStore + Clone + 'static,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
        }
    }

    /// Registers command type `C`, retrying rejections per the default policy.
    pub fn register<C>(self) -> Self
    where
        C: Command + 'static,
    {
        self.register_with::<C>(|_, _| RetryDirective::Default)
    }

    /// Registers command type `C`, choosing a [`RetryDirective`] for each
    /// failure from the error and the attempt number.
    pub fn register_with<C>(
        mut self,
        retry: impl Fn(&DomainError, i32) -> RetryDirective + Send + Sync + 'static,
    ) -> Self
    where
        C: Command + 'static,
    {
        let store = self.store.clone();
        let retry: RetryFn = Arc::new(retry);
        let deliver: DeliverFn = Box::new(move |scheduled, now| {
            let handler = CommandHandler::<S, C::Aggregate>::new(store.clone());
            let retry = Arc::clone(&retry);
            Box::pin(async move {
                let command: C = serde_json::from_str(&scheduled.serialized_command).map_err(|e| {
                    DeliveryFailure::new(format!("could not deserialize {}: {e}", C::NAME), RetryDirective::GiveUp)
                })?;
                let ctx = CommandContext::new(now)
                    .with_clock(Some(scheduled.clock_name.clone()))
                    .with_etag(Some(delivery_etag(&scheduled)));
                match handler.execute_at(&command, ctx).await {
                    Ok(_) => Ok(()),
                    Err(e) if e.is_concurrency_conflict() => Err(DeliveryFailure::concurrency(e.to_string())),
                    Err(e) => Err(DeliveryFailure::new(e.to_string(), retry(&e, scheduled.attempts))),
                }
            })
        });
        self.handlers.insert(
            (C::Aggregate::aggregate_type().to_string(), C::NAME.to_string()),
            deliver,
        );
        self
    }

    pub fn handles(&self, aggregate_type: &str, command_name: &str) -> bool {
        self.handlers
            .contains_key(&(aggregate_type.to_string(), command_name.to_string()))
    }
}

#[async_trait]
impl<S> CommandDeliverer for AggregateCommandDeliverer<S>
where
    S: EventStore + Clone + 'static,
{
    async fn deliver(&self, command: &ScheduledCommand, now: DateTime<Utc>) -> Result<(), DeliveryFailure> {
        let key = (command.aggregate_type.clone(), command.command_name.clone());
        let Some(deliver) = self.handlers.get(&key) else {
            return Err(DeliveryFailure::new(
                format!("no handler registered for {}.{}", command.aggregate_type, command.command_name),
                RetryDirective::GiveUp,
            ));
        };
        deliver(command.clone(), now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ScheduleRequest;
    use common::AggregateId;
    use domain::{AddItem, CreateOrder, CustomerId, Money, Order, OrderItem, OrderState, ShipOrder};
    use event_store::InMemoryEventStore;

    fn scheduled<C: Command>(command: &C) -> ScheduledCommand {
        ScheduleRequest::for_command(command)
            .unwrap()
            .into_command(-1, "virtual".to_string(), Utc::now())
            .unwrap()
    }

    async fn draft_order(store: &InMemoryEventStore) -> AggregateId {
        let handler: CommandHandler<_, Order> = CommandHandler::new(store.clone());
        let create = CreateOrder::for_customer(CustomerId::new());
        handler.execute(&create).await.unwrap();
        handler
            .execute(&AddItem::new(create.order_id, OrderItem::new("SKU", 1, Money::from_cents(500))))
            .await
            .unwrap();
        create.order_id
    }

    #[tokio::test]
    async fn delivers_registered_commands_at_clock_time() {
        let store = InMemoryEventStore::new();
        let order_id = draft_order(&store).await;
        let deliverer = AggregateCommandDeliverer::new(store.clone()).register::<domain::CancelOrder>();
        assert!(deliverer.handles("Order", "CancelOrder"));

        let at = Utc::now() + chrono::Duration::days(3);
        deliverer
            .deliver(&scheduled(&domain::CancelOrder::new(order_id, "late")), at)
            .await
            .unwrap();

        let order = CommandHandler::<_, Order>::new(store).load(order_id).await.unwrap();
        assert_eq!(order.state(), OrderState::Cancelled);
    }

    #[tokio::test]
    async fn second_delivery_of_one_command_changes_nothing() {
        let store = InMemoryEventStore::new();
        let order_id = draft_order(&store).await;
        let deliverer = AggregateCommandDeliverer::new(store.clone()).register::<domain::CancelOrder>();
        let command = scheduled(&domain::CancelOrder::new(order_id, "late"));

        deliverer.deliver(&command, Utc::now()).await.unwrap();
        let recorded = store.events_for_aggregate("Order", order_id).await.unwrap().len();
        deliverer.deliver(&command, Utc::now()).await.unwrap();

        assert_eq!(store.events_for_aggregate("Order", order_id).await.unwrap().len(), recorded);
        assert!(
            store
                .find_by_etag(order_id, &delivery_etag(&command))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn rejection_uses_the_registered_directive() {
        let store = InMemoryEventStore::new();
        let order_id = draft_order(&store).await;
        let deliverer = AggregateCommandDeliverer::new(store)
            .register_with::<ShipOrder>(|_, attempts| {
                if attempts >= 2 {
                    RetryDirective::GiveUp
                } else {
                    RetryDirective::After(chrono::Duration::seconds(10))
                }
            });

        let mut command = scheduled(&ShipOrder { order_id });
        command.attempts = 1;
        let failure = deliverer.deliver(&command, Utc::now()).await.unwrap_err();
        assert_eq!(failure.retry, RetryDirective::After(chrono::Duration::seconds(10)));
        assert!(!failure.concurrency);

        command.attempts = 2;
        let failure = deliverer.deliver(&command, Utc::now()).await.unwrap_err();
        assert_eq!(failure.retry, RetryDirective::GiveUp);
    }

    #[tokio::test]
    async fn unknown_commands_are_given_up() {
        let deliverer = AggregateCommandDeliverer::new(InMemoryEventStore::new());
        let failure = deliverer
            .deliver(&scheduled(&ShipOrder { order_id: AggregateId::new() }), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(failure.retry, RetryDirective::GiveUp);
        assert!(failure.error.contains("Order.ShipOrder"));
    }
}

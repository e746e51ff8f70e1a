//! Checks whether a delivery precondition has been recorded.

use async_trait::async_trait;
use common::Precondition;
use event_store::EventStore;

use crate::Result;

/// Answers whether an event carrying a given etag exists on an aggregate.
#[async_trait]
pub trait ETagChecker: Send + Sync {
    async fn has_been_recorded(&self, precondition: &Precondition) -> Result<bool>;
}

/// [`ETagChecker`] reading the event log.
#[derive(Clone)]
pub struct EventStoreETagChecker<S> {
    store: S,
}

impl<S: EventStore> EventStoreETagChecker<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: EventStore> ETagChecker for EventStoreETagChecker<S> {
    async fn has_been_recorded(&self, precondition: &Precondition) -> Result<bool> {
        Ok(self
            .store
            .find_by_etag(precondition.aggregate_id, &precondition.etag)
            .await?
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{AggregateId, ETag};
    use event_store::{EventStoreExt, InMemoryEventStore, NewEvent};

    #[tokio::test]
    async fn finds_etags_on_the_right_aggregate_only() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        store
            .append_event(
                NewEvent::builder()
                    .stream_name("Order")
                    .event_type("PaymentCharged")
                    .aggregate_id(id)
                    .sequence_number(1)
                    .body_raw("{}")
                    .etag(ETag::new("charge-1"))
                    .build(),
            )
            .await
            .unwrap();
        let checker = EventStoreETagChecker::new(store);

        assert!(checker.has_been_recorded(&Precondition::new(id, "charge-1")).await.unwrap());
        assert!(!checker.has_been_recorded(&Precondition::new(id, "charge-2")).await.unwrap());
        assert!(
            !checker
                .has_been_recorded(&Precondition::new(AggregateId::new(), "charge-1"))
                .await
                .unwrap()
        );
    }
}

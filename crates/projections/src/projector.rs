//! Projectors and the events they receive.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AggregateId, ETag, EventId};
use event_store::{Interest, StoredEvent};
use serde::de::DeserializeOwned;

use crate::{ProjectionError, Result};

/// A stored event with its body parsed, as handed to projectors.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub id: EventId,
    pub stream_name: String,
    pub event_type: String,
    pub aggregate_id: AggregateId,
    pub sequence_number: i64,
    pub timestamp: DateTime<Utc>,
    pub etag: Option<ETag>,
    pub body: serde_json::Value,
}

impl EventEnvelope {
    /// Parses the body of a stored event.
    pub fn parse(event: &StoredEvent) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self {
            id: event.id,
            stream_name: event.stream_name.clone(),
            event_type: event.event_type.clone(),
            aggregate_id: event.aggregate_id,
            sequence_number: event.sequence_number,
            timestamp: event.timestamp,
            etag: event.etag.clone(),
            body: event.body_json()?,
        })
    }

    /// Deserializes the body into a concrete event type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.body).map_err(ProjectionError::from)
    }
}

/// A consumer of events that maintains a read model.
///
/// A projector declares its interests up front; the catchup only offers it
/// events matching them. `U` is the unit of work of the read model store the
/// projector writes through: whatever the projector stages in it commits
/// atomically with the projector's progress row.
#[async_trait]
pub trait Projector<U: Send>: Send + Sync {
    /// Explicit read model name. When `None`, the name is derived from the
    /// interests.
    fn name(&self) -> Option<String> {
        None
    }

    /// The `(stream, event type)` pairs this projector handles.
    fn interests(&self) -> Vec<Interest>;

    /// Handles one event. Returning an error rolls back `uow`.
    async fn handle(&self, event: &EventEnvelope, uow: &mut U) -> Result<()>;
}

/// Resolves the read model name of a projector.
///
/// Derived names list the interests in sorted order, so two projectors with
/// the same interest set resolve to the same name.
pub fn read_model_name<U: Send>(projector: &dyn Projector<U>) -> String {
    if let Some(name) = projector.name() {
        return name;
    }
    let mut interests = projector.interests();
    interests.sort();
    interests.dedup();
    let parts: Vec<String> = interests.iter().map(ToString::to_string).collect();
    parts.join("+")
}

/// Returns the names that appear more than once, in first-seen order.
pub(crate) fn duplicate_names(names: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    for name in names {
        if !seen.insert(name.as_str()) && !duplicates.contains(name) {
            duplicates.push(name.clone());
        }
    }
    duplicates
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(Option<&'static str>, Vec<Interest>);

    #[async_trait]
    impl Projector<()> for Named {
        fn name(&self) -> Option<String> {
            self.0.map(str::to_string)
        }

        fn interests(&self) -> Vec<Interest> {
            self.1.clone()
        }

        async fn handle(&self, _event: &EventEnvelope, _uow: &mut ()) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn derived_name_is_order_independent() {
        let a = Named(
            None,
            vec![Interest::event("Order", "Placed"), Interest::stream("Customer")],
        );
        let b = Named(
            None,
            vec![Interest::stream("Customer"), Interest::event("Order", "Placed")],
        );
        assert_eq!(read_model_name(&a), read_model_name(&b));
        assert_eq!(read_model_name(&a), "Customer.*+Order.Placed");
    }

    #[test]
    fn explicit_name_wins() {
        let p = Named(Some("orders"), vec![Interest::all()]);
        assert_eq!(read_model_name(&p), "orders");
    }

    #[test]
    fn finds_duplicates() {
        let names: Vec<String> = ["a", "b", "a", "c", "a"].iter().map(|s| s.to_string()).collect();
        assert_eq!(duplicate_names(&names), vec!["a".to_string()]);
        assert!(duplicate_names(&names[1..2]).is_empty());
    }

    #[test]
    fn envelope_parses_body() {
        let stored = event_store::NewEvent::builder()
            .stream_name("Order")
            .event_type("Placed")
            .aggregate_id(AggregateId::new())
            .sequence_number(1)
            .body_raw(r#"{"total":5}"#)
            .build()
            .into_stored(EventId::new(7));

        let envelope = EventEnvelope::parse(&stored).unwrap();
        assert_eq!(envelope.id, EventId::new(7));
        assert_eq!(envelope.body["total"], 5);

        let mut broken = stored.clone();
        broken.body = "{not json".to_string();
        assert!(EventEnvelope::parse(&broken).is_err());
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{AggregateId, ETag, EventId};

/// An event as persisted in the store.
///
/// `id` is assigned by the store on append and totally orders every event
/// across all streams. `(stream_name, aggregate_id, sequence_number)`
/// identifies the event within its aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Global position assigned by the store.
    pub id: EventId,

    /// Name of the stream, by convention the aggregate type (e.g. "Order").
    pub stream_name: String,

    /// The type of the event (e.g. "Placed", "Scheduled:ChargeCreditCard").
    pub event_type: String,

    /// The aggregate this event belongs to.
    pub aggregate_id: AggregateId,

    /// Position of the event within its aggregate.
    pub sequence_number: i64,

    /// The serialized event body.
    ///
    /// Kept as text rather than parsed JSON so a malformed body can be
    /// stored, read back, and reported instead of poisoning the reader.
    pub body: String,

    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,

    /// ETag of the command that produced this event, if any.
    pub etag: Option<ETag>,
}

impl StoredEvent {
    /// Parses the body as JSON.
    pub fn body_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.body)
    }

    /// Deserializes the body into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// An event waiting to be appended. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub stream_name: String,
    pub event_type: String,
    pub aggregate_id: AggregateId,
    pub sequence_number: i64,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub etag: Option<ETag>,
}

impl NewEvent {
    /// Creates a new event builder.
    pub fn builder() -> NewEventBuilder {
        NewEventBuilder::default()
    }

    /// Converts into a stored event at the given position.
    pub fn into_stored(self, id: EventId) -> StoredEvent {
        StoredEvent {
            id,
            stream_name: self.stream_name,
            event_type: self.event_type,
            aggregate_id: self.aggregate_id,
            sequence_number: self.sequence_number,
            body: self.body,
            timestamp: self.timestamp,
            etag: self.etag,
        }
    }
}

/// Builder for constructing events to append.
#[derive(Debug, Default)]
pub struct NewEventBuilder {
    stream_name: Option<String>,
    event_type: Option<String>,
    aggregate_id: Option<AggregateId>,
    sequence_number: Option<i64>,
    body: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    etag: Option<ETag>,
}

impl NewEventBuilder {
    /// Sets the stream name.
    pub fn stream_name(mut self, stream_name: impl Into<String>) -> Self {
        self.stream_name = Some(stream_name.into());
        self
    }

    /// Sets the event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the aggregate ID.
    pub fn aggregate_id(mut self, id: AggregateId) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    /// Sets the sequence number within the aggregate.
    pub fn sequence_number(mut self, sequence_number: i64) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }

    /// Sets the body from a serializable value.
    pub fn body<T: Serialize>(mut self, body: &T) -> Result<Self, serde_json::Error> {
        self.body = Some(serde_json::to_string(body)?);
        Ok(self)
    }

    /// Sets the body from already-serialized text.
    pub fn body_raw(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the etag of the command that produced the event.
    pub fn etag(mut self, etag: impl Into<ETag>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Sets the etag if one is present.
    pub fn maybe_etag(mut self, etag: Option<ETag>) -> Self {
        self.etag = etag;
        self
    }

    /// Builds the event.
    ///
    /// # Panics
    ///
    /// Panics if stream_name, event_type, aggregate_id, sequence_number or
    /// body are not set.
    pub fn build(self) -> NewEvent {
        NewEvent {
            stream_name: self.stream_name.expect("stream_name is required"),
            event_type: self.event_type.expect("event_type is required"),
            aggregate_id: self.aggregate_id.expect("aggregate_id is required"),
            sequence_number: self.sequence_number.expect("sequence_number is required"),
            body: self.body.expect("body is required"),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            etag: self.etag,
        }
    }

    /// Tries to build the event, returning None if required fields are missing.
    pub fn try_build(self) -> Option<NewEvent> {
        Some(NewEvent {
            stream_name: self.stream_name?,
            event_type: self.event_type?,
            aggregate_id: self.aggregate_id?,
            sequence_number: self.sequence_number?,
            body: self.body?,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            etag: self.etag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_all_fields() {
        let aggregate_id = AggregateId::new();

        let event = NewEvent::builder()
            .stream_name("Order")
            .event_type("Placed")
            .aggregate_id(aggregate_id)
            .sequence_number(3)
            .body(&serde_json::json!({"total": 10}))
            .unwrap()
            .etag("abc")
            .build();

        assert_eq!(event.stream_name, "Order");
        assert_eq!(event.event_type, "Placed");
        assert_eq!(event.aggregate_id, aggregate_id);
        assert_eq!(event.sequence_number, 3);
        assert_eq!(event.body, r#"{"total":10}"#);
        assert_eq!(event.etag, Some(ETag::new("abc")));
    }

    #[test]
    fn try_build_returns_none_on_missing_fields() {
        assert!(NewEvent::builder().event_type("Placed").try_build().is_none());
    }

    #[test]
    fn stored_event_decodes_body() {
        #[derive(Deserialize)]
        struct Placed {
            total: i64,
        }

        let stored = NewEvent::builder()
            .stream_name("Order")
            .event_type("Placed")
            .aggregate_id(AggregateId::new())
            .sequence_number(1)
            .body_raw(r#"{"total": 42}"#)
            .build()
            .into_stored(EventId::new(7));

        assert_eq!(stored.id, EventId::new(7));
        assert_eq!(stored.decode::<Placed>().unwrap().total, 42);
    }

    #[test]
    fn malformed_body_is_reported_not_panicked() {
        let stored = NewEvent::builder()
            .stream_name("Order")
            .event_type("Placed")
            .aggregate_id(AggregateId::new())
            .sequence_number(1)
            .body_raw("{not json")
            .build()
            .into_stored(EventId::new(1));

        assert!(stored.body_json().is_err());
    }
}

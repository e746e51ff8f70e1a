//! Append-only event log with an id-ordered read model.
//!
//! Every stored event carries a store-assigned [`EventId`] that totally orders
//! it against all other events. Readers consume the log forward from an id
//! cursor through an [`EventFilter`], and exclusive workers coordinate through
//! [`NamedLock`].

pub mod error;
pub mod event;
pub mod filter;
pub mod lock;
pub mod memory;
pub mod postgres;
pub mod store;

pub use common::{AggregateId, ETag, EventId, Precondition};
pub use error::{EventStoreError, Result};
pub use event::{NewEvent, NewEventBuilder, StoredEvent};
pub use filter::{EventFilter, Interest, StreamMatch, TypeMatch};
pub use lock::{InMemoryLockGuard, InMemoryNamedLock, LockGuard, NamedLock};
pub use memory::InMemoryEventStore;
pub use postgres::{PostgresEventStore, PostgresLockGuard};
pub use store::{EventStore, EventStoreExt, EventStream};

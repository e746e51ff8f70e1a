//! In-memory read model store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::EventId;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use crate::read_model_info::{EventHandlingError, ReadModelInfo};
use crate::store::{ReadModelStore, UnitOfWork};
use crate::Result;

type Collection = BTreeMap<String, serde_json::Value>;

#[derive(Default)]
struct State {
    progress: BTreeMap<String, ReadModelInfo>,
    documents: HashMap<String, Collection>,
    errors: Vec<EventHandlingError>,
}

impl State {
    fn save_progress(&mut self, info: ReadModelInfo) {
        match self.progress.get_mut(&info.name) {
            Some(existing) => {
                let cursor = existing.current_as_of_event_id.max(info.current_as_of_event_id);
                *existing = info;
                existing.current_as_of_event_id = cursor;
            }
            None => {
                self.progress.insert(info.name.clone(), info);
            }
        }
    }
}

/// Read model store holding progress rows and JSON documents in memory.
///
/// Projectors keep their state as documents keyed by collection and key,
/// staged through [`InMemoryUnitOfWork`] so they commit together with the
/// projector's progress. Clones share the same state.
#[derive(Clone, Default)]
pub struct InMemoryReadModelStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryReadModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the committed progress of one read model.
    pub async fn progress(&self, name: &str) -> Option<ReadModelInfo> {
        self.state.read().await.progress.get(name).cloned()
    }

    /// Reads a committed document.
    pub async fn document<T: DeserializeOwned>(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<T>> {
        let state = self.state.read().await;
        match state.documents.get(collection).and_then(|c| c.get(key)) {
            Some(value) => Ok(Some(T::deserialize(value)?)),
            None => Ok(None),
        }
    }

    /// Reads every committed document of a collection, ordered by key.
    pub async fn documents<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<(String, T)>> {
        let state = self.state.read().await;
        let Some(docs) = state.documents.get(collection) else {
            return Ok(Vec::new());
        };
        docs.iter()
            .map(|(key, value)| Ok((key.clone(), T::deserialize(value)?)))
            .collect()
    }
}

#[async_trait]
impl ReadModelStore for InMemoryReadModelStore {
    type UnitOfWork = InMemoryUnitOfWork;

    async fn load_progress(&self, names: &[String]) -> Result<Vec<ReadModelInfo>> {
        let mut state = self.state.write().await;
        Ok(names
            .iter()
            .map(|name| {
                state
                    .progress
                    .entry(name.clone())
                    .or_insert_with(|| ReadModelInfo::new(name.clone()))
                    .clone()
            })
            .collect())
    }

    async fn all_progress(&self) -> Result<Vec<ReadModelInfo>> {
        Ok(self.state.read().await.progress.values().cloned().collect())
    }

    async fn begin(&self) -> Result<InMemoryUnitOfWork> {
        Ok(InMemoryUnitOfWork {
            state: Arc::clone(&self.state),
            progress: Vec::new(),
            writes: Vec::new(),
            on_commit: Vec::new(),
        })
    }

    async fn record_handling_error(&self, mut error: EventHandlingError) -> Result<()> {
        let mut state = self.state.write().await;
        error.id = Some(state.errors.len() as i64 + 1);
        state.errors.push(error);
        Ok(())
    }

    async fn record_failure(&self, name: &str, event_id: EventId, message: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let info = state
            .progress
            .entry(name.to_string())
            .or_insert_with(|| ReadModelInfo::new(name));
        info.current_as_of_event_id = info.current_as_of_event_id.max(event_id);
        info.failed_on_event_id = Some(event_id);
        info.error = Some(message.to_string());
        info.last_updated = Some(Utc::now());
        Ok(())
    }

    async fn handling_errors(&self) -> Result<Vec<EventHandlingError>> {
        Ok(self.state.read().await.errors.clone())
    }
}

enum DocumentWrite {
    Put {
        collection: String,
        key: String,
        value: serde_json::Value,
    },
    Delete {
        collection: String,
        key: String,
    },
}

type CommitCallback = Box<dyn FnOnce() + Send + Sync>;

/// Staged changes against an [`InMemoryReadModelStore`].
///
/// Nothing is visible to readers of the store until [`UnitOfWork::commit`].
pub struct InMemoryUnitOfWork {
    state: Arc<RwLock<State>>,
    progress: Vec<ReadModelInfo>,
    writes: Vec<DocumentWrite>,
    on_commit: Vec<CommitCallback>,
}

impl InMemoryUnitOfWork {
    /// Stages an insert or replace of a document.
    pub fn put_document<T: Serialize>(
        &mut self,
        collection: &str,
        key: impl Into<String>,
        value: &T,
    ) -> Result<()> {
        self.writes.push(DocumentWrite::Put {
            collection: collection.to_string(),
            key: key.into(),
            value: serde_json::to_value(value)?,
        });
        Ok(())
    }

    /// Stages removal of a document.
    pub fn delete_document(&mut self, collection: &str, key: impl Into<String>) {
        self.writes.push(DocumentWrite::Delete {
            collection: collection.to_string(),
            key: key.into(),
        });
    }

    /// Reads a document as this unit of work sees it: staged writes first,
    /// then committed state.
    pub async fn document<T: DeserializeOwned>(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<T>> {
        for write in self.writes.iter().rev() {
            match write {
                DocumentWrite::Put {
                    collection: c,
                    key: k,
                    value,
                } if c == collection && k == key => return Ok(Some(T::deserialize(value)?)),
                DocumentWrite::Delete {
                    collection: c,
                    key: k,
                } if c == collection && k == key => return Ok(None),
                _ => {}
            }
        }
        let state = self.state.read().await;
        match state.documents.get(collection).and_then(|c| c.get(key)) {
            Some(value) => Ok(Some(T::deserialize(value)?)),
            None => Ok(None),
        }
    }

    /// Runs `callback` after a successful commit. Dropped on rollback.
    pub fn on_commit(&mut self, callback: impl FnOnce() + Send + Sync + 'static) {
        self.on_commit.push(Box::new(callback));
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn save_progress(&mut self, info: &ReadModelInfo) -> Result<()> {
        self.progress.retain(|p| p.name != info.name);
        self.progress.push(info.clone());
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        let InMemoryUnitOfWork {
            state,
            progress,
            writes,
            on_commit,
        } = self;

        {
            let mut state = state.write().await;
            for write in writes {
                match write {
                    DocumentWrite::Put {
                        collection,
                        key,
                        value,
                    } => {
                        state.documents.entry(collection).or_default().insert(key, value);
                    }
                    DocumentWrite::Delete { collection, key } => {
                        if let Some(docs) = state.documents.get_mut(&collection) {
                            docs.remove(&key);
                        }
                    }
                }
            }
            for info in progress {
                state.save_progress(info);
            }
        }

        for callback in on_commit {
            callback();
        }
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn load_progress_creates_missing_rows_in_order() {
        let store = InMemoryReadModelStore::new();
        let names = vec!["b".to_string(), "a".to_string()];
        let rows = store.load_progress(&names).await.unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "b");
        assert_eq!(rows[1].current_as_of_event_id, EventId::NONE);
        assert_eq!(store.all_progress().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn commit_applies_documents_and_progress_together() {
        let store = InMemoryReadModelStore::new();
        let fired = Arc::new(AtomicBool::new(false));

        let mut uow = store.begin().await.unwrap();
        uow.put_document("totals", "x", &3).unwrap();
        assert_eq!(uow.document::<i32>("totals", "x").await.unwrap(), Some(3));
        assert_eq!(store.document::<i32>("totals", "x").await.unwrap(), None);

        let mut info = ReadModelInfo::new("totals");
        info.current_as_of_event_id = EventId::new(4);
        uow.save_progress(&info).await.unwrap();
        let flag = Arc::clone(&fired);
        uow.on_commit(move || flag.store(true, Ordering::SeqCst));
        uow.commit().await.unwrap();

        assert_eq!(store.document::<i32>("totals", "x").await.unwrap(), Some(3));
        assert_eq!(
            store.progress("totals").await.unwrap().current_as_of_event_id,
            EventId::new(4)
        );
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unit_of_work_with_callbacks_is_usable_across_tasks() {
        let store = InMemoryReadModelStore::new();
        let fired = Arc::new(AtomicBool::new(false));
        let mut uow = store.begin().await.unwrap();
        let flag = Arc::clone(&fired);
        uow.on_commit(move || flag.store(true, Ordering::SeqCst));
        uow.put_document("totals", "x", &7).unwrap();

        // Holding a shared borrow across an await inside a spawned task
        let uow = tokio::spawn(async move {
            let staged = &uow;
            assert_eq!(staged.document::<i32>("totals", "x").await.unwrap(), Some(7));
            uow
        })
        .await
        .unwrap();
        uow.commit().await.unwrap();

        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn rollback_discards_everything() {
        let store = InMemoryReadModelStore::new();
        let fired = Arc::new(AtomicBool::new(false));

        let mut uow = store.begin().await.unwrap();
        uow.put_document("totals", "x", &1).unwrap();
        uow.save_progress(&ReadModelInfo::new("totals")).await.unwrap();
        let flag = Arc::clone(&fired);
        uow.on_commit(move || flag.store(true, Ordering::SeqCst));
        uow.rollback().await.unwrap();

        assert_eq!(store.document::<i32>("totals", "x").await.unwrap(), None);
        assert!(store.progress("totals").await.is_none());
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn committed_cursor_is_monotonic() {
        let store = InMemoryReadModelStore::new();
        for id in [7, 3] {
            let mut info = ReadModelInfo::new("m");
            info.current_as_of_event_id = EventId::new(id);
            let mut uow = store.begin().await.unwrap();
            uow.save_progress(&info).await.unwrap();
            uow.commit().await.unwrap();
        }
        assert_eq!(
            store.progress("m").await.unwrap().current_as_of_event_id,
            EventId::new(7)
        );
    }

    #[tokio::test]
    async fn staged_delete_hides_committed_document() {
        let store = InMemoryReadModelStore::new();
        let mut uow = store.begin().await.unwrap();
        uow.put_document("c", "k", &"v").unwrap();
        uow.commit().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        uow.delete_document("c", "k");
        assert_eq!(uow.document::<String>("c", "k").await.unwrap(), None);
        uow.commit().await.unwrap();
        assert!(store.documents::<String>("c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_marker_moves_cursor_past_the_event() {
        let store = InMemoryReadModelStore::new();
        let mut info = ReadModelInfo::new("m");
        info.current_as_of_event_id = EventId::new(2);
        let mut uow = store.begin().await.unwrap();
        uow.save_progress(&info).await.unwrap();
        uow.commit().await.unwrap();

        store.record_failure("m", EventId::new(3), "boom").await.unwrap();
        let info = store.progress("m").await.unwrap();
        assert_eq!(info.current_as_of_event_id, EventId::new(3));
        assert_eq!(info.failed_on_event_id, Some(EventId::new(3)));
        assert_eq!(info.error.as_deref(), Some("boom"));

        store.record_failure("m", EventId::new(1), "late").await.unwrap();
        assert_eq!(store.progress("m").await.unwrap().current_as_of_event_id, EventId::new(3));
    }
}

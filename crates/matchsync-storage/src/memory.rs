//! In-process document store for tests and dry runs.
//!
//! Clones share the same data, so a test can hold one handle for inspection
//! while the code under test connects through another. `fail_next` injects
//! connectivity failures to exercise the retry discipline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use matchsync_core::Document;
use serde_json::{json, Value};

use crate::store::{
    compare_values, Aggregation, DocumentStore, Filter, FindOptions, InsertOutcome, StoreConnector,
    StoreError, StoreResult,
};

#[derive(Debug, Default)]
struct MemoryCollection {
    unique_field: Option<String>,
    docs: Vec<Document>,
}

impl MemoryCollection {
    fn collides(&self, doc: &Document) -> bool {
        let Some(field) = &self.unique_field else {
            return false;
        };
        let Some(key) = doc.get(field) else {
            return false;
        };
        self.docs.iter().any(|existing| existing.get(field) == Some(key))
    }
}

/// Recorded `update` call, for assertions on what the loops asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateCall {
    pub collection: String,
    pub filter: Filter,
    pub patch: Document,
    pub many: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    collections: Arc<Mutex<HashMap<String, MemoryCollection>>>,
    updates: Arc<Mutex<Vec<UpdateCall>>>,
    failures: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operations (including connects) fail as unavailable.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, AtomicOrdering::SeqCst);
    }

    pub fn pending_failures(&self) -> usize {
        self.failures.load(AtomicOrdering::SeqCst)
    }

    pub fn closed_sessions(&self) -> usize {
        self.closed.load(AtomicOrdering::SeqCst)
    }

    pub fn update_calls(&self) -> Vec<UpdateCall> {
        self.updates
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    /// Snapshot of a collection's documents in insertion order.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .lock()
            .ok()
            .and_then(|map| map.get(collection).map(|c| c.docs.clone()))
            .unwrap_or_default()
    }

    fn check_available(&self) -> StoreResult<()> {
        let consumed = self
            .failures
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(StoreError::Unavailable("injected connectivity failure".into())),
            Err(_) => Ok(()),
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, HashMap<String, MemoryCollection>>> {
        self.collections
            .lock()
            .map_err(|_| StoreError::Query("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    async fn connect(&self) -> StoreResult<Arc<dyn DocumentStore>> {
        self.check_available()?;
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ensure_collection(&self, collection: &str, unique_field: Option<&str>) -> StoreResult<()> {
        self.check_available()?;
        let mut map = self.lock()?;
        let entry = map.entry(collection.to_string()).or_default();
        if let Some(field) = unique_field {
            entry.unique_field = Some(field.to_string());
        }
        Ok(())
    }

    async fn insert(&self, collection: &str, docs: &[Document]) -> StoreResult<InsertOutcome> {
        self.check_available()?;
        let mut map = self.lock()?;
        let entry = map.entry(collection.to_string()).or_default();
        let mut outcome = InsertOutcome::default();
        for doc in docs {
            if entry.collides(doc) {
                outcome.duplicates += 1;
            } else {
                entry.docs.push(doc.clone());
                outcome.inserted += 1;
            }
        }
        Ok(outcome)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>> {
        self.check_available()?;
        let map = self.lock()?;
        let Some(entry) = map.get(collection) else {
            return Ok(Vec::new());
        };
        let mut found: Vec<Document> = entry
            .docs
            .iter()
            .filter(|doc| filter.matches(doc))
            .cloned()
            .collect();
        if let Some(sort) = &options.sort {
            found.sort_by(|a, b| sort.compare(a, b));
        }
        if let Some(limit) = options.limit {
            found.truncate(limit);
        }
        if let Some(projection) = &options.projection {
            found = found.into_iter().map(|doc| projection.apply(doc)).collect();
        }
        Ok(found)
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &Document,
        many: bool,
    ) -> StoreResult<u64> {
        self.check_available()?;
        if let Ok(mut calls) = self.updates.lock() {
            calls.push(UpdateCall {
                collection: collection.to_string(),
                filter: filter.clone(),
                patch: patch.clone(),
                many,
            });
        }

        let mut map = self.lock()?;
        let Some(entry) = map.get_mut(collection) else {
            return Ok(0);
        };
        let mut updated = 0u64;
        for doc in entry.docs.iter_mut().filter(|doc| filter.matches(doc)) {
            for (key, value) in patch {
                doc.insert(key.clone(), value.clone());
            }
            updated += 1;
            if !many {
                break;
            }
        }
        Ok(updated)
    }

    async fn delete(&self, collection: &str, filter: &Filter, many: bool) -> StoreResult<u64> {
        self.check_available()?;
        let mut map = self.lock()?;
        let Some(entry) = map.get_mut(collection) else {
            return Ok(0);
        };
        let mut deleted = 0u64;
        entry.docs.retain(|doc| {
            let remove = filter.matches(doc) && (many || deleted == 0);
            if remove {
                deleted += 1;
            }
            !remove
        });
        Ok(deleted)
    }

    async fn aggregate(&self, collection: &str, aggregation: &Aggregation) -> StoreResult<Vec<Document>> {
        self.check_available()?;
        let map = self.lock()?;
        let docs = map.get(collection).map(|c| c.docs.as_slice()).unwrap_or_default();
        let rows = match aggregation {
            Aggregation::Max { field, filter } => docs
                .iter()
                .filter(|doc| filter.matches(doc))
                .filter_map(|doc| doc.get(field))
                .filter(|value| !value.is_null())
                .max_by(|a, b| compare_values(a, b).unwrap_or(std::cmp::Ordering::Equal))
                .map(|value| row(json!({ "value": value })))
                .into_iter()
                .collect(),
            Aggregation::GroupCount { field, filter } => {
                let mut groups: Vec<(Value, u64)> = Vec::new();
                for doc in docs.iter().filter(|doc| filter.matches(doc)) {
                    let key = doc.get(field).cloned().unwrap_or(Value::Null);
                    match groups.iter_mut().find(|(k, _)| *k == key) {
                        Some((_, n)) => *n += 1,
                        None => groups.push((key, 1)),
                    }
                }
                groups.sort_by(|a, b| b.1.cmp(&a.1));
                groups
                    .into_iter()
                    .map(|(value, count)| row(json!({ "value": value, "count": count })))
                    .collect()
            }
        };
        Ok(rows)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        self.check_available()?;
        let map = self.lock()?;
        Ok(map
            .get(collection)
            .map(|c| c.docs.iter().filter(|doc| filter.matches(doc)).count() as u64)
            .unwrap_or(0))
    }

    async fn close(&self) {
        self.closed.fetch_add(1, AtomicOrdering::SeqCst);
    }
}

fn row(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

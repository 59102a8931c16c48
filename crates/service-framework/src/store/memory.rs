//! # In-Memory Store
//!
//! `MemoryStore` owns one collection and processes [`StoreRequest`]s
//! sequentially in its own Tokio task, so the records need no lock.
//!
//! ## Usage Pattern
//!
//! 1. **Create**: `MemoryStore::new()` returns the store (server) and a
//!    [`StoreClient`] (interface).
//! 2. **Run**: spawn `store.run()`.
//! 3. **Use**: hand the client to anything expecting a
//!    [`StoreAdapter`](super::adapter::StoreAdapter).
//!
//! ```rust
//! use service_framework::store::{MemoryStore, StoreAdapter};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (store, client) = MemoryStore::new("products", 10);
//!     tokio::spawn(store.run());
//!
//!     let record = json!({ "name": "iPhone 11 Pro" }).as_object().cloned().unwrap();
//!     let saved = client.insert(record).await.unwrap();
//!     assert_eq!(saved["_id"], "1");
//!     assert_eq!(client.count(Default::default()).await.unwrap(), 1);
//! }
//! ```
//!
//! Identifiers come from a per-collection counter rendered as a string; an
//! explicit `_id` (string or number) is kept as given.

use super::adapter::{Filter, Record, ID_FIELD};
use super::client::StoreClient;
use super::message::StoreRequest;
use crate::error::StoreError;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct MemoryStore {
    collection: String,
    receiver: mpsc::Receiver<StoreRequest>,
    records: HashMap<String, Record>,
    /// Insertion order, used for unsorted reads.
    order: Vec<String>,
    next_id: u64,
}

impl MemoryStore {
    /// Creates the store and its client.
    ///
    /// `buffer_size` is the request channel capacity; when full, callers wait.
    pub fn new(collection: impl Into<String>, buffer_size: usize) -> (Self, StoreClient) {
        let (sender, receiver) = mpsc::channel(buffer_size);
        let store = Self {
            collection: collection.into(),
            receiver,
            records: HashMap::new(),
            order: Vec::new(),
            next_id: 1,
        };
        (store, StoreClient::new(sender))
    }

    /// Processes requests until every client is dropped.
    pub async fn run(mut self) {
        let collection = self.collection.clone();
        info!(%collection, "Store started");

        while let Some(request) = self.receiver.recv().await {
            match request {
                StoreRequest::Ping { respond_to } => {
                    let _ = respond_to.send(Ok(()));
                }
                StoreRequest::Count { query, respond_to } => {
                    let filter = Filter::new().query(query);
                    let count = self.records.values().filter(|r| filter.matches(r)).count();
                    debug!(%collection, count, "Count");
                    let _ = respond_to.send(Ok(count));
                }
                StoreRequest::Find { filter, respond_to } => {
                    let matched = self
                        .order
                        .iter()
                        .filter_map(|id| self.records.get(id))
                        .filter(|r| filter.matches(r))
                        .cloned()
                        .collect();
                    let rows = filter.apply(matched);
                    debug!(%collection, rows = rows.len(), "Find");
                    let _ = respond_to.send(Ok(rows));
                }
                StoreRequest::FindById { id, respond_to } => {
                    let record = self.records.get(&id).cloned();
                    debug!(%collection, %id, found = record.is_some(), "Find by id");
                    let _ = respond_to.send(Ok(record));
                }
                StoreRequest::Insert { record, respond_to } => {
                    let result = self.insert(record);
                    if let Err(e) = &result {
                        warn!(%collection, error = %e, "Insert failed");
                    }
                    let _ = respond_to.send(result);
                }
                StoreRequest::InsertMany {
                    records,
                    respond_to,
                } => {
                    let result = self.insert_many(records);
                    match &result {
                        Ok(saved) => info!(%collection, inserted = saved.len(), "Inserted many"),
                        Err(e) => warn!(%collection, error = %e, "Bulk insert failed"),
                    }
                    let _ = respond_to.send(result);
                }
                StoreRequest::Update {
                    id,
                    mut patch,
                    respond_to,
                } => {
                    patch.remove(ID_FIELD);
                    let updated = self.records.get_mut(&id).map(|record| {
                        record.extend(patch);
                        record.clone()
                    });
                    debug!(%collection, %id, found = updated.is_some(), "Update");
                    let _ = respond_to.send(Ok(updated));
                }
                StoreRequest::Remove { id, respond_to } => {
                    let removed = self.records.remove(&id);
                    if removed.is_some() {
                        self.order.retain(|existing| *existing != id);
                    }
                    debug!(%collection, %id, found = removed.is_some(), "Remove");
                    let _ = respond_to.send(Ok(removed));
                }
            }
        }

        info!(%collection, size = self.records.len(), "Store shutdown");
    }

    fn insert(&mut self, mut record: Record) -> Result<Record, StoreError> {
        let id = match record.get(ID_FIELD) {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(StoreError::InvalidRecord(format!(
                    "'{ID_FIELD}' must be a string or number, got {other}"
                )))
            }
            None => self.generate_id(),
        };
        if self.records.contains_key(&id) {
            return Err(StoreError::DuplicateId(id));
        }
        record.insert(ID_FIELD.to_string(), Value::String(id.clone()));
        self.records.insert(id.clone(), record.clone());
        self.order.push(id);
        Ok(record)
    }

    /// All-or-nothing: a duplicate anywhere in the batch rejects the batch.
    fn insert_many(&mut self, records: Vec<Record>) -> Result<Vec<Record>, StoreError> {
        let snapshot = (self.records.clone(), self.order.clone(), self.next_id);
        let mut saved = Vec::with_capacity(records.len());
        for record in records {
            match self.insert(record) {
                Ok(record) => saved.push(record),
                Err(e) => {
                    (self.records, self.order, self.next_id) = snapshot;
                    return Err(e);
                }
            }
        }
        Ok(saved)
    }

    fn generate_id(&mut self) -> String {
        loop {
            let id = self.next_id.to_string();
            self.next_id += 1;
            if !self.records.contains_key(&id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::adapter::StoreAdapter;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn spawn_store() -> StoreClient {
        let (store, client) = MemoryStore::new("products", 10);
        tokio::spawn(store.run());
        client
    }

    #[tokio::test]
    async fn test_crud_round() {
        let client = spawn_store();
        client.connect().await.unwrap();

        let saved = client
            .insert(record(json!({ "name": "Huawei P30 Pro", "quantity": 15 })))
            .await
            .unwrap();
        let id = saved["_id"].as_str().unwrap().to_string();

        let updated = client
            .update_by_id(&id, record(json!({ "quantity": 14, "_id": "hijack" })))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated["quantity"], 14);
        assert_eq!(updated["_id"], id.as_str());

        let removed = client.remove_by_id(&id).await.unwrap();
        assert!(removed.is_some());
        assert_eq!(client.find_by_id(&id).await.unwrap(), None);
        assert_eq!(client.update_by_id(&id, Record::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_generated_ids_skip_explicit_ones() {
        let client = spawn_store();
        client.insert(record(json!({ "_id": 2 }))).await.unwrap();

        let saved = client
            .insert_many(vec![record(json!({ "n": 1 })), record(json!({ "n": 2 }))])
            .await
            .unwrap();
        let ids: Vec<_> = saved.iter().map(|r| r["_id"].clone()).collect();
        assert_eq!(ids, vec![json!("1"), json!("3")]);
    }

    #[tokio::test]
    async fn test_bulk_insert_is_all_or_nothing() {
        let client = spawn_store();
        client.insert(record(json!({ "_id": "a" }))).await.unwrap();

        let result = client
            .insert_many(vec![record(json!({ "_id": "b" })), record(json!({ "_id": "a" }))])
            .await;
        assert_eq!(result, Err(StoreError::DuplicateId("a".into())));
        assert_eq!(client.count(Record::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_find_keeps_insertion_order() {
        let client = spawn_store();
        for name in ["c", "a", "b"] {
            client.insert(record(json!({ "name": name }))).await.unwrap();
        }
        let rows = client.find(Filter::new()).await.unwrap();
        let names: Vec<_> = rows.iter().map(|r| r["name"].clone()).collect();
        assert_eq!(names, vec![json!("c"), json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn test_dropped_store_reports_closed() {
        let (store, client) = MemoryStore::new("products", 1);
        drop(store);
        assert_eq!(client.connect().await, Err(StoreError::Closed));
    }
}

//! Document store abstraction for rollcall.
//!
//! The backing store is an external collaborator: an ACID-per-document
//! key/value store with equality queries and a transaction primitive. This
//! module defines the trait surface the three components depend on, plus
//! [`MemoryStore`], an in-memory implementation used by every test and
//! suitable for embedding.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Collection names shared by the components.
pub mod collections {
    /// Student records.
    pub const SUBJECTS: &str = "subjects";
    /// Guardian accounts.
    pub const GUARDIANS: &str = "guardians";
    /// Recorder (staff) accounts.
    pub const RECORDERS: &str = "recorders";
    /// Attendance records.
    pub const ATTENDANCE: &str = "attendance";
    /// Invitation codes.
    pub const INVITATION_CODES: &str = "invitation_codes";
}

/// A read-then-conditionally-write transaction.
///
/// All writes issued through a transaction commit together or not at all.
/// Reads observe writes staged earlier in the same transaction.
pub trait Transaction: Send {
    /// Read a document inside the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    fn get(&mut self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Stage a field-merge write against an existing document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the document does not exist.
    fn merge(&mut self, collection: &str, id: &str, fields: Value) -> Result<()>;
}

/// Transaction body passed to [`DocumentStore::transact`].
pub type TransactFn = Box<dyn FnOnce(&mut dyn Transaction) -> Result<()> + Send>;

/// The document store the components share.
///
/// Implementations must provide per-document atomicity, equality queries,
/// and a serializable transaction primitive. Backends with optimistic
/// concurrency may fail `transact` with [`Error::WriteConflict`]; callers
/// that care (code redemption) retry once.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Get a document by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Find all documents whose `field` equals `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    async fn find_by_field(&self, collection: &str, field: &str, value: &Value)
        -> Result<Vec<Value>>;

    /// Insert a document, assigning and returning a generated id.
    ///
    /// The id is also written into the stored document under `"id"`.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a JSON object or the store
    /// operation fails.
    async fn insert(&self, collection: &str, doc: Value) -> Result<String>;

    /// Insert a batch of documents atomically; observers never see a
    /// partial batch.
    ///
    /// # Errors
    ///
    /// Returns an error if any document is not a JSON object or the store
    /// operation fails. On error, nothing is written.
    async fn insert_batch(&self, collection: &str, docs: Vec<Value>) -> Result<Vec<String>>;

    /// Replace a document wholesale.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the document does not exist.
    async fn replace(&self, collection: &str, id: &str, doc: Value) -> Result<()>;

    /// Merge fields into an existing document, leaving other fields intact.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the document does not exist.
    async fn merge(&self, collection: &str, id: &str, fields: Value) -> Result<()>;

    /// Delete a document. Deleting a missing document is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    /// Run a transaction. Writes commit together on `Ok`, and are discarded
    /// if the body returns an error.
    ///
    /// # Errors
    ///
    /// Propagates the body's error, or [`Error::WriteConflict`] from
    /// backends with optimistic concurrency.
    async fn transact(&self, body: TransactFn) -> Result<()>;
}

/// Serialize a domain value into a store document.
///
/// # Errors
///
/// Returns an error if the value does not serialize to a JSON object.
pub fn to_doc<T: Serialize>(value: &T) -> Result<Value> {
    let doc = serde_json::to_value(value)?;
    if !doc.is_object() {
        return Err(Error::store("document must be a JSON object"));
    }
    Ok(doc)
}

/// Deserialize a store document into a domain value.
///
/// # Errors
///
/// Returns an error if the document does not match the target shape.
pub fn from_doc<T: DeserializeOwned>(doc: Value) -> Result<T> {
    Ok(serde_json::from_value(doc)?)
}

type Collections = HashMap<String, HashMap<String, Value>>;

/// In-memory document store.
///
/// Transactions serialize on a store-wide write lock, which trivially
/// satisfies the atomic-visibility requirement: a reader sees either all of
/// a transaction's writes or none of them.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<Collections>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn shallow_merge(target: &mut Value, fields: &Value) {
        if let (Value::Object(target_map), Value::Object(field_map)) = (target, fields) {
            for (key, value) in field_map {
                target_map.insert(key.clone(), value.clone());
            }
        }
    }

    fn prepare_insert(doc: Value) -> Result<(String, Value)> {
        let Value::Object(mut map) = doc else {
            return Err(Error::store("document must be a JSON object"));
        };
        let id = Uuid::new_v4().to_string();
        map.insert("id".to_string(), Value::String(id.clone()));
        Ok((id, Value::Object(map)))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let data = self.data.read().map_err(|_| Error::store("store lock poisoned"))?;
        Ok(data
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Value>> {
        let data = self.data.read().map_err(|_| Error::store("store lock poisoned"))?;
        let Some(docs) = data.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .values()
            .filter(|doc| doc.get(field) == Some(value))
            .cloned()
            .collect())
    }

    async fn insert(&self, collection: &str, doc: Value) -> Result<String> {
        let (id, doc) = Self::prepare_insert(doc)?;
        let mut data = self.data.write().map_err(|_| Error::store("store lock poisoned"))?;
        data.entry(collection.to_string())
            .or_default()
            .insert(id.clone(), doc);
        Ok(id)
    }

    async fn insert_batch(&self, collection: &str, docs: Vec<Value>) -> Result<Vec<String>> {
        // Validate everything before touching the store so a bad document
        // cannot leave a partial batch behind.
        let prepared = docs
            .into_iter()
            .map(Self::prepare_insert)
            .collect::<Result<Vec<_>>>()?;

        let mut data = self.data.write().map_err(|_| Error::store("store lock poisoned"))?;
        let bucket = data.entry(collection.to_string()).or_default();
        let mut ids = Vec::with_capacity(prepared.len());
        for (id, doc) in prepared {
            bucket.insert(id.clone(), doc);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn replace(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        let mut data = self.data.write().map_err(|_| Error::store("store lock poisoned"))?;
        let slot = data
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| Error::not_found("document", id))?;
        *slot = doc;
        Ok(())
    }

    async fn merge(&self, collection: &str, id: &str, fields: Value) -> Result<()> {
        let mut data = self.data.write().map_err(|_| Error::store("store lock poisoned"))?;
        let slot = data
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| Error::not_found("document", id))?;
        Self::shallow_merge(slot, &fields);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let mut data = self.data.write().map_err(|_| Error::store("store lock poisoned"))?;
        if let Some(docs) = data.get_mut(collection) {
            docs.remove(id);
        }
        Ok(())
    }

    async fn transact(&self, body: TransactFn) -> Result<()> {
        let mut data = self.data.write().map_err(|_| Error::store("store lock poisoned"))?;
        let mut tx = MemoryTransaction {
            data: &data,
            staged: Vec::new(),
        };
        body(&mut tx)?;
        let staged = tx.staged;
        for (collection, id, fields) in staged {
            let slot = data
                .get_mut(&collection)
                .and_then(|docs| docs.get_mut(&id))
                .ok_or_else(|| Error::not_found("document", id.clone()))?;
            Self::shallow_merge(slot, &fields);
        }
        Ok(())
    }
}

/// Transaction over [`MemoryStore`]: reads overlay staged writes, commits
/// apply them under the same exclusive lock.
struct MemoryTransaction<'a> {
    data: &'a Collections,
    staged: Vec<(String, String, Value)>,
}

impl Transaction for MemoryTransaction<'_> {
    fn get(&mut self, collection: &str, id: &str) -> Result<Option<Value>> {
        let base = self
            .data
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned();

        // Read-your-writes: apply staged merges for this document in order.
        let mut doc = base;
        for (staged_collection, staged_id, fields) in &self.staged {
            if staged_collection == collection && staged_id == id {
                if let Some(target) = doc.as_mut() {
                    MemoryStore::shallow_merge(target, fields);
                }
            }
        }
        Ok(doc)
    }

    fn merge(&mut self, collection: &str, id: &str, fields: Value) -> Result<()> {
        let exists = self
            .data
            .get(collection)
            .is_some_and(|docs| docs.contains_key(id));
        if !exists {
            return Err(Error::not_found("document", id));
        }
        self.staged
            .push((collection.to_string(), id.to_string(), fields));
        Ok(())
    }
}

/// Build a JSON object from field/value pairs, for merge writes.
#[must_use]
pub fn fields(entries: &[(&str, Value)]) -> Value {
    let mut map = Map::new();
    for (key, value) in entries {
        map.insert((*key).to_string(), value.clone());
    }
    Value::Object(map)
}

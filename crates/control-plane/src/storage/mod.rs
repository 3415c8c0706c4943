//! Metadata store adapter
//!
//! Records are addressed by a composite key (partition key + sort key), the
//! layout a single-table document store uses:
//! - `WS#{workspace_id}` / `METADATA` → workspace
//! - `WS#{workspace_id}` / `FN#{function_id}` → function
//! - `WS#{workspace_id}` / `TASK#{task_id}` → build task
//! - `FN#{function_id}` / `LOG#{timestamp}#{log_id}` → execution log
//! - `TASK#{task_id}` / `WORKSPACE` and `FN#{function_id}` / `WORKSPACE` → id indexes
//!
//! Each record is a flat map of JSON values. Integer fields can be
//! incremented atomically, which the counters rely on.

mod memory;
mod redis_store;

use async_trait::async_trait;
use faas_common::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub use memory::InMemoryMetadataStore;
pub use redis_store::RedisMetadataStore;

/// A stored record: top-level field name to JSON value
pub type Item = Map<String, Value>;

/// Composite record key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub pk: String,
    pub sk: String,
}

impl ItemKey {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.pk, self.sk)
    }
}

/// A single change applied by [`MetadataStore::update`]
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    /// Overwrite a field
    Set(String, Value),
    /// Add `delta` to an integer field (missing fields count as 0)
    Increment(String, i64),
}

impl FieldUpdate {
    pub fn set(field: &str, value: impl Into<Value>) -> Self {
        FieldUpdate::Set(field.to_string(), value.into())
    }

    pub fn increment(field: &str, delta: i64) -> Self {
        FieldUpdate::Increment(field.to_string(), delta)
    }
}

/// Sort key ordering for partition queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Create or replace a record
    async fn put(&self, key: &ItemKey, item: Item) -> Result<()>;

    async fn get(&self, key: &ItemKey) -> Result<Option<Item>>;

    /// Apply all changes atomically and return the updated record.
    /// Returns `None` (and writes nothing) when the record does not exist.
    async fn update(&self, key: &ItemKey, updates: &[FieldUpdate]) -> Result<Option<Item>>;

    /// Returns whether a record was removed
    async fn delete(&self, key: &ItemKey) -> Result<bool>;

    /// Records in one partition whose sort key starts with `sk_prefix`
    async fn query(
        &self,
        pk: &str,
        sk_prefix: &str,
        order: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Item>>;

    /// Full scan over every partition whose key starts with `pk_prefix`
    async fn scan(&self, pk_prefix: &str, sk_prefix: &str) -> Result<Vec<Item>>;
}

/// Serialize a record into a storable item
pub fn to_item<T: Serialize>(record: &T) -> Result<Item> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::InvalidRecord {
            key: "<new>".to_string(),
            reason: format!("expected an object, got {}", other),
        }),
    }
}

/// Deserialize a stored item back into a record
pub fn from_item<T: DeserializeOwned>(item: Item) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(item))?)
}

/// Apply updates to an in-memory item, shared by the backends
pub(crate) fn apply_updates(item: &mut Item, updates: &[FieldUpdate]) {
    for update in updates {
        match update {
            FieldUpdate::Set(field, value) => {
                item.insert(field.clone(), value.clone());
            }
            FieldUpdate::Increment(field, delta) => {
                let current = item.get(field).and_then(Value::as_i64).unwrap_or(0);
                item.insert(field.clone(), Value::from(current + delta));
            }
        }
    }
}

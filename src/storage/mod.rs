//! Durable key/value storage for effect records and instance state.

mod libsql_store;
mod memory;

pub use libsql_store::LibsqlStore;
pub use memory::MemoryStore;

use crate::Result;
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

/// Key/value storage the durable scheduler persists into.
///
/// Every operation is atomic per key and durable once it returns `Ok`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn put(&self, key: &str, value: Value) -> Result<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All entries whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<BTreeMap<String, Value>>;
}

/// Namespaces another store under a fixed key prefix.
pub struct ScopedStore {
    inner: Arc<dyn KvStore>,
    prefix: String,
}

impl ScopedStore {
    pub fn new(inner: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl KvStore for ScopedStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.get(&self.scoped(key)).await
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.inner.put(&self.scoped(key), value).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(&self.scoped(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<BTreeMap<String, Value>> {
        let entries = self.inner.list(&self.scoped(prefix)).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&self.prefix)
                    .map(|stripped| (stripped.to_string(), value))
            })
            .collect())
    }
}

const STATE_KEY: &str = "instance::state";

/// Where an instance keeps its current state, apart from its effect records.
#[derive(Clone)]
pub struct StateSlot {
    store: Arc<dyn KvStore>,
}

impl StateSlot {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn load<S: DeserializeOwned>(&self) -> Result<Option<S>> {
        match self.store.get(STATE_KEY).await? {
            Some(value) => {
                debug!("Loaded persisted instance state");
                Ok(Some(serde_json::from_value(value)?))
            }
            None => Ok(None),
        }
    }

    pub async fn save<S: Serialize>(&self, state: &S) -> Result<()> {
        let value = serde_json::to_value(state)?;
        self.store.put(STATE_KEY, value).await
    }
}

use super::KvStore;
use crate::{Error, Result};
use async_trait::async_trait;
use libsql::{Builder, Connection, Database};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// [`KvStore`] backed by a libSQL database file (or `:memory:`).
pub struct LibsqlStore {
    // Keeps the database open for as long as the connection lives.
    _db: Database,
    conn: Mutex<Connection>,
}

impl LibsqlStore {
    pub async fn new(db_path: &str) -> Result<Self> {
        let db = Builder::new_local(db_path).build().await?;
        let conn = db.connect()?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
            (),
        )
        .await?;

        info!("Database initialized successfully: {}", db_path);

        Ok(Self {
            _db: db,
            conn: Mutex::new(conn),
        })
    }

    fn decode(key: &str, raw: &str) -> Result<Value> {
        serde_json::from_str(raw)
            .map_err(|e| Error::storage(format!("Corrupt value under '{key}': {e}")))
    }
}

#[async_trait]
impl KvStore for LibsqlStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query("SELECT value FROM kv_store WHERE key = ?1", [key])
            .await?;

        match rows.next().await? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(Some(Self::decode(key, &raw)?))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        let raw = serde_json::to_string(&value)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO kv_store (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            (key, raw.as_str()),
        )
        .await?;
        debug!("Stored key: {}", key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute("DELETE FROM kv_store WHERE key = ?1", [key])
            .await?;
        debug!("Deleted key: {} ({} rows)", key, affected);
        Ok(affected > 0)
    }

    async fn list(&self, prefix: &str) -> Result<BTreeMap<String, Value>> {
        let conn = self.conn.lock().await;
        let prefix_len = prefix.chars().count() as i64;
        let mut rows = conn
            .query(
                "SELECT key, value FROM kv_store WHERE substr(key, 1, ?1) = ?2 ORDER BY key ASC",
                (prefix_len, prefix),
            )
            .await?;

        let mut entries = BTreeMap::new();
        while let Some(row) = rows.next().await? {
            let key: String = row.get(0)?;
            let raw: String = row.get(1)?;
            let value = Self::decode(&key, &raw)?;
            entries.insert(key, value);
        }

        debug!("Listed {} keys with prefix: {}", entries.len(), prefix);
        Ok(entries)
    }
}

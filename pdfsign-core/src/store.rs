// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! Key-prefixed persistence
//!
//! Keys look like `job_<id>` or `task_<id>`; the segment before the first `_`
//! is the bucket. Single-key writes are atomic, batches are atomic as a group.

use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

pub const JOB_PREFIX: &str = "job_";
pub const TASK_PREFIX: &str = "task_";
pub const LICENSE_KEY: &str = "license";
pub const LICENSE_LIMITS_KEY: &str = "license_limits";
pub const LICENSE_MACHINE_KEY: &str = "license_machineid";

pub fn job_key(id: &str) -> String {
    format!("{}{}", JOB_PREFIX, id)
}

pub fn task_key(id: &str) -> String {
    format!("{}{}", TASK_PREFIX, id)
}

/// Bucket of a key: everything before the first `_`
pub fn bucket_of(key: &str) -> &str {
    key.split_once('_').map_or(key, |(bucket, _)| bucket)
}

/// Ordered key-value store
pub trait KvStore: Send + Sync {
    /// Durable once this returns
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn delete(&self, key: &str) -> Result<()>;

    /// Write every entry or none
    fn batch_put(&self, entries: &BTreeMap<String, Vec<u8>>) -> Result<()>;

    /// Delete every key or none
    fn batch_delete(&self, keys: &[String]) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order
    fn scan(&self, prefix: &str) -> Result<BTreeMap<String, Vec<u8>>>;
}

/// SQLite-backed store, one `kv` table
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 30000;
        "#,
        )?;
        let store = Self::with_connection(conn)?;
        info!(path = %path.display(), "Opened store");
        Ok(store)
    }

    /// Non-durable store for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                bucket TEXT NOT NULL,
                value BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS kv_bucket ON kv(bucket);
        "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KvStore for SqliteStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO kv (key, bucket, value) VALUES (?1, ?2, ?3)",
            params![key, bucket_of(key), value],
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .conn
            .lock()
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn batch_put(&self, entries: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT OR REPLACE INTO kv (key, bucket, value) VALUES (?1, ?2, ?3)")?;
            for (key, value) in entries {
                stmt.execute(params![key, bucket_of(key), value])?;
            }
        }
        tx.commit()?;
        debug!(entries = entries.len(), "Batch written");
        Ok(())
    }

    fn batch_delete(&self, keys: &[String]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM kv WHERE key = ?1")?;
            for key in keys {
                stmt.execute(params![key])?;
            }
        }
        tx.commit()?;
        debug!(keys = keys.len(), "Batch deleted");
        Ok(())
    }

    fn scan(&self, prefix: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut out = BTreeMap::new();
        for row in rows {
            let (key, value) = row?;
            out.insert(key, value);
        }
        Ok(out)
    }
}

/// In-memory store for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KvStore for MemoryStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn batch_put(&self, entries: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        let mut map = self.entries.write();
        for (key, value) in entries {
            map.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn batch_delete(&self, keys: &[String]) -> Result<()> {
        let mut map = self.entries.write();
        for key in keys {
            map.remove(key);
        }
        Ok(())
    }

    fn scan(&self, prefix: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// Serialize `value` as JSON under `key`
pub fn put_json<T: serde::Serialize>(store: &dyn KvStore, key: &str, value: &T) -> Result<()> {
    store.put(key, &serde_json::to_vec(value)?)
}

/// Read a JSON value, `None` if the key is missing
pub fn get_json<T: serde::de::DeserializeOwned>(store: &dyn KvStore, key: &str) -> Result<Option<T>> {
    store
        .get(key)?
        .map(|bytes| {
            serde_json::from_slice(&bytes)
                .map_err(|e| Error::Serialization(format!("{}: {}", key, e)))
        })
        .transpose()
}

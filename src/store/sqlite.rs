use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};

use super::KeyValueStore;
use crate::errors::StoreError;

/// SQLite-backed store.
///
/// The connection sits behind `Arc<Mutex>` and every call runs on tokio's
/// blocking pool via `spawn_blocking`, so synchronous SQLite I/O never
/// holds up async worker threads.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file and run migrations.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        Self::init(conn)
    }

    /// In-memory database (for testing).
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS sorted_sets (
                key TEXT NOT NULL,
                member TEXT NOT NULL,
                score REAL NOT NULL,
                seq INTEGER NOT NULL,
                PRIMARY KEY (key, member)
            );

            CREATE INDEX IF NOT EXISTS idx_sorted_sets_rank ON sorted_sets(key, score DESC, seq ASC);
            ",
        )
        .context("Failed to run store migrations")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut *guard).map_err(StoreError::Backend)
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("store task panicked: {}", e)))?
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.call(move |conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .context("Failed to read key")
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.set_many(vec![(key.to_string(), value.to_string())])
            .await
    }

    async fn set_many(&self, entries: Vec<(String, String)>) -> Result<(), StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            for (key, value) in &entries {
                tx.execute(
                    "INSERT INTO kv (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                    params![key, value],
                )
                .with_context(|| format!("Failed to write key {}", key))?;
            }
            tx.commit().context("Failed to commit write")?;
            Ok(())
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            tx.execute("DELETE FROM sorted_sets WHERE key = ?1", params![key])?;
            tx.commit().context("Failed to delete key")?;
            Ok(())
        })
        .await
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let key = key.to_string();
        let result = self
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<String> = tx
                    .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                        row.get(0)
                    })
                    .optional()?;
                let current = match current {
                    Some(v) => match v.parse::<i64>() {
                        Ok(n) => n,
                        Err(_) => return Ok(Err(key)),
                    },
                    None => 0,
                };
                let next = current + 1;
                tx.execute(
                    "INSERT INTO kv (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                    params![key, next.to_string()],
                )?;
                tx.commit()?;
                Ok(Ok(next))
            })
            .await?;
        result.map_err(|key| StoreError::WrongType {
            key,
            expected: "an integer".to_string(),
        })
    }

    async fn sorted_set_add(
        &self,
        key: &str,
        entries: Vec<(String, f64)>,
    ) -> Result<(), StoreError> {
        let key = key.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let mut seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM sorted_sets WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO sorted_sets (key, member, score, seq) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(key, member) DO UPDATE SET score = excluded.score",
                )?;
                for (member, score) in &entries {
                    seq += 1;
                    stmt.execute(params![key, member, score, seq])?;
                }
            }
            tx.commit().context("Failed to write sorted set")?;
            Ok(())
        })
        .await
    }

    async fn sorted_set_top_n(
        &self,
        key: &str,
        n: usize,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let key = key.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT member, score FROM sorted_sets WHERE key = ?1
                 ORDER BY score DESC, seq ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![key, n as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<(String, f64)>, _>>()
                .context("Failed to read sorted set")?;
            Ok(rows)
        })
        .await
    }

    async fn sorted_set_len(&self, key: &str) -> Result<usize, StoreError> {
        let key = key.to_string();
        self.call(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sorted_sets WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }
}

//! SQLite-backed key-value storage
//!
//! 컨텍스트 아이템, 체크포인트, 브랜치를 단일 `kv` 테이블에 저장합니다.
//! 각 batch는 하나의 트랜잭션으로 적용되므로 우선순위 일괄 변경과
//! 압축 커밋이 원자적으로 반영됩니다.

use super::kv::{KvOp, KvStore};
use crate::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Current schema version
const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Database file name inside the data directory
pub const DB_FILE: &str = "deepctx.db";

/// SQLite KV storage
#[derive(Clone)]
pub struct SqliteKv {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKv {
    /// Open (or create) the database inside `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;

        let db_path = data_dir.join(DB_FILE);
        let conn = Connection::open(&db_path)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Storage(format!("Failed to set pragmas: {}", e)))?;

        info!("Opened context database at {}", db_path.display());

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    /// Create an in-memory storage (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory database: {}", e)))?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))
    }

    /// Get current schema version from database
    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::Storage(format!("Failed to get schema version: {}", e)))
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            -- Schema version tracking
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Namespaced records: {user}/{workspace}/...
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(|e| Error::Storage(format!("Failed to initialize schema: {}", e)))?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| Error::Storage(format!("Failed to record schema version: {}", e)))?;

        debug!("Context database schema version {}", CURRENT_SCHEMA_VERSION);
        Ok(())
    }
}

impl KvStore for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|e| Error::Storage(format!("Failed to read {}: {}", key, e)))
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
            )
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| Error::Storage(format!("Failed to scan {}: {}", prefix, e)))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Storage(format!("Failed to read row: {}", e)))
    }

    fn apply(&self, batch: Vec<KvOp>) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Storage(format!("Failed to begin transaction: {}", e)))?;
        let now = chrono::Utc::now().to_rfc3339();

        for op in &batch {
            match op {
                KvOp::Put { key, value } => {
                    tx.execute(
                        "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)",
                        params![key, value, now],
                    )
                    .map_err(|e| Error::Storage(format!("Failed to write {}: {}", key, e)))?;
                }
                KvOp::Delete { key } => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", params![key])
                        .map_err(|e| Error::Storage(format!("Failed to delete {}: {}", key, e)))?;
                }
                KvOp::DeletePrefix { prefix } => {
                    tx.execute(
                        "DELETE FROM kv WHERE substr(key, 1, length(?1)) = ?1",
                        params![prefix],
                    )
                    .map_err(|e| Error::Storage(format!("Failed to delete {}: {}", prefix, e)))?;
                }
            }
        }

        // Dropping `tx` without commit rolls the whole batch back
        tx.commit()
            .map_err(|e| Error::Storage(format!("Failed to commit batch: {}", e)))?;

        debug!("Applied batch of {} ops", batch.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_roundtrip() {
        let kv = SqliteKv::in_memory().unwrap();
        assert_eq!(kv.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);

        kv.set("u/w/items/a", "{}").unwrap();
        assert_eq!(kv.get("u/w/items/a").unwrap().as_deref(), Some("{}"));
        assert!(kv.get("u/w/items/missing").unwrap().is_none());
    }

    #[test]
    fn test_scan_and_delete_prefix() {
        let kv = SqliteKv::in_memory().unwrap();
        kv.apply(vec![
            KvOp::put("u/w1/items/a", "1"),
            KvOp::put("u/w1/items/b", "2"),
            KvOp::put("u/w2/items/c", "3"),
        ])
        .unwrap();

        assert_eq!(kv.scan_prefix("u/w1/").unwrap().len(), 2);

        kv.apply(vec![KvOp::delete_prefix("u/w1/")]).unwrap();
        assert!(kv.scan_prefix("u/w1/").unwrap().is_empty());
        assert_eq!(kv.scan_prefix("u/").unwrap().len(), 1);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let kv = SqliteKv::open(dir.path()).unwrap();
            kv.set("u/w/items/a", "persisted").unwrap();
        }

        let kv = SqliteKv::open(dir.path()).unwrap();
        assert_eq!(kv.get("u/w/items/a").unwrap().as_deref(), Some("persisted"));
    }
}

//! SQLite ordered key-value backend.
//!
//! Two tables: `addresses` holds binary keys (non-unique, so re-merged
//! entries show up as duplicate rows) and `state` holds small JSON records
//! such as the watermark. SQLite compares BLOBs with `memcmp`, so
//! `ORDER BY key, rowid` is byte order and then insertion order.
//!
//! # Usage
//! ```rust,no_run
//! use addrindex_storage::kv::KvIndexStore;
//! use addrindex_storage::sqlite::SqliteKv;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = KvIndexStore::new(SqliteKv::open("./addrindex.db").await?);
//!
//! // In-memory (tests / ephemeral)
//! let store = KvIndexStore::new(SqliteKv::in_memory().await?);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use addrindex_core::error::IndexerError;

use crate::kv::{KvRow, OrderedKv};

fn storage_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

/// SQLite-backed ordered key-value store.
pub struct SqliteKv {
    pool: SqlitePool,
}

impl SqliteKv {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./addrindex.db"`) or a full
    /// SQLite URL (`"sqlite:./addrindex.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        debug!(path, "opened sqlite store");
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every pooled connection would get its own empty database, so the pool
    /// is pinned to one connection that never expires. All data is lost when
    /// the pool is dropped.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS addresses (
                key   BLOB NOT NULL,
                value BLOB NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_addresses_key ON addresses (key);")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS state (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    /// Total number of rows in `addresses`, duplicates included.
    pub async fn row_count(&self) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM addresses")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;

        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }
}

#[async_trait]
impl OrderedKv for SqliteKv {
    async fn put_batch(&self, rows: Vec<KvRow>) -> Result<(), IndexerError> {
        let count = rows.len();
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for (key, value) in rows {
            sqlx::query("INSERT INTO addresses (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;

        debug!(rows = count, "batch committed");
        Ok(())
    }

    async fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        limit: Option<usize>,
    ) -> Result<Vec<KvRow>, IndexerError> {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        let rows = sqlx::query(
            "SELECT key, value FROM addresses
             WHERE key >= ? AND key <= ?
             ORDER BY key, rowid
             LIMIT ?",
        )
        .bind(start)
        .bind(end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<Vec<u8>, _>("key"), r.get::<Vec<u8>, _>("value")))
            .collect())
    }

    async fn scan_all(&self) -> Result<Vec<KvRow>, IndexerError> {
        let rows = sqlx::query("SELECT key, value FROM addresses ORDER BY key, rowid")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<Vec<u8>, _>("key"), r.get::<Vec<u8>, _>("value")))
            .collect())
    }

    async fn contains(&self, key: &[u8]) -> Result<bool, IndexerError> {
        let row = sqlx::query("SELECT 1 FROM addresses WHERE key = ? LIMIT 1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.is_some())
    }

    async fn get_state(&self, key: &str) -> Result<Option<String>, IndexerError> {
        let row = sqlx::query("SELECT value FROM state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    async fn put_state(&self, key: &str, value: &str) -> Result<(), IndexerError> {
        sqlx::query("INSERT OR REPLACE INTO state (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        debug!(key, "state saved");
        Ok(())
    }

    async fn close(&self) -> Result<(), IndexerError> {
        self.pool.close().await;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvIndexStore;
    use addrindex_core::store::IndexStore;
    use addrindex_core::types::{Address, AddressEntries, AddressEntry, Direction, TxHash};

    fn transfer(from: u8, to: u8, hash: u8, block: u64) -> AddressEntries {
        let hash = TxHash::from_slice(&[hash; 32]).unwrap();
        let mut entries = AddressEntries::new();
        entries
            .entry(Address([from; 20]))
            .or_default()
            .push(AddressEntry::new(hash.clone(), block, Direction::Outbound));
        entries
            .entry(Address([to; 20]))
            .or_default()
            .push(AddressEntry::new(hash, block, Direction::Inbound));
        entries
    }

    // ── OrderedKv ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn scan_is_inclusive_and_ordered() {
        let kv = SqliteKv::in_memory().await.unwrap();
        kv.put_batch(vec![
            (vec![3], vec![]),
            (vec![1], vec![]),
            (vec![2], b"first".to_vec()),
            (vec![2], b"second".to_vec()),
        ])
        .await
        .unwrap();

        let rows = kv.scan(&[1], &[2], None).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].0, vec![1]);
        assert_eq!(rows[1].1, b"first".to_vec());
        assert_eq!(rows[2].1, b"second".to_vec());

        assert_eq!(kv.scan(&[0], &[9], Some(2)).await.unwrap().len(), 2);
        assert!(kv.contains(&[3]).await.unwrap());
        assert!(!kv.contains(&[4]).await.unwrap());
        assert_eq!(kv.row_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn state_upsert() {
        let kv = SqliteKv::in_memory().await.unwrap();
        assert!(kv.get_state("blockNumber").await.unwrap().is_none());
        kv.put_state("blockNumber", "1").await.unwrap();
        kv.put_state("blockNumber", "2").await.unwrap();
        assert_eq!(kv.get_state("blockNumber").await.unwrap().as_deref(), Some("2"));
    }

    // ── IndexStore over SQLite ────────────────────────────────────────────────

    #[tokio::test]
    async fn duplicate_merge_is_observable() {
        let store = KvIndexStore::new(SqliteKv::in_memory().await.unwrap());
        let batch = transfer(0xa, 0xb, 0x11, 5);
        store.merge_address_entries(&batch).await.unwrap();
        store.merge_address_entries(&batch).await.unwrap();

        let a = store.lookup_address(&Address([0xa; 20]), 0, None).await.unwrap();
        let b = store.lookup_address(&Address([0xb; 20]), 0, None).await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
        assert!(b.iter().all(|e| e.inbound && e.block_number == 5));
        assert_eq!(store.kv().row_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn lookup_from_height() {
        let store = KvIndexStore::new(SqliteKv::in_memory().await.unwrap());
        for (i, block) in [1u64, 5, 9, 256].into_iter().enumerate() {
            store
                .merge_address_entries(&transfer(0xa, 0xb, i as u8, block))
                .await
                .unwrap();
        }
        let heights: Vec<u64> = store
            .lookup_address(&Address([0xa; 20]), 5, None)
            .await
            .unwrap()
            .iter()
            .map(|e| e.block_number)
            .collect();
        assert_eq!(heights, vec![5, 9, 256]);
    }

    #[tokio::test]
    async fn watermark_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("addrindex-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("reopen.db");
        let path = path.to_str().unwrap();
        let _ = std::fs::remove_file(path);

        {
            let store = KvIndexStore::new(SqliteKv::open(path).await.unwrap());
            store.set_watermark(1_234).await.unwrap();
            store
                .merge_address_entries(&transfer(1, 2, 3, 1_234))
                .await
                .unwrap();
            store.close().await.unwrap();
        }

        let store = KvIndexStore::new(SqliteKv::open(path).await.unwrap());
        assert_eq!(store.get_watermark().await.unwrap(), Some(1_234));
        assert_eq!(store.lookup_address(&Address([2; 20]), 0, None).await.unwrap().len(), 1);
        store.close().await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}

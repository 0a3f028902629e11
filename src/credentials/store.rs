//! SQLite-backed pairing-code store.
//!
//! The store, not the caller, enforces the TTL: reads filter on
//! `expires_at`, and a periodic sweep removes dead rows so an expired code
//! is indistinguishable from one that never existed. `put` replaces any
//! existing row for the device id, which keeps the at-most-one-live-code
//! invariant without a separate check.

use anyhow::Result;
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr, time::Duration};
use tracing::{debug, warn};

/// Default timeout for individual SQLite queries.
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the background sweeper removes expired rows.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

/// A short-lived pairing code bound to one device id.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PairingRecord {
    pub device_id: String,
    pub pin: String,
    pub device_name: String,
    /// Milliseconds since epoch.
    pub created_at: i64,
    /// Milliseconds since epoch; the row is dead once this passes.
    pub expires_at: i64,
}

impl PairingRecord {
    /// Build a record expiring `ttl_seconds` from now.
    pub fn new(device_id: &str, device_name: &str, pin: &str, ttl_seconds: u64) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            device_id: device_id.to_string(),
            pin: pin.to_string(),
            device_name: device_name.to_string(),
            created_at: now,
            expires_at: now + (ttl_seconds as i64) * 1000,
        }
    }
}

#[derive(Clone)]
pub struct PairingStore {
    pool: SqlitePool,
}

impl PairingStore {
    pub async fn open(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("relay.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests. Pinned to a single connection — every
    /// `:memory:` connection is otherwise a distinct database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for stmt in include_str!("migrations/001_pairing.sql").split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(pool).await?;
            }
        }
        Ok(())
    }

    /// Store a pairing code, replacing any live code for the same device id.
    pub async fn put(&self, record: &PairingRecord) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "INSERT OR REPLACE INTO pairing_codes \
                 (device_id, pin, device_name, created_at, expires_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&record.device_id)
            .bind(&record.pin)
            .bind(&record.device_name)
            .bind(record.created_at)
            .bind(record.expires_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Fetch the live pairing code for a device id, if any.
    ///
    /// Expired rows are removed on the way so a post-expiry lookup observes
    /// a plain miss.
    pub async fn get(&self, device_id: &str) -> Result<Option<PairingRecord>> {
        with_timeout(async {
            let now = Utc::now().timestamp_millis();
            sqlx::query("DELETE FROM pairing_codes WHERE device_id = ? AND expires_at <= ?")
                .bind(device_id)
                .bind(now)
                .execute(&self.pool)
                .await?;

            let row = sqlx::query_as::<_, PairingRecord>(
                "SELECT device_id, pin, device_name, created_at, expires_at \
                 FROM pairing_codes WHERE device_id = ? AND expires_at > ?",
            )
            .bind(device_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await
    }

    /// Delete a pairing code. Returns `true` if a row was removed —
    /// redemption relies on this to keep codes single-use.
    pub async fn delete(&self, device_id: &str) -> Result<bool> {
        with_timeout(async {
            let result = sqlx::query("DELETE FROM pairing_codes WHERE device_id = ?")
                .bind(device_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    /// Remove every expired row. Returns the number removed.
    pub async fn sweep_expired(&self) -> Result<u64> {
        with_timeout(async {
            let result = sqlx::query("DELETE FROM pairing_codes WHERE expires_at <= ?")
                .bind(Utc::now().timestamp_millis())
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    /// Spawn the background sweeper task for this store.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                match store.sweep_expired().await {
                    Ok(n) if n > 0 => debug!(swept = n, "expired pairing codes removed"),
                    Ok(_) => {}
                    Err(e) => warn!(err = %e, "pairing-code sweep failed"),
                }
            }
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_cycle() {
        let store = PairingStore::open_in_memory().await.unwrap();
        let record = PairingRecord::new("swift-tiger-42", "laptop", "314159", 300);
        store.put(&record).await.unwrap();

        let got = store.get("swift-tiger-42").await.unwrap().expect("live code");
        assert_eq!(got, record);

        assert!(store.delete("swift-tiger-42").await.unwrap());
        assert!(store.get("swift-tiger-42").await.unwrap().is_none());
        // Second delete is a no-op.
        assert!(!store.delete("swift-tiger-42").await.unwrap());
    }

    #[tokio::test]
    async fn put_replaces_existing_code() {
        let store = PairingStore::open_in_memory().await.unwrap();
        store
            .put(&PairingRecord::new("swift-tiger-42", "laptop", "111111", 300))
            .await
            .unwrap();
        store
            .put(&PairingRecord::new("swift-tiger-42", "laptop", "222222", 300))
            .await
            .unwrap();

        let got = store.get("swift-tiger-42").await.unwrap().expect("live code");
        assert_eq!(got.pin, "222222");
    }

    #[tokio::test]
    async fn expired_code_reads_as_miss() {
        let store = PairingStore::open_in_memory().await.unwrap();
        let mut record = PairingRecord::new("swift-tiger-42", "laptop", "314159", 300);
        record.expires_at = Utc::now().timestamp_millis() - 1;
        store.put(&record).await.unwrap();

        assert!(store.get("swift-tiger-42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_rows() {
        let store = PairingStore::open_in_memory().await.unwrap();
        let mut dead = PairingRecord::new("old-fox-01", "desk", "111111", 300);
        dead.expires_at = Utc::now().timestamp_millis() - 1;
        store.put(&dead).await.unwrap();
        store
            .put(&PairingRecord::new("new-owl-02", "desk", "222222", 300))
            .await
            .unwrap();

        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert!(store.get("new-owl-02").await.unwrap().is_some());
    }
}

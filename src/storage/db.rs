use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Dedup store errors.
///
/// Unlike fetch and parse failures these are not transient: a feed task
/// that cannot record what it announced must stop announcing, otherwise a
/// later restart would replay the whole backlog.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Schema migration failed
    #[error("Store migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Store error: {0}")]
    Other(#[from] sqlx::Error),
}

// ============================================================================
// Database
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open the store and run migrations.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: SQLite waits up to 5 seconds for locks to
        // release before returning SQLITE_BUSY. Set via pragma() so every
        // connection in the pool inherits it.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(StoreError::Other)?
            .pragma("busy_timeout", "5000");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate()
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(db)
    }

    /// Run schema migrations. `IF NOT EXISTS` keeps this idempotent, so a
    /// restart against an existing store is a no-op. Adding a feed to the
    /// config needs no migration at all; its rows simply start appearing.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS seen_entries (
                feed_id TEXT NOT NULL,
                entry_id TEXT NOT NULL,
                first_seen_at INTEGER NOT NULL,
                PRIMARY KEY (feed_id, entry_id)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load every recorded entry id for one feed.
    ///
    /// Called once per feed at startup to seed its [`SeenCache`].
    pub async fn load_seen(&self, feed_id: &str) -> Result<HashSet<String>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT entry_id FROM seen_entries WHERE feed_id = ?")
                .bind(feed_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(entry_id,)| entry_id).collect())
    }

    /// Record an entry as seen. Idempotent: returns `true` when the row was
    /// newly inserted, `false` when it already existed.
    pub async fn record(
        &self,
        feed_id: &str,
        entry_id: &str,
        first_seen_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO seen_entries (feed_id, entry_id, first_seen_at)
            VALUES (?, ?, ?)
            ON CONFLICT(feed_id, entry_id) DO NOTHING
        "#,
        )
        .bind(feed_id)
        .bind(entry_id)
        .bind(first_seen_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

// ============================================================================
// Seen Cache
// ============================================================================

/// In-memory view of one feed's `seen_entries` partition.
///
/// Owned by the feed's scheduler task; the database stays authoritative,
/// the cache only makes the per-poll membership check synchronous. Inserts
/// happen together with `Database::record`, never on their own.
#[derive(Debug)]
pub struct SeenCache {
    seen: HashSet<String>,
}

impl SeenCache {
    pub fn new(seen: HashSet<String>) -> Self {
        Self { seen }
    }

    /// Whether the feed had no recorded entries at load time. Drives the
    /// first-run suppression decision.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn is_new(&self, entry_id: &str) -> bool {
        !self.seen.contains(entry_id)
    }

    pub fn insert(&mut self, entry_id: String) -> bool {
        self.seen.insert(entry_id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }
}

// ============================================================================
// Tests
// ============================================================================

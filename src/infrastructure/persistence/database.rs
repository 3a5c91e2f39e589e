use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Shared handle over the SQLite pool. All lifecycle mutations run through
/// transactions obtained from [`Database::begin`].
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        // Ensure the directory exists if it's a file path
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        // An in-memory database exists per connection; a pool of one keeps
        // every caller on the same database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool
            .begin()
            .await
            .context("Failed to begin transaction")
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                pair TEXT NOT NULL,
                long_exchange TEXT NOT NULL,
                short_exchange TEXT NOT NULL,
                size_usd TEXT NOT NULL,
                long_size TEXT,
                short_size TEXT,
                long_entry_price TEXT,
                short_entry_price TEXT,
                leverage_long INTEGER NOT NULL DEFAULT 1,
                leverage_short INTEGER NOT NULL DEFAULT 1,
                entry_timestamp TEXT NOT NULL,
                entry_funding_spread TEXT,
                status TEXT NOT NULL DEFAULT 'OPEN',
                close_timestamp TEXT,
                realized_pnl TEXT,
                funding_collected TEXT NOT NULL DEFAULT '0',
                total_fees TEXT NOT NULL DEFAULT '0',
                long_close_price TEXT,
                short_close_price TEXT,
                notes TEXT
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create positions table")?;

        // One non-terminal position per pair, enforced at the storage layer.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS ux_positions_open_pair
            ON positions (pair) WHERE status = 'OPEN';
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create open-pair index")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_positions_status
            ON positions (status, entry_timestamp);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create position status index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                position_id TEXT NOT NULL REFERENCES positions(id),
                exchange TEXT NOT NULL,
                pair TEXT NOT NULL,
                side TEXT NOT NULL,
                action TEXT NOT NULL,
                order_type TEXT NOT NULL,
                price TEXT,
                size TEXT NOT NULL,
                fee TEXT NOT NULL DEFAULT '0',
                order_id TEXT,
                status TEXT NOT NULL DEFAULT 'PENDING',
                created_at TEXT NOT NULL,
                executed_at TEXT,
                latency_ms INTEGER,
                error_message TEXT
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create trades table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_trades_position ON trades (position_id, created_at);",
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create trade index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS funding_events (
                id TEXT PRIMARY KEY,
                position_id TEXT NOT NULL REFERENCES positions(id),
                exchange TEXT NOT NULL,
                pair TEXT NOT NULL,
                side TEXT NOT NULL,
                funding_rate TEXT NOT NULL,
                payment_usd TEXT NOT NULL,
                position_size TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create funding_events table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_funding_events_position
            ON funding_events (position_id, timestamp);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create funding event index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS system_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create system_state table")?;

        info!("Database schema initialized.");
        Ok(())
    }
}

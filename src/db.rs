//! SQLite pool construction and schema migration, shared by the
//! persistent components (trust store, transaction store, registry).

use crate::Result;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::str::FromStr;

pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let pool = SqlitePool::connect_with(
        SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal),
    )
    .await?;

    migrate(&pool).await?;
    Ok(pool)
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS agents (
            agent_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            verification_status TEXT NOT NULL,
            reputation_score REAL NOT NULL DEFAULT 0.5,
            allowed_domains TEXT NOT NULL,
            blocked_entities TEXT NOT NULL DEFAULT '[]',
            requests_per_minute INTEGER NOT NULL,
            created_at DATETIME NOT NULL,
            last_active DATETIME NOT NULL
        );

        CREATE TABLE IF NOT EXISTS request_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_id TEXT NOT NULL,
            intent_type TEXT NOT NULL,
            target_entity_id TEXT NOT NULL,
            status_code INTEGER NOT NULL,
            latency_ms INTEGER NOT NULL,
            created_at DATETIME NOT NULL
        );

        CREATE TABLE IF NOT EXISTS properties (
            property_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            pms_type TEXT NOT NULL,
            credentials TEXT NOT NULL,
            tier TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            paused_reason TEXT,
            config TEXT NOT NULL DEFAULT '{}',
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        );

        CREATE TABLE IF NOT EXISTS transactions (
            tx_id TEXT PRIMARY KEY,
            request_id TEXT NOT NULL UNIQUE,
            agent_id TEXT NOT NULL,
            property_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            status TEXT NOT NULL,
            negotiation_round INTEGER NOT NULL DEFAULT 0,
            current_offer TEXT,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            expires_at DATETIME NOT NULL
        );

        CREATE TABLE IF NOT EXISTS idempotency_records (
            request_id TEXT NOT NULL,
            execution_type TEXT NOT NULL,
            payload_hash TEXT NOT NULL,
            -- NULL while an execution holds the slot; filled in on success
            result TEXT,
            created_at DATETIME NOT NULL,
            PRIMARY KEY (request_id, execution_type)
        );

        CREATE INDEX IF NOT EXISTS idx_request_log_agent_time
            ON request_log(agent_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_transactions_session
            ON transactions(session_id, status, updated_at DESC);
        CREATE INDEX IF NOT EXISTS idx_transactions_status ON transactions(status);
        CREATE INDEX IF NOT EXISTS idx_properties_active ON properties(is_active);
        CREATE INDEX IF NOT EXISTS idx_idempotency_created
            ON idempotency_records(created_at);
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

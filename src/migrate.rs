//! Database schema migrations.
//!
//! Creates all required tables and ensures idempotent execution. Runs at
//! every `Service` bind; all operations use `CREATE … IF NOT EXISTS` or
//! check `sqlite_master` before creating objects that do not support it.
//!
//! # Schema
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   services   │──┐  │  embeddings  │──┐  │  projections │
//! │              │  │  │              │  │  │              │
//! │ id (PK)      │  │  │ hash (PK)    │──┼──│ hash (PK)    │
//! │ name (UQ)    │  └──│ service_id   │  │  │ proj_0..7    │
//! │ format       │     │ embedding    │  │  └──────────────┘
//! │ base_url     │     │ token_count  │  │
//! │ model        │     │ created_at   │  │  ┌──────────────┐
//! │ dimensions   │     └──────────────┘  └──│    chunks    │
//! │ max_tokens   │                          │              │
//! │ created_at   │     ┌──────────────┐     │ id (PK)      │
//! └──────┬───────┘     │ embed_queue  │     │ hash         │
//!        │             │              │     │ source_type  │
//! ┌──────┴────────────┐│ id (PK)      │     │ source_id    │
//! │ projection_vectors││ source_type  │     │ pair_id      │
//! │                   ││ source_id    │     │ parent_id    │
//! │ service_id (PK)   ││ text         │     │ offset       │
//! │ vec_0 .. vec_7    ││ status       │     │ size         │
//! │ created_at        ││ attempts     │     │ match_count  │
//! └───────────────────┘│ created_at   │     │ read_count   │
//!                      │ processed_at │     │ created_at   │
//!                      └──────────────┘     └──────────────┘
//!
//! text database (attached as `text_store`):
//! ┌──────────────┐     ┌──────────────┐
//! │    texts     │     │  texts_fts   │
//! │              │     │  (FTS5)      │
//! │ hash (PK)    │     │ hash UNIDX   │
//! │ content      │     │ content      │
//! └──────────────┘     └──────────────┘
//! ```
//!
//! Timestamps are epoch milliseconds. The content hash is a 32-byte BLOB.
//! Queue status: -1 pending, 0 success, >= 1 terminal failure.

use sqlx::SqlitePool;

use crate::error::Result;
use crate::models::QueueStatus;

/// Create all tables and indexes for one instance prefix. Safe to call
/// repeatedly; pass the text schema alias only when text storage is on.
pub async fn run_migrations(
    pool: &SqlitePool,
    prefix: &str,
    text_schema: Option<&str>,
) -> Result<()> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {p}services (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            format TEXT NOT NULL,
            base_url TEXT,
            model TEXT NOT NULL,
            dimensions INTEGER NOT NULL,
            max_tokens INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )",
        p = prefix
    );
    sqlx::query(&sql).execute(pool).await?;

    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {p}embeddings (
            hash BLOB PRIMARY KEY,
            embedding BLOB NOT NULL,
            token_count INTEGER NOT NULL DEFAULT 0,
            service_id INTEGER NOT NULL REFERENCES {p}services(id),
            created_at INTEGER NOT NULL
        )",
        p = prefix
    );
    sqlx::query(&sql).execute(pool).await?;

    let sql = format!(
        "CREATE INDEX IF NOT EXISTS idx_{p}embeddings_service_id ON {p}embeddings(service_id)",
        p = prefix
    );
    sqlx::query(&sql).execute(pool).await?;

    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {p}chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            hash BLOB NOT NULL REFERENCES {p}embeddings(hash),
            source_type TEXT NOT NULL,
            source_id INTEGER NOT NULL,
            pair_id INTEGER,
            parent_id INTEGER,
            \"offset\" INTEGER,
            size INTEGER NOT NULL,
            match_count INTEGER NOT NULL DEFAULT 0,
            read_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            UNIQUE(source_type, source_id, \"offset\")
        )",
        p = prefix
    );
    sqlx::query(&sql).execute(pool).await?;

    for index in [
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{p}chunks_hash ON {p}chunks(hash)",
            p = prefix
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{p}chunks_source ON {p}chunks(source_type, source_id)",
            p = prefix
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{p}chunks_pair_id ON {p}chunks(pair_id)",
            p = prefix
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{p}chunks_parent_id ON {p}chunks(parent_id)",
            p = prefix
        ),
    ] {
        sqlx::query(&index).execute(pool).await?;
    }

    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {p}projection_vectors (
            service_id INTEGER PRIMARY KEY REFERENCES {p}services(id),
            vec_0 BLOB NOT NULL,
            vec_1 BLOB NOT NULL,
            vec_2 BLOB NOT NULL,
            vec_3 BLOB NOT NULL,
            vec_4 BLOB NOT NULL,
            vec_5 BLOB NOT NULL,
            vec_6 BLOB NOT NULL,
            vec_7 BLOB NOT NULL,
            created_at INTEGER NOT NULL
        )",
        p = prefix
    );
    sqlx::query(&sql).execute(pool).await?;

    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {p}projections (
            hash BLOB PRIMARY KEY REFERENCES {p}embeddings(hash),
            proj_0 REAL NOT NULL,
            proj_1 REAL NOT NULL,
            proj_2 REAL NOT NULL,
            proj_3 REAL NOT NULL,
            proj_4 REAL NOT NULL,
            proj_5 REAL NOT NULL,
            proj_6 REAL NOT NULL,
            proj_7 REAL NOT NULL
        )",
        p = prefix
    );
    sqlx::query(&sql).execute(pool).await?;

    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {p}embed_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_type TEXT NOT NULL,
            source_id INTEGER NOT NULL,
            text TEXT NOT NULL,
            status INTEGER NOT NULL DEFAULT {pending},
            error_message TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            processed_at INTEGER,
            UNIQUE(source_type, source_id)
        )",
        p = prefix,
        pending = QueueStatus::PENDING
    );
    sqlx::query(&sql).execute(pool).await?;

    let sql = format!(
        "CREATE INDEX IF NOT EXISTS idx_{p}embed_queue_pending
         ON {p}embed_queue(created_at) WHERE status = {pending}",
        p = prefix,
        pending = QueueStatus::PENDING
    );
    sqlx::query(&sql).execute(pool).await?;

    let sql = format!(
        "CREATE INDEX IF NOT EXISTS idx_{p}embed_queue_failed
         ON {p}embed_queue(status) WHERE status > {success}",
        p = prefix,
        success = QueueStatus::SUCCESS
    );
    sqlx::query(&sql).execute(pool).await?;

    if let Some(schema) = text_schema {
        run_text_migrations(pool, prefix, schema).await?;
    }

    Ok(())
}

/// Tables in the attached text database: the content-addressed text store
/// and its FTS5 index. FTS5 virtual tables do not support
/// `IF NOT EXISTS`, so creation is guarded by a `sqlite_master` probe.
async fn run_text_migrations(pool: &SqlitePool, prefix: &str, schema: &str) -> Result<()> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {s}.{p}texts (
            hash BLOB PRIMARY KEY,
            content TEXT NOT NULL
        )",
        s = schema,
        p = prefix
    );
    sqlx::query(&sql).execute(pool).await?;

    let sql = format!(
        "SELECT COUNT(*) > 0 FROM {s}.sqlite_master WHERE type = 'table' AND name = ?",
        s = schema
    );
    let fts_exists: bool = sqlx::query_scalar(&sql)
        .bind(format!("{}texts_fts", prefix))
        .fetch_one(pool)
        .await?;

    if !fts_exists {
        let sql = format!(
            "CREATE VIRTUAL TABLE {s}.{p}texts_fts USING fts5(
                hash UNINDEXED,
                content
            )",
            s = schema,
            p = prefix
        );
        sqlx::query(&sql).execute(pool).await?;
    }

    Ok(())
}

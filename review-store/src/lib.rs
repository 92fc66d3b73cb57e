//! Durable relational store for LiveReview.
//!
//! Single SQLite database (selected by `DATABASE_URL`) acting as the source
//! of truth for:
//! - `review_jobs` — the transactional job queue (idempotent enqueue,
//!   atomic lease with expiry, retry/poison handling),
//! - `review_events` — the append-only audit log of a review pass,
//! - `learnings` — reviewer-authored guidance captured post-hoc,
//! - `connectors` / `integration_tokens` / `webhook_registry` — per-forge
//!   credentials and webhook secrets.
//!
//! Schema is ensured at startup with idempotent DDL; there is no external
//! migration machinery. All SQL is plain ANSI so another relational backend
//! could be swapped in behind the same queries.

pub mod errors;
pub mod events;
pub mod jobs;
pub mod learnings;
pub mod registry;

use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;

use errors::StoreResult;

/// Handle to the shared database pool. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connects to `database_url` and ensures the schema exists.
    ///
    /// `max_connections` must exceed the worker count so lease queries can
    /// never deadlock behind long-running job transactions.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        info!(max_connections, "store connected");
        Ok(store)
    }

    /// Wraps an already-connected pool (used by tests).
    pub async fn from_pool(pool: SqlitePool) -> StoreResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Borrow the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent DDL for all tables and indexes.
    async fn ensure_schema(&self) -> StoreResult<()> {
        let ddl = [
            r#"CREATE TABLE IF NOT EXISTS connectors (
                id          TEXT PRIMARY KEY,
                provider    TEXT NOT NULL,
                api_base    TEXT NOT NULL,
                enabled     INTEGER NOT NULL DEFAULT 1,
                created_at  TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS integration_tokens (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                connector_id TEXT NOT NULL REFERENCES connectors(id),
                token        TEXT NOT NULL,
                bot_user_id  TEXT NOT NULL,
                bot_login    TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS webhook_registry (
                provider             TEXT NOT NULL,
                integration_token_id INTEGER NOT NULL REFERENCES integration_tokens(id),
                secret               TEXT NOT NULL,
                PRIMARY KEY (provider, integration_token_id)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS review_jobs (
                id               TEXT PRIMARY KEY,
                idempotency_key  TEXT NOT NULL UNIQUE,
                payload          TEXT NOT NULL,
                state            TEXT NOT NULL DEFAULT 'available',
                attempt          INTEGER NOT NULL DEFAULT 0,
                next_run_at      TEXT NOT NULL,
                leased_by        TEXT,
                lease_expires_at TEXT,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_review_jobs_available
                ON review_jobs (next_run_at) WHERE state = 'available'"#,
            r#"CREATE TABLE IF NOT EXISTS review_events (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                review_id  TEXT NOT NULL,
                kind       TEXT NOT NULL,
                detail     TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_review_events_review
                ON review_events (review_id, kind, created_at)"#,
            r#"CREATE TABLE IF NOT EXISTS learnings (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                provider        TEXT NOT NULL,
                repo_id         TEXT NOT NULL,
                pattern         TEXT NOT NULL,
                preferred_style TEXT NOT NULL,
                counter_example TEXT,
                created_at      TEXT NOT NULL
            )"#,
        ];

        for stmt in ddl {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

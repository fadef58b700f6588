use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(8))
        .connect_lazy(database_url)
        .context("Failed to create lazy database pool")
}

const DISPATCH_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS dispatch_units (
        id uuid PRIMARY KEY,
        kind text NOT NULL,
        payload jsonb NOT NULL,
        status text NOT NULL,
        dedupe_key text NULL,
        dedupe_hash text NULL,
        attempts integer NOT NULL DEFAULT 0,
        max_attempts integer NOT NULL,
        available_at timestamptz NOT NULL DEFAULT now(),
        last_error jsonb NULL,
        result_status text NULL,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now(),
        started_at timestamptz NULL,
        completed_at timestamptz NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS dispatch_units_dedupe_hash_idx
        ON dispatch_units (dedupe_hash)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS dispatch_units_claim_idx
        ON dispatch_units (status, available_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS notification_ledger (
        dedupe_key text PRIMARY KEY,
        created_at timestamptz NOT NULL DEFAULT now()
    )
    "#,
];

/// Creates the dispatcher's own tables. The sensor/workspace/user schema belongs to the CRUD
/// service and is never touched here.
pub async fn ensure_dispatch_schema(pool: &PgPool) -> Result<()> {
    for statement in DISPATCH_SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("failed to apply dispatch schema")?;
    }
    Ok(())
}

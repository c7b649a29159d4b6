//! One-shot schema migrations for the database backend.
//!
//! Migrations are additive statements with stable ids, recorded in
//! `kv_migrations`. All pending migrations apply inside a single
//! transaction; ids already recorded are skipped, and a process-local flag
//! short-circuits repeat calls. DDL uses `IF NOT EXISTS` and id inserts use
//! `ON CONFLICT DO NOTHING`, so two processes booting against the same
//! database race harmlessly.

use std::sync::atomic::{AtomicBool, Ordering};

use sqlx::PgPool;

use crate::error::StoreError;

struct Migration {
    id: &'static str,
    sql: &'static str,
}

const CREATE_BOOKKEEPING_SQL: &str = "CREATE TABLE IF NOT EXISTS kv_migrations \
     (id text PRIMARY KEY, applied_at timestamptz NOT NULL DEFAULT now())";

/// Ordered, additive migrations. Never reorder or rewrite an entry; append
/// a new id instead.
const MIGRATIONS: &[Migration] = &[
    Migration {
        id: "0001_create_kv",
        sql: "CREATE TABLE IF NOT EXISTS kv \
              (key text PRIMARY KEY, data jsonb NOT NULL, \
               updated_at timestamptz NOT NULL DEFAULT now())",
    },
    Migration {
        id: "0002_kv_updated_at_idx",
        sql: "CREATE INDEX IF NOT EXISTS kv_updated_at_idx ON kv (updated_at)",
    },
];

static APPLIED_THIS_PROCESS: AtomicBool = AtomicBool::new(false);

/// Ensures the bookkeeping table exists and applies any pending migrations,
/// in order, inside one transaction. Idempotent.
pub async fn apply_migrations(pool: &PgPool) -> Result<(), StoreError> {
    if APPLIED_THIS_PROCESS.load(Ordering::Acquire) {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    sqlx::query(CREATE_BOOKKEEPING_SQL).execute(&mut *tx).await?;

    let applied: Vec<String> = sqlx::query_scalar("SELECT id FROM kv_migrations")
        .fetch_all(&mut *tx)
        .await?;

    for migration in MIGRATIONS {
        if applied.iter().any(|id| id == migration.id) {
            continue;
        }
        sqlx::query(migration.sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO kv_migrations (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(migration.id)
            .execute(&mut *tx)
            .await?;
        tracing::info!(id = migration.id, "applied schema migration");
    }

    tx.commit().await?;
    APPLIED_THIS_PROCESS.store(true, Ordering::Release);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_ids_are_unique_and_ordered() {
        let ids: Vec<&str> = MIGRATIONS.iter().map(|m| m.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(ids, sorted, "ids must be unique and appended in order");
    }

    #[test]
    fn first_migration_creates_the_kv_table() {
        assert!(MIGRATIONS[0].sql.contains("CREATE TABLE"));
        assert!(MIGRATIONS[0].sql.contains("kv"));
    }
}

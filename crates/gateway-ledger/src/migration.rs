//! Schema migration system.
//!
//! Migrations are stored as static SQL strings keyed by version number.
//! The current version is tracked in a `_migrations` table so migrations
//! are idempotent and only run once.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{LedgerError, LedgerResult};

/// A single migration definition.
struct Migration {
    /// Monotonically increasing version number (1, 2, 3, ...).
    version: u32,
    /// Human-readable description.
    description: &'static str,
    /// Raw SQL to execute. May contain multiple statements separated by `;`.
    sql: &'static str,
}

/// All migrations in order. Add new migrations to the end of this array.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "initial schema — accounts and usage_records",
    sql: r#"
            CREATE TABLE accounts (
                user_id    TEXT PRIMARY KEY,
                power      INTEGER NOT NULL DEFAULT 0 CHECK(power >= 0),
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE usage_records (
                id                TEXT PRIMARY KEY,
                user_id           TEXT NOT NULL REFERENCES accounts(user_id),
                amount            INTEGER NOT NULL,
                source            TEXT NOT NULL,
                association_no    TEXT NOT NULL UNIQUE,
                prompt_tokens     INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                status            TEXT NOT NULL CHECK(status IN ('completed','cancelled','failed')),
                created_at        INTEGER NOT NULL
            );
            CREATE INDEX idx_usage_records_user ON usage_records(user_id);
            CREATE UNIQUE INDEX idx_usage_records_assoc ON usage_records(association_no);
        "#,
}];

// ── public API ───────────────────────────────────────────────────────

/// Run all pending migrations against `conn`.
///
/// This is a **synchronous** function — call it from `spawn_blocking`.
pub fn run_all(conn: &Connection) -> LedgerResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(current_version = current, "ledger schema is up to date");
        return Ok(());
    }

    info!(
        current_version = current,
        pending = pending.len(),
        "running pending ledger migrations"
    );

    for migration in pending {
        apply(conn, migration)?;
    }

    Ok(())
}

/// Return the latest applied migration version, or 0 if none.
pub fn current_version(conn: &Connection) -> LedgerResult<u32> {
    let version: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| LedgerError::Migration {
            version: 0,
            message: format!("failed to read current version: {e}"),
        })?;
    Ok(version)
}

// ── internals ────────────────────────────────────────────────────────

/// Create the version-tracking table if missing.
fn ensure_migrations_table(conn: &Connection) -> LedgerResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version    INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        );",
    )?;
    Ok(())
}

/// Apply one migration inside a transaction.
fn apply(conn: &Connection, migration: &Migration) -> LedgerResult<()> {
    debug!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    conn.execute_batch(&format!(
        "BEGIN;\n{}\nINSERT INTO _migrations (version, applied_at) VALUES ({}, strftime('%s','now'));\nCOMMIT;",
        migration.sql, migration.version
    ))
    .map_err(|e| LedgerError::Migration {
        version: migration.version,
        message: e.to_string(),
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

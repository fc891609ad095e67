//! Lightweight migration runner for rusqlite.
//!
//! Migrations are embedded at compile time via `include_str!` so the binary
//! is self-contained and works without access to the source tree.

use std::collections::HashSet;

use rusqlite::{params, Connection};
use tracing::{info, warn};

const EMBEDDED_MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "001_baseline",
    include_str!("../migrations/001_baseline.sql"),
)];

/// Run all pending migrations against the given connection.
///
/// Call this at startup before any other database operations.
pub fn run_migrations(conn: &mut Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
    )?;

    let applied: HashSet<i64> = conn
        .prepare("SELECT version FROM schema_versions")?
        .query_map([], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();

    let mut pending = 0;
    for &(version, name, sql) in EMBEDDED_MIGRATIONS {
        if applied.contains(&version) {
            continue;
        }

        if let Err(e) = conn.execute_batch(sql) {
            warn!(
                component = "migrations",
                event = "migration.failed",
                version = version,
                name = %name,
                error = %e,
                "migration failed (may already be applied)"
            );
            conn.execute(
                "INSERT OR IGNORE INTO schema_versions (version, name) VALUES (?1, ?2)",
                params![version, name],
            )?;
            continue;
        }

        conn.execute(
            "INSERT OR IGNORE INTO schema_versions (version, name) VALUES (?1, ?2)",
            params![version, name],
        )?;

        info!(
            component = "migrations",
            event = "migration.applied",
            version = version,
            name = %name,
            "applied migration"
        );
        pending += 1;
    }

    let total = EMBEDDED_MIGRATIONS.len();
    info!(
        component = "migrations",
        event = "migrations.complete",
        total = total,
        applied = pending,
        skipped = total - pending,
        "migration check complete"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_migrations_are_sorted() {
        let versions: Vec<i64> = EMBEDDED_MIGRATIONS.iter().map(|(v, _, _)| *v).collect();
        let mut sorted = versions.clone();
        sorted.sort();
        assert_eq!(versions, sorted);
    }

    #[test]
    fn run_migrations_on_fresh_db() {
        let mut conn = Connection::open_in_memory().expect("open in-memory db");
        run_migrations(&mut conn).expect("migrations should succeed");

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_versions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, EMBEDDED_MIGRATIONS.len() as i64);

        let table_exists: i64 = conn
            .query_row(
                "SELECT COUNT(1) FROM sqlite_master WHERE type = 'table' AND name = 'directories'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(table_exists, 1);
    }

    #[test]
    fn idempotent_migrations() {
        let mut conn = Connection::open_in_memory().expect("open in-memory db");
        run_migrations(&mut conn).expect("first run");
        run_migrations(&mut conn).expect("second run should be idempotent");
    }
}

use chrono::Utc;
use rusqlite::{params, Connection, TransactionBehavior};
use tempo_core::{clock::dt_to_ms, Error, Result};

use crate::store::map_sqlite_err;

const SCHEMA_VERSION: i64 = 2;

pub(crate) fn ensure_schema(conn: &mut Connection) -> Result<()> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| map_sqlite_err("begin schema tx", e))?;

    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tempo_schema_migrations (
          version INTEGER PRIMARY KEY,
          name TEXT NOT NULL,
          applied_at_ms INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| map_sqlite_err("init migration table", e))?;

    let current: i64 = tx
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM tempo_schema_migrations",
            [],
            |r| r.get(0),
        )
        .map_err(|e| map_sqlite_err("read schema version", e))?;
    if current > SCHEMA_VERSION {
        return Err(Error::Config(format!(
            "sqlite schema version {current} is newer than supported {SCHEMA_VERSION}"
        )));
    }

    if current < 1 {
        tx.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_actions (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              id TEXT NOT NULL UNIQUE,
              subject_id TEXT NOT NULL,
              kind TEXT NOT NULL,
              payload TEXT NOT NULL,
              scheduled_for_ms INTEGER NOT NULL,
              status TEXT NOT NULL,
              started_processing_at_ms INTEGER NULL,
              attempt_count INTEGER NOT NULL DEFAULT 0,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scheduled_actions_due
              ON scheduled_actions(status, scheduled_for_ms, created_at_ms, seq);
            CREATE INDEX IF NOT EXISTS idx_scheduled_actions_subject
              ON scheduled_actions(subject_id, status);
            "#,
        )
        .map_err(|e| map_sqlite_err("apply migration v1", e))?;
        record(&tx, 1, "scheduled_actions")?;
    }
    if current < 2 {
        tx.execute_batch(
            r#"
            ALTER TABLE scheduled_actions ADD COLUMN last_error TEXT NULL;
            ALTER TABLE scheduled_actions ADD COLUMN claimed_by TEXT NULL;
            "#,
        )
        .map_err(|e| map_sqlite_err("apply migration v2", e))?;
        record(&tx, 2, "last_error_and_claimant")?;
    }

    tx.commit()
        .map_err(|e| map_sqlite_err("commit schema tx", e))
}

fn record(conn: &Connection, version: i64, name: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO tempo_schema_migrations(version, name, applied_at_ms)
         VALUES (?1, ?2, ?3)",
        params![version, name, dt_to_ms(Utc::now())],
    )
    .map_err(|e| map_sqlite_err("record migration", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_bootstrap_is_repeatable() {
        let mut conn = Connection::open_in_memory().unwrap();
        ensure_schema(&mut conn).unwrap();
        ensure_schema(&mut conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM tempo_schema_migrations", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        conn.execute(
            "INSERT INTO tempo_schema_migrations(version, name, applied_at_ms) VALUES (99, 'future', 0)",
            [],
        )
        .unwrap();
        assert!(matches!(ensure_schema(&mut conn), Err(Error::Config(_))));
    }
}

use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{
    params, types::Type, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior,
};
use tracing::{debug, warn};
use uuid::Uuid;

use tempo_core::{
    clock::{dt_to_ms, ms_to_dt, Clock, SystemClock},
    domain::{ActionFilter, ActionId, ActionStatus, ScheduledAction, StatusCounts, SubjectId},
    retry::{FailDecision, RetryPolicy},
    store::{check_completable, claim_cutoff, stale_cutoff, ActionStore},
    Error, Result,
};

use crate::schema::ensure_schema;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const COLUMNS: &str = "id, subject_id, kind, payload, scheduled_for_ms, status, \
     started_processing_at_ms, attempt_count, last_error, claimed_by, created_at_ms, updated_at_ms";

/// One connection per instance. Opening several instances on the same file
/// behaves like several worker processes sharing the database.
#[derive(Clone)]
pub struct SqliteActionStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    worker_id: Option<String>,
}

impl SqliteActionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| map_sqlite_err("open", e))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get::<_, String>(0))
            .map_err(|e| map_sqlite_err("enable wal", e))?;
        debug!(path = %path.display(), "opened sqlite action store");
        Self::from_connection(conn)
    }

    /// Private database that disappears with the store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| map_sqlite_err("open", e))?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| map_sqlite_err("set busy timeout", e))?;
        ensure_schema(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
            worker_id: None,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::StoreUnavailable("sqlite connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::StoreUnavailable(format!("sqlite task failed: {e}")))?
    }
}

/// Busy/locked/IO conditions are outages the loops back off from; anything
/// else is a bug or corruption and surfaces as-is.
pub(crate) fn map_sqlite_err(context: &str, err: rusqlite::Error) -> Error {
    let outage = matches!(
        &err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
            )
    );
    if outage {
        Error::StoreUnavailable(format!("sqlite {context}: {err}"))
    } else {
        Error::External(format!("sqlite {context}: {err}"))
    }
}

fn conversion_err(col: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, Type::Text, Box::new(e))
}

fn is_decode_err(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
    )
}

fn row_to_action(row: &Row<'_>) -> rusqlite::Result<ScheduledAction> {
    let id: String = row.get(0)?;
    let id = Uuid::parse_str(&id).map_err(|e| conversion_err(0, e))?;
    let payload: String = row.get(3)?;
    let payload = serde_json::from_str(&payload).map_err(|e| conversion_err(3, e))?;
    let status: String = row.get(5)?;
    let status = ActionStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            Type::Text,
            format!("unknown status: {status}").into(),
        )
    })?;

    Ok(ScheduledAction {
        id: ActionId(id),
        subject_id: SubjectId(row.get(1)?),
        kind: row.get(2)?,
        payload,
        scheduled_for: ms_to_dt(row.get(4)?),
        status,
        started_processing_at: row.get::<_, Option<i64>>(6)?.map(ms_to_dt),
        attempt_count: row.get::<_, i64>(7)? as u32,
        last_error: row.get(8)?,
        claimed_by: row.get(9)?,
        created_at: ms_to_dt(row.get(10)?),
        updated_at: ms_to_dt(row.get(11)?),
    })
}

fn current_status(conn: &Connection, id: ActionId) -> Result<(ActionStatus, u32)> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT status, attempt_count FROM scheduled_actions WHERE id = ?1",
            params![id.to_string()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| map_sqlite_err("read status", e))?;
    let (status, attempts) = row.ok_or(Error::NotFound { id })?;
    let status = ActionStatus::parse(&status)
        .ok_or_else(|| Error::External(format!("unknown status {status} for {id}")))?;
    Ok((status, attempts as u32))
}

#[async_trait]
impl ActionStore for SqliteActionStore {
    async fn schedule(
        &self,
        subject: &SubjectId,
        kind: &str,
        payload: serde_json::Value,
        due_at: DateTime<Utc>,
    ) -> Result<ActionId> {
        let id = ActionId::new();
        let now = dt_to_ms(self.clock.now());
        let subject = subject.0.clone();
        let kind = kind.to_string();
        let payload = serde_json::to_string(&payload)?;

        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO scheduled_actions
                 (id, subject_id, kind, payload, scheduled_for_ms, status, attempt_count,
                  created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?6)",
                params![id.to_string(), subject, kind, payload, dt_to_ms(due_at), now],
            )
            .map_err(|e| map_sqlite_err("insert action", e))?;
            Ok(id)
        })
        .await
    }

    async fn cancel_pending(&self, subject: &SubjectId, kind: Option<&str>) -> Result<u64> {
        let now = dt_to_ms(self.clock.now());
        let subject = subject.0.clone();
        let kind = kind.map(str::to_string);

        self.blocking(move |conn| {
            let n = conn
                .execute(
                    "UPDATE scheduled_actions
                     SET status = 'cancelled', updated_at_ms = ?1
                     WHERE subject_id = ?2 AND status = 'pending'
                       AND (?3 IS NULL OR kind = ?3)",
                    params![now, subject, kind],
                )
                .map_err(|e| map_sqlite_err("cancel pending", e))?;
            Ok(n as u64)
        })
        .await
    }

    async fn claim_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        preemptive_window: Duration,
    ) -> Result<Vec<ScheduledAction>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let cutoff = dt_to_ms(claim_cutoff(now, preemptive_window));
        let now = dt_to_ms(now);
        let worker = self.worker_id.clone();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.blocking(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| map_sqlite_err("begin claim tx", e))?;

            let ids: Vec<String> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT id FROM scheduled_actions
                         WHERE status = 'pending' AND scheduled_for_ms <= ?1
                         ORDER BY scheduled_for_ms ASC, created_at_ms ASC, seq ASC
                         LIMIT ?2",
                    )
                    .map_err(|e| map_sqlite_err("prepare claim", e))?;
                let rows = stmt
                    .query_map(params![cutoff, limit], |r| r.get(0))
                    .map_err(|e| map_sqlite_err("select due", e))?;
                rows.collect::<rusqlite::Result<_>>()
                    .map_err(|e| map_sqlite_err("select due", e))?
            };

            let mut claimed = Vec::with_capacity(ids.len());
            {
                let sql = format!(
                    "UPDATE scheduled_actions
                     SET status = 'processing', started_processing_at_ms = ?2,
                         claimed_by = ?3, updated_at_ms = ?2
                     WHERE id = ?1 AND status = 'pending'
                     RETURNING {COLUMNS}"
                );
                let mut stmt = tx
                    .prepare(&sql)
                    .map_err(|e| map_sqlite_err("prepare claim update", e))?;
                for id in &ids {
                    match stmt
                        .query_row(params![id, now, worker], row_to_action)
                        .optional()
                    {
                        Ok(row) => claimed.extend(row),
                        // An unreadable row would otherwise fail every claim.
                        Err(e) if is_decode_err(&e) => {
                            warn!(id = %id, error = %e, "undecodable action marked failed");
                            tx.execute(
                                "UPDATE scheduled_actions
                                 SET status = 'failed', started_processing_at_ms = NULL,
                                     last_error = ?2, updated_at_ms = ?3
                                 WHERE id = ?1",
                                params![id, format!("undecodable row: {e}"), now],
                            )
                            .map_err(|e| map_sqlite_err("fail undecodable row", e))?;
                        }
                        Err(e) => return Err(map_sqlite_err("claim row", e)),
                    }
                }
            }

            tx.commit()
                .map_err(|e| map_sqlite_err("commit claim tx", e))?;
            Ok(claimed)
        })
        .await
    }

    async fn complete(&self, id: ActionId) -> Result<bool> {
        let now = dt_to_ms(self.clock.now());
        self.blocking(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| map_sqlite_err("begin complete tx", e))?;
            let (status, _) = current_status(&tx, id)?;
            let transition = check_completable(id, status)?;
            if transition {
                tx.execute(
                    "UPDATE scheduled_actions SET status = 'executed', updated_at_ms = ?2
                     WHERE id = ?1 AND status = 'processing'",
                    params![id.to_string(), now],
                )
                .map_err(|e| map_sqlite_err("complete", e))?;
            }
            tx.commit()
                .map_err(|e| map_sqlite_err("commit complete tx", e))?;
            Ok(transition)
        })
        .await
    }

    async fn fail(&self, id: ActionId, retryable: bool, reason: &str) -> Result<ActionStatus> {
        let now = self.clock.now();
        let retry = self.retry.clone();
        let reason = reason.to_string();

        self.blocking(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| map_sqlite_err("begin fail tx", e))?;
            let (status, attempts) = current_status(&tx, id)?;
            if status != ActionStatus::Processing {
                return Err(Error::InvalidTransition {
                    id,
                    from: status,
                    op: "fail",
                });
            }

            let next = match retry.decide(attempts, retryable, now) {
                FailDecision::Retry {
                    attempt_count,
                    not_before,
                } => {
                    tx.execute(
                        "UPDATE scheduled_actions
                         SET status = 'pending', attempt_count = ?2, scheduled_for_ms = ?3,
                             started_processing_at_ms = NULL, last_error = ?4, updated_at_ms = ?5
                         WHERE id = ?1 AND status = 'processing'",
                        params![
                            id.to_string(),
                            attempt_count,
                            dt_to_ms(not_before),
                            reason,
                            dt_to_ms(now)
                        ],
                    )
                    .map_err(|e| map_sqlite_err("fail (retry)", e))?;
                    ActionStatus::Pending
                }
                FailDecision::GiveUp => {
                    tx.execute(
                        "UPDATE scheduled_actions
                         SET status = 'failed', last_error = ?2, updated_at_ms = ?3
                         WHERE id = ?1 AND status = 'processing'",
                        params![id.to_string(), reason, dt_to_ms(now)],
                    )
                    .map_err(|e| map_sqlite_err("fail (terminal)", e))?;
                    ActionStatus::Failed
                }
            };
            tx.commit()
                .map_err(|e| map_sqlite_err("commit fail tx", e))?;
            Ok(next)
        })
        .await
    }

    async fn reap_stale(&self, stale_after: Duration) -> Result<u64> {
        let now = self.clock.now();
        let cutoff = dt_to_ms(stale_cutoff(now, stale_after));
        let now = dt_to_ms(now);

        self.blocking(move |conn| {
            let n = conn
                .execute(
                    "UPDATE scheduled_actions
                     SET status = 'pending', started_processing_at_ms = NULL, updated_at_ms = ?1
                     WHERE status = 'processing' AND started_processing_at_ms < ?2",
                    params![now, cutoff],
                )
                .map_err(|e| map_sqlite_err("reap stale", e))?;
            Ok(n as u64)
        })
        .await
    }

    async fn get(&self, id: ActionId) -> Result<Option<ScheduledAction>> {
        self.blocking(move |conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM scheduled_actions WHERE id = ?1"),
                params![id.to_string()],
                row_to_action,
            )
            .optional()
            .map_err(|e| map_sqlite_err("get action", e))
        })
        .await
    }

    async fn list(&self, filter: &ActionFilter) -> Result<Vec<ScheduledAction>> {
        let status = filter.status.map(|s| s.as_str());
        let subject = filter.subject_id.as_ref().map(|s| s.0.clone());
        // SQLite treats a negative LIMIT as "no limit".
        let limit = filter
            .limit
            .map(|n| i64::try_from(n).unwrap_or(i64::MAX))
            .unwrap_or(-1);

        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {COLUMNS} FROM scheduled_actions
                     WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR subject_id = ?2)
                     ORDER BY scheduled_for_ms ASC, created_at_ms ASC, seq ASC
                     LIMIT ?3"
                ))
                .map_err(|e| map_sqlite_err("prepare list", e))?;
            let rows = stmt
                .query_map(params![status, subject, limit], row_to_action)
                .map_err(|e| map_sqlite_err("list actions", e))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| map_sqlite_err("list actions", e))
        })
        .await
    }

    async fn retry_failed(&self, id: ActionId, due_at: DateTime<Utc>) -> Result<()> {
        let now = dt_to_ms(self.clock.now());
        self.blocking(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| map_sqlite_err("begin retry tx", e))?;
            let (status, _) = current_status(&tx, id)?;
            if status != ActionStatus::Failed {
                return Err(Error::InvalidTransition {
                    id,
                    from: status,
                    op: "retry",
                });
            }
            tx.execute(
                "UPDATE scheduled_actions
                 SET status = 'pending', attempt_count = 0, scheduled_for_ms = ?2,
                     started_processing_at_ms = NULL, updated_at_ms = ?3
                 WHERE id = ?1 AND status = 'failed'",
                params![id.to_string(), dt_to_ms(due_at), now],
            )
            .map_err(|e| map_sqlite_err("retry failed", e))?;
            tx.commit()
                .map_err(|e| map_sqlite_err("commit retry tx", e))
        })
        .await
    }

    async fn counts(&self) -> Result<StatusCounts> {
        self.blocking(|conn| {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM scheduled_actions GROUP BY status")
                .map_err(|e| map_sqlite_err("prepare counts", e))?;
            let rows = stmt
                .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
                .map_err(|e| map_sqlite_err("count actions", e))?;
            let mut counts = StatusCounts::default();
            for row in rows {
                let (status, n) = row.map_err(|e| map_sqlite_err("count actions", e))?;
                if let Some(status) = ActionStatus::parse(&status) {
                    counts.add(status, n as u64);
                }
            }
            Ok(counts)
        })
        .await
    }
}

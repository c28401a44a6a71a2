use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    PgPool, Postgres, Row, Transaction,
};
use tracing::{debug, info};
use uuid::Uuid;

use tempo_core::{
    clock::{Clock, SystemClock},
    domain::{ActionFilter, ActionId, ActionStatus, ScheduledAction, StatusCounts, SubjectId},
    retry::{FailDecision, RetryPolicy},
    store::{check_completable, claim_cutoff, stale_cutoff, ActionStore},
    Error, Result,
};

const COLUMNS: &str = "seq, id, subject_id, kind, payload, scheduled_for, status, \
     started_processing_at, attempt_count, last_error, claimed_by, created_at, updated_at";

#[derive(Clone)]
pub struct PostgresActionStore {
    pool: PgPool,
    schema: String,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    worker_id: Option<String>,
}

impl PostgresActionStore {
    /// Connect and bootstrap the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_err("connect", e))?;
        let store = Self::with_pool(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Wrap an existing pool. Call [`ensure_schema`](Self::ensure_schema)
    /// before first use.
    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema: "public".to_string(),
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
            worker_id: None,
        }
    }

    /// Place the table in `schema`. Only `[A-Za-z0-9_]+` is accepted since
    /// the name is interpolated into every statement.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        if !is_valid_schema_ident(&schema) {
            return Err(Error::Config(format!(
                "invalid postgres schema name: {schema}"
            )));
        }
        self.schema = schema;
        Ok(self)
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

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn table(&self) -> String {
        format!("\"{}\".scheduled_actions", self.schema)
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        let t = self.table();
        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", self.schema),
            format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    seq BIGSERIAL PRIMARY KEY,
                    id UUID NOT NULL UNIQUE,
                    subject_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    scheduled_for TIMESTAMPTZ NOT NULL,
                    status TEXT NOT NULL,
                    started_processing_at TIMESTAMPTZ NULL,
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT NULL,
                    claimed_by TEXT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_scheduled_actions_due
                 ON {t}(status, scheduled_for, created_at, seq)"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_scheduled_actions_subject
                 ON {t}(subject_id, status)"
            ),
        ];
        for sql in &statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_err("schema bootstrap", e))?;
        }
        info!(schema = %self.schema, "postgres action store ready");
        Ok(())
    }

    async fn lock_row(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: ActionId,
    ) -> Result<(ActionStatus, u32)> {
        let row = sqlx::query(&format!(
            "SELECT status, attempt_count FROM {} WHERE id = $1 FOR UPDATE",
            self.table()
        ))
        .bind(id.0)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_err("lock row", e))?
        .ok_or(Error::NotFound { id })?;

        let status: String = row.try_get("status").map_err(|e| map_sqlx_err("decode", e))?;
        let attempts: i32 = row
            .try_get("attempt_count")
            .map_err(|e| map_sqlx_err("decode", e))?;
        let status = ActionStatus::parse(&status)
            .ok_or_else(|| Error::External(format!("unknown status {status} for {id}")))?;
        Ok((status, attempts.max(0) as u32))
    }
}

fn is_valid_schema_ident(schema: &str) -> bool {
    !schema.is_empty()
        && schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Postgres timestamps stop at 4713 BC; chrono goes further back.
fn pg_clamp(t: DateTime<Utc>) -> DateTime<Utc> {
    let floor = DateTime::<Utc>::from_timestamp(-210_866_760_000, 0)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    t.max(floor)
}

/// Connection-level trouble is an outage; constraint or syntax errors are not.
fn map_sqlx_err(context: &str, err: sqlx::Error) -> Error {
    let outage = match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| {
            // 08: connection exception, 53: insufficient resources,
            // 57P: operator intervention, 40001/40P01: serialization/deadlock.
            code.starts_with("08")
                || code.starts_with("53")
                || code.starts_with("57P")
                || code == "40001"
                || code == "40P01"
        }),
        _ => false,
    };
    if outage {
        Error::StoreUnavailable(format!("postgres {context}: {err}"))
    } else {
        Error::External(format!("postgres {context}: {err}"))
    }
}

fn row_to_action(row: &PgRow) -> Result<(i64, ScheduledAction)> {
    let decode = |e| map_sqlx_err("decode action", e);
    let status: String = row.try_get("status").map_err(decode)?;
    let status = ActionStatus::parse(&status)
        .ok_or_else(|| Error::External(format!("unknown status: {status}")))?;
    let attempts: i32 = row.try_get("attempt_count").map_err(decode)?;

    let action = ScheduledAction {
        id: ActionId(row.try_get::<Uuid, _>("id").map_err(decode)?),
        subject_id: SubjectId(row.try_get("subject_id").map_err(decode)?),
        kind: row.try_get("kind").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        scheduled_for: row.try_get("scheduled_for").map_err(decode)?,
        status,
        started_processing_at: row.try_get("started_processing_at").map_err(decode)?,
        attempt_count: attempts.max(0) as u32,
        last_error: row.try_get("last_error").map_err(decode)?,
        claimed_by: row.try_get("claimed_by").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    };
    Ok((row.try_get("seq").map_err(decode)?, action))
}

fn actions_from_rows(rows: &[PgRow]) -> Result<Vec<ScheduledAction>> {
    let mut out = rows
        .iter()
        .map(row_to_action)
        .collect::<Result<Vec<_>>>()?;
    out.sort_by(|(sa, a), (sb, b)| {
        a.scheduled_for
            .cmp(&b.scheduled_for)
            .then(a.created_at.cmp(&b.created_at))
            .then(sa.cmp(sb))
    });
    Ok(out.into_iter().map(|(_, a)| a).collect())
}

#[async_trait]
impl ActionStore for PostgresActionStore {
    async fn schedule(
        &self,
        subject: &SubjectId,
        kind: &str,
        payload: serde_json::Value,
        due_at: DateTime<Utc>,
    ) -> Result<ActionId> {
        let id = ActionId::new();
        let now = self.clock.now();
        sqlx::query(&format!(
            "INSERT INTO {} (id, subject_id, kind, payload, scheduled_for, status,
                             attempt_count, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $6)",
            self.table()
        ))
        .bind(id.0)
        .bind(subject.as_str())
        .bind(kind)
        .bind(&payload)
        .bind(due_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("insert action", e))?;
        Ok(id)
    }

    async fn cancel_pending(&self, subject: &SubjectId, kind: Option<&str>) -> Result<u64> {
        let done = sqlx::query(&format!(
            "UPDATE {} SET status = 'cancelled', updated_at = $1
             WHERE subject_id = $2 AND status = 'pending'
               AND ($3::text IS NULL OR kind = $3)",
            self.table()
        ))
        .bind(self.clock.now())
        .bind(subject.as_str())
        .bind(kind)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("cancel pending", e))?;
        Ok(done.rows_affected())
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
        let t = self.table();
        let rows = sqlx::query(&format!(
            "WITH next AS (
                SELECT id FROM {t}
                WHERE status = 'pending' AND scheduled_for <= $1
                ORDER BY scheduled_for, created_at, seq
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {t} a
            SET status = 'processing', started_processing_at = $3,
                claimed_by = $4, updated_at = $3
            FROM next
            WHERE a.id = next.id AND a.status = 'pending'
            RETURNING {}",
            COLUMNS
                .split(", ")
                .map(|c| format!("a.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(pg_clamp(claim_cutoff(now, preemptive_window)))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(now)
        .bind(self.worker_id.as_deref())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("claim due", e))?;

        let claimed = actions_from_rows(&rows)?;
        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed rows");
        }
        Ok(claimed)
    }

    async fn complete(&self, id: ActionId) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_err("begin complete tx", e))?;
        let (status, _) = self.lock_row(&mut tx, id).await?;
        let transition = check_completable(id, status)?;
        if transition {
            sqlx::query(&format!(
                "UPDATE {} SET status = 'executed', updated_at = $2
                 WHERE id = $1 AND status = 'processing'",
                self.table()
            ))
            .bind(id.0)
            .bind(self.clock.now())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_err("complete", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_err("commit complete tx", e))?;
        Ok(transition)
    }

    async fn fail(&self, id: ActionId, retryable: bool, reason: &str) -> Result<ActionStatus> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_err("begin fail tx", e))?;
        let (status, attempts) = self.lock_row(&mut tx, id).await?;
        if status != ActionStatus::Processing {
            return Err(Error::InvalidTransition {
                id,
                from: status,
                op: "fail",
            });
        }

        let next = match self.retry.decide(attempts, retryable, now) {
            FailDecision::Retry {
                attempt_count,
                not_before,
            } => {
                sqlx::query(&format!(
                    "UPDATE {} SET status = 'pending', attempt_count = $2, scheduled_for = $3,
                         started_processing_at = NULL, last_error = $4, updated_at = $5
                     WHERE id = $1 AND status = 'processing'",
                    self.table()
                ))
                .bind(id.0)
                .bind(i32::try_from(attempt_count).unwrap_or(i32::MAX))
                .bind(not_before)
                .bind(reason)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_err("fail (retry)", e))?;
                ActionStatus::Pending
            }
            FailDecision::GiveUp => {
                sqlx::query(&format!(
                    "UPDATE {} SET status = 'failed', last_error = $2, updated_at = $3
                     WHERE id = $1 AND status = 'processing'",
                    self.table()
                ))
                .bind(id.0)
                .bind(reason)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_err("fail (terminal)", e))?;
                ActionStatus::Failed
            }
        };
        tx.commit()
            .await
            .map_err(|e| map_sqlx_err("commit fail tx", e))?;
        Ok(next)
    }

    async fn reap_stale(&self, stale_after: Duration) -> Result<u64> {
        let now = self.clock.now();
        let done = sqlx::query(&format!(
            "UPDATE {} SET status = 'pending', started_processing_at = NULL, updated_at = $1
             WHERE status = 'processing' AND started_processing_at < $2",
            self.table()
        ))
        .bind(now)
        .bind(pg_clamp(stale_cutoff(now, stale_after)))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("reap stale", e))?;
        Ok(done.rows_affected())
    }

    async fn get(&self, id: ActionId) -> Result<Option<ScheduledAction>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE id = $1",
            self.table()
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("get action", e))?;
        row.as_ref()
            .map(|r| row_to_action(r).map(|(_, a)| a))
            .transpose()
    }

    async fn list(&self, filter: &ActionFilter) -> Result<Vec<ScheduledAction>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {}
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR subject_id = $2)
             ORDER BY scheduled_for, created_at, seq
             LIMIT $3",
            self.table()
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.subject_id.as_ref().map(|s| s.as_str()))
        .bind(filter.limit.map(|n| i64::try_from(n).unwrap_or(i64::MAX)))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("list actions", e))?;
        actions_from_rows(&rows)
    }

    async fn retry_failed(&self, id: ActionId, due_at: DateTime<Utc>) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_err("begin retry tx", e))?;
        let (status, _) = self.lock_row(&mut tx, id).await?;
        if status != ActionStatus::Failed {
            return Err(Error::InvalidTransition {
                id,
                from: status,
                op: "retry",
            });
        }
        sqlx::query(&format!(
            "UPDATE {} SET status = 'pending', attempt_count = 0, scheduled_for = $2,
                 started_processing_at = NULL, updated_at = $3
             WHERE id = $1 AND status = 'failed'",
            self.table()
        ))
        .bind(id.0)
        .bind(due_at)
        .bind(self.clock.now())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_err("retry failed", e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_err("commit retry tx", e))
    }

    async fn counts(&self) -> Result<StatusCounts> {
        let rows = sqlx::query(&format!(
            "SELECT status, COUNT(*) AS n FROM {} GROUP BY status",
            self.table()
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_err("count actions", e))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_err("decode", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_err("decode", e))?;
            if let Some(status) = ActionStatus::parse(&status) {
                counts.add(status, n.max(0) as u64);
            }
        }
        Ok(counts)
    }
}

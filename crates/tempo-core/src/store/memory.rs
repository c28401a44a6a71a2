//! In-process action store.
//!
//! One mutex guards the whole table, so every operation is trivially atomic and
//! concurrent claimers can never overlap. Useful for tests and single-process
//! deployments that accept losing pending actions on restart.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    clock::{Clock, SystemClock},
    domain::{ActionFilter, ActionId, ActionStatus, ScheduledAction, StatusCounts, SubjectId},
    errors::Error,
    retry::{FailDecision, RetryPolicy},
    Result,
};

use super::{check_completable, claim_cutoff, stale_cutoff, ActionStore};

struct Row {
    seq: u64,
    action: ScheduledAction,
}

#[derive(Default)]
struct Table {
    rows: HashMap<ActionId, Row>,
    next_seq: u64,
}

/// Cloning yields another handle onto the same table.
#[derive(Clone)]
pub struct MemoryActionStore {
    table: Arc<Mutex<Table>>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    worker_id: Option<String>,
}

impl Default for MemoryActionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryActionStore {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
            worker_id: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Recorded as `claimed_by` on actions this handle claims.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        // A panic while holding the lock cannot leave a row half-written: every
        // mutation below is a field assignment on an existing row.
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn sorted_by_due(mut rows: Vec<&Row>) -> Vec<&Row> {
    rows.sort_by(|a, b| {
        a.action
            .scheduled_for
            .cmp(&b.action.scheduled_for)
            .then(a.action.created_at.cmp(&b.action.created_at))
            .then(a.seq.cmp(&b.seq))
    });
    rows
}

#[async_trait]
impl ActionStore for MemoryActionStore {
    async fn schedule(
        &self,
        subject: &SubjectId,
        kind: &str,
        payload: serde_json::Value,
        due_at: DateTime<Utc>,
    ) -> Result<ActionId> {
        let now = self.clock.now();
        let id = ActionId::new();
        let mut table = self.lock();
        let seq = table.next_seq;
        table.next_seq += 1;
        table.rows.insert(
            id,
            Row {
                seq,
                action: ScheduledAction {
                    id,
                    subject_id: subject.clone(),
                    kind: kind.to_string(),
                    payload,
                    scheduled_for: due_at,
                    status: ActionStatus::Pending,
                    started_processing_at: None,
                    attempt_count: 0,
                    last_error: None,
                    claimed_by: None,
                    created_at: now,
                    updated_at: now,
                },
            },
        );
        Ok(id)
    }

    async fn cancel_pending(&self, subject: &SubjectId, kind: Option<&str>) -> Result<u64> {
        let now = self.clock.now();
        let mut table = self.lock();
        let mut cancelled = 0;
        for row in table.rows.values_mut() {
            let a = &mut row.action;
            if a.status != ActionStatus::Pending || &a.subject_id != subject {
                continue;
            }
            if kind.is_some_and(|k| a.kind != k) {
                continue;
            }
            a.status = ActionStatus::Cancelled;
            a.updated_at = now;
            cancelled += 1;
        }
        Ok(cancelled)
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
        let cutoff = claim_cutoff(now, preemptive_window);
        let mut table = self.lock();

        let due: Vec<ActionId> = sorted_by_due(
            table
                .rows
                .values()
                .filter(|r| {
                    r.action.status == ActionStatus::Pending && r.action.scheduled_for <= cutoff
                })
                .collect(),
        )
        .into_iter()
        .take(limit)
        .map(|r| r.action.id)
        .collect();

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(row) = table.rows.get_mut(&id) {
                let a = &mut row.action;
                a.status = ActionStatus::Processing;
                a.started_processing_at = Some(now);
                a.claimed_by = self.worker_id.clone();
                a.updated_at = now;
                claimed.push(a.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, id: ActionId) -> Result<bool> {
        let now = self.clock.now();
        let mut table = self.lock();
        let row = table.rows.get_mut(&id).ok_or(Error::NotFound { id })?;
        let transition = check_completable(id, row.action.status)?;
        if transition {
            row.action.status = ActionStatus::Executed;
            row.action.updated_at = now;
        }
        Ok(transition)
    }

    async fn fail(&self, id: ActionId, retryable: bool, reason: &str) -> Result<ActionStatus> {
        let now = self.clock.now();
        let mut table = self.lock();
        let row = table.rows.get_mut(&id).ok_or(Error::NotFound { id })?;
        let a = &mut row.action;
        if a.status != ActionStatus::Processing {
            return Err(Error::InvalidTransition {
                id,
                from: a.status,
                op: "fail",
            });
        }

        a.last_error = Some(reason.to_string());
        a.updated_at = now;
        match self.retry.decide(a.attempt_count, retryable, now) {
            FailDecision::Retry {
                attempt_count,
                not_before,
            } => {
                a.status = ActionStatus::Pending;
                a.attempt_count = attempt_count;
                a.scheduled_for = not_before;
                a.started_processing_at = None;
            }
            FailDecision::GiveUp => {
                a.status = ActionStatus::Failed;
            }
        }
        Ok(a.status)
    }

    async fn reap_stale(&self, stale_after: Duration) -> Result<u64> {
        let now = self.clock.now();
        let cutoff = stale_cutoff(now, stale_after);
        let mut table = self.lock();
        let mut reaped = 0;
        for row in table.rows.values_mut() {
            let a = &mut row.action;
            let stale = a.status == ActionStatus::Processing
                && a.started_processing_at.is_some_and(|t| t < cutoff);
            if stale {
                a.status = ActionStatus::Pending;
                a.started_processing_at = None;
                a.updated_at = now;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn get(&self, id: ActionId) -> Result<Option<ScheduledAction>> {
        Ok(self.lock().rows.get(&id).map(|r| r.action.clone()))
    }

    async fn list(&self, filter: &ActionFilter) -> Result<Vec<ScheduledAction>> {
        let table = self.lock();
        let rows = sorted_by_due(
            table
                .rows
                .values()
                .filter(|r| filter.matches(&r.action))
                .collect(),
        );
        Ok(rows
            .into_iter()
            .take(filter.limit.unwrap_or(usize::MAX))
            .map(|r| r.action.clone())
            .collect())
    }

    async fn retry_failed(&self, id: ActionId, due_at: DateTime<Utc>) -> Result<()> {
        let now = self.clock.now();
        let mut table = self.lock();
        let row = table.rows.get_mut(&id).ok_or(Error::NotFound { id })?;
        let a = &mut row.action;
        if a.status != ActionStatus::Failed {
            return Err(Error::InvalidTransition {
                id,
                from: a.status,
                op: "retry",
            });
        }
        a.status = ActionStatus::Pending;
        a.attempt_count = 0;
        a.scheduled_for = due_at;
        a.started_processing_at = None;
        a.updated_at = now;
        Ok(())
    }

    async fn counts(&self) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for row in self.lock().rows.values() {
            counts.add(row.action.status, 1);
        }
        Ok(counts)
    }
}

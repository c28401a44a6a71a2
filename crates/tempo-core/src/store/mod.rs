//! The action store port: the single source of truth for scheduled actions.
//!
//! Every mutation is one atomic, conditional operation. No transaction spans
//! two calls, so lock windows stay as small as a single statement.

#[cfg(any(test, feature = "testing"))]
pub mod contract;
pub mod memory;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    clock::{add_saturating, sub_saturating},
    domain::{ActionFilter, ActionId, ActionStatus, ScheduledAction, StatusCounts, SubjectId},
    errors::Error,
    Result,
};

pub use memory::MemoryActionStore;

/// Durable table of scheduled actions plus its claim protocol.
///
/// Implementations must guarantee that concurrent `claim_due` callers (in this
/// process or any other) receive disjoint sets of actions, and that a claim
/// never waits on rows another claimer holds.
#[async_trait]
pub trait ActionStore: Send + Sync {
    /// Insert a pending action. `due_at` may be in the past (run immediately).
    async fn schedule(
        &self,
        subject: &SubjectId,
        kind: &str,
        payload: serde_json::Value,
        due_at: DateTime<Utc>,
    ) -> Result<ActionId>;

    /// `pending -> cancelled` for the subject's actions (optionally one kind).
    /// Actions already claimed are left alone.
    async fn cancel_pending(&self, subject: &SubjectId, kind: Option<&str>) -> Result<u64>;

    /// Claim up to `limit` pending actions due at or before
    /// `now + preemptive_window`, earliest first, ties by insertion order.
    /// Claimed rows are `processing` with `started_processing_at = now`.
    async fn claim_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        preemptive_window: Duration,
    ) -> Result<Vec<ScheduledAction>>;

    /// `processing -> executed`. Returns `false` when the action was already
    /// executed (idempotent no-op).
    async fn complete(&self, id: ActionId) -> Result<bool>;

    /// Record a failed execution. Returns the resulting status: `pending` when
    /// the retry policy allows another attempt, `failed` otherwise.
    async fn fail(&self, id: ActionId, retryable: bool, reason: &str) -> Result<ActionStatus>;

    /// Reset actions stuck in `processing` for longer than `stale_after` back
    /// to `pending`, leaving `attempt_count` unchanged.
    async fn reap_stale(&self, stale_after: Duration) -> Result<u64>;

    async fn get(&self, id: ActionId) -> Result<Option<ScheduledAction>>;

    async fn list(&self, filter: &ActionFilter) -> Result<Vec<ScheduledAction>>;

    /// Operator retry: `failed -> pending` with a fresh attempt budget.
    async fn retry_failed(&self, id: ActionId, due_at: DateTime<Utc>) -> Result<()>;

    async fn counts(&self) -> Result<StatusCounts>;
}

#[async_trait]
impl<S: ActionStore + ?Sized> ActionStore for Arc<S> {
    async fn schedule(
        &self,
        subject: &SubjectId,
        kind: &str,
        payload: serde_json::Value,
        due_at: DateTime<Utc>,
    ) -> Result<ActionId> {
        (**self).schedule(subject, kind, payload, due_at).await
    }

    async fn cancel_pending(&self, subject: &SubjectId, kind: Option<&str>) -> Result<u64> {
        (**self).cancel_pending(subject, kind).await
    }

    async fn claim_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        preemptive_window: Duration,
    ) -> Result<Vec<ScheduledAction>> {
        (**self).claim_due(limit, now, preemptive_window).await
    }

    async fn complete(&self, id: ActionId) -> Result<bool> {
        (**self).complete(id).await
    }

    async fn fail(&self, id: ActionId, retryable: bool, reason: &str) -> Result<ActionStatus> {
        (**self).fail(id, retryable, reason).await
    }

    async fn reap_stale(&self, stale_after: Duration) -> Result<u64> {
        (**self).reap_stale(stale_after).await
    }

    async fn get(&self, id: ActionId) -> Result<Option<ScheduledAction>> {
        (**self).get(id).await
    }

    async fn list(&self, filter: &ActionFilter) -> Result<Vec<ScheduledAction>> {
        (**self).list(filter).await
    }

    async fn retry_failed(&self, id: ActionId, due_at: DateTime<Utc>) -> Result<()> {
        (**self).retry_failed(id, due_at).await
    }

    async fn counts(&self) -> Result<StatusCounts> {
        (**self).counts().await
    }
}

/// Latest `scheduled_for` a claim at `now` may pick up.
pub fn claim_cutoff(now: DateTime<Utc>, preemptive_window: Duration) -> DateTime<Utc> {
    add_saturating(now, preemptive_window)
}

/// Staleness threshold for `reap_stale` at `now`.
pub fn stale_cutoff(now: DateTime<Utc>, stale_after: Duration) -> DateTime<Utc> {
    sub_saturating(now, stale_after)
}

/// Error for `complete` on a row that is not processing/executed.
///
/// Shared by the stores so every backend reports a lost race the same way.
pub fn check_completable(id: ActionId, status: ActionStatus) -> Result<bool> {
    match status {
        ActionStatus::Processing => Ok(true),
        ActionStatus::Executed => Ok(false),
        from => Err(Error::InvalidTransition {
            id,
            from,
            op: "complete",
        }),
    }
}

//! Behavioural test-suite shared by every [`ActionStore`] implementation.
//!
//! Adapter crates enable the `testing` feature and run each function against
//! their own backend through a [`Harness`].

use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use crate::{
    clock::{Clock, ManualClock},
    domain::{ActionFilter, ActionId, ActionStatus, SubjectId},
    errors::Error,
    retry::RetryPolicy,
};

use super::ActionStore;

/// Several handles onto one empty backing store, all reading `clock`.
pub struct Fixture<S> {
    pub clock: Arc<ManualClock>,
    pub stores: Vec<S>,
}

#[async_trait]
pub trait Harness: Send + Sync {
    type Store: ActionStore + Clone + 'static;

    /// A fresh, empty store. Handle `i` must record `worker-{i}` as the
    /// claimant, the way separate worker processes would.
    async fn fixture(&self, handles: usize, retry: RetryPolicy) -> Fixture<Self::Store>;
}

pub fn test_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap(),
    ))
}

fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

async fn status_of<S: ActionStore>(store: &S, id: ActionId) -> ActionStatus {
    store.get(id).await.unwrap().expect("action exists").status
}

pub async fn concurrent_claims_are_disjoint<H: Harness>(h: &H) {
    for claimers in [1usize, 2, 8] {
        for actions in [0usize, 1, 50] {
            let fx = h.fixture(claimers, RetryPolicy::default()).await;
            let now = fx.clock.now();
            for i in 0..actions {
                fx.stores[0]
                    .schedule(
                        &SubjectId(format!("s{}", i % 7)),
                        "reply",
                        json!({ "n": i }),
                        now - secs(1),
                    )
                    .await
                    .unwrap();
            }

            let mut tasks = Vec::new();
            for (i, store) in fx.stores.iter().cloned().enumerate() {
                tasks.push(tokio::spawn(async move {
                    let mut mine = Vec::new();
                    loop {
                        let batch = store.claim_due(3, now, Duration::ZERO).await.unwrap();
                        if batch.is_empty() {
                            break;
                        }
                        for a in batch {
                            assert_eq!(a.status, ActionStatus::Processing);
                            assert_eq!(a.claimed_by.as_deref(), Some(format!("worker-{i}").as_str()));
                            mine.push(a.id);
                        }
                        tokio::task::yield_now().await;
                    }
                    mine
                }));
            }

            let mut all = Vec::new();
            for t in tasks {
                all.extend(t.await.unwrap());
            }
            let unique: HashSet<ActionId> = all.iter().copied().collect();
            assert_eq!(all.len(), actions, "claimers={claimers} actions={actions}");
            assert_eq!(unique.len(), actions, "an action was claimed twice");

            let counts = fx.stores[0].counts().await.unwrap();
            assert_eq!(counts.processing, actions as u64);
            assert_eq!(counts.pending, 0);
        }
    }
}

pub async fn claims_follow_due_time_then_insertion_order<H: Harness>(h: &H) {
    let fx = h.fixture(1, RetryPolicy::default()).await;
    let store = &fx.stores[0];
    let t = fx.clock.now();
    let subject = SubjectId::from("p1");

    let c = store.schedule(&subject, "k", json!(null), t + secs(3)).await.unwrap();
    let a = store.schedule(&subject, "k", json!(null), t + secs(1)).await.unwrap();
    let b1 = store.schedule(&subject, "k", json!(null), t + secs(2)).await.unwrap();
    let b2 = store.schedule(&subject, "k", json!(null), t + secs(2)).await.unwrap();

    let now = t + secs(5);
    let first: Vec<_> = store
        .claim_due(2, now, Duration::ZERO)
        .await
        .unwrap()
        .into_iter()
        .map(|x| x.id)
        .collect();
    assert_eq!(first, vec![a, b1]);

    let second: Vec<_> = store
        .claim_due(10, now, Duration::ZERO)
        .await
        .unwrap()
        .into_iter()
        .map(|x| x.id)
        .collect();
    assert_eq!(second, vec![b2, c]);
}

pub async fn preemptive_window_claims_slightly_early<H: Harness>(h: &H) {
    let fx = h.fixture(1, RetryPolicy::default()).await;
    let store = &fx.stores[0];
    let now = fx.clock.now();
    let subject = SubjectId::from("p1");

    let soon = store
        .schedule(&subject, "k", json!(1), now + chrono::Duration::milliseconds(400))
        .await
        .unwrap();
    let later = store
        .schedule(&subject, "k", json!(2), now + chrono::Duration::milliseconds(600))
        .await
        .unwrap();

    assert!(store.claim_due(10, now, Duration::ZERO).await.unwrap().is_empty());

    let claimed = store
        .claim_due(10, now, Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, soon);
    assert_eq!(claimed[0].started_processing_at, Some(now));
    assert_eq!(status_of(store, later).await, ActionStatus::Pending);
}

pub async fn cancel_pending_only_touches_unclaimed_rows<H: Harness>(h: &H) {
    let fx = h.fixture(1, RetryPolicy::default()).await;
    let store = &fx.stores[0];
    let now = fx.clock.now();
    let p1 = SubjectId::from("p1");
    let p2 = SubjectId::from("p2");

    let reminder = store.schedule(&p1, "reminder", json!({}), now + secs(60)).await.unwrap();
    let followup = store.schedule(&p1, "followup", json!({}), now + secs(60)).await.unwrap();
    let other = store.schedule(&p2, "reminder", json!({}), now + secs(60)).await.unwrap();

    assert_eq!(store.cancel_pending(&p1, Some("reminder")).await.unwrap(), 1);
    assert_eq!(status_of(store, reminder).await, ActionStatus::Cancelled);
    assert_eq!(status_of(store, followup).await, ActionStatus::Pending);
    assert_eq!(status_of(store, other).await, ActionStatus::Pending);

    assert_eq!(store.cancel_pending(&p1, None).await.unwrap(), 1);
    assert_eq!(status_of(store, followup).await, ActionStatus::Cancelled);
    // Terminal rows are not re-cancelled.
    assert_eq!(store.cancel_pending(&p1, None).await.unwrap(), 0);

    // A claimed action completes its lifecycle regardless of a later cancel.
    let p3 = SubjectId::from("p3");
    let running = store.schedule(&p3, "reply", json!({}), now).await.unwrap();
    let claimed = store.claim_due(10, now, Duration::ZERO).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, running);

    assert_eq!(store.cancel_pending(&p3, None).await.unwrap(), 0);
    assert_eq!(status_of(store, running).await, ActionStatus::Processing);
    assert!(store.complete(running).await.unwrap());
    assert_eq!(status_of(store, running).await, ActionStatus::Executed);

    // Cancelled rows are never claimed.
    fx.clock.advance(Duration::from_secs(120));
    let later = store.claim_due(10, fx.clock.now(), Duration::ZERO).await.unwrap();
    let ids: Vec<_> = later.iter().map(|a| a.id).collect();
    assert_eq!(ids, vec![other]);
}

pub async fn cancel_before_due_time_prevents_claim<H: Harness>(h: &H) {
    let fx = h.fixture(1, RetryPolicy::default()).await;
    let store = &fx.stores[0];
    let p1 = SubjectId::from("p1");

    store
        .schedule(&p1, "reminder", json!({ "text": "still there?" }), fx.clock.now() + secs(2))
        .await
        .unwrap();

    fx.clock.advance(Duration::from_secs(1));
    assert_eq!(store.cancel_pending(&p1, None).await.unwrap(), 1);

    fx.clock.advance(Duration::from_secs(1));
    let claimed = store.claim_due(10, fx.clock.now(), Duration::ZERO).await.unwrap();
    assert!(claimed.iter().all(|a| a.subject_id != p1));
}

pub async fn reap_stale_respects_threshold<H: Harness>(h: &H) {
    let retry = RetryPolicy {
        retry_delay: Duration::from_secs(1),
        ..RetryPolicy::default()
    };
    let fx = h.fixture(1, retry).await;
    let store = &fx.stores[0];
    let stale_after = Duration::from_secs(60);
    let subject = SubjectId::from("p1");
    let t0 = fx.clock.now();

    let old = store.schedule(&subject, "k", json!(null), t0).await.unwrap();
    // One ordinary retry first, so the reaper's effect on attempt_count shows.
    store.claim_due(1, t0, Duration::ZERO).await.unwrap();
    assert_eq!(store.fail(old, true, "flaky").await.unwrap(), ActionStatus::Pending);
    fx.clock.advance(Duration::from_secs(1));
    let t1 = fx.clock.now();
    let claimed = store.claim_due(1, t1, Duration::ZERO).await.unwrap();
    assert_eq!(claimed[0].id, old);

    fx.clock.advance(Duration::from_secs(90));
    let young = store.schedule(&subject, "k", json!(null), fx.clock.now()).await.unwrap();
    store.claim_due(1, fx.clock.now(), Duration::ZERO).await.unwrap();

    // old: processing for 2T; young: for 0.5T.
    fx.clock.set(t1 + secs(120));
    assert_eq!(store.reap_stale(stale_after).await.unwrap(), 1);

    let old_row = store.get(old).await.unwrap().unwrap();
    assert_eq!(old_row.status, ActionStatus::Pending);
    assert_eq!(old_row.attempt_count, 1);
    assert_eq!(old_row.started_processing_at, None);
    assert_eq!(status_of(store, young).await, ActionStatus::Processing);

    // Nothing left past the threshold.
    assert_eq!(store.reap_stale(stale_after).await.unwrap(), 0);

    // The reset action is claimable again.
    let reclaimed = store.claim_due(10, fx.clock.now(), Duration::ZERO).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, old);
}

pub async fn complete_is_idempotent<H: Harness>(h: &H) {
    let fx = h.fixture(1, RetryPolicy::default()).await;
    let store = &fx.stores[0];
    let now = fx.clock.now();
    let subject = SubjectId::from("p1");

    let id = store.schedule(&subject, "k", json!(null), now).await.unwrap();
    store.claim_due(1, now, Duration::ZERO).await.unwrap();

    assert!(store.complete(id).await.unwrap());
    let after_first = store.get(id).await.unwrap().unwrap();
    assert_eq!(after_first.status, ActionStatus::Executed);

    fx.clock.advance(Duration::from_secs(5));
    assert!(!store.complete(id).await.unwrap());
    let after_second = store.get(id).await.unwrap().unwrap();
    assert_eq!(after_second, after_first);

    // A worker that lost its claim to the reaper cannot complete.
    let lost = store.schedule(&subject, "k", json!(null), fx.clock.now()).await.unwrap();
    store.claim_due(1, fx.clock.now(), Duration::ZERO).await.unwrap();
    fx.clock.advance(Duration::from_secs(600));
    assert_eq!(store.reap_stale(Duration::from_secs(60)).await.unwrap(), 1);
    match store.complete(lost).await {
        Err(Error::InvalidTransition { from, .. }) => assert_eq!(from, ActionStatus::Pending),
        other => panic!("expected InvalidTransition, got {other:?}"),
    }
}

pub async fn retryable_failures_then_success_end_executed<H: Harness>(h: &H) {
    let retry = RetryPolicy {
        max_retries: 3,
        retry_delay: Duration::from_secs(10),
        ..RetryPolicy::default()
    };
    let fx = h.fixture(1, retry).await;
    let store = &fx.stores[0];
    let id = store
        .schedule(&SubjectId::from("p1"), "k", json!(null), fx.clock.now())
        .await
        .unwrap();

    for attempt in 0..2u32 {
        let claimed = store.claim_due(1, fx.clock.now(), Duration::ZERO).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt_count, attempt);
        assert_eq!(
            store.fail(id, true, "upstream 503").await.unwrap(),
            ActionStatus::Pending
        );

        // Not eligible again until the retry delay has passed.
        assert!(store
            .claim_due(1, fx.clock.now(), Duration::ZERO)
            .await
            .unwrap()
            .is_empty());
        fx.clock.advance(Duration::from_secs(10));
    }

    let claimed = store.claim_due(1, fx.clock.now(), Duration::ZERO).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert!(store.complete(id).await.unwrap());

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, ActionStatus::Executed);
    assert_eq!(row.attempt_count, 2);
    assert_eq!(row.last_error.as_deref(), Some("upstream 503"));
}

pub async fn exhausted_and_permanent_failures_are_terminal<H: Harness>(h: &H) {
    let retry = RetryPolicy {
        max_retries: 1,
        retry_delay: Duration::from_secs(1),
        ..RetryPolicy::default()
    };
    let fx = h.fixture(1, retry).await;
    let store = &fx.stores[0];
    let subject = SubjectId::from("p1");

    let flaky = store.schedule(&subject, "k", json!(null), fx.clock.now()).await.unwrap();
    store.claim_due(1, fx.clock.now(), Duration::ZERO).await.unwrap();
    assert_eq!(store.fail(flaky, true, "timeout").await.unwrap(), ActionStatus::Pending);
    fx.clock.advance(Duration::from_secs(1));
    store.claim_due(1, fx.clock.now(), Duration::ZERO).await.unwrap();
    assert_eq!(store.fail(flaky, true, "timeout").await.unwrap(), ActionStatus::Failed);

    let broken = store.schedule(&subject, "k", json!(null), fx.clock.now()).await.unwrap();
    store.claim_due(1, fx.clock.now(), Duration::ZERO).await.unwrap();
    assert_eq!(
        store.fail(broken, false, "bad payload").await.unwrap(),
        ActionStatus::Failed
    );

    // Terminal rows stay queryable and are never claimed.
    fx.clock.advance(Duration::from_secs(60));
    assert!(store
        .claim_due(10, fx.clock.now(), Duration::ZERO)
        .await
        .unwrap()
        .is_empty());
    let failed = store.list(&ActionFilter::status(ActionStatus::Failed)).await.unwrap();
    assert_eq!(failed.len(), 2);
    assert_eq!(store.counts().await.unwrap().failed, 2);

    // fail() outside processing is a lost race, not a silent overwrite.
    assert!(matches!(
        store.fail(broken, true, "again").await,
        Err(Error::InvalidTransition { .. })
    ));

    // Explicit operator retry is the only way out of `failed`.
    store.retry_failed(broken, fx.clock.now()).await.unwrap();
    let row = store.get(broken).await.unwrap().unwrap();
    assert_eq!(row.status, ActionStatus::Pending);
    assert_eq!(row.attempt_count, 0);
    assert!(matches!(
        store.retry_failed(broken, fx.clock.now()).await,
        Err(Error::InvalidTransition { .. })
    ));
    let claimed = store.claim_due(10, fx.clock.now(), Duration::ZERO).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, broken);
}

pub async fn lookups_and_unknown_ids<H: Harness>(h: &H) {
    let fx = h.fixture(1, RetryPolicy::default()).await;
    let store = &fx.stores[0];
    let due: DateTime<Utc> = fx.clock.now() + secs(30);
    let payload = json!({ "chat_id": 42, "text": "hello", "nested": [1, 2, 3] });

    let id = store
        .schedule(&SubjectId::from("chat-42"), "send_message", payload.clone(), due)
        .await
        .unwrap();
    store
        .schedule(&SubjectId::from("chat-7"), "send_message", json!(null), due)
        .await
        .unwrap();

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.kind, "send_message");
    assert_eq!(row.payload, payload);
    assert_eq!(row.scheduled_for, due);
    assert_eq!(row.status, ActionStatus::Pending);
    assert_eq!(row.attempt_count, 0);
    assert_eq!(row.created_at, fx.clock.now());

    let mine = store.list(&ActionFilter::subject("chat-42")).await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, id);
    let limited = store
        .list(&ActionFilter {
            limit: Some(1),
            ..ActionFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(store.counts().await.unwrap().pending, 2);

    let missing = ActionId::new();
    assert!(store.get(missing).await.unwrap().is_none());
    assert!(matches!(store.complete(missing).await, Err(Error::NotFound { .. })));
    assert!(matches!(
        store.fail(missing, true, "x").await,
        Err(Error::NotFound { .. })
    ));
    assert!(matches!(
        store.retry_failed(missing, due).await,
        Err(Error::NotFound { .. })
    ));
    // complete() on a pending row: never claimed, so nothing to complete.
    assert!(matches!(
        store.complete(id).await,
        Err(Error::InvalidTransition { .. })
    ));
}

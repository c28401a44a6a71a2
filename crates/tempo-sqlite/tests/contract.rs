//! Runs the shared store behaviour suite against SQLite. Each fixture opens
//! several stores on one database file, standing in for separate processes.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tempo_core::{
    retry::RetryPolicy,
    store::contract::{self, Fixture, Harness},
};
use tempo_sqlite::SqliteActionStore;

#[derive(Default)]
struct SqliteHarness {
    dirs: Mutex<Vec<TempDir>>,
}

#[async_trait]
impl Harness for SqliteHarness {
    type Store = SqliteActionStore;

    async fn fixture(&self, handles: usize, retry: RetryPolicy) -> Fixture<SqliteActionStore> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tempo.db");
        let clock = contract::test_clock();

        let stores = (0..handles.max(1))
            .map(|i| {
                SqliteActionStore::open(&path)
                    .unwrap()
                    .with_clock(clock.clone())
                    .with_retry_policy(retry.clone())
                    .with_worker_id(format!("worker-{i}"))
            })
            .collect();

        self.dirs.lock().unwrap().push(dir);
        Fixture { clock, stores }
    }
}

fn harness() -> Arc<SqliteHarness> {
    Arc::new(SqliteHarness::default())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_are_disjoint() {
    contract::concurrent_claims_are_disjoint(&*harness()).await;
}

#[tokio::test]
async fn claims_follow_due_time_then_insertion_order() {
    contract::claims_follow_due_time_then_insertion_order(&*harness()).await;
}

#[tokio::test]
async fn preemptive_window_claims_slightly_early() {
    contract::preemptive_window_claims_slightly_early(&*harness()).await;
}

#[tokio::test]
async fn cancel_pending_only_touches_unclaimed_rows() {
    contract::cancel_pending_only_touches_unclaimed_rows(&*harness()).await;
}

#[tokio::test]
async fn cancel_before_due_time_prevents_claim() {
    contract::cancel_before_due_time_prevents_claim(&*harness()).await;
}

#[tokio::test]
async fn reap_stale_respects_threshold() {
    contract::reap_stale_respects_threshold(&*harness()).await;
}

#[tokio::test]
async fn complete_is_idempotent() {
    contract::complete_is_idempotent(&*harness()).await;
}

#[tokio::test]
async fn retryable_failures_then_success_end_executed() {
    contract::retryable_failures_then_success_end_executed(&*harness()).await;
}

#[tokio::test]
async fn exhausted_and_permanent_failures_are_terminal() {
    contract::exhausted_and_permanent_failures_are_terminal(&*harness()).await;
}

#[tokio::test]
async fn lookups_and_unknown_ids() {
    contract::lookups_and_unknown_ids(&*harness()).await;
}

#[tokio::test]
async fn actions_survive_reopening_the_file() {
    use chrono::Utc;
    use serde_json::json;
    use tempo_core::{domain::SubjectId, store::ActionStore};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tempo.db");

    let id = {
        let store = SqliteActionStore::open(&path).unwrap();
        store
            .schedule(&SubjectId::from("p1"), "reply", json!({ "n": 1 }), Utc::now())
            .await
            .unwrap()
    };

    let store = SqliteActionStore::open(&path).unwrap();
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.payload, json!({ "n": 1 }));
}

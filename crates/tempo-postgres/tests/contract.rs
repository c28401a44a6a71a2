//! Shared store behaviour suite against a real Postgres. Skipped unless
//! `TEMPO_TEST_DATABASE_URL` points at a database the tests may write to.
//! Every fixture gets its own schema, dropped when the test finishes.

use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use tempo_core::{
    retry::RetryPolicy,
    store::contract::{self, Fixture, Harness},
};
use tempo_postgres::PostgresActionStore;
use uuid::Uuid;

struct PgHarness {
    url: String,
    schemas: Mutex<Vec<(sqlx::PgPool, String)>>,
}

impl PgHarness {
    fn from_env() -> Option<Self> {
        match std::env::var("TEMPO_TEST_DATABASE_URL") {
            Ok(url) if !url.trim().is_empty() => Some(Self {
                url,
                schemas: Mutex::new(Vec::new()),
            }),
            _ => {
                eprintln!("TEMPO_TEST_DATABASE_URL not set; skipping postgres store tests");
                None
            }
        }
    }

    async fn cleanup(self) {
        let schemas = std::mem::take(&mut *self.schemas.lock().unwrap());
        for (pool, schema) in schemas {
            sqlx::query(&format!("DROP SCHEMA IF EXISTS \"{schema}\" CASCADE"))
                .execute(&pool)
                .await
                .unwrap();
        }
    }
}

#[async_trait]
impl Harness for PgHarness {
    type Store = PostgresActionStore;

    async fn fixture(&self, handles: usize, retry: RetryPolicy) -> Fixture<PostgresActionStore> {
        let schema = format!("tempo_test_{}", Uuid::new_v4().simple());
        let clock = contract::test_clock();

        let mut stores = Vec::new();
        for i in 0..handles.max(1) {
            // A pool per handle, like separate worker processes.
            let pool = PgPoolOptions::new()
                .max_connections(2)
                .connect(&self.url)
                .await
                .unwrap();
            let store = PostgresActionStore::with_pool(pool)
                .with_schema(schema.clone())
                .unwrap()
                .with_clock(clock.clone())
                .with_retry_policy(retry.clone())
                .with_worker_id(format!("worker-{i}"));
            store.ensure_schema().await.unwrap();
            stores.push(store);
        }

        self.schemas
            .lock()
            .unwrap()
            .push((stores[0].pool().clone(), schema));
        Fixture { clock, stores }
    }
}

macro_rules! pg_contract {
    ($($name:ident),* $(,)?) => {$(
        #[tokio::test]
        async fn $name() {
            let Some(h) = PgHarness::from_env() else {
                return;
            };
            contract::$name(&h).await;
            h.cleanup().await;
        }
    )*};
}

pg_contract!(
    claims_follow_due_time_then_insertion_order,
    preemptive_window_claims_slightly_early,
    cancel_pending_only_touches_unclaimed_rows,
    cancel_before_due_time_prevents_claim,
    reap_stale_respects_threshold,
    complete_is_idempotent,
    retryable_failures_then_success_end_executed,
    exhausted_and_permanent_failures_are_terminal,
    lookups_and_unknown_ids,
);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_are_disjoint() {
    let Some(h) = PgHarness::from_env() else {
        return;
    };
    contract::concurrent_claims_are_disjoint(&h).await;
    h.cleanup().await;
}

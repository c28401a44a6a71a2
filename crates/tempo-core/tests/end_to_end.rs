use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use tempo_core::{
    debounce::{schedule_on_flush, DebounceBuffer, DebounceConfig},
    domain::{ActionFilter, ActionStatus, ScheduledAction, SubjectId},
    executor::FnExecutor,
    reaper::{Reaper, ReaperConfig},
    store::{ActionStore, MemoryActionStore},
    worker::{ClaimLoop, WorkerConfig},
};

fn worker_cfg() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(100),
        batch_size: 5,
        preemptive_window: Duration::ZERO,
        execution_timeout: Duration::from_secs(5),
        store_backoff_max: Duration::from_secs(1),
    }
}

#[tokio::test(start_paused = true)]
async fn burst_is_coalesced_scheduled_and_executed_once() {
    let store = MemoryActionStore::new();
    let delivered: Arc<Mutex<Vec<ScheduledAction>>> = Arc::default();

    let sink = delivered.clone();
    let exec = FnExecutor::new(move |a: ScheduledAction| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(a);
            Ok(())
        }
    });
    let worker = Arc::new(ClaimLoop::new(
        Arc::new(store.clone()),
        Arc::new(exec),
        worker_cfg(),
    ));
    let shutdown = CancellationToken::new();
    let handle = {
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };

    let buffer = DebounceBuffer::new(
        DebounceConfig {
            quiet_period: Duration::from_secs(3),
            max_wait_cap: None,
        },
        schedule_on_flush::<String>(Arc::new(store.clone()), "reply"),
    );
    let chat = SubjectId::from("chat-1");
    for text in ["hey", "are you", "there?"] {
        buffer.add_event(chat.clone(), text.to_string()).await;
        tokio::time::sleep(Duration::from_millis(700)).await;
    }

    tokio::time::sleep(Duration::from_secs(10)).await;
    shutdown.cancel();
    handle.await.unwrap();

    let delivered = delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].kind, "reply");
    assert_eq!(delivered[0].payload, json!(["hey", "are you", "there?"]));

    let rows = store.list(&ActionFilter::subject(chat)).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ActionStatus::Executed);
}

#[tokio::test]
async fn crashed_worker_claim_is_reaped_and_finished_by_another() {
    let store = MemoryActionStore::new();
    let id = store
        .schedule(&SubjectId::from("p1"), "reminder", json!({}), Utc::now())
        .await
        .unwrap();

    // A worker claims and then "crashes" without recording anything.
    let claimed = store.claim_due(10, Utc::now(), Duration::ZERO).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let reaper = Reaper::new(
        Arc::new(store.clone()),
        ReaperConfig {
            stale_after: Duration::from_millis(50),
            interval: Duration::from_secs(60),
        },
    );
    assert_eq!(reaper.reap_once().await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(reaper.reap_once().await.unwrap(), 1);

    let exec = FnExecutor::new(|_a: ScheduledAction| async move { Ok(()) });
    let survivor = ClaimLoop::new(Arc::new(store.clone()), Arc::new(exec), worker_cfg());
    assert_eq!(survivor.poll_once().await.unwrap(), 1);

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, ActionStatus::Executed);
    assert_eq!(row.attempt_count, 0);
}

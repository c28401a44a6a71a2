//! Per-subject coalescing buffer.
//!
//! Every `add_event` arms a fresh wake carrying a new generation. A wake only
//! flushes when its generation still matches the session's current one, so
//! armed timers are never cancelled: they go stale and do nothing. The optional
//! `max_wait_cap` wake is validated the same way against the burst it was armed
//! for.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use serde::Serialize;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, error, trace};

use crate::{domain::SubjectId, store::ActionStore};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebounceConfig {
    pub quiet_period: Duration,
    /// Longest a burst may keep buffering before it is flushed regardless of
    /// activity. `None` buffers for as long as events keep arriving.
    pub max_wait_cap: Option<Duration>,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_secs(3),
            max_wait_cap: None,
        }
    }
}

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type FlushFn<T> = Arc<dyn Fn(SubjectId, Vec<T>) -> BoxFuture + Send + Sync>;

struct Session<T> {
    generation: u64,
    /// Generation of the event that opened the burst; identifies it for the cap wake.
    burst: u64,
    items: Vec<T>,
    opened_at: Instant,
}

#[derive(Clone, Copy, Debug)]
enum Wake {
    Quiet(u64),
    Cap(u64),
}

pub struct DebounceBuffer<T> {
    cfg: DebounceConfig,
    on_flush: FlushFn<T>,
    next_generation: AtomicU64,
    sessions: Mutex<HashMap<SubjectId, Session<T>>>,
}

impl<T: Send + 'static> DebounceBuffer<T> {
    pub fn new(cfg: DebounceConfig, on_flush: FlushFn<T>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            on_flush,
            next_generation: AtomicU64::new(0),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_handler<F, Fut>(cfg: DebounceConfig, f: F) -> Arc<Self>
    where
        F: Fn(SubjectId, Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::new(
            cfg,
            Arc::new(move |subject: SubjectId, items: Vec<T>| -> BoxFuture {
                Box::pin(f(subject, items))
            }),
        )
    }

    /// Buffer `event` and restart the subject's quiet period. Returns the
    /// generation now owning the eventual flush.
    pub async fn add_event(self: &Arc<Self>, subject: SubjectId, event: T) -> u64 {
        let (generation, opened) = {
            let mut map = self.sessions.lock().await;
            // Taken under the lock so a subject's generation only moves forward.
            let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
            let session = map.entry(subject.clone()).or_insert_with(|| Session {
                generation,
                burst: generation,
                items: Vec::new(),
                opened_at: Instant::now(),
            });
            session.generation = generation;
            session.items.push(event);
            trace!(%subject, generation, buffered = session.items.len(), "event buffered");
            (generation, session.burst == generation)
        };

        self.spawn_wake(subject.clone(), Wake::Quiet(generation), self.cfg.quiet_period);
        if opened {
            if let Some(cap) = self.cfg.max_wait_cap {
                self.spawn_wake(subject, Wake::Cap(generation), cap);
            }
        }
        generation
    }

    fn spawn_wake(self: &Arc<Self>, subject: SubjectId, wake: Wake, after: Duration) {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            buffer.on_wake(subject, wake).await;
        });
    }

    async fn on_wake(&self, subject: SubjectId, wake: Wake) {
        let taken = {
            let mut map = self.sessions.lock().await;
            let current = match map.get(&subject) {
                Some(s) => match wake {
                    Wake::Quiet(g) => s.generation == g,
                    Wake::Cap(b) => s.burst == b,
                },
                None => false,
            };
            if current {
                map.remove(&subject)
            } else {
                None
            }
        };

        match taken {
            Some(session) => {
                debug!(
                    %subject,
                    items = session.items.len(),
                    waited_ms = session.opened_at.elapsed().as_millis() as u64,
                    forced = matches!(wake, Wake::Cap(_)),
                    "flushing burst"
                );
                (self.on_flush)(subject, session.items).await;
            }
            None => trace!(%subject, ?wake, "stale wake"),
        }
    }

    /// Flush the subject's buffer immediately. Any armed wake for it goes stale.
    pub async fn flush_now(&self, subject: &SubjectId) -> bool {
        let session = self.sessions.lock().await.remove(subject);
        match session {
            Some(s) => {
                (self.on_flush)(subject.clone(), s.items).await;
                true
            }
            None => false,
        }
    }

    /// Drop the subject's buffered events without flushing.
    pub async fn discard(&self, subject: &SubjectId) -> usize {
        self.sessions
            .lock()
            .await
            .remove(subject)
            .map(|s| s.items.len())
            .unwrap_or(0)
    }

    pub async fn pending_subjects(&self) -> Vec<SubjectId> {
        let mut out: Vec<_> = self.sessions.lock().await.keys().cloned().collect();
        out.sort();
        out
    }

    pub async fn buffered_len(&self, subject: &SubjectId) -> usize {
        self.sessions
            .lock()
            .await
            .get(subject)
            .map(|s| s.items.len())
            .unwrap_or(0)
    }
}

/// Flush handler that turns each burst into one immediately-due action whose
/// payload is the JSON array of buffered items.
pub fn schedule_on_flush<T>(store: Arc<dyn ActionStore>, kind: impl Into<String>) -> FlushFn<T>
where
    T: Serialize + Send + 'static,
{
    let kind: Arc<str> = Arc::from(kind.into());
    Arc::new(move |subject: SubjectId, items: Vec<T>| -> BoxFuture {
        let store = store.clone();
        let kind = kind.clone();
        Box::pin(async move {
            let payload = match serde_json::to_value(&items) {
                Ok(v) => v,
                Err(e) => {
                    error!(%subject, error = %e, "could not encode burst; dropped");
                    return;
                }
            };
            match store.schedule(&subject, &kind, payload, Utc::now()).await {
                Ok(id) => debug!(%subject, %id, kind = %kind, "burst scheduled"),
                Err(e) => error!(%subject, error = %e, "could not schedule burst"),
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{ActionFilter, ActionStatus},
        store::MemoryActionStore,
    };
    use serde_json::json;
    use tokio::time::sleep;

    type Flushes<T> = Arc<std::sync::Mutex<Vec<(SubjectId, Vec<T>, Instant)>>>;

    fn recording<T: Send + 'static>(cfg: DebounceConfig) -> (Arc<DebounceBuffer<T>>, Flushes<T>) {
        let flushes: Flushes<T> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = flushes.clone();
        let buffer = DebounceBuffer::with_handler(cfg, move |subject, items| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push((subject, items, Instant::now()));
            }
        });
        (buffer, flushes)
    }

    fn quiet(secs: u64) -> DebounceConfig {
        DebounceConfig {
            quiet_period: Duration::from_secs(secs),
            max_wait_cap: None,
        }
    }

    fn near(actual: Duration, expected: Duration) -> bool {
        let slack = Duration::from_millis(20);
        actual + slack >= expected && actual <= expected + slack
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_five_flushes_once_after_last_event() {
        let (buffer, flushes) = recording::<u32>(quiet(3));
        let subject = SubjectId::from("conv-1");
        let start = Instant::now();

        for i in 1..=5 {
            buffer.add_event(subject.clone(), i).await;
            if i < 5 {
                sleep(Duration::from_secs(1)).await;
            }
        }
        sleep(Duration::from_secs(10)).await;

        let flushes = flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        let (who, items, at) = &flushes[0];
        assert_eq!(who, &subject);
        assert_eq!(items, &vec![1, 2, 3, 4, 5]);
        assert!(near(*at - start, Duration::from_secs(7)), "flushed at {:?}", *at - start);
    }

    #[tokio::test(start_paused = true)]
    async fn lone_event_flushes_once_after_quiet_period() {
        let (buffer, flushes) = recording::<&'static str>(quiet(3));
        let start = Instant::now();
        buffer.add_event(SubjectId::from("conv-1"), "hi").await;

        sleep(Duration::from_secs(30)).await;

        let flushes = flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].1, vec!["hi"]);
        assert!(near(flushes[0].2 - start, Duration::from_secs(3)));
        assert!(buffer.sessions.try_lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cap_forces_flush_without_double_firing() {
        let (buffer, flushes) = recording::<u32>(DebounceConfig {
            quiet_period: Duration::from_secs(3),
            max_wait_cap: Some(Duration::from_millis(4500)),
        });
        let subject = SubjectId::from("chatty");
        let start = Instant::now();

        for i in 0..10 {
            buffer.add_event(subject.clone(), i).await;
            sleep(Duration::from_secs(1)).await;
        }
        sleep(Duration::from_secs(20)).await;

        let flushes = flushes.lock().unwrap();
        let batches: Vec<_> = flushes.iter().map(|(_, items, _)| items.clone()).collect();
        assert_eq!(batches, vec![vec![0, 1, 2, 3, 4], vec![5, 6, 7, 8, 9]]);
        assert!(near(flushes[0].2 - start, Duration::from_millis(4500)));
        assert!(near(flushes[1].2 - start, Duration::from_millis(9500)));
    }

    #[tokio::test(start_paused = true)]
    async fn cap_from_flushed_burst_ignores_next_burst() {
        let (buffer, flushes) = recording::<u32>(DebounceConfig {
            quiet_period: Duration::from_secs(1),
            max_wait_cap: Some(Duration::from_secs(5)),
        });
        let subject = SubjectId::from("conv-1");
        let start = Instant::now();

        // First burst flushes on quiet at 1s; its cap stays armed for 5s.
        buffer.add_event(subject.clone(), 1).await;
        sleep(Duration::from_secs(3)).await;

        // Second burst spans the old cap deadline.
        for i in 2..=5 {
            buffer.add_event(subject.clone(), i).await;
            if i < 5 {
                sleep(Duration::from_millis(800)).await;
            }
        }
        sleep(Duration::from_secs(10)).await;

        let flushes = flushes.lock().unwrap();
        let batches: Vec<_> = flushes.iter().map(|(_, items, _)| items.clone()).collect();
        assert_eq!(batches, vec![vec![1], vec![2, 3, 4, 5]]);
        assert!(near(flushes[0].2 - start, Duration::from_secs(1)));
        assert!(
            near(flushes[1].2 - start, Duration::from_millis(6400)),
            "second burst flushed at {:?}",
            flushes[1].2 - start
        );
    }

    #[tokio::test(start_paused = true)]
    async fn generations_increase_across_concurrent_adds() {
        let (buffer, _flushes) = recording::<u32>(quiet(60));
        let subject = SubjectId::from("busy");

        let mut tasks = Vec::new();
        for i in 0..32 {
            let buffer = buffer.clone();
            let subject = subject.clone();
            tasks.push(tokio::spawn(async move { buffer.add_event(subject, i).await }));
        }
        let mut issued = Vec::new();
        for task in tasks {
            issued.push(task.await.unwrap());
        }

        let map = buffer.sessions.try_lock().unwrap();
        let session = &map[&subject];
        assert_eq!(session.items.len(), 32);
        assert_eq!(session.generation, *issued.iter().max().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn subjects_are_coalesced_independently() {
        let (buffer, flushes) = recording::<u32>(quiet(2));
        let a = SubjectId::from("a");
        let b = SubjectId::from("b");

        buffer.add_event(a.clone(), 1).await;
        buffer.add_event(b.clone(), 10).await;
        sleep(Duration::from_secs(1)).await;
        buffer.add_event(a.clone(), 2).await;
        assert_eq!(buffer.pending_subjects().await, vec![a.clone(), b.clone()]);
        assert_eq!(buffer.buffered_len(&a).await, 2);

        sleep(Duration::from_secs(5)).await;

        let mut got: Vec<_> = flushes
            .lock()
            .unwrap()
            .iter()
            .map(|(s, items, _)| (s.clone(), items.clone()))
            .collect();
        got.sort();
        assert_eq!(got, vec![(a, vec![1, 2]), (b, vec![10])]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_now_and_discard_leave_armed_wakes_stale() {
        let (buffer, flushes) = recording::<u32>(quiet(3));
        let s = SubjectId::from("s");

        buffer.add_event(s.clone(), 1).await;
        buffer.add_event(s.clone(), 2).await;
        assert!(buffer.flush_now(&s).await);
        assert!(!buffer.flush_now(&s).await);

        buffer.add_event(s.clone(), 3).await;
        assert_eq!(buffer.discard(&s).await, 1);
        assert_eq!(buffer.discard(&s).await, 0);

        sleep(Duration::from_secs(10)).await;

        let flushes = flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].1, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn session_recreated_after_flush_gets_fresh_generation() {
        let (buffer, flushes) = recording::<u32>(quiet(3));
        let s = SubjectId::from("s");

        let g1 = buffer.add_event(s.clone(), 1).await;
        sleep(Duration::from_secs(4)).await;
        let g2 = buffer.add_event(s.clone(), 2).await;
        assert!(g2 > g1);
        sleep(Duration::from_secs(4)).await;

        let batches: Vec<_> = flushes.lock().unwrap().iter().map(|f| f.1.clone()).collect();
        assert_eq!(batches, vec![vec![1], vec![2]]);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_on_flush_turns_burst_into_one_action() {
        let store = MemoryActionStore::new();
        let buffer = DebounceBuffer::new(
            quiet(3),
            schedule_on_flush::<String>(Arc::new(store.clone()), "reply"),
        );
        let subject = SubjectId::from("p1");

        buffer.add_event(subject.clone(), "hi".to_string()).await;
        sleep(Duration::from_millis(500)).await;
        buffer.add_event(subject.clone(), "there".to_string()).await;
        sleep(Duration::from_secs(5)).await;

        let rows = store.list(&ActionFilter::subject(subject)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, "reply");
        assert_eq!(rows[0].status, ActionStatus::Pending);
        assert_eq!(rows[0].payload, json!(["hi", "there"]));
    }
}

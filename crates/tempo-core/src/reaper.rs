//! Stale-claim reaper.
//!
//! A worker that dies between claiming and recording an outcome leaves its
//! actions in `processing` forever. The reaper periodically returns any claim
//! older than `stale_after` to `pending` so another worker can pick it up.
//! Running it on several hosts at once is harmless: each reset is a
//! conditional update on `processing`.

use std::{sync::Arc, time::Duration};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{clock::Backoff, store::ActionStore, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Must exceed the longest legitimate execution, or live work gets reaped
    /// and runs twice.
    pub stale_after: Duration,
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(300),
            interval: Duration::from_secs(60),
        }
    }
}

pub struct Reaper {
    store: Arc<dyn ActionStore>,
    cfg: ReaperConfig,
}

impl Reaper {
    pub fn new(store: Arc<dyn ActionStore>, cfg: ReaperConfig) -> Self {
        Self { store, cfg }
    }

    /// One pass. Returns how many claims were reset.
    pub async fn reap_once(&self) -> Result<u64> {
        let n = self.store.reap_stale(self.cfg.stale_after).await?;
        if n > 0 {
            warn!(
                count = n,
                stale_after_ms = self.cfg.stale_after.as_millis() as u64,
                "reset stale claims to pending"
            );
        } else {
            debug!("no stale claims");
        }
        Ok(n)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.cfg.interval.as_millis() as u64,
            stale_after_ms = self.cfg.stale_after.as_millis() as u64,
            "reaper started"
        );
        let mut backoff = Backoff::new(self.cfg.interval, self.cfg.interval * 4);

        loop {
            let wait = match self.reap_once().await {
                Ok(_) => {
                    backoff.reset();
                    self.cfg.interval
                }
                Err(e) => {
                    let wait = backoff.next_delay();
                    warn!(error = %e, retry_in_ms = wait.as_millis() as u64, "reap failed");
                    wait
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(wait) => {}
            }
        }
        info!("reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::{Clock, ManualClock},
        domain::{ActionStatus, SubjectId},
        store::MemoryActionStore,
    };
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn reap_once_recovers_only_stale_claims() {
        let clock = clock();
        let store = MemoryActionStore::new().with_clock(clock.clone());
        let subject = SubjectId::from("p1");
        let now = clock.now();

        let old = store.schedule(&subject, "k", json!(1), now).await.unwrap();
        store.claim_due(1, now, Duration::ZERO).await.unwrap();

        clock.advance(Duration::from_secs(240));
        let fresh = store.schedule(&subject, "k", json!(2), clock.now()).await.unwrap();
        store.claim_due(1, clock.now(), Duration::ZERO).await.unwrap();

        clock.advance(Duration::from_secs(120));
        let reaper = Reaper::new(
            Arc::new(store.clone()),
            ReaperConfig {
                stale_after: Duration::from_secs(300),
                interval: Duration::from_secs(60),
            },
        );
        assert_eq!(reaper.reap_once().await.unwrap(), 1);
        assert_eq!(reaper.reap_once().await.unwrap(), 0);

        let old_row = store.get(old).await.unwrap().unwrap();
        assert_eq!(old_row.status, ActionStatus::Pending);
        assert_eq!(old_row.started_processing_at, None);
        let fresh_row = store.get(fresh).await.unwrap().unwrap();
        assert_eq!(fresh_row.status, ActionStatus::Processing);
    }

    #[tokio::test(start_paused = true)]
    async fn run_reaps_on_interval_until_cancelled() {
        let clock = clock();
        let store = MemoryActionStore::new().with_clock(clock.clone());
        let now = clock.now();
        let id = store
            .schedule(&SubjectId::from("p1"), "k", json!(null), now)
            .await
            .unwrap();
        store.claim_due(1, now, Duration::ZERO).await.unwrap();
        clock.advance(Duration::from_secs(600));

        let reaper = Arc::new(Reaper::new(
            Arc::new(store.clone()),
            ReaperConfig {
                stale_after: Duration::from_secs(300),
                interval: Duration::from_secs(1),
            },
        ));
        let shutdown = CancellationToken::new();
        let handle = {
            let reaper = reaper.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { reaper.run(shutdown).await })
        };

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            ActionStatus::Pending
        );

        shutdown.cancel();
        handle.await.unwrap();
    }
}

//! Claim loop: `Idle -> Polling -> Executing(batch) -> Sleeping -> Polling`.
//!
//! Any number of loops (threads, processes, hosts) may run against the same
//! store; disjoint claims are the store's job, so no leader election is needed.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{sync::watch, task::JoinSet, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    clock::{Backoff, Clock, SystemClock},
    domain::{ActionStatus, ScheduledAction},
    errors::ExecutionError,
    executor::ActionExecutor,
    store::ActionStore,
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub preemptive_window: Duration,
    /// Upper bound for one execution; exceeding it counts as a transient failure.
    pub execution_timeout: Duration,
    /// Cap for the backoff applied while the store is unreachable.
    pub store_backoff_max: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            preemptive_window: Duration::from_millis(500),
            execution_timeout: Duration::from_secs(120),
            store_backoff_max: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Polling,
    Executing { batch: usize },
    Sleeping,
    Stopping,
    Stopped,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub polls: u64,
    pub claimed: u64,
    pub executed: u64,
    pub retried: u64,
    pub failed: u64,
    /// Executions whose outcome could not be recorded (claim lost to the
    /// reaper, or the store went away). The reaper recovers these.
    pub unrecorded: u64,
    pub store_errors: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Executed,
    Retried,
    Failed,
    Unrecorded,
}

pub struct ClaimLoop {
    store: Arc<dyn ActionStore>,
    executor: Arc<dyn ActionExecutor>,
    cfg: WorkerConfig,
    clock: Arc<dyn Clock>,
    state: watch::Sender<LoopState>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl ClaimLoop {
    pub fn new(
        store: Arc<dyn ActionStore>,
        executor: Arc<dyn ActionExecutor>,
        cfg: WorkerConfig,
    ) -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            store,
            executor,
            cfg,
            clock: Arc::new(SystemClock),
            state,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    /// Time source for the `now` passed to `claim_due`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> WorkerStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Once `Stopping` is published only `Stopped` may replace it.
    fn set_state(&self, s: LoopState) {
        self.state.send_if_modified(|cur| {
            if *cur == s || (*cur == LoopState::Stopping && s != LoopState::Stopped) {
                return false;
            }
            *cur = s;
            true
        });
    }

    fn bump(&self, f: impl FnOnce(&mut WorkerStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut *stats);
    }

    /// Run until `shutdown` fires. A batch that is executing when the signal
    /// arrives is allowed to finish (each action bounded by the execution
    /// timeout) before the loop exits.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            poll_ms = self.cfg.poll_interval.as_millis() as u64,
            batch = self.cfg.batch_size,
            "claim loop started"
        );
        let mut backoff = Backoff::new(self.cfg.poll_interval, self.cfg.store_backoff_max);

        while !shutdown.is_cancelled() {
            let polled = {
                let poll = self.poll_once();
                tokio::pin!(poll);
                tokio::select! {
                    r = &mut poll => r,
                    _ = shutdown.cancelled() => {
                        self.set_state(LoopState::Stopping);
                        info!("shutdown requested; finishing in-flight batch");
                        poll.await
                    }
                }
            };
            let wait = match polled {
                Ok(_) => {
                    backoff.reset();
                    self.cfg.poll_interval
                }
                Err(e) => {
                    self.bump(|s| s.store_errors += 1);
                    let wait = backoff.next_delay();
                    warn!(
                        error = %e,
                        retry_in_ms = wait.as_millis() as u64,
                        failures = backoff.failures(),
                        "claim failed; backing off"
                    );
                    wait
                }
            };

            if shutdown.is_cancelled() {
                break;
            }
            self.set_state(LoopState::Sleeping);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(wait) => {}
            }
        }

        self.set_state(LoopState::Stopping);
        let stats = self.stats();
        info!(
            executed = stats.executed,
            retried = stats.retried,
            failed = stats.failed,
            "claim loop stopped"
        );
        self.set_state(LoopState::Stopped);
    }

    /// One Polling -> Executing cycle. Returns the number of claimed actions.
    ///
    /// Only the claim itself can fail; execution errors are recorded per
    /// action and never abort the batch.
    pub async fn poll_once(&self) -> Result<usize> {
        self.set_state(LoopState::Polling);
        let now = self.clock.now();
        let batch = match self
            .store
            .claim_due(self.cfg.batch_size, now, self.cfg.preemptive_window)
            .await
        {
            Ok(b) => b,
            Err(e) => {
                self.set_state(LoopState::Idle);
                return Err(e);
            }
        };
        self.bump(|s| s.polls += 1);

        if batch.is_empty() {
            debug!("no due actions");
            self.set_state(LoopState::Idle);
            return Ok(0);
        }

        let n = batch.len();
        self.bump(|s| s.claimed += n as u64);
        info!(count = n, "claimed due actions");
        self.set_state(LoopState::Executing { batch: n });

        let mut tasks = JoinSet::new();
        for action in batch {
            tasks.spawn(execute_one(
                self.store.clone(),
                self.executor.clone(),
                action,
                self.cfg.execution_timeout,
            ));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Outcome::Executed) => self.bump(|s| s.executed += 1),
                Ok(Outcome::Retried) => self.bump(|s| s.retried += 1),
                Ok(Outcome::Failed) => self.bump(|s| s.failed += 1),
                Ok(Outcome::Unrecorded) => self.bump(|s| s.unrecorded += 1),
                Err(e) => {
                    error!(error = %e, "action task aborted");
                    self.bump(|s| s.unrecorded += 1);
                }
            }
        }

        self.set_state(LoopState::Idle);
        Ok(n)
    }
}

async fn execute_one(
    store: Arc<dyn ActionStore>,
    executor: Arc<dyn ActionExecutor>,
    action: ScheduledAction,
    timeout: Duration,
) -> Outcome {
    let id = action.id;
    let subject = action.subject_id.clone();
    let kind = action.kind.clone();
    let attempt = action.attempt_count;

    // Own task so a panicking executor is contained to this action.
    let mut handle = tokio::spawn(async move { executor.execute(&action).await });
    let result = match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(r)) => r,
        Ok(Err(join_err)) => Err(ExecutionError::Transient(format!(
            "executor panicked: {join_err}"
        ))),
        Err(_) => {
            handle.abort();
            Err(ExecutionError::Transient(format!(
                "execution timed out after {}ms",
                timeout.as_millis()
            )))
        }
    };

    match result {
        Ok(()) => match store.complete(id).await {
            Ok(_) => {
                debug!(%id, %subject, %kind, "action executed");
                Outcome::Executed
            }
            Err(e) => {
                warn!(%id, %subject, %kind, error = %e, "executed but could not record completion");
                Outcome::Unrecorded
            }
        },
        Err(err) => match store.fail(id, err.is_retryable(), err.reason()).await {
            Ok(ActionStatus::Pending) => {
                warn!(%id, %subject, %kind, attempt, error = %err, "action failed; will retry");
                Outcome::Retried
            }
            Ok(_) => {
                error!(%id, %subject, %kind, attempt, error = %err, "action failed permanently");
                Outcome::Failed
            }
            Err(e) => {
                warn!(%id, %subject, %kind, error = %e, "could not record failure");
                Outcome::Unrecorded
            }
        },
    }
}

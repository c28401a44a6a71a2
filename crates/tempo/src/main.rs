use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tempo_core::{config::Config, reaper::Reaper, worker::ClaimLoop};
use tempo_webhook::{delivery_timeout, WebhookExecutor};

mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tempo_core::logging::init("tempo")?;

    let cfg = Config::load().context("loading configuration")?;
    let webhook_url = cfg
        .webhook_url
        .clone()
        .context("TEMPO_WEBHOOK_URL is required")?;

    let store = store::open(&cfg).await?;
    let executor = Arc::new(WebhookExecutor::new(
        webhook_url,
        delivery_timeout(cfg.execution_timeout),
    )?);

    let worker = Arc::new(ClaimLoop::new(store.clone(), executor, cfg.worker()));
    let reaper = Arc::new(Reaper::new(store.clone(), cfg.reaper()));
    let shutdown = CancellationToken::new();

    info!(worker_id = %cfg.worker_id, store = %store::describe(&cfg.database_url), "tempo worker starting");

    let worker_task = {
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };
    let reaper_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { reaper.run(shutdown).await })
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested; draining in-flight actions"),
        Err(e) => error!(error = %e, "could not listen for ctrl-c; shutting down"),
    }
    shutdown.cancel();

    worker_task.await.context("claim loop task")?;
    reaper_task.await.context("reaper task")?;

    let stats = worker.stats();
    info!(
        claimed = stats.claimed,
        executed = stats.executed,
        retried = stats.retried,
        failed = stats.failed,
        "tempo worker stopped"
    );
    Ok(())
}

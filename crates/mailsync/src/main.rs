//! `mailsync` - mail sync daemon
//!
//! Usage: `mailsync [CONFIG_PATH]`. Without a path the configuration is read
//! from the user's configuration directory.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use mailsync_core::{
    Clock, FsObjectStore, IdleSweep, ImapConnector, MailClient, PeriodicTrigger, RetryEngine,
    Scheduler, SessionPool, SmtpSubmitter, StuckClaimCleanup, Store, SyncConfig, SyncWorker,
    SystemClock, spawn_recurring,
};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailsync=info,mailsync_core=info,mailsync_imap=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = std::env::args_os()
        .nth(1)
        .map_or_else(SyncConfig::default_path, PathBuf::from);
    let config = SyncConfig::load(&path)
        .await
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    config.validate().context("invalid configuration")?;

    info!(
        config = %path.display(),
        database = %config.database_path.display(),
        node = ?config.node,
        max_workers = config.max_concurrent_workers,
        "starting mailsync"
    );

    let store = Store::new(&config.database_path)
        .await
        .context("opening the database")?;
    for seed in &config.accounts {
        match store.upsert_account(seed).await {
            Ok(id) => info!(account = %id, address = %seed.address, "account configured"),
            Err(e) => warn!(address = %seed.address, error = %e, "account skipped"),
        }
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let connector = ImapConnector::new(
        config.mailbox.clone(),
        config.connect_timeout(),
        config.io_timeout(),
    );
    let pool = Arc::new(SessionPool::new(
        Arc::new(connector),
        Arc::clone(&clock),
        config.pool_settings(),
    ));
    let client = MailClient::new(
        RetryEngine::new(Arc::clone(&pool)),
        Arc::new(SmtpSubmitter::new(config.connect_timeout(), config.io_timeout())),
        Arc::clone(&clock),
    );
    let worker = SyncWorker::new(
        store.clone(),
        Arc::new(client),
        Arc::new(FsObjectStore::new(config.object_store_dir.clone())),
        Arc::clone(&clock),
        config.worker_settings(),
    );
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(worker),
        Arc::clone(&clock),
        config.scheduler_settings(),
    );

    let (stop_jobs, jobs_rx) = watch::channel(false);
    let jobs = vec![
        spawn_recurring(
            PeriodicTrigger::new(scheduler.clone(), config.sync_request()),
            config.trigger_interval(),
            jobs_rx.clone(),
        ),
        spawn_recurring(
            IdleSweep::new(Arc::clone(&pool)),
            config.sweep_interval(),
            jobs_rx.clone(),
        ),
        spawn_recurring(
            StuckClaimCleanup::new(store.clone(), Arc::clone(&clock), config.stuck_claim_age()),
            config.sweep_interval(),
            jobs_rx,
        ),
    ];

    tokio::signal::ctrl_c()
        .await
        .context("listening for Ctrl-C")?;
    info!("shutdown requested");

    stop_jobs.send_replace(true);
    for job in jobs {
        if let Err(e) = job.await {
            warn!(error = %e, "job ended abnormally");
        }
    }

    scheduler.shutdown();
    if !scheduler.wait_idle(config.safety_margin()).await {
        warn!(running = scheduler.running(), "workers still running at exit");
    }
    pool.close_all().await;
    store.close().await;

    info!("mailsync stopped");
    Ok(())
}

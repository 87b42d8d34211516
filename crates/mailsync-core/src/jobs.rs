//! Recurring background jobs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::Result;
use crate::clock::Clock;
use crate::pool::SessionPool;
use crate::scheduler::{Scheduler, SyncRequest};
use crate::store::Store;

/// Work repeated on a fixed cadence.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Runs once.
    async fn tick(&self) -> Result<()>;
}

/// Runs `job` every `every` until `shutdown` turns true. The first tick
/// happens immediately; ticks missed while a slow tick runs are skipped.
pub fn spawn_recurring<J: Job>(
    job: J,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(job = job.name(), every = ?every, "job started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
            if let Err(e) = job.tick().await {
                warn!(job = job.name(), error = %e, "job tick failed");
            }
        }
        debug!(job = job.name(), "job stopped");
    })
}

/// Triggers a sync pass on every tick.
pub struct PeriodicTrigger {
    scheduler: Scheduler,
    request: SyncRequest,
}

impl PeriodicTrigger {
    /// Creates the job.
    #[must_use]
    pub const fn new(scheduler: Scheduler, request: SyncRequest) -> Self {
        Self { scheduler, request }
    }
}

#[async_trait]
impl Job for PeriodicTrigger {
    fn name(&self) -> &'static str {
        "periodic-trigger"
    }

    async fn tick(&self) -> Result<()> {
        // The run finishes in the background and logs its own summary.
        let (ack, _run) = self.scheduler.trigger(self.request).await?;
        debug!(accepted = ack.accepted, running = ack.running, "sync triggered");
        Ok(())
    }
}

/// Closes pooled sessions that sat unused too long.
pub struct IdleSweep {
    pool: Arc<SessionPool>,
}

impl IdleSweep {
    /// Creates the job.
    #[must_use]
    pub const fn new(pool: Arc<SessionPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Job for IdleSweep {
    fn name(&self) -> &'static str {
        "idle-sweep"
    }

    async fn tick(&self) -> Result<()> {
        let closed = self.pool.sweep_idle().await;
        if closed > 0 {
            debug!(closed, "idle sessions closed");
        }
        Ok(())
    }
}

/// Releases account and message claims left behind by workers that never
/// finished.
pub struct StuckClaimCleanup {
    store: Store,
    clock: Arc<dyn Clock>,
    max_age: chrono::Duration,
}

impl StuckClaimCleanup {
    /// Creates the job. Claims older than `max_age` are released.
    #[must_use]
    pub fn new(store: Store, clock: Arc<dyn Clock>, max_age: chrono::Duration) -> Self {
        Self {
            store,
            clock,
            max_age,
        }
    }
}

#[async_trait]
impl Job for StuckClaimCleanup {
    fn name(&self) -> &'static str {
        "stuck-claim-cleanup"
    }

    async fn tick(&self) -> Result<()> {
        let now = self.clock.now();
        let cutoff = now - self.max_age;
        self.store.release_stuck_claims(cutoff, now).await?;
        self.store.release_stuck_messages(cutoff, now).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use crate::account::{AccountSeed, ClaimState};
    use crate::clock::ManualClock;
    use crate::message::{MessageStatus, MessageSummary};
    use crate::testing::epoch;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter {
        ticks: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl Job for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        async fn tick(&self) -> Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(crate::Error::Config("tick failed".into()));
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_until_shutdown() {
        let ticks = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(false);
        let handle = spawn_recurring(
            Counter {
                ticks: Arc::clone(&ticks),
                fail: false,
            },
            Duration::from_secs(10),
            rx,
        );

        tokio::time::sleep(Duration::from_secs(35)).await;
        // Immediately, then at 10s, 20s and 30s.
        assert_eq!(ticks.load(Ordering::SeqCst), 4);

        tx.send_replace(true);
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_ticks_keep_the_job_alive() {
        let ticks = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(false);
        let handle = spawn_recurring(
            Counter {
                ticks: Arc::clone(&ticks),
                fail: true,
            },
            Duration::from_secs(1),
            rx,
        );

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_releases_old_claims_only() {
        let store = Store::in_memory().await.unwrap();
        let old = store
            .upsert_account(&AccountSeed::with_email("old@gmail.com", "pw"))
            .await
            .unwrap();
        store
            .insert_new_messages(
                old,
                &[MessageSummary {
                    uid: 1,
                    subject: "s".into(),
                    from: "f".into(),
                    date: None,
                    has_attachment: false,
                    size: 10,
                }],
                epoch(),
            )
            .await
            .unwrap();
        store.claim_accounts(None, 1, epoch()).await.unwrap();
        store.claim_pending_messages(old, 10, epoch()).await.unwrap();

        let recent = store
            .upsert_account(&AccountSeed::with_email("recent@gmail.com", "pw"))
            .await
            .unwrap();
        let later = epoch() + chrono::Duration::minutes(30);
        store.claim_accounts(None, 1, later).await.unwrap();

        let clock = Arc::new(ManualClock::new(epoch() + chrono::Duration::minutes(41)));
        let job = StuckClaimCleanup::new(store.clone(), clock.clone(), chrono::Duration::minutes(40));
        job.tick().await.unwrap();

        let old_account = store.get_account(old).await.unwrap().unwrap();
        assert_eq!(old_account.claim_state, ClaimState::Idle);
        assert_eq!(
            old_account.last_content_sync_time,
            Some(clock.now() - chrono::Duration::hours(2))
        );
        let message = store.get_message(old, 1).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Pending);

        let recent_account = store.get_account(recent).await.unwrap().unwrap();
        assert_eq!(recent_account.claim_state, ClaimState::Claimed);
    }
}

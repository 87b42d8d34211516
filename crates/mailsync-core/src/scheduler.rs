//! Claiming accounts and running their workers under a global ceiling.
//!
//! A trigger first reserves free worker slots on an atomic counter, then
//! claims at most that many idle accounts in one store statement, so two
//! triggers never hand the same account to two workers. Each launched
//! worker owns one slot and gives it back when its task ends, whether it
//! finished, failed, timed out or panicked. A worker that did not finish
//! normally has its claimed messages returned to pending before the account
//! is released.
//!
//! Workers run in the background. [`Scheduler::trigger`] returns as soon as
//! they are launched, together with a handle that resolves to the
//! [`RunSummary`] once the last of them is done.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::Result;
use crate::account::{Account, AccountId};
use crate::clock::Clock;
use crate::store::{RunRecord, Store};
use crate::worker::{Progress, SyncWorker, WorkerReport};

/// Scheduler tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Most workers running at once, across all triggers.
    pub max_concurrent: usize,
    /// Content limit used when a request names none.
    pub default_limit: usize,
    /// Hard limit on one worker's run time.
    pub timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 20,
            default_limit: 30,
            timeout: Duration::from_secs(25 * 60),
        }
    }
}

/// A request to sync due accounts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Only accounts on this node; all nodes when `None`.
    pub node: Option<i64>,
    /// Per-account content limit; the default when `None` or zero.
    pub limit: Option<usize>,
}

/// Immediate answer to a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAck {
    /// Accounts claimed and launched by this trigger.
    pub accepted: usize,
    /// Workers running right after the launch, this trigger's included.
    pub running: usize,
}

/// Counts for one finished trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Accounts launched.
    pub accounts: usize,
    /// Accounts completed.
    pub succeeded: usize,
    /// Accounts failed, timed out or crashed.
    pub failed: usize,
    /// Messages newly listed.
    pub listed: u64,
    /// Message contents saved.
    pub fetched: u64,
}

struct Inner {
    store: Store,
    worker: Arc<SyncWorker>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    running: AtomicUsize,
    idle: Notify,
    shutdown: watch::Sender<bool>,
}

/// Holds one worker slot; giving it back on drop.
struct Slot {
    inner: Arc<Inner>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.inner.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

enum Outcome {
    Finished(WorkerReport),
    StoreError(crate::Error),
    TimedOut,
    Crashed(String),
}

struct AccountResult {
    succeeded: bool,
    listed: u64,
    fetched: u64,
}

/// Launches sync workers.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Creates a scheduler.
    #[must_use]
    pub fn new(
        store: Store,
        worker: Arc<SyncWorker>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                worker,
                clock,
                settings,
                running: AtomicUsize::new(0),
                idle: Notify::new(),
                shutdown,
            }),
        }
    }

    /// Claims due accounts and starts a worker for each, without waiting for
    /// them.
    ///
    /// When the ceiling is reached nothing is claimed and `accepted` is 0.
    ///
    /// # Errors
    ///
    /// Returns an error if claiming accounts fails.
    pub async fn trigger(&self, request: SyncRequest) -> Result<(SyncAck, JoinHandle<RunSummary>)> {
        let inner = &self.inner;
        let limit = request
            .limit
            .filter(|limit| *limit > 0)
            .unwrap_or(inner.settings.default_limit);

        if *inner.shutdown.borrow() {
            return Ok((self.ack(0), tokio::spawn(async { RunSummary::default() })));
        }
        let mut slots = self.reserve();
        if slots.is_empty() {
            info!(running = self.running(), "worker ceiling reached, trigger skipped");
            return Ok((self.ack(0), tokio::spawn(async { RunSummary::default() })));
        }

        let started = inner.clock.now();
        // Unused slots go back when `slots` is truncated or dropped.
        let accounts = inner
            .store
            .claim_accounts(request.node, slots.len(), started)
            .await?;
        slots.truncate(accounts.len());
        info!(node = ?request.node, limit, claimed = accounts.len(), "accounts claimed");

        let mut tasks = JoinSet::new();
        for (account, slot) in accounts.into_iter().zip(slots) {
            tasks.spawn(run_account(Arc::clone(inner), account, limit, slot));
        }
        let accepted = tasks.len();
        let collector = tokio::spawn(collect(Arc::clone(inner), tasks, request.node, started));
        Ok((self.ack(accepted), collector))
    }

    /// Workers currently running.
    #[must_use]
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Waits until no worker is running, at most `limit`. Returns false on
    /// timeout.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let idle = async {
            loop {
                let notified = self.inner.idle.notified();
                if self.running() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(limit, idle).await.is_ok()
    }

    /// Asks running workers to stop early and refuses new triggers.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        info!(running = self.running(), "scheduler shutting down");
    }

    fn ack(&self, accepted: usize) -> SyncAck {
        SyncAck {
            accepted,
            running: self.running(),
        }
    }

    /// Takes as many free slots as the ceiling allows.
    fn reserve(&self) -> Vec<Slot> {
        let max = self.inner.settings.max_concurrent;
        let mut current = self.inner.running.load(Ordering::Acquire);
        let taken = loop {
            let free = max.saturating_sub(current);
            if free == 0 {
                return Vec::new();
            }
            match self.inner.running.compare_exchange(
                current,
                current + free,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break free,
                Err(actual) => current = actual,
            }
        };
        (0..taken)
            .map(|_| Slot {
                inner: Arc::clone(&self.inner),
            })
            .collect()
    }
}

/// Runs one worker in its own task, so a panic is caught here, then settles
/// the account's claim.
async fn run_account(inner: Arc<Inner>, account: Account, limit: usize, slot: Slot) -> AccountResult {
    let id = account.id;
    let timeout = inner.settings.timeout;
    let worker = Arc::clone(&inner.worker);
    let shutdown = inner.shutdown.subscribe();
    let deadline = deadline_after(inner.clock.now(), timeout);
    let progress = Arc::new(Progress::default());
    let tracked = Arc::clone(&progress);

    // The worker stops on its own before the deadline; this timeout only
    // catches a run stuck outside its fetch loop.
    let task = tokio::spawn(async move {
        tokio::time::timeout(
            timeout,
            worker.run_tracked(&account, limit, deadline, &shutdown, &tracked),
        )
        .await
    });
    let outcome = match task.await {
        Ok(Ok(Ok(report))) => Outcome::Finished(report),
        Ok(Ok(Err(e))) => Outcome::StoreError(e),
        Ok(Err(_)) => Outcome::TimedOut,
        Err(e) => Outcome::Crashed(e.to_string()),
    };
    let result = settle(&inner, id, outcome, &progress).await;
    drop(slot);
    result
}

fn deadline_after(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| now.checked_add_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

async fn settle(inner: &Inner, id: AccountId, outcome: Outcome, progress: &Progress) -> AccountResult {
    let now = inner.clock.now();
    let result = match outcome {
        Outcome::Finished(report) => AccountResult {
            succeeded: !report.is_failure(),
            listed: report.listed,
            fetched: report.succeeded,
        },
        Outcome::StoreError(e) => {
            warn!(account = %id, error = %e, "worker aborted by store error");
            AccountResult::interrupted(progress)
        }
        Outcome::TimedOut => {
            warn!(account = %id, timeout = ?inner.settings.timeout, "worker timed out");
            AccountResult::interrupted(progress)
        }
        Outcome::Crashed(reason) => {
            error!(account = %id, reason, "worker crashed");
            AccountResult::interrupted(progress)
        }
    };

    if !result.succeeded
        && let Err(e) = inner.store.requeue_claimed_messages(id, now).await
    {
        // The stuck-claim cleanup releases them later.
        error!(account = %id, error = %e, "could not requeue claimed messages");
    }

    let released = if result.succeeded {
        inner.store.complete_account(id, now).await
    } else {
        inner.store.fail_account(id, now).await
    };
    if let Err(e) = released {
        // The stuck-claim cleanup releases it later.
        error!(account = %id, error = %e, "could not release account claim");
    }
    result
}

impl AccountResult {
    /// A failed account, keeping whatever the worker committed before it
    /// was cut off.
    fn interrupted(progress: &Progress) -> Self {
        Self {
            succeeded: false,
            listed: progress.listed(),
            fetched: progress.saved(),
        }
    }
}

async fn collect(
    inner: Arc<Inner>,
    mut tasks: JoinSet<AccountResult>,
    node: Option<i64>,
    started: DateTime<Utc>,
) -> RunSummary {
    let mut summary = RunSummary {
        accounts: tasks.len(),
        ..RunSummary::default()
    };
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => {
                if result.succeeded {
                    summary.succeeded += 1;
                } else {
                    summary.failed += 1;
                }
                summary.listed += result.listed;
                summary.fetched += result.fetched;
            }
            Err(e) => {
                error!(error = %e, "account task lost");
                summary.failed += 1;
            }
        }
    }

    info!(
        node = ?node,
        accounts = summary.accounts,
        succeeded = summary.succeeded,
        failed = summary.failed,
        listed = summary.listed,
        fetched = summary.fetched,
        "sync run finished"
    );
    if summary.accounts > 0 {
        let record = RunRecord {
            node,
            started_at: started,
            finished_at: inner.clock.now(),
            summary: summary.clone(),
        };
        if let Err(e) = inner.store.record_run(&record).await {
            warn!(error = %e, "could not record sync run");
        }
    }
    summary
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
    use crate::client::{MailClient, SmtpSubmitter, Submitter};
    use crate::message::MessageStatus;
    use crate::clock::ManualClock;
    use crate::pool::{PoolSettings, SessionPool};
    use crate::retry::RetryEngine;
    use crate::storage::ObjectStore;
    use crate::testing::{FakeConnector, MemoryObjectStore, Script, epoch, raw_message, raw_with_attachment};
    use crate::worker::WorkerSettings;
    use async_trait::async_trait;

    struct Fixture {
        store: Store,
        connector: FakeConnector,
        scheduler: Scheduler,
    }

    fn worker_settings() -> WorkerSettings {
        WorkerSettings {
            pacing: Duration::ZERO,
            safety_margin: Duration::ZERO,
            ..WorkerSettings::default()
        }
    }

    async fn fixture(
        accounts: usize,
        settings: SchedulerSettings,
        objects: Arc<dyn ObjectStore>,
    ) -> Fixture {
        fixture_with(accounts, settings, objects, worker_settings()).await
    }

    async fn fixture_with(
        accounts: usize,
        settings: SchedulerSettings,
        objects: Arc<dyn ObjectStore>,
        worker_settings: WorkerSettings,
    ) -> Fixture {
        let store = Store::in_memory().await.unwrap();
        for n in 0..accounts {
            store
                .upsert_account(&AccountSeed::with_email(&format!("u{n}@gmail.com"), "pw"))
                .await
                .unwrap();
        }
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(epoch()));
        let connector = FakeConnector::new();
        let pool = SessionPool::new(
            Arc::new(connector.clone()),
            Arc::clone(&clock),
            PoolSettings::default(),
        );
        let submitter: Arc<dyn Submitter> =
            Arc::new(SmtpSubmitter::new(Duration::from_secs(1), Duration::from_secs(1)));
        let client = MailClient::new(RetryEngine::new(Arc::new(pool)), submitter, Arc::clone(&clock));
        let worker = SyncWorker::new(
            store.clone(),
            Arc::new(client),
            objects,
            Arc::clone(&clock),
            worker_settings,
        );
        let scheduler = Scheduler::new(store.clone(), Arc::new(worker), clock, settings);
        Fixture {
            store,
            connector,
            scheduler,
        }
    }

    fn memory() -> Arc<dyn ObjectStore> {
        Arc::new(MemoryObjectStore::default())
    }

    fn settings(max_concurrent: usize, timeout: Duration) -> SchedulerSettings {
        SchedulerSettings {
            max_concurrent,
            default_limit: 30,
            timeout,
        }
    }

    #[tokio::test]
    async fn trigger_syncs_and_records_the_run() {
        let f = fixture(2, SchedulerSettings::default(), memory()).await;
        f.connector.add_message(1, raw_message("a", "x"));
        f.connector.add_message(2, raw_message("b", "y"));

        let (ack, handle) = f.scheduler.trigger(SyncRequest::default()).await.unwrap();
        assert_eq!(ack.accepted, 2);

        let summary = handle.await.unwrap();
        assert_eq!(
            summary,
            RunSummary {
                accounts: 2,
                succeeded: 2,
                failed: 0,
                listed: 4,
                fetched: 4,
            }
        );
        assert_eq!(f.scheduler.running(), 0);

        for account in f.store.list_accounts().await.unwrap() {
            assert_eq!(account.claim_state, ClaimState::Idle);
            assert_eq!(account.last_content_sync_time, Some(epoch()));
        }
        let runs = f.store.recent_runs(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].summary, summary);
    }

    #[tokio::test]
    async fn ceiling_limits_claims() {
        let f = fixture(3, settings(2, Duration::from_secs(60)), memory()).await;
        f.connector.add_message(1, raw_message("a", "x"));

        let (ack, handle) = f.scheduler.trigger(SyncRequest::default()).await.unwrap();
        assert_eq!(ack.accepted, 2);
        let summary = handle.await.unwrap();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.fetched, 2);

        let never_synced = f
            .store
            .list_accounts()
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.last_content_sync_time.is_none())
            .count();
        assert_eq!(never_synced, 1);

        // All three are idle again; the ceiling still caps the claim.
        let (ack, handle) = f.scheduler.trigger(SyncRequest::default()).await.unwrap();
        assert_eq!(ack.accepted, 2);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn busy_scheduler_accepts_nothing_and_timeouts_fail_the_account() {
        let f = fixture(2, settings(1, Duration::from_millis(200)), memory()).await;
        f.connector.push_search(Script::Hang);

        let (first, handle) = f.scheduler.trigger(SyncRequest::default()).await.unwrap();
        assert_eq!(first.accepted, 1);
        assert_eq!(first.running, 1);

        let (second, _) = f.scheduler.trigger(SyncRequest::default()).await.unwrap();
        assert_eq!(second.accepted, 0);

        let summary = handle.await.unwrap();
        assert_eq!(summary.failed, 1);
        assert!(f.scheduler.wait_idle(Duration::from_secs(1)).await);

        let failed = f
            .store
            .list_accounts()
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.last_content_sync_time.is_some())
            .unwrap();
        assert_eq!(failed.claim_state, ClaimState::Idle);
        assert_eq!(
            failed.last_content_sync_time,
            Some(epoch() - chrono::Duration::hours(1))
        );
    }

    struct PanickingStore;

    #[async_trait]
    impl ObjectStore for PanickingStore {
        async fn upload(&self, _: &str, _: &[u8], _: &str) -> crate::Result<String> {
            panic!("object store exploded");
        }
    }

    #[tokio::test]
    async fn crashed_worker_releases_slot_and_claim() {
        let f = fixture(1, settings(1, Duration::from_secs(60)), Arc::new(PanickingStore)).await;
        f.connector.add_message(1, raw_with_attachment("boom"));

        let (ack, handle) = f.scheduler.trigger(SyncRequest::default()).await.unwrap();
        assert_eq!(ack.accepted, 1);

        let summary = handle.await.unwrap();
        assert_eq!(summary.failed, 1);
        // The list phase committed before the crash.
        assert_eq!(summary.listed, 1);
        assert_eq!(summary.fetched, 0);
        assert_eq!(f.scheduler.running(), 0);
        let account = &f.store.list_accounts().await.unwrap()[0];
        assert_eq!(account.claim_state, ClaimState::Idle);
        let message = f.store.get_message(account.id, 1).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn hanging_fetch_keeps_finished_work() {
        let f = fixture_with(
            1,
            settings(1, Duration::from_secs(2)),
            memory(),
            WorkerSettings {
                safety_margin: Duration::from_millis(1500),
                ..worker_settings()
            },
        )
        .await;
        f.connector.add_message(1, raw_message("a", "x"));
        f.connector.add_message(2, raw_message("b", "y"));
        f.connector.fail_fetch(2, Script::Hang);

        let (_, handle) = f.scheduler.trigger(SyncRequest::default()).await.unwrap();
        let summary = handle.await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.listed, 2);
        assert_eq!(summary.fetched, 1);
        let account = &f.store.list_accounts().await.unwrap()[0];
        assert_eq!(account.claim_state, ClaimState::Idle);
        let first = f.store.get_message(account.id, 1).await.unwrap().unwrap();
        let second = f.store.get_message(account.id, 2).await.unwrap().unwrap();
        assert_eq!(first.status, MessageStatus::Done);
        assert_eq!(second.status, MessageStatus::Pending);
    }

    #[test]
    fn deadline_saturates() {
        assert_eq!(
            deadline_after(epoch(), Duration::from_secs(60)),
            epoch() + chrono::Duration::seconds(60)
        );
        assert_eq!(
            deadline_after(epoch(), Duration::MAX),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[tokio::test]
    async fn shutdown_refuses_new_triggers() {
        let f = fixture(1, SchedulerSettings::default(), memory()).await;
        f.scheduler.shutdown();

        let (ack, handle) = f.scheduler.trigger(SyncRequest::default()).await.unwrap();
        assert_eq!(ack.accepted, 0);
        assert_eq!(handle.await.unwrap(), RunSummary::default());
        assert!(f.scheduler.wait_idle(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn concurrent_triggers_never_share_an_account() {
        let f = fixture(6, settings(4, Duration::from_secs(60)), memory()).await;

        let (a, b) = tokio::join!(
            f.scheduler.trigger(SyncRequest::default()),
            f.scheduler.trigger(SyncRequest::default())
        );
        let (ack_a, handle_a) = a.unwrap();
        let (ack_b, handle_b) = b.unwrap();
        assert!(ack_a.accepted + ack_b.accepted <= 4);

        let total = handle_a.await.unwrap().accounts + handle_b.await.unwrap().accounts;
        assert_eq!(total, ack_a.accepted + ack_b.accepted);
        assert!(f.scheduler.wait_idle(Duration::from_secs(1)).await);
    }
}

//! The per-account sync cycle.
//!
//! A run has two phases:
//!
//! 1. **List**: messages newer than the highest stored UID are inserted as
//!    pending; duplicates are skipped and the list cursor advances in the
//!    same transaction.
//! 2. **Content**: up to `limit` pending messages are claimed and fetched
//!    one at a time, in UID order. Each failure becomes a status change
//!    rather than an error. Before every fetch the worker checks the
//!    deadline (minus a safety margin) and shutdown, and a fetch still
//!    running when either arrives is cut off. When it stops early the
//!    messages it did not get to go back to pending.
//!
//! Contents fetched in one run are saved in a single transaction at the end
//! of the phase, including when it stopped early.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::client::MailClient;
use crate::clock::Clock;
use crate::message::{AttachmentRecord, FetchedContent, MessageId, MessageRecord, MessageStatus};
use crate::mime::AttachmentData;
use crate::retry::{self, RetryPolicy};
use crate::storage::ObjectStore;
use crate::store::Store;
use crate::{Error, Result};

/// Worker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Most messages a list phase inserts.
    pub list_batch: usize,
    /// Pause between two message fetches.
    pub pacing: Duration,
    /// The content phase stops this long before the deadline.
    pub safety_margin: Duration,
    /// Attempts and backoff for each attachment upload.
    pub upload_policy: RetryPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            list_batch: 100,
            pacing: Duration::from_millis(500),
            safety_margin: Duration::from_secs(120),
            upload_policy: RetryPolicy::SEND,
        }
    }
}

/// Outcome of one worker run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Messages newly inserted by the list phase.
    pub listed: u64,
    /// Messages whose content was saved.
    pub succeeded: u64,
    /// Messages that failed permanently.
    pub failed: u64,
    /// Messages the server no longer has.
    pub deleted: u64,
    /// Messages returned to pending, after a transient failure or because
    /// the phase stopped early.
    pub requeued: u64,
    /// The content phase stopped before the end of its batch.
    pub stopped_early: bool,
    /// Why the account could not be synced, if it could not.
    pub account_error: Option<String>,
}

impl WorkerReport {
    /// Returns true if the account should be treated as failed.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        self.account_error.is_some()
    }
}

/// Counts a run has committed so far, readable while it is still running.
#[derive(Debug, Default)]
pub struct Progress {
    listed: AtomicU64,
    saved: AtomicU64,
}

impl Progress {
    /// Messages inserted by the list phase.
    #[must_use]
    pub fn listed(&self) -> u64 {
        self.listed.load(Ordering::Acquire)
    }

    /// Message contents saved.
    #[must_use]
    pub fn saved(&self) -> u64 {
        self.saved.load(Ordering::Acquire)
    }
}

/// Runs sync cycles.
pub struct SyncWorker {
    store: Store,
    client: Arc<MailClient>,
    objects: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    settings: WorkerSettings,
}

enum Stop {
    Deadline,
    Shutdown,
    AccountFailure,
}

impl SyncWorker {
    /// Creates a worker.
    #[must_use]
    pub fn new(
        store: Store,
        client: Arc<MailClient>,
        objects: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            client,
            objects,
            clock,
            settings,
        }
    }

    /// Runs both phases for `account`, fetching at most `limit` contents
    /// and stopping `safety_margin` before `deadline`.
    ///
    /// A failing list phase is recorded in the report and the content phase
    /// still works through already pending messages.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store fails. Claimed messages that were
    /// not finished are returned to pending first, as far as the store
    /// allows.
    pub async fn run(
        &self,
        account: &Account,
        limit: usize,
        deadline: DateTime<Utc>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<WorkerReport> {
        self.run_tracked(account, limit, deadline, shutdown, &Progress::default())
            .await
    }

    /// Like [`run`](Self::run), also recording committed counts in
    /// `progress` as they happen.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run).
    pub async fn run_tracked(
        &self,
        account: &Account,
        limit: usize,
        deadline: DateTime<Utc>,
        shutdown: &watch::Receiver<bool>,
        progress: &Progress,
    ) -> Result<WorkerReport> {
        let mut report = WorkerReport::default();

        match self.list_phase(account).await {
            Ok(inserted) => {
                report.listed = inserted;
                progress.listed.store(inserted, Ordering::Release);
            }
            Err(e @ Error::Database(_)) => return Err(e),
            Err(e) => {
                warn!(account = %account.id, error = %e, "list phase failed");
                report.account_error = Some(e.to_string());
                if e.is_account_failure() {
                    return Ok(report);
                }
            }
        }

        self.content_phase(account, limit, deadline, shutdown, &mut report, progress)
            .await?;

        info!(
            account = %account.id,
            listed = report.listed,
            succeeded = report.succeeded,
            failed = report.failed,
            deleted = report.deleted,
            requeued = report.requeued,
            stopped_early = report.stopped_early,
            "account synced"
        );
        Ok(report)
    }

    async fn list_phase(&self, account: &Account) -> Result<u64> {
        let last_uid = self.store.last_known_uid(account.id).await?;
        let summaries = self
            .client
            .list_new(account, last_uid, self.settings.list_batch)
            .await?;
        let inserted = self
            .store
            .insert_new_messages(account.id, &summaries, self.clock.now())
            .await?;
        debug!(account = %account.id, ?last_uid, found = summaries.len(), inserted, "list phase done");
        Ok(inserted)
    }

    async fn content_phase(
        &self,
        account: &Account,
        limit: usize,
        deadline: DateTime<Utc>,
        shutdown: &watch::Receiver<bool>,
        report: &mut WorkerReport,
        progress: &Progress,
    ) -> Result<()> {
        let claimed = self
            .store
            .claim_pending_messages(account.id, limit, self.clock.now())
            .await?;
        debug!(account = %account.id, claimed = claimed.len(), "content phase started");

        let mut contents = Vec::new();
        let mut next = 0;
        let mut stop = None;
        while next < claimed.len() {
            if let Some(reason) = self.should_stop(deadline, shutdown) {
                stop = Some(reason);
                break;
            }
            if next > 0 {
                tokio::time::sleep(self.settings.pacing).await;
            }

            let message = &claimed[next];
            let fetched = tokio::select! {
                fetched = tokio::time::timeout(self.budget(deadline), self.fetch_one(account, message)) => fetched,
                () = shutdown_requested(shutdown.clone()) => {
                    self.cut_off(account, message).await;
                    stop = Some(Stop::Shutdown);
                    break;
                }
            };
            let Ok(fetched) = fetched else {
                self.cut_off(account, message).await;
                stop = Some(Stop::Deadline);
                break;
            };
            match fetched {
                Ok(content) => {
                    contents.push(content);
                    next += 1;
                }
                Err(e) if e.is_account_failure() => {
                    warn!(account = %account.id, error = %e, "account unusable, content phase stopped");
                    report.account_error = Some(e.to_string());
                    stop = Some(Stop::AccountFailure);
                    break;
                }
                Err(e) => {
                    let status = MessageStatus::after_failure(&e);
                    warn!(account = %account.id, uid = message.uid, ?status, error = %e, "message fetch failed");
                    if let Err(store_error) = self
                        .store
                        .mark_message(message.id, status, self.clock.now())
                        .await
                    {
                        self.abandon(&claimed[next..], &contents).await;
                        return Err(store_error);
                    }
                    match status {
                        MessageStatus::Deleted => report.deleted += 1,
                        MessageStatus::PermanentFailure => report.failed += 1,
                        _ => report.requeued += 1,
                    }
                    next += 1;
                }
            }
        }

        match self.store.save_contents(&contents, self.clock.now()).await {
            Ok(saved) => {
                report.succeeded += saved;
                progress.saved.fetch_add(saved, Ordering::AcqRel);
            }
            Err(e) => {
                self.abandon(&claimed[next..], &contents).await;
                return Err(e);
            }
        }

        if let Some(reason) = stop {
            let rest: Vec<MessageId> = claimed[next..].iter().map(|m| m.id).collect();
            let requeued = self.store.requeue_messages(&rest, self.clock.now()).await?;
            report.requeued += requeued;
            report.stopped_early = true;
            let reason = match reason {
                Stop::Deadline => "deadline",
                Stop::Shutdown => "shutdown",
                Stop::AccountFailure => "account failure",
            };
            info!(account = %account.id, reason, requeued, "content phase stopped early");
        }
        Ok(())
    }

    fn should_stop(&self, deadline: DateTime<Utc>, shutdown: &watch::Receiver<bool>) -> Option<Stop> {
        if *shutdown.borrow() {
            return Some(Stop::Shutdown);
        }
        if self.budget(deadline).is_zero() {
            return Some(Stop::Deadline);
        }
        None
    }

    /// Time left before `deadline` minus the safety margin.
    fn budget(&self, deadline: DateTime<Utc>) -> Duration {
        (deadline - self.clock.now())
            .to_std()
            .unwrap_or_default()
            .saturating_sub(self.settings.safety_margin)
    }

    /// Drops the session an interrupted fetch left mid-command. The message
    /// itself stays claimed and is requeued with the rest of the batch.
    async fn cut_off(&self, account: &Account, message: &MessageRecord) {
        warn!(account = %account.id, uid = message.uid, "fetch interrupted");
        self.client.engine().pool().invalidate(account.id).await;
    }

    async fn fetch_one(&self, account: &Account, message: &MessageRecord) -> Result<FetchedContent> {
        let parsed = self.client.fetch_content(account, message.uid).await?;
        let mut attachments = Vec::with_capacity(parsed.attachments.len());
        for attachment in parsed.attachments {
            attachments.push(self.upload(account, message, attachment).await);
        }
        Ok(FetchedContent {
            message_id: message.id,
            body: parsed.text,
            html_body: parsed.html,
            attachments,
        })
    }

    async fn upload(
        &self,
        account: &Account,
        message: &MessageRecord,
        attachment: AttachmentData,
    ) -> AttachmentRecord {
        let result = retry::with_backoff(self.settings.upload_policy, "upload", || {
            self.objects
                .upload(&attachment.filename, &attachment.bytes, &attachment.mime_type)
        })
        .await;
        let storage_url = match result {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(
                    account = %account.id,
                    uid = message.uid,
                    filename = %attachment.filename,
                    error = %e,
                    "attachment upload failed"
                );
                None
            }
        };
        AttachmentRecord {
            size: u64::try_from(attachment.bytes.len()).unwrap_or(u64::MAX),
            filename: attachment.filename,
            mime_type: attachment.mime_type,
            storage_url,
        }
    }

    /// Best-effort release of everything still claimed after a store error.
    async fn abandon(&self, unprocessed: &[MessageRecord], fetched: &[FetchedContent]) {
        let ids: Vec<MessageId> = unprocessed
            .iter()
            .map(|m| m.id)
            .chain(fetched.iter().map(|c| c.message_id))
            .collect();
        if let Err(e) = self.store.requeue_messages(&ids, self.clock.now()).await {
            warn!(error = %e, messages = ids.len(), "could not requeue claimed messages");
        }
    }
}

/// Resolves once shutdown is requested. Never resolves if the sender is
/// gone without asking.
async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
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
    use crate::account::{AccountId, AccountSeed};
    use crate::client::{SmtpSubmitter, Submitter};
    use crate::clock::ManualClock;
    use crate::pool::{PoolSettings, SessionPool};
    use crate::retry::RetryEngine;
    use crate::testing::{
        FakeConnector, MemoryObjectStore, Script, epoch, raw_message, raw_with_attachment,
    };

    struct Fixture {
        store: Store,
        connector: FakeConnector,
        clock: Arc<ManualClock>,
        objects: Arc<MemoryObjectStore>,
        worker: SyncWorker,
        account: Account,
    }

    /// Retries back off by a millisecond so the tests run in real time.
    fn quick() -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_millis(1))
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            pacing: Duration::ZERO,
            upload_policy: RetryPolicy::new(3, Duration::from_millis(1)),
            ..WorkerSettings::default()
        }
    }

    async fn fixture(settings: WorkerSettings) -> Fixture {
        let store = Store::in_memory().await.unwrap();
        let id = store
            .upsert_account(&AccountSeed::with_email("a@gmail.com", "pw"))
            .await
            .unwrap();
        let account = store.get_account(id).await.unwrap().unwrap();

        let connector = FakeConnector::new();
        let clock = Arc::new(ManualClock::new(epoch()));
        let pool = SessionPool::new(
            Arc::new(connector.clone()),
            Arc::clone(&clock) as Arc<dyn Clock>,
            PoolSettings {
                connect_policy: quick(),
                ..PoolSettings::default()
            },
        );
        let submitter: Arc<dyn Submitter> =
            Arc::new(SmtpSubmitter::new(Duration::from_secs(1), Duration::from_secs(1)));
        let client = MailClient::new(
            RetryEngine::new(Arc::new(pool)),
            submitter,
            Arc::clone(&clock) as Arc<dyn Clock>,
        )
        .with_policies(quick(), quick());
        let objects = Arc::new(MemoryObjectStore::default());
        let worker = SyncWorker::new(
            store.clone(),
            Arc::new(client),
            Arc::clone(&objects) as Arc<dyn ObjectStore>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            settings,
        );
        Fixture {
            store,
            connector,
            clock,
            objects,
            worker,
            account,
        }
    }

    fn far_deadline() -> DateTime<Utc> {
        epoch() + chrono::Duration::hours(1)
    }

    fn running() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    async fn status_of(store: &Store, account: AccountId, uid: u32) -> MessageStatus {
        store.get_message(account, uid).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn first_sync_scenario() {
        let f = fixture(settings()).await;
        for uid in [101, 102, 103] {
            f.connector.add_message(uid, raw_message(&format!("m{uid}"), "body"));
        }
        f.connector.fail_fetch(102, Script::NonExistent);

        let report = f
            .worker
            .run(&f.account, 2, far_deadline(), &running())
            .await
            .unwrap();

        assert_eq!(report.listed, 3);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert!(!report.is_failure());

        let id = f.account.id;
        assert_eq!(status_of(&f.store, id, 101).await, MessageStatus::Done);
        assert_eq!(status_of(&f.store, id, 102).await, MessageStatus::PermanentFailure);
        assert_eq!(status_of(&f.store, id, 103).await, MessageStatus::Pending);

        let account = f.store.get_account(id).await.unwrap().unwrap();
        assert!(account.last_list_sync_time.is_some());
    }

    #[tokio::test]
    async fn relisting_creates_no_duplicates() {
        let f = fixture(settings()).await;
        f.connector.add_message(1, raw_message("one", "x"));

        f.worker.run(&f.account, 10, far_deadline(), &running()).await.unwrap();
        let again = f.worker.run(&f.account, 10, far_deadline(), &running()).await.unwrap();

        assert_eq!(again.listed, 0);
        assert_eq!(f.store.list_messages(f.account.id).await.unwrap().len(), 1);
        // Done is terminal: the second run fetched nothing.
        assert_eq!(f.connector.fetched(), vec![1]);
    }

    #[tokio::test]
    async fn vanished_and_flaky_messages() {
        let f = fixture(settings()).await;
        for uid in [1, 2, 3] {
            f.connector.add_message(uid, raw_message("m", "x"));
        }
        f.connector.fail_fetch(1, Script::Gone);
        for _ in 0..5 {
            f.connector.fail_fetch(2, Script::Timeout);
        }

        let report = f.worker.run(&f.account, 10, far_deadline(), &running()).await.unwrap();

        assert_eq!(report.deleted, 1);
        assert_eq!(report.requeued, 1);
        assert_eq!(report.succeeded, 1);
        let id = f.account.id;
        assert_eq!(status_of(&f.store, id, 1).await, MessageStatus::Deleted);
        assert_eq!(status_of(&f.store, id, 2).await, MessageStatus::Pending);
        assert_eq!(status_of(&f.store, id, 3).await, MessageStatus::Done);
    }

    #[tokio::test]
    async fn deadline_stop_conserves_messages() {
        let f = fixture(settings()).await;
        for uid in 1..=6 {
            f.connector.add_message(uid, raw_message("m", "x"));
        }
        f.connector.fail_fetch(2, Script::NonExistent);
        f.connector
            .charge_fetches(Arc::clone(&f.clock), chrono::Duration::seconds(30));

        // 75s of room before the 120s margin: fetches at 0s, 30s and 60s.
        let deadline = epoch() + chrono::Duration::seconds(195);
        let report = f.worker.run(&f.account, 6, deadline, &running()).await.unwrap();

        assert!(report.stopped_early);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.requeued, 3);

        let counts = f.store.status_counts(f.account.id).await.unwrap();
        assert_eq!(counts.pending, 3);
        assert_eq!(counts.done, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.claimed, 0);
        assert_eq!(counts.total(), 6);
    }

    #[tokio::test]
    async fn hanging_fetch_is_cut_off_at_the_deadline() {
        let f = fixture(WorkerSettings {
            safety_margin: Duration::from_millis(50),
            ..settings()
        })
        .await;
        for uid in 1..=3 {
            f.connector.add_message(uid, raw_message("m", "x"));
        }
        f.connector.fail_fetch(2, Script::Hang);

        let deadline = epoch() + chrono::Duration::milliseconds(250);
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            f.worker.run(&f.account, 3, deadline, &running()),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(report.stopped_early);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.requeued, 2);
        let id = f.account.id;
        assert_eq!(status_of(&f.store, id, 1).await, MessageStatus::Done);
        assert_eq!(status_of(&f.store, id, 2).await, MessageStatus::Pending);
        assert_eq!(status_of(&f.store, id, 3).await, MessageStatus::Pending);
        assert_eq!(f.connector.fetched(), vec![1]);
    }

    #[tokio::test]
    async fn shutdown_requeues_the_batch() {
        let f = fixture(settings()).await;
        for uid in 1..=3 {
            f.connector.add_message(uid, raw_message("m", "x"));
        }
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let report = f.worker.run(&f.account, 10, far_deadline(), &rx).await.unwrap();

        assert!(report.stopped_early);
        assert_eq!(report.listed, 3);
        assert_eq!(report.requeued, 3);
        assert!(f.connector.fetched().is_empty());
        let counts = f.store.status_counts(f.account.id).await.unwrap();
        assert_eq!(counts.pending, 3);
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_hanging_fetch() {
        let f = fixture(settings()).await;
        f.connector.add_message(1, raw_message("m", "x"));
        f.connector.add_message(2, raw_message("m", "x"));
        f.connector.fail_fetch(2, Script::Hang);
        let (tx, rx) = watch::channel(false);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send_replace(true);
            tx
        });
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            f.worker.run(&f.account, 10, far_deadline(), &rx),
        )
        .await
        .unwrap()
        .unwrap();
        drop(stopper.await.unwrap());

        assert!(report.stopped_early);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.requeued, 1);
        assert_eq!(status_of(&f.store, f.account.id, 1).await, MessageStatus::Done);
        assert_eq!(status_of(&f.store, f.account.id, 2).await, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn progress_tracks_committed_counts() {
        let f = fixture(settings()).await;
        for uid in 1..=3 {
            f.connector.add_message(uid, raw_message("m", "x"));
        }
        let progress = Progress::default();

        let report = f
            .worker
            .run_tracked(&f.account, 2, far_deadline(), &running(), &progress)
            .await
            .unwrap();

        assert_eq!(progress.listed(), report.listed);
        assert_eq!(progress.listed(), 3);
        assert_eq!(progress.saved(), 2);
    }

    #[tokio::test]
    async fn attachments_are_uploaded_and_recorded() {
        let f = fixture(settings()).await;
        f.connector.add_message(1, raw_with_attachment("report"));
        f.connector.add_message(2, raw_with_attachment("again"));
        // Every attempt for the first attachment fails; the second succeeds.
        f.objects.fail_next(3);

        let report = f.worker.run(&f.account, 10, far_deadline(), &running()).await.unwrap();
        assert_eq!(report.succeeded, 2);

        let first = f.store.get_message(f.account.id, 1).await.unwrap().unwrap();
        let content = f.store.get_content(first.id).await.unwrap().unwrap();
        assert_eq!(content.body.trim(), "see attached");
        assert_eq!(content.attachments.len(), 1);
        assert_eq!(content.attachments[0].filename, "report.pdf");
        assert_eq!(content.attachments[0].size, 5);
        assert_eq!(content.attachments[0].storage_url, None);

        let second = f.store.get_message(f.account.id, 2).await.unwrap().unwrap();
        let content = f.store.get_content(second.id).await.unwrap().unwrap();
        assert!(content.attachments[0].storage_url.is_some());
        assert_eq!(f.objects.uploads().len(), 1);
    }

    #[tokio::test]
    async fn rejected_login_fails_account_without_touching_messages() {
        let f = fixture(settings()).await;
        f.store
            .insert_new_messages(
                f.account.id,
                &[crate::message::MessageSummary {
                    uid: 1,
                    subject: "old".into(),
                    from: "x@example.org".into(),
                    date: None,
                    has_attachment: false,
                    size: 10,
                }],
                epoch(),
            )
            .await
            .unwrap();
        f.connector.reject_login();

        let report = f.worker.run(&f.account, 10, far_deadline(), &running()).await.unwrap();

        assert!(report.is_failure());
        assert_eq!(status_of(&f.store, f.account.id, 1).await, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn list_failure_still_processes_pending() {
        let f = fixture(settings()).await;
        f.connector.add_message(1, raw_message("m", "x"));
        f.store
            .insert_new_messages(
                f.account.id,
                &[crate::message::MessageSummary {
                    uid: 1,
                    subject: "m".into(),
                    from: String::new(),
                    date: None,
                    has_attachment: false,
                    size: 1,
                }],
                epoch(),
            )
            .await
            .unwrap();
        for _ in 0..5 {
            f.connector.push_search(Script::Timeout);
        }

        let report = f.worker.run(&f.account, 10, far_deadline(), &running()).await.unwrap();

        assert!(report.is_failure());
        assert_eq!(report.succeeded, 1);
        assert_eq!(status_of(&f.store, f.account.id, 1).await, MessageStatus::Done);
    }
}

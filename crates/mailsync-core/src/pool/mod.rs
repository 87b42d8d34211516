//! One reusable IMAP session per account.
//!
//! The pool keeps a map from account to entry. The map lock is held only to
//! find or insert an entry; each entry has its own lock, held by a borrower
//! for the duration of one operation through [`PooledSession`]. The
//! scheduler guarantees a single worker per account, so that lock is almost
//! never contended.
//!
//! A pooled session is handed out again only after a health check: it must
//! still have its folder selected and answer NOOP within the probe timeout.

mod session;

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mailsync_imap::{ErrorKind, Result as ImapResult, SessionState};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::account::{Account, AccountId};
use crate::clock::Clock;
use crate::retry::{self, RetryPolicy};

pub use session::{Connector, ImapConnector, MailSession};
use session::Vacant;

/// Pool tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Sessions unused for longer than this are closed by [`SessionPool::sweep_idle`].
    pub idle_timeout: Duration,
    /// Deadline for the NOOP health probe.
    pub probe_timeout: Duration,
    /// Attempts and backoff for opening a session.
    pub connect_policy: RetryPolicy,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(240),
            probe_timeout: Duration::from_secs(5),
            connect_policy: RetryPolicy::CONNECT,
        }
    }
}

struct Entry {
    session: Box<dyn MailSession>,
    last_used: DateTime<Utc>,
}

impl Entry {
    fn vacant(now: DateTime<Utc>) -> Self {
        Self {
            session: Box::new(Vacant),
            last_used: now,
        }
    }

    async fn close(&mut self) {
        let mut session: Box<dyn MailSession> = Box::new(Vacant);
        std::mem::swap(&mut session, &mut self.session);
        session.close().await;
    }
}

/// Exclusive access to an account's session for one operation.
pub struct PooledSession {
    guard: OwnedMutexGuard<Entry>,
}

impl Deref for PooledSession {
    type Target = dyn MailSession;

    fn deref(&self) -> &Self::Target {
        &*self.guard.session
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.guard.session
    }
}

/// Sessions keyed by account.
pub struct SessionPool {
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    settings: PoolSettings,
    entries: Mutex<HashMap<AccountId, Arc<Mutex<Entry>>>>,
    invalidations: AtomicU64,
    created: AtomicU64,
}

impl SessionPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, clock: Arc<dyn Clock>, settings: PoolSettings) -> Self {
        Self {
            connector,
            clock,
            settings,
            entries: Mutex::new(HashMap::new()),
            invalidations: AtomicU64::new(0),
            created: AtomicU64::new(0),
        }
    }

    /// Returns a healthy, folder-selected session for `account`.
    ///
    /// A pooled session that fails its health check is logged out and
    /// replaced. Opening a session is retried per the connect policy.
    ///
    /// # Errors
    ///
    /// Returns the last connect error once the connect policy is used up, or
    /// the first permanent one (such as rejected credentials).
    pub async fn acquire(&self, account: &Account) -> ImapResult<PooledSession> {
        let entry = self.entry(account.id).await;
        let mut guard = entry.lock_owned().await;

        if guard.session.state() != SessionState::Disconnected {
            if self.is_healthy(&mut *guard.session).await {
                guard.last_used = self.clock.now();
                return Ok(PooledSession { guard });
            }
            debug!(account = %account.id, "pooled session failed health check");
            guard.close().await;
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }

        guard.session = self.open(account).await?;
        guard.last_used = self.clock.now();
        Ok(PooledSession { guard })
    }

    /// Closes and forgets the account's session.
    pub async fn invalidate(&self, account: AccountId) {
        let entry = self.entries.lock().await.remove(&account);
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        if let Some(entry) = entry {
            entry.lock().await.close().await;
            debug!(account = %account, "session invalidated");
        }
    }

    /// Marks the account's session as just used.
    pub async fn release(&self, account: AccountId) {
        let entry = self.entries.lock().await.get(&account).cloned();
        if let Some(entry) = entry {
            entry.lock().await.last_used = self.clock.now();
        }
    }

    /// Closes sessions idle for longer than the idle timeout, and drops
    /// entries that hold no session. Entries in use are skipped. Returns the
    /// number of sessions closed.
    pub async fn sweep_idle(&self) -> usize {
        let now = self.clock.now();
        let snapshot: Vec<(AccountId, Arc<Mutex<Entry>>)> = self
            .entries
            .lock()
            .await
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(entry)))
            .collect();

        let mut evicted = 0;
        for (id, entry) in snapshot {
            let Ok(mut guard) = entry.try_lock() else {
                continue;
            };
            let connected = guard.session.state() != SessionState::Disconnected;
            let idle = (now - guard.last_used)
                .to_std()
                .is_ok_and(|idle| idle > self.settings.idle_timeout);
            if connected && !idle {
                continue;
            }
            if connected {
                guard.close().await;
                evicted += 1;
                info!(account = %id, "idle session evicted");
            }
            drop(guard);

            let mut entries = self.entries.lock().await;
            if entries.get(&id).is_some_and(|current| Arc::ptr_eq(current, &entry)) {
                entries.remove(&id);
            }
        }
        evicted
    }

    /// Logs out every session.
    pub async fn close_all(&self) {
        let entries: Vec<_> = self.entries.lock().await.drain().collect();
        let count = entries.len();
        for (_, entry) in entries {
            entry.lock().await.close().await;
        }
        info!(sessions = count, "session pool closed");
    }

    /// Sessions discarded so far: invalidations, failed health checks and
    /// failed connect attempts.
    #[must_use]
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Sessions opened so far.
    #[must_use]
    pub fn sessions_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Number of accounts with a pool entry.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Returns true if the pool has no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    async fn entry(&self, account: AccountId) -> Arc<Mutex<Entry>> {
        let mut entries = self.entries.lock().await;
        Arc::clone(
            entries
                .entry(account)
                .or_insert_with(|| Arc::new(Mutex::new(Entry::vacant(self.clock.now())))),
        )
    }

    async fn is_healthy(&self, session: &mut dyn MailSession) -> bool {
        if session.state() != SessionState::FolderSelected {
            return false;
        }
        match tokio::time::timeout(self.settings.probe_timeout, session.noop()).await {
            Ok(Ok(())) => true,
            // The connection answered; the server just refused NOOP.
            Ok(Err(e)) if e.kind() == ErrorKind::Permanent => true,
            Ok(Err(e)) => {
                debug!(error = %e, "health probe failed");
                false
            }
            Err(_) => {
                debug!(timeout = ?self.settings.probe_timeout, "health probe timed out");
                false
            }
        }
    }

    async fn open(&self, account: &Account) -> ImapResult<Box<dyn MailSession>> {
        let result = retry::with_backoff(self.settings.connect_policy, "connect", move || async move {
            let result = self.connector.connect(account).await;
            if result.is_err() {
                self.invalidations.fetch_add(1, Ordering::Relaxed);
            }
            result
        })
        .await;

        match &result {
            Ok(_) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                info!(account = %account.id, host = %account.imap.host, "imap session created");
            }
            Err(e) => {
                warn!(account = %account.id, host = %account.imap.host, error = %e, "could not open session");
            }
        }
        result
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
    use crate::clock::ManualClock;
    use crate::testing::{FakeConnector, Script, account, epoch};

    fn pool(connector: &FakeConnector, clock: &Arc<ManualClock>) -> SessionPool {
        SessionPool::new(
            Arc::new(connector.clone()),
            Arc::clone(clock) as Arc<dyn Clock>,
            PoolSettings::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_session_is_reused() {
        let connector = FakeConnector::new();
        let clock = Arc::new(ManualClock::new(epoch()));
        let pool = pool(&connector, &clock);
        let account = account(1);

        drop(pool.acquire(&account).await.unwrap());
        drop(pool.acquire(&account).await.unwrap());

        assert_eq!(connector.connects(), 1);
        assert_eq!(pool.sessions_created(), 1);
        assert_eq!(pool.invalidations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_health_check_replaces_session() {
        let connector = FakeConnector::new();
        let clock = Arc::new(ManualClock::new(epoch()));
        let pool = pool(&connector, &clock);
        let account = account(1);

        drop(pool.acquire(&account).await.unwrap());
        connector.push_noop(Script::Timeout);
        let session = pool.acquire(&account).await.unwrap();

        assert_eq!(session.state(), SessionState::FolderSelected);
        assert_eq!(connector.connects(), 2);
        // The timed-out session was closed without a LOGOUT.
        assert_eq!(connector.closes(), 1);
        assert_eq!(connector.logouts(), 0);
        assert_eq!(pool.invalidations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_health_check_replaces_session() {
        let connector = FakeConnector::new();
        let clock = Arc::new(ManualClock::new(epoch()));
        let pool = pool(&connector, &clock);
        let account = account(1);

        drop(pool.acquire(&account).await.unwrap());
        connector.push_noop(Script::Hang);
        drop(pool.acquire(&account).await.unwrap());

        assert_eq!(connector.connects(), 2);
        assert_eq!(pool.invalidations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_count_as_invalidations() {
        let connector = FakeConnector::new();
        connector.fail_connects(2);
        let clock = Arc::new(ManualClock::new(epoch()));
        let pool = pool(&connector, &clock);

        pool.acquire(&account(1)).await.unwrap();

        assert_eq!(connector.connects(), 3);
        assert_eq!(pool.invalidations(), 2);
        assert_eq!(pool.sessions_created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_gives_up_after_three_attempts() {
        let connector = FakeConnector::new();
        connector.fail_connects(5);
        let clock = Arc::new(ManualClock::new(epoch()));
        let pool = pool(&connector, &clock);

        let err = pool.acquire(&account(1)).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(connector.connects(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_login_is_not_retried() {
        let connector = FakeConnector::new();
        connector.reject_login();
        let clock = Arc::new(ManualClock::new(epoch()));
        let pool = pool(&connector, &clock);

        let err = pool.acquire(&account(1)).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_logs_out_and_forgets() {
        let connector = FakeConnector::new();
        let clock = Arc::new(ManualClock::new(epoch()));
        let pool = pool(&connector, &clock);

        drop(pool.acquire(&account(1)).await.unwrap());
        pool.invalidate(AccountId(1)).await;

        assert!(pool.is_empty().await);
        assert_eq!(connector.logouts(), 1);
        drop(pool.acquire(&account(1)).await.unwrap());
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_only_idle_sessions() {
        let connector = FakeConnector::new();
        let clock = Arc::new(ManualClock::new(epoch()));
        let pool = pool(&connector, &clock);

        drop(pool.acquire(&account(1)).await.unwrap());
        clock.advance(chrono::Duration::seconds(200));
        drop(pool.acquire(&account(2)).await.unwrap());
        clock.advance(chrono::Duration::seconds(60));

        assert_eq!(pool.sweep_idle().await, 1);
        assert_eq!(pool.len().await, 1);
        assert_eq!(connector.logouts(), 1);

        // Refreshed by release, so it survives the next sweep.
        clock.advance(chrono::Duration::seconds(200));
        pool.release(AccountId(2)).await;
        clock.advance(chrono::Duration::seconds(60));
        assert_eq!(pool.sweep_idle().await, 0);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_skips_borrowed_sessions() {
        let connector = FakeConnector::new();
        let clock = Arc::new(ManualClock::new(epoch()));
        let pool = pool(&connector, &clock);

        let held = pool.acquire(&account(1)).await.unwrap();
        clock.advance(chrono::Duration::hours(1));

        assert_eq!(pool.sweep_idle().await, 0);
        drop(held);
        assert_eq!(pool.sweep_idle().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_all_logs_out_everything() {
        let connector = FakeConnector::new();
        let clock = Arc::new(ManualClock::new(epoch()));
        let pool = pool(&connector, &clock);

        for id in 1..=3 {
            drop(pool.acquire(&account(id)).await.unwrap());
        }
        pool.close_all().await;

        assert!(pool.is_empty().await);
        assert_eq!(connector.logouts(), 3);
    }
}

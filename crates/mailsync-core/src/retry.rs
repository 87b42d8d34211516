//! Classification-driven retry.
//!
//! Every error in the workspace reports an [`ErrorKind`], decided where the
//! error is produced. The retry loops here only look at that kind:
//!
//! - `Transient`: the session is dropped and the operation is retried after
//!   `base_delay * attempt`.
//! - `ProtocolState`: the session is dropped and the operation is retried at
//!   once. The network is fine, the session is not.
//! - `Permanent`: returned to the caller after the first attempt.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::account::Account;
use crate::pool::{MailSession, SessionPool};
use crate::{Error, ErrorKind, Result};

/// Future returned by an operation run on a borrowed session.
pub type SessionFuture<'a, T> =
    Pin<Box<dyn Future<Output = mailsync_imap::Result<T>> + Send + 'a>>;

/// Errors that know their retry class.
pub trait Classify {
    /// Retry class of this error.
    fn kind(&self) -> ErrorKind;
}

impl Classify for mailsync_imap::Error {
    fn kind(&self) -> ErrorKind {
        Self::kind(self)
    }
}

impl Classify for mailsync_smtp::Error {
    fn kind(&self) -> ErrorKind {
        crate::error::smtp_kind(Self::kind(self))
    }
}

impl Classify for Error {
    fn kind(&self) -> ErrorKind {
        Self::kind(self)
    }
}

/// Attempt budget and linear backoff step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; later delays grow linearly.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Policy for read operations.
    pub const READ: Self = Self::new(5, Duration::from_secs(2));
    /// Policy for establishing a session.
    pub const CONNECT: Self = Self::new(3, Duration::from_secs(2));
    /// Policy for SMTP submission and object uploads.
    pub const SEND: Self = Self::new(3, Duration::from_secs(2));

    /// Creates a policy. Zero attempts is treated as one.
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
            base_delay,
        }
    }

    /// Wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Runs `op` until it succeeds, fails permanently or the policy runs out.
///
/// No session is involved; this is for connecting, sending and uploading.
/// The last error is returned unchanged.
///
/// # Errors
///
/// Returns the first permanent error or the error of the last attempt.
pub async fn with_backoff<T, E, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> std::result::Result<T, E>
where
    E: Classify + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        let kind = error.kind();
        if kind == ErrorKind::Permanent || attempt >= policy.max_attempts {
            debug!(operation = label, attempt, %kind, error = %error, "giving up");
            return Err(error);
        }
        warn!(operation = label, attempt, %kind, error = %error, "attempt failed, retrying");
        if kind == ErrorKind::Transient {
            tokio::time::sleep(policy.delay(attempt)).await;
        }
        attempt += 1;
    }
}

/// Runs protocol operations on pooled sessions with retry.
#[derive(Clone)]
pub struct RetryEngine {
    pool: Arc<SessionPool>,
}

impl RetryEngine {
    /// Creates an engine over `pool`.
    #[must_use]
    pub const fn new(pool: Arc<SessionPool>) -> Self {
        Self { pool }
    }

    /// The pool sessions are borrowed from.
    #[must_use]
    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Runs `op` on the account's session.
    ///
    /// `op` is called once per attempt with a freshly acquired session, so
    /// it must own or clone whatever it needs. The session is released on
    /// success and invalidated after every non-permanent failure.
    ///
    /// # Errors
    ///
    /// Returns the first permanent error, or [`Error::RetriesExhausted`]
    /// wrapping the last error once `policy.max_attempts` are used up.
    pub async fn run<T, F>(&self, account: &Account, policy: RetryPolicy, mut op: F) -> Result<T>
    where
        T: Send,
        F: FnMut(&mut dyn MailSession) -> SessionFuture<'_, T> + Send,
    {
        let mut attempt = 1;
        loop {
            let outcome = match self.pool.acquire(account).await {
                Ok(mut session) => op(&mut *session).await,
                Err(error) => Err(error),
            };
            let error = match outcome {
                Ok(value) => {
                    self.pool.release(account.id).await;
                    return Ok(value);
                }
                Err(error) => error,
            };

            let kind = error.kind();
            if kind == ErrorKind::Permanent {
                debug!(account = %account.id, attempt, error = %error, "permanent failure");
                return Err(error.into());
            }
            self.pool.invalidate(account.id).await;
            if attempt >= policy.max_attempts {
                warn!(account = %account.id, attempt, %kind, error = %error, "retries exhausted");
                return Err(Error::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(error.into()),
                });
            }
            warn!(account = %account.id, attempt, %kind, error = %error, "operation failed, retrying");
            if kind == ErrorKind::Transient {
                tokio::time::sleep(policy.delay(attempt)).await;
            }
            attempt += 1;
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
    use crate::clock::SystemClock;
    use crate::pool::PoolSettings;
    use crate::testing::{FakeConnector, Script, account};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn engine(connector: FakeConnector) -> RetryEngine {
        let pool = SessionPool::new(
            Arc::new(connector),
            Arc::new(SystemClock),
            PoolSettings::default(),
        );
        RetryEngine::new(Arc::new(pool))
    }

    fn noop(session: &mut dyn MailSession) -> SessionFuture<'_, ()> {
        Box::pin(async move { session.noop().await })
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_back_off_and_retry() {
        let connector = FakeConnector::new();
        connector.push_noop(Script::Timeout);
        connector.push_noop(Script::Timeout);
        let engine = engine(connector.clone());

        let started = Instant::now();
        engine
            .run(&account(1), RetryPolicy::READ, noop)
            .await
            .unwrap();

        // Two failures: waits of 2s and 4s.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        assert_eq!(engine.pool().invalidations(), 2);
        assert_eq!(connector.connects(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn protocol_state_errors_retry_without_delay() {
        let connector = FakeConnector::new();
        connector.push_noop(Script::Bad);
        let engine = engine(connector.clone());

        let started = Instant::now();
        engine
            .run(&account(1), RetryPolicy::READ, noop)
            .await
            .unwrap();

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(engine.pool().invalidations(), 1);
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let connector = FakeConnector::new();
        connector.push_noop(Script::NonExistent);
        let engine = engine(connector.clone());

        let calls = AtomicU32::new(0);
        let err = engine
            .run(&account(1), RetryPolicy::READ, |session| {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { session.noop().await })
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.pool().invalidations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_wraps_last_error() {
        let connector = FakeConnector::new();
        for _ in 0..3 {
            connector.push_noop(Script::Timeout);
        }
        let engine = engine(connector.clone());

        let err = engine
            .run(&account(1), RetryPolicy::new(3, Duration::from_secs(1)), noop)
            .await
            .unwrap_err();

        match err {
            Error::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert_eq!(source.kind(), ErrorKind::Transient);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.pool().invalidations(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failures_are_absorbed_by_the_pool() {
        let connector = FakeConnector::new();
        connector.fail_connects(2);
        let engine = engine(connector.clone());

        engine
            .run(&account(7), RetryPolicy::READ, noop)
            .await
            .unwrap();

        assert_eq!(connector.connects(), 3);
        assert_eq!(engine.pool().invalidations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_helper_stops_on_permanent() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), mailsync_imap::Error> =
            with_backoff(RetryPolicy::SEND, "upload", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(mailsync_imap::Error::Auth("denied".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result = with_backoff(RetryPolicy::SEND, "upload", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(mailsync_imap::Error::Timeout(Duration::from_secs(1)))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }
}

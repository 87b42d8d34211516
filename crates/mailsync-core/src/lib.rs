//! # mailsync-core
//!
//! Sync engine for `mailsync`.
//!
//! This crate provides:
//! - **Session Pool** - one health-checked IMAP session per account
//! - **Retry Engine** - retries driven by each error's [`ErrorKind`]
//! - **Mail Client** - list, fetch, attachment, send and forward operations
//! - **Scheduler** - exclusive account claims under a global worker ceiling
//! - **Sync Worker** - the list and content phases of one account
//! - Local storage (`SQLite`), MIME flattening and object storage
//! - Recurring jobs and configuration

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod account;
pub mod client;
pub mod clock;
pub mod config;
mod error;
pub mod jobs;
pub mod message;
pub mod mime;
pub mod pool;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod worker;

#[cfg(test)]
mod testing;

pub use account::{Account, AccountId, AccountSeed, AccountStatus, ClaimState, Security};
pub use client::{MailClient, OutgoingMessage, SmtpSubmitter, Submitter};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use error::{Error, ErrorKind, Result};
pub use jobs::{IdleSweep, Job, PeriodicTrigger, StuckClaimCleanup, spawn_recurring};
pub use message::{MessageRecord, MessageStatus, MessageSummary, StatusCounts};
pub use mime::ParsedMessage;
pub use pool::{Connector, ImapConnector, MailSession, PoolSettings, SessionPool};
pub use retry::{RetryEngine, RetryPolicy};
pub use scheduler::{RunSummary, Scheduler, SchedulerSettings, SyncAck, SyncRequest};
pub use storage::{FsObjectStore, ObjectStore};
pub use store::{RunRecord, Store};
pub use worker::{Progress, SyncWorker, WorkerReport, WorkerSettings};

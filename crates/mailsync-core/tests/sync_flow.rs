//! End-to-end sync tests.
//!
//! A scripted in-memory mail server stands in for IMAP; everything else
//! (store, pool, retry engine, scheduler, workers, object storage) is the
//! real thing.

#![allow(clippy::unwrap_used)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailsync_imap::{FetchedSummary, Result as ImapResult, SearchCriteria, SessionState, Uid};

use mailsync_core::{
    Account, AccountSeed, ClaimState, Clock, Connector, FsObjectStore, MailClient, MailSession,
    ManualClock, MessageStatus, PoolSettings, RetryEngine, Scheduler, SchedulerSettings,
    SessionPool, SmtpSubmitter, Store, SyncRequest, SyncWorker, WorkerSettings,
};

type Mailboxes = Arc<Mutex<HashMap<String, BTreeMap<u32, Vec<u8>>>>>;

/// One mailbox per account address. Unknown addresses fail to log in.
#[derive(Clone, Default)]
struct MailServer {
    mailboxes: Mailboxes,
}

impl MailServer {
    fn deliver(&self, address: &str, uid: u32, raw: Vec<u8>) {
        self.mailboxes
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .insert(uid, raw);
    }
}

#[async_trait]
impl Connector for MailServer {
    async fn connect(&self, account: &Account) -> ImapResult<Box<dyn MailSession>> {
        if !self.mailboxes.lock().unwrap().contains_key(&account.address) {
            return Err(mailsync_imap::Error::Auth("unknown user".into()));
        }
        Ok(Box::new(Mailbox {
            mailboxes: Arc::clone(&self.mailboxes),
            address: account.address.clone(),
            open: true,
        }))
    }
}

struct Mailbox {
    mailboxes: Mailboxes,
    address: String,
    open: bool,
}

impl Mailbox {
    fn messages(&self) -> BTreeMap<u32, Vec<u8>> {
        self.mailboxes.lock().unwrap()[&self.address].clone()
    }
}

#[async_trait]
impl MailSession for Mailbox {
    fn state(&self) -> SessionState {
        if self.open {
            SessionState::FolderSelected
        } else {
            SessionState::Disconnected
        }
    }

    async fn noop(&mut self) -> ImapResult<()> {
        Ok(())
    }

    async fn search(&mut self, criteria: SearchCriteria) -> ImapResult<Vec<Uid>> {
        let uids: Vec<u32> = self.messages().keys().copied().collect();
        let selected = match criteria {
            SearchCriteria::All => uids,
            SearchCriteria::UidFrom(from) => {
                let newer: Vec<u32> = uids.iter().copied().filter(|u| *u >= from.get()).collect();
                if newer.is_empty() {
                    uids.last().copied().into_iter().collect()
                } else {
                    newer
                }
            }
        };
        Ok(selected.into_iter().filter_map(Uid::new).collect())
    }

    async fn fetch_summaries(&mut self, uids: &[Uid]) -> ImapResult<Vec<FetchedSummary>> {
        let messages = self.messages();
        Ok(uids
            .iter()
            .filter_map(|uid| {
                let raw = messages.get(&uid.get())?;
                Some(FetchedSummary {
                    uid: *uid,
                    size: u32::try_from(raw.len()).unwrap(),
                    header: raw.clone(),
                    body_structure: None,
                })
            })
            .collect())
    }

    async fn fetch_raw(&mut self, uid: Uid) -> ImapResult<Vec<u8>> {
        self.messages()
            .get(&uid.get())
            .cloned()
            .ok_or(mailsync_imap::Error::MessageNotFound(uid))
    }

    async fn close(&mut self) {
        self.open = false;
    }
}

fn start() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-05-01T08:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn plain(subject: &str) -> Vec<u8> {
    format!(
        "From: sender@example.com\r\nSubject: {subject}\r\nDate: Wed, 1 May 2024 07:00:00 +0000\r\n\r\nHello.\r\n"
    )
    .into_bytes()
}

fn with_attachment(subject: &str) -> Vec<u8> {
    format!(
        "From: sender@example.com\r\n\
         Subject: {subject}\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: multipart/mixed; boundary=\"b\"\r\n\
         \r\n\
         --b\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         See attached.\r\n\
         --b\r\n\
         Content-Type: text/plain; name=\"notes.txt\"\r\n\
         Content-Disposition: attachment; filename=\"notes.txt\"\r\n\
         \r\n\
         remember the milk\r\n\
         --b--\r\n"
    )
    .into_bytes()
}

struct Daemon {
    store: Store,
    scheduler: Scheduler,
    objects_dir: std::path::PathBuf,
}

async fn daemon(server: &MailServer, addresses: &[&str]) -> Daemon {
    let store = Store::in_memory().await.unwrap();
    for address in addresses {
        store
            .upsert_account(&AccountSeed::with_email(address, "pw"))
            .await
            .unwrap();
    }

    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(start()));
    let pool = Arc::new(SessionPool::new(
        Arc::new(server.clone()),
        Arc::clone(&clock),
        PoolSettings::default(),
    ));
    let client = MailClient::new(
        RetryEngine::new(pool),
        Arc::new(SmtpSubmitter::new(Duration::from_secs(1), Duration::from_secs(1))),
        Arc::clone(&clock),
    );
    let objects_dir = std::env::temp_dir().join(format!(
        "mailsync-sync-flow-{}-{}",
        std::process::id(),
        addresses.join("-")
    ));
    let worker = SyncWorker::new(
        store.clone(),
        Arc::new(client),
        Arc::new(FsObjectStore::new(objects_dir.clone())),
        Arc::clone(&clock),
        WorkerSettings {
            pacing: Duration::ZERO,
            ..WorkerSettings::default()
        },
    );
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(worker),
        clock,
        SchedulerSettings::default(),
    );
    Daemon {
        store,
        scheduler,
        objects_dir,
    }
}

#[tokio::test]
async fn syncs_accounts_and_isolates_failures() {
    let server = MailServer::default();
    server.deliver("alice@gmail.com", 1, plain("first"));
    server.deliver("alice@gmail.com", 2, with_attachment("notes"));
    let d = daemon(&server, &["alice@gmail.com", "mallory@gmail.com"]).await;

    let (ack, run) = d.scheduler.trigger(SyncRequest::default()).await.unwrap();
    assert_eq!(ack.accepted, 2);
    let summary = run.await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.listed, 2);
    assert_eq!(summary.fetched, 2);

    let accounts = d.store.list_accounts().await.unwrap();
    let alice = accounts.iter().find(|a| a.address == "alice@gmail.com").unwrap();
    let mallory = accounts.iter().find(|a| a.address == "mallory@gmail.com").unwrap();
    assert_eq!(alice.claim_state, ClaimState::Idle);
    assert_eq!(alice.last_content_sync_time, Some(start()));
    assert_eq!(mallory.claim_state, ClaimState::Idle);
    assert_eq!(
        mallory.last_content_sync_time,
        Some(start() - chrono::Duration::hours(1))
    );

    let notes = d.store.get_message(alice.id, 2).await.unwrap().unwrap();
    assert_eq!(notes.status, MessageStatus::Done);
    let content = d.store.get_content(notes.id).await.unwrap().unwrap();
    assert!(content.body.contains("See attached."));
    assert_eq!(content.attachments.len(), 1);
    let url = content.attachments[0].storage_url.clone().unwrap();
    let path = url.strip_prefix("file://").unwrap();
    assert!(std::fs::read(path).unwrap().starts_with(b"remember the milk"));

    let runs = d.store.recent_runs(10).await.unwrap();
    assert_eq!(runs[0].summary, summary);

    std::fs::remove_dir_all(&d.objects_dir).ok();
}

#[tokio::test]
async fn later_runs_only_fetch_new_mail() {
    let server = MailServer::default();
    server.deliver("bob@gmail.com", 10, plain("old"));
    let d = daemon(&server, &["bob@gmail.com"]).await;

    let (_, run) = d.scheduler.trigger(SyncRequest::default()).await.unwrap();
    assert_eq!(run.await.unwrap().fetched, 1);

    server.deliver("bob@gmail.com", 11, plain("new"));
    let (_, run) = d
        .scheduler
        .trigger(SyncRequest {
            node: None,
            limit: Some(5),
        })
        .await
        .unwrap();
    let summary = run.await.unwrap();
    assert_eq!(summary.listed, 1);
    assert_eq!(summary.fetched, 1);

    let bob = &d.store.list_accounts().await.unwrap()[0];
    let counts = d.store.status_counts(bob.id).await.unwrap();
    assert_eq!(counts.done, 2);
    assert_eq!(counts.pending, 0);
}

#[tokio::test]
async fn other_nodes_are_left_alone() {
    let server = MailServer::default();
    server.deliver("carol@gmail.com", 1, plain("hi"));
    let d = daemon(&server, &["carol@gmail.com"]).await;

    let (ack, run) = d
        .scheduler
        .trigger(SyncRequest {
            node: Some(7),
            limit: None,
        })
        .await
        .unwrap();
    assert_eq!(ack.accepted, 0);
    assert_eq!(run.await.unwrap().accounts, 0);

    let carol = &d.store.list_accounts().await.unwrap()[0];
    assert!(carol.last_content_sync_time.is_none());
}

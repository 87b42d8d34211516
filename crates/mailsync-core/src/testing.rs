//! In-memory stand-ins for the IMAP server and object storage.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailsync_imap::{
    BodyStructure, Error as ImapError, ErrorKind, FetchedSummary, ResponseCode,
    Result as ImapResult, SearchCriteria, SessionState, Uid,
};

use crate::account::{
    Account, AccountId, AccountStatus, ClaimState, ImapConfig, Security, SmtpConfig,
};
use crate::clock::ManualClock;
use crate::pool::{Connector, MailSession};
use crate::storage::ObjectStore;

pub fn epoch() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn account(id: i64) -> Account {
    Account {
        id: AccountId(id),
        address: format!("user{id}@example.com"),
        username: format!("user{id}@example.com"),
        password: "secret".to_string(),
        imap: ImapConfig {
            host: "imap.example.com".to_string(),
            port: 993,
            security: Security::Tls,
        },
        smtp: SmtpConfig {
            host: "smtp.example.com".to_string(),
            port: 587,
            security: Security::StartTls,
        },
        node: 0,
        status: AccountStatus::Active,
        claim_state: ClaimState::Idle,
        claimed_at: None,
        last_list_sync_time: None,
        last_content_sync_time: None,
    }
}

pub fn raw_message(subject: &str, body: &str) -> Vec<u8> {
    format!(
        "From: Alice <alice@example.org>\r\n\
         Subject: {subject}\r\n\
         Date: Fri, 01 Mar 2024 10:00:00 +0000\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         {body}\r\n"
    )
    .into_bytes()
}

pub fn raw_with_attachment(subject: &str) -> Vec<u8> {
    format!(
        "From: Alice <alice@example.org>\r\n\
         Subject: {subject}\r\n\
         Content-Type: multipart/mixed; boundary=\"b\"\r\n\
         \r\n\
         --b\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         see attached\r\n\
         --b\r\n\
         Content-Type: application/pdf; name=\"report.pdf\"\r\n\
         Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
         Content-Transfer-Encoding: base64\r\n\
         \r\n\
         JVBERi0=\r\n\
         --b--\r\n"
    )
    .into_bytes()
}

/// A scripted failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Network timeout.
    Timeout,
    /// BAD reply to a command sent in the wrong state.
    Bad,
    /// NO [NONEXISTENT].
    NonExistent,
    /// FETCH completed without data.
    Gone,
    /// Never answers.
    Hang,
}

impl Script {
    fn error(self, uid: Uid) -> ImapError {
        match self {
            Self::Timeout | Self::Hang => ImapError::Timeout(Duration::from_secs(60)),
            Self::Bad => ImapError::Bad("Command received in Invalid state.".to_string()),
            Self::NonExistent => ImapError::No {
                code: Some(ResponseCode::NonExistent),
                text: "no such message".to_string(),
            },
            Self::Gone => ImapError::MessageNotFound(uid),
        }
    }
}

#[derive(Default)]
struct Server {
    connects: u32,
    failing_connects: u32,
    reject_login: bool,
    logouts: u32,
    closes: u32,
    noops: VecDeque<Script>,
    searches: VecDeque<Script>,
    fetch_failures: HashMap<u32, VecDeque<Script>>,
    messages: BTreeMap<u32, (Vec<u8>, Option<BodyStructure>)>,
    fetched: Vec<u32>,
    fetch_cost: Option<(Arc<ManualClock>, chrono::Duration)>,
}

/// A fake server shared by every session it opens.
#[derive(Clone, Default)]
pub struct FakeConnector {
    server: Arc<Mutex<Server>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_connects(&self, n: u32) {
        self.server.lock().unwrap().failing_connects = n;
    }

    pub fn reject_login(&self) {
        self.server.lock().unwrap().reject_login = true;
    }

    pub fn push_noop(&self, script: Script) {
        self.server.lock().unwrap().noops.push_back(script);
    }

    pub fn push_search(&self, script: Script) {
        self.server.lock().unwrap().searches.push_back(script);
    }

    pub fn fail_fetch(&self, uid: u32, script: Script) {
        self.server
            .lock()
            .unwrap()
            .fetch_failures
            .entry(uid)
            .or_default()
            .push_back(script);
    }

    pub fn add_message(&self, uid: u32, raw: Vec<u8>) {
        self.server.lock().unwrap().messages.insert(uid, (raw, None));
    }

    pub fn add_message_with(&self, uid: u32, raw: Vec<u8>, structure: BodyStructure) {
        self.server
            .lock()
            .unwrap()
            .messages
            .insert(uid, (raw, Some(structure)));
    }

    /// Every full-source fetch, served or failed, moves `clock` by `cost`.
    pub fn charge_fetches(&self, clock: Arc<ManualClock>, cost: chrono::Duration) {
        self.server.lock().unwrap().fetch_cost = Some((clock, cost));
    }

    pub fn connects(&self) -> u32 {
        self.server.lock().unwrap().connects
    }

    /// LOGOUT commands sent; a session already disconnected sends none.
    pub fn logouts(&self) -> u32 {
        self.server.lock().unwrap().logouts
    }

    /// Sessions closed, connected or not.
    pub fn closes(&self) -> u32 {
        self.server.lock().unwrap().closes
    }

    /// UIDs whose full source was served, in order.
    pub fn fetched(&self) -> Vec<u32> {
        self.server.lock().unwrap().fetched.clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _account: &Account) -> ImapResult<Box<dyn MailSession>> {
        let mut server = self.server.lock().unwrap();
        server.connects += 1;
        if server.failing_connects > 0 {
            server.failing_connects -= 1;
            return Err(ImapError::Timeout(Duration::from_secs(30)));
        }
        if server.reject_login {
            return Err(ImapError::Auth("invalid credentials".to_string()));
        }
        Ok(Box::new(FakeSession {
            server: Arc::clone(&self.server),
            state: SessionState::FolderSelected,
        }))
    }
}

struct FakeSession {
    server: Arc<Mutex<Server>>,
    state: SessionState,
}

impl FakeSession {
    async fn fail<T>(&mut self, script: Script, uid: Uid) -> ImapResult<T> {
        if script == Script::Hang {
            std::future::pending::<()>().await;
        }
        let error = script.error(uid);
        if error.kind() != ErrorKind::Permanent {
            self.state = SessionState::Disconnected;
        }
        Err(error)
    }

    fn check(&self) -> ImapResult<()> {
        if self.state == SessionState::FolderSelected {
            Ok(())
        } else {
            Err(ImapError::InvalidState("session is disconnected".to_string()))
        }
    }
}

fn any_uid() -> Uid {
    Uid::new(1).unwrap()
}

#[async_trait]
impl MailSession for FakeSession {
    fn state(&self) -> SessionState {
        self.state
    }

    async fn noop(&mut self) -> ImapResult<()> {
        self.check()?;
        let script = self.server.lock().unwrap().noops.pop_front();
        match script {
            Some(script) => self.fail(script, any_uid()).await,
            None => Ok(()),
        }
    }

    async fn search(&mut self, criteria: SearchCriteria) -> ImapResult<Vec<Uid>> {
        self.check()?;
        let script = self.server.lock().unwrap().searches.pop_front();
        if let Some(script) = script {
            return self.fail(script, any_uid()).await;
        }
        let server = self.server.lock().unwrap();
        let all: Vec<u32> = server.messages.keys().copied().collect();
        let uids = match criteria {
            SearchCriteria::All => all,
            SearchCriteria::UidFrom(from) => {
                let newer: Vec<u32> = all.iter().copied().filter(|u| *u >= from.get()).collect();
                // `n:*` always matches the highest message.
                if newer.is_empty() {
                    all.last().copied().into_iter().collect()
                } else {
                    newer
                }
            }
        };
        Ok(uids.into_iter().filter_map(Uid::new).collect())
    }

    async fn fetch_summaries(&mut self, uids: &[Uid]) -> ImapResult<Vec<FetchedSummary>> {
        self.check()?;
        let server = self.server.lock().unwrap();
        let mut summaries: Vec<FetchedSummary> = uids
            .iter()
            .filter_map(|uid| {
                let (raw, structure) = server.messages.get(&uid.get())?;
                let end = raw
                    .windows(4)
                    .position(|w| w == b"\r\n\r\n")
                    .map_or(raw.len(), |p| p + 4);
                Some(FetchedSummary {
                    uid: *uid,
                    size: u32::try_from(raw.len()).unwrap(),
                    header: raw[..end].to_vec(),
                    body_structure: structure.clone(),
                })
            })
            .collect();
        summaries.sort_by_key(|s| s.uid);
        Ok(summaries)
    }

    async fn fetch_raw(&mut self, uid: Uid) -> ImapResult<Vec<u8>> {
        self.check()?;
        let script = {
            let mut server = self.server.lock().unwrap();
            if let Some((clock, cost)) = &server.fetch_cost {
                clock.advance(*cost);
            }
            server
                .fetch_failures
                .get_mut(&uid.get())
                .and_then(VecDeque::pop_front)
        };
        if let Some(script) = script {
            return self.fail(script, uid).await;
        }
        let mut server = self.server.lock().unwrap();
        let raw = server.messages.get(&uid.get()).map(|(raw, _)| raw.clone());
        match raw {
            Some(raw) => {
                server.fetched.push(uid.get());
                Ok(raw)
            }
            None => Err(ImapError::MessageNotFound(uid)),
        }
    }

    async fn close(&mut self) {
        let mut server = self.server.lock().unwrap();
        server.closes += 1;
        if self.state != SessionState::Disconnected {
            server.logouts += 1;
        }
        drop(server);
        self.state = SessionState::Disconnected;
    }
}

/// Object store that keeps uploads in memory.
#[derive(Default)]
pub struct MemoryObjectStore {
    uploads: Mutex<Vec<(String, usize)>>,
    failures: Mutex<u32>,
}

impl MemoryObjectStore {
    pub fn fail_next(&self, n: u32) {
        *self.failures.lock().unwrap() = n;
    }

    pub fn uploads(&self) -> Vec<(String, usize)> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, filename: &str, bytes: &[u8], _mime_type: &str) -> crate::Result<String> {
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(crate::Error::ObjectStore("bucket unavailable".to_string()));
            }
        }
        let mut uploads = self.uploads.lock().unwrap();
        uploads.push((filename.to_string(), bytes.len()));
        Ok(format!("mem://{}/{filename}", uploads.len()))
    }
}

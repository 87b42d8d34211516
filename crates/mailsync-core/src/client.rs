//! High-level mail operations.
//!
//! Every IMAP call goes through the [`RetryEngine`], every submission
//! through [`with_backoff`](crate::retry::with_backoff), so callers only see
//! permanent errors or exhausted retries.

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use mailsync_imap::{BodyStructure, FetchedSummary, SearchCriteria, Uid};
use mailsync_smtp::Address;
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::clock::Clock;
use crate::message::MessageSummary;
use crate::mime::{self, AttachmentData, HeaderSummary, ParsedMessage};
use crate::retry::{self, RetryEngine, RetryPolicy};
use crate::{Error, Result};

/// Hands a finished message to the account's outgoing server.
#[async_trait]
pub trait Submitter: Send + Sync {
    /// Submits `message` for delivery to `recipients`.
    async fn submit(
        &self,
        account: &Account,
        from: &Address,
        recipients: &[Address],
        message: &[u8],
    ) -> mailsync_smtp::Result<()>;
}

/// Submits over SMTP with the account's credentials.
#[derive(Debug, Clone, Copy)]
pub struct SmtpSubmitter {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl SmtpSubmitter {
    /// Creates a submitter with the given transport timeouts.
    #[must_use]
    pub const fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout,
        }
    }
}

#[async_trait]
impl Submitter for SmtpSubmitter {
    async fn submit(
        &self,
        account: &Account,
        from: &Address,
        recipients: &[Address],
        message: &[u8],
    ) -> mailsync_smtp::Result<()> {
        let config = account.submit_config(self.connect_timeout, self.io_timeout);
        mailsync_smtp::submit(&config, from, recipients, message).await
    }
}

/// An email message to send.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    /// Sender; the account address when empty.
    pub from: String,
    /// Recipient addresses.
    pub to: Vec<String>,
    /// CC addresses.
    pub cc: Vec<String>,
    /// BCC addresses, never written to the headers.
    pub bcc: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain text body.
    pub body: String,
}

impl OutgoingMessage {
    /// Creates a message without recipients.
    #[must_use]
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            ..Self::default()
        }
    }

    /// Sets the sender.
    #[must_use]
    pub fn from(mut self, sender: impl Into<String>) -> Self {
        self.from = sender.into();
        self
    }

    /// Adds a recipient.
    #[must_use]
    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.to.push(recipient.into());
        self
    }

    /// Adds a CC recipient.
    #[must_use]
    pub fn cc(mut self, recipient: impl Into<String>) -> Self {
        self.cc.push(recipient.into());
        self
    }

    /// Adds a BCC recipient.
    #[must_use]
    pub fn bcc(mut self, recipient: impl Into<String>) -> Self {
        self.bcc.push(recipient.into());
        self
    }

    fn recipients(&self) -> impl Iterator<Item = &String> {
        self.to.iter().chain(&self.cc).chain(&self.bcc)
    }

    fn to_rfc5322(&self, from: &str, date: &str, message_id: &str) -> String {
        let mut message = String::new();
        let _ = write!(message, "From: {}\r\n", header_value(from));
        if !self.to.is_empty() {
            let _ = write!(message, "To: {}\r\n", header_value(&self.to.join(", ")));
        }
        if !self.cc.is_empty() {
            let _ = write!(message, "Cc: {}\r\n", header_value(&self.cc.join(", ")));
        }
        let _ = write!(message, "Subject: {}\r\n", encode_subject(&self.subject));
        let _ = write!(message, "Date: {date}\r\n");
        let _ = write!(message, "Message-ID: {message_id}\r\n");
        message.push_str("MIME-Version: 1.0\r\n");
        message.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        message.push_str("Content-Transfer-Encoding: 8bit\r\n");
        message.push_str("\r\n");
        message.push_str(&crlf(&self.body));
        message
    }
}

/// Mail operations for one account at a time.
pub struct MailClient {
    engine: RetryEngine,
    submitter: Arc<dyn Submitter>,
    clock: Arc<dyn Clock>,
    read_policy: RetryPolicy,
    send_policy: RetryPolicy,
    sequence: AtomicU64,
}

impl MailClient {
    /// Creates a client with the default read and send policies.
    #[must_use]
    pub fn new(engine: RetryEngine, submitter: Arc<dyn Submitter>, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine,
            submitter,
            clock,
            read_policy: RetryPolicy::READ,
            send_policy: RetryPolicy::SEND,
            sequence: AtomicU64::new(0),
        }
    }

    /// Replaces the read and send policies.
    #[must_use]
    pub const fn with_policies(mut self, read: RetryPolicy, send: RetryPolicy) -> Self {
        self.read_policy = read;
        self.send_policy = send;
        self
    }

    /// The engine IMAP calls go through.
    #[must_use]
    pub const fn engine(&self) -> &RetryEngine {
        &self.engine
    }

    /// Lists messages newer than `last_uid`, oldest first, at most `limit`.
    ///
    /// Without a known UID the `limit` most recent messages are listed.
    /// Messages that vanish between search and fetch are left out.
    ///
    /// # Errors
    ///
    /// Returns the first permanent error or exhausted retries.
    pub async fn list_new(
        &self,
        account: &Account,
        last_uid: Option<u32>,
        limit: usize,
    ) -> Result<Vec<MessageSummary>> {
        let last_uid = last_uid.filter(|uid| *uid > 0);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let criteria = match last_uid.and_then(Uid::new) {
            Some(last) => match last.next() {
                Some(next) => SearchCriteria::UidFrom(next),
                None => return Ok(Vec::new()),
            },
            None => SearchCriteria::All,
        };

        let found = self
            .engine
            .run(account, self.read_policy, move |session| {
                Box::pin(async move { session.search(criteria).await })
            })
            .await?;
        let selected = select_uids(found, last_uid, limit);
        debug!(account = %account.id, ?last_uid, selected = selected.len(), "search done");
        if selected.is_empty() {
            return Ok(Vec::new());
        }

        let fetched = self
            .engine
            .run(account, self.read_policy, |session| {
                let uids = selected.clone();
                Box::pin(async move { session.fetch_summaries(&uids).await })
            })
            .await?;
        Ok(fetched.into_iter().map(summarize).collect())
    }

    /// Fetches the full source of one message.
    ///
    /// # Errors
    ///
    /// Returns a permanent `MessageNotFound` if the server has no such
    /// message, or exhausted retries.
    pub async fn fetch_raw(&self, account: &Account, uid: u32) -> Result<Vec<u8>> {
        let uid = Uid::new(uid).ok_or_else(|| Error::MessageNotFound(format!("UID {uid}")))?;
        self.engine
            .run(account, self.read_policy, move |session| {
                Box::pin(async move { session.fetch_raw(uid).await })
            })
            .await
    }

    /// Fetches and flattens one message.
    ///
    /// # Errors
    ///
    /// Same as [`fetch_raw`](Self::fetch_raw), plus MIME errors.
    pub async fn fetch_content(&self, account: &Account, uid: u32) -> Result<ParsedMessage> {
        let raw = self.fetch_raw(account, uid).await?;
        mime::parse_message(&raw)
    }

    /// Fetches the `index`-th attachment (0-based) of a message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AttachmentNotFound`] if the message has fewer
    /// attachments, otherwise the errors of
    /// [`fetch_content`](Self::fetch_content).
    pub async fn fetch_attachment(
        &self,
        account: &Account,
        uid: u32,
        index: usize,
    ) -> Result<AttachmentData> {
        let parsed = self.fetch_content(account, uid).await?;
        parsed
            .attachments
            .into_iter()
            .nth(index)
            .ok_or(Error::AttachmentNotFound { uid, index })
    }

    /// Sends a plain-text message from the account.
    ///
    /// # Errors
    ///
    /// Returns an SMTP error for invalid addresses, permanent rejections or
    /// once the send policy is used up.
    pub async fn send(&self, account: &Account, message: &OutgoingMessage) -> Result<()> {
        let sender = if message.from.is_empty() {
            account.address.as_str()
        } else {
            message.from.as_str()
        };
        let recipients = parse_recipients(message.recipients())?;
        let raw = message.to_rfc5322(sender, &self.date(), &self.message_id(account));
        self.submit(account, sender, &recipients, raw.as_bytes()).await?;
        info!(account = %account.id, recipients = recipients.len(), "message sent");
        Ok(())
    }

    /// Forwards message `uid` to `to`, with `note` above the original. The
    /// original is attached unchanged as `message/rfc822`.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`fetch_raw`](Self::fetch_raw) and
    /// [`send`](Self::send).
    pub async fn forward(
        &self,
        account: &Account,
        uid: u32,
        to: &[String],
        note: &str,
    ) -> Result<()> {
        let recipients = parse_recipients(to.iter())?;
        let original = self.fetch_raw(account, uid).await?;
        let headers = mime::parse_headers(&original).unwrap_or_else(|e| {
            warn!(account = %account.id, uid, error = %e, "unreadable headers in forwarded message");
            HeaderSummary::default()
        });

        let boundary = format!("mailsync-{}", self.next_sequence());
        let mut raw = String::new();
        let _ = write!(raw, "From: {}\r\n", header_value(&account.address));
        let _ = write!(raw, "To: {}\r\n", header_value(&to.join(", ")));
        let _ = write!(raw, "Subject: {}\r\n", encode_subject(&forward_subject(&headers.subject)));
        let _ = write!(raw, "Date: {}\r\n", self.date());
        let _ = write!(raw, "Message-ID: {}\r\n", self.message_id(account));
        raw.push_str("MIME-Version: 1.0\r\n");
        let _ = write!(raw, "Content-Type: multipart/mixed; boundary=\"{boundary}\"\r\n\r\n");
        let _ = write!(raw, "--{boundary}\r\n");
        raw.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        raw.push_str("Content-Transfer-Encoding: 8bit\r\n\r\n");
        raw.push_str(&crlf(note));
        let _ = write!(raw, "\r\n--{boundary}\r\n");
        raw.push_str("Content-Type: message/rfc822; name=\"original_message.eml\"\r\n");
        raw.push_str("Content-Disposition: attachment; filename=\"original_message.eml\"\r\n\r\n");

        let mut bytes = raw.into_bytes();
        bytes.extend_from_slice(&original);
        if !original.ends_with(b"\r\n") {
            bytes.extend_from_slice(b"\r\n");
        }
        bytes.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

        self.submit(account, &account.address, &recipients, &bytes).await?;
        info!(account = %account.id, uid, recipients = recipients.len(), "message forwarded");
        Ok(())
    }

    async fn submit(
        &self,
        account: &Account,
        sender: &str,
        recipients: &[Address],
        message: &[u8],
    ) -> Result<()> {
        let from = Address::from_header(sender)?;
        retry::with_backoff(self.send_policy, "smtp submit", || {
            self.submitter.submit(account, &from, recipients, message)
        })
        .await?;
        Ok(())
    }

    fn date(&self) -> String {
        self.clock.now().to_rfc2822()
    }

    fn message_id(&self, account: &Account) -> String {
        let domain = account
            .address
            .rsplit_once('@')
            .map_or("localhost", |(_, domain)| domain);
        format!(
            "<{}.{}@{domain}>",
            self.clock.now().timestamp_micros(),
            self.next_sequence()
        )
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }
}

/// Picks the UIDs to fetch from a search result.
fn select_uids(mut found: Vec<Uid>, last_uid: Option<u32>, limit: usize) -> Vec<Uid> {
    found.sort_unstable();
    found.dedup();
    match last_uid {
        Some(last) => {
            // `n:*` matches the highest message even when it is older.
            found.retain(|uid| uid.get() > last);
            found.truncate(limit);
            found
        }
        None => {
            let skip = found.len().saturating_sub(limit);
            found.split_off(skip)
        }
    }
}

fn summarize(fetched: FetchedSummary) -> MessageSummary {
    let headers = mime::parse_headers(&fetched.header).unwrap_or_else(|e| {
        warn!(uid = fetched.uid.get(), error = %e, "unreadable summary headers");
        HeaderSummary::default()
    });
    MessageSummary {
        uid: fetched.uid.get(),
        subject: headers.subject,
        from: headers.from,
        date: headers.date,
        has_attachment: fetched
            .body_structure
            .as_ref()
            .is_some_and(BodyStructure::has_attachment),
        size: fetched.size,
    }
}

fn parse_recipients<'a>(recipients: impl Iterator<Item = &'a String>) -> Result<Vec<Address>> {
    let parsed = recipients
        .map(|r| Address::from_header(r))
        .collect::<mailsync_smtp::Result<Vec<_>>>()?;
    if parsed.is_empty() {
        return Err(mailsync_smtp::Error::InvalidAddress("no recipients".to_string()).into());
    }
    Ok(parsed)
}

fn forward_subject(subject: &str) -> String {
    if subject.get(..4).is_some_and(|prefix| prefix.eq_ignore_ascii_case("fwd:")) {
        subject.to_string()
    } else {
        format!("Fwd: {subject}")
    }
}

/// RFC 2047 encoded-word for non-ASCII subjects.
fn encode_subject(subject: &str) -> String {
    let subject = header_value(subject);
    if subject.is_ascii() {
        subject
    } else {
        format!("=?UTF-8?B?{}?=", BASE64.encode(subject.as_bytes()))
    }
}

fn header_value(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

fn crlf(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
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
    use crate::pool::{PoolSettings, SessionPool};
    use crate::testing::{
        FakeConnector, Script, account, epoch, raw_message, raw_with_attachment,
    };
    use mailsync_imap::parser::Disposition;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSubmitter {
        sent: Mutex<Vec<(String, Vec<String>, Vec<u8>)>>,
        failures: Mutex<Vec<mailsync_smtp::Error>>,
    }

    #[async_trait]
    impl Submitter for RecordingSubmitter {
        async fn submit(
            &self,
            _account: &Account,
            from: &Address,
            recipients: &[Address],
            message: &[u8],
        ) -> mailsync_smtp::Result<()> {
            if let Some(error) = self.failures.lock().unwrap().pop() {
                return Err(error);
            }
            self.sent.lock().unwrap().push((
                from.to_string(),
                recipients.iter().map(ToString::to_string).collect(),
                message.to_vec(),
            ));
            Ok(())
        }
    }

    fn client(connector: &FakeConnector, submitter: &Arc<RecordingSubmitter>) -> MailClient {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(epoch()));
        let pool = SessionPool::new(
            Arc::new(connector.clone()),
            Arc::clone(&clock),
            PoolSettings::default(),
        );
        MailClient::new(
            RetryEngine::new(Arc::new(pool)),
            Arc::clone(submitter) as Arc<dyn Submitter>,
            clock,
        )
    }

    fn uids(ns: &[u32]) -> Vec<Uid> {
        ns.iter().map(|n| Uid::new(*n).unwrap()).collect()
    }

    #[test]
    fn selection_without_cursor_keeps_newest() {
        let picked = select_uids(uids(&[5, 1, 3, 9, 7]), None, 2);
        assert_eq!(picked, uids(&[7, 9]));
    }

    #[test]
    fn selection_with_cursor_keeps_oldest_newer() {
        let picked = select_uids(uids(&[12, 11, 10, 13]), Some(10), 2);
        assert_eq!(picked, uids(&[11, 12]));

        // The server answers `11:*` with 10 when nothing is newer.
        assert!(select_uids(uids(&[10]), Some(10), 5).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn list_new_reads_headers_and_attachment_flag() {
        let connector = FakeConnector::new();
        connector.add_message(101, raw_message("first", "one"));
        let structure = BodyStructure::Multipart {
            parts: vec![BodyStructure::Single {
                media_type: "application".into(),
                subtype: "pdf".into(),
                params: vec![],
                size: 5,
                disposition: Some(Disposition {
                    kind: "attachment".into(),
                    params: vec![("filename".into(), "a.pdf".into())],
                }),
            }],
            subtype: "mixed".into(),
            disposition: None,
        };
        connector.add_message_with(102, raw_with_attachment("second"), structure);
        let submitter = Arc::new(RecordingSubmitter::default());
        let client = client(&connector, &submitter);

        let listed = client.list_new(&account(1), None, 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].uid, 101);
        assert_eq!(listed[0].subject, "first");
        assert_eq!(listed[0].from, "Alice <alice@example.org>");
        assert!(listed[0].date.is_some());
        assert!(!listed[0].has_attachment);
        assert!(listed[1].has_attachment);
    }

    #[tokio::test(start_paused = true)]
    async fn list_new_after_cursor() {
        let connector = FakeConnector::new();
        for uid in [4, 5, 6, 7] {
            connector.add_message(uid, raw_message(&format!("m{uid}"), "x"));
        }
        let submitter = Arc::new(RecordingSubmitter::default());
        let client = client(&connector, &submitter);

        let listed = client.list_new(&account(1), Some(5), 1).await.unwrap();
        assert_eq!(listed.iter().map(|m| m.uid).collect::<Vec<_>>(), vec![6]);

        let listed = client.list_new(&account(1), Some(7), 10).await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn list_survives_transient_search_failure() {
        let connector = FakeConnector::new();
        connector.add_message(1, raw_message("only", "x"));
        connector.push_search(Script::Timeout);
        let submitter = Arc::new(RecordingSubmitter::default());
        let client = client(&connector, &submitter);

        let listed = client.list_new(&account(1), None, 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(client.engine().pool().invalidations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_content_and_attachments() {
        let connector = FakeConnector::new();
        connector.add_message(8, raw_with_attachment("report"));
        let submitter = Arc::new(RecordingSubmitter::default());
        let client = client(&connector, &submitter);

        let parsed = client.fetch_content(&account(1), 8).await.unwrap();
        assert_eq!(parsed.subject, "report");
        assert_eq!(parsed.text.trim(), "see attached");

        let attachment = client.fetch_attachment(&account(1), 8, 0).await.unwrap();
        assert_eq!(attachment.filename, "report.pdf");
        assert_eq!(attachment.bytes, b"%PDF-");

        let err = client.fetch_attachment(&account(1), 8, 1).await.unwrap_err();
        assert!(matches!(err, Error::AttachmentNotFound { uid: 8, index: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_message_is_permanent() {
        let connector = FakeConnector::new();
        let submitter = Arc::new(RecordingSubmitter::default());
        let client = client(&connector, &submitter);

        let err = client.fetch_content(&account(1), 42).await.unwrap_err();
        assert!(err.is_message_gone());
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn send_builds_message_and_retries_busy_server() {
        let connector = FakeConnector::new();
        let submitter = Arc::new(RecordingSubmitter::default());
        submitter
            .failures
            .lock()
            .unwrap()
            .push(mailsync_smtp::Error::reply(451, "try later"));
        let client = client(&connector, &submitter);

        let message = OutgoingMessage::new("Grüße", "line one\nline two")
            .to("Bob <bob@example.org>")
            .bcc("carol@example.org");
        client.send(&account(1), &message).await.unwrap();

        let sent = submitter.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (from, recipients, raw) = &sent[0];
        assert_eq!(from, "user1@example.com");
        assert_eq!(recipients, &vec!["bob@example.org".to_string(), "carol@example.org".to_string()]);

        let text = String::from_utf8(raw.clone()).unwrap();
        assert!(text.contains("Subject: =?UTF-8?B?R3LDvMOfZQ==?=\r\n"));
        assert!(text.contains("Message-ID: <"));
        assert!(!text.contains("carol"));
        assert!(text.ends_with("line one\r\nline two"));
    }

    #[tokio::test(start_paused = true)]
    async fn send_rejects_missing_recipients() {
        let connector = FakeConnector::new();
        let submitter = Arc::new(RecordingSubmitter::default());
        let client = client(&connector, &submitter);

        let err = client
            .send(&account(1), &OutgoingMessage::new("hi", "body"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Permanent);
        assert!(submitter.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn forward_attaches_original() {
        let connector = FakeConnector::new();
        connector.add_message(3, raw_message("status", "all good"));
        let submitter = Arc::new(RecordingSubmitter::default());
        let client = client(&connector, &submitter);

        client
            .forward(&account(1), 3, &["bob@example.org".to_string()], "FYI")
            .await
            .unwrap();

        let sent = submitter.sent.lock().unwrap();
        let raw = &sent[0].2;
        let parsed = mime::parse_message(raw).unwrap();
        assert_eq!(parsed.subject, "Fwd: status");
        assert_eq!(parsed.text.trim(), "FYI");
        assert_eq!(parsed.attachments.len(), 1);
        assert_eq!(parsed.attachments[0].filename, "original_message.eml");
        assert_eq!(parsed.attachments[0].mime_type, "message/rfc822");
    }

    #[test]
    fn forward_subject_is_not_doubled() {
        assert_eq!(forward_subject("hello"), "Fwd: hello");
        assert_eq!(forward_subject("FWD: hello"), "FWD: hello");
    }
}

//! Integration tests for the IMAP client.
//!
//! Most tests replay canned server output through an in-memory stream; the
//! last one runs a scripted server on a loopback socket.

#![allow(clippy::unwrap_used)]

use std::io::{self, Cursor};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpListener;

use mailsync_imap::{
    Config, ErrorKind, SearchCriteria, Security, Session, SessionConfig, SessionState, Uid,
};

/// Stream that returns predefined responses and swallows writes.
struct MockStream {
    responses: Cursor<Vec<u8>>,
}

impl MockStream {
    fn new(responses: &[u8]) -> Self {
        Self {
            responses: Cursor::new(responses.to_vec()),
        }
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let pos = usize::try_from(self.responses.position()).unwrap();
        let data = self.responses.get_ref();
        if pos >= data.len() {
            return Poll::Ready(Ok(()));
        }
        let to_read = (data.len() - pos).min(buf.remaining());
        buf.put_slice(&data[pos..pos + to_read]);
        self.responses.set_position((pos + to_read) as u64);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

const LOGIN_AND_SELECT: &[u8] = b"* OK [CAPABILITY IMAP4rev1] ready\r\n\
A0001 OK LOGIN completed\r\n\
* 3 EXISTS\r\n\
* OK [UIDVALIDITY 1700000000] ok\r\n\
* OK [UIDNEXT 13] ok\r\n\
A0002 OK [READ-WRITE] SELECT completed\r\n";

fn uid(n: u32) -> Uid {
    Uid::new(n).unwrap()
}

fn config() -> SessionConfig {
    SessionConfig::new("imap.example.com", 993).credentials("alice@example.com", "secret")
}

#[tokio::test]
async fn search_then_fetch_summaries() {
    let mut script = LOGIN_AND_SELECT.to_vec();
    script.extend_from_slice(b"* SEARCH 10 11 12\r\nA0003 OK SEARCH completed\r\n");
    script.extend_from_slice(
        b"* 1 FETCH (UID 11 RFC822.SIZE 2048 BODYSTRUCTURE (\"TEXT\" \"PLAIN\" (\"CHARSET\" \"UTF-8\") NIL NIL \"7BIT\" 2048 40 NIL NIL NIL NIL) BODY[HEADER.FIELDS (SUBJECT FROM DATE)] {20}\r\nSubject: Quarterly\r\n)\r\n\
A0004 OK FETCH completed\r\n",
    );
    let mut session = Session::from_stream(MockStream::new(&script), &config())
        .await
        .unwrap();

    let uids = session
        .search(SearchCriteria::UidFrom(uid(10)))
        .await
        .unwrap();
    assert_eq!(uids, vec![uid(10), uid(11), uid(12)]);

    let summaries = session.fetch_summaries(&[uid(11)]).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].size, 2048);
    assert_eq!(summaries[0].header, b"Subject: Quarterly\r\n");
    let structure = summaries[0].body_structure.as_ref().unwrap();
    assert_eq!(structure.mime_type(), "text/plain");
    assert!(!structure.has_attachment());
}

#[tokio::test]
async fn fetch_raw_returns_literal() {
    let mut script = LOGIN_AND_SELECT.to_vec();
    script.extend_from_slice(
        b"* 3 FETCH (UID 12 BODY[] {28}\r\nSubject: hi\r\n\r\nHello there\r\n)\r\nA0003 OK FETCH completed\r\n",
    );
    let mut session = Session::from_stream(MockStream::new(&script), &config())
        .await
        .unwrap();

    let raw = session.fetch_raw(uid(12)).await.unwrap();
    assert_eq!(raw, b"Subject: hi\r\n\r\nHello there\r\n");
}

#[tokio::test]
async fn closed_connection_is_transient_and_disconnects() {
    let mut session = Session::from_stream(MockStream::new(LOGIN_AND_SELECT), &config())
        .await
        .unwrap();

    let err = session.noop().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn rejected_login_is_permanent() {
    let script = b"* OK ready\r\nA0001 NO [AUTHENTICATIONFAILED] bad password\r\n";
    let err = Session::from_stream(MockStream::new(script), &config())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permanent);
}

/// Answers each tagged command with a canned reply until LOGOUT.
async fn scripted_server(listener: TcpListener) {
    let (socket, _) = listener.accept().await.unwrap();
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    write.write_all(b"* OK scripted server ready\r\n").await.unwrap();

    while let Some(line) = lines.next_line().await.unwrap() {
        let (tag, command) = line.split_once(' ').unwrap();
        let reply = match command.split(' ').next().unwrap() {
            "LOGIN" => format!("{tag} OK logged in\r\n"),
            "SELECT" => format!("* 0 EXISTS\r\n{tag} OK [READ-WRITE] selected\r\n"),
            "NOOP" => format!("{tag} OK noop\r\n"),
            "LOGOUT" => {
                let reply = format!("* BYE bye\r\n{tag} OK logout\r\n");
                write.write_all(reply.as_bytes()).await.unwrap();
                return;
            }
            _ => format!("{tag} BAD unknown\r\n"),
        };
        write.write_all(reply.as_bytes()).await.unwrap();
    }
}

#[tokio::test]
async fn open_over_loopback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(scripted_server(listener));

    let transport = Config::builder("127.0.0.1")
        .port(port)
        .security(Security::None)
        .build();
    let config = config().transport(transport);

    let mut session = Session::open(&config).await.unwrap();
    assert_eq!(session.state(), SessionState::FolderSelected);
    session.noop().await.unwrap();
    session.logout().await;

    server.await.unwrap();
}

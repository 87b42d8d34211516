//! Submits a message to a scripted SMTP server on a loopback socket.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use mailsync_smtp::{Address, ErrorKind, Security, SubmitConfig, submit};

/// Accepts one connection, answers the dialog and returns the DATA payload.
async fn scripted_server(listener: TcpListener, rcpt_reply: &'static str) -> Vec<String> {
    let (socket, _) = listener.accept().await.unwrap();
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    write.write_all(b"220 loopback ESMTP\r\n").await.unwrap();

    let mut data = Vec::new();
    let mut in_data = false;
    while let Some(line) = lines.next_line().await.unwrap() {
        if in_data {
            if line == "." {
                in_data = false;
                write.write_all(b"250 2.0.0 queued\r\n").await.unwrap();
            } else {
                data.push(line);
            }
            continue;
        }
        let reply = match line.split([' ', ':']).next().unwrap() {
            "EHLO" => "250-loopback\r\n250 AUTH PLAIN\r\n",
            "AUTH" => "235 2.7.0 ok\r\n",
            "MAIL" => "250 ok\r\n",
            "RCPT" => rcpt_reply,
            "DATA" => {
                in_data = true;
                "354 end with .\r\n"
            }
            "QUIT" => {
                write.write_all(b"221 bye\r\n").await.unwrap();
                break;
            }
            _ => "500 unknown\r\n",
        };
        write.write_all(reply.as_bytes()).await.unwrap();
    }
    data
}

fn config(port: u16) -> SubmitConfig {
    SubmitConfig::new("127.0.0.1", port)
        .security(Security::None)
        .credentials("alice@example.com", "secret")
        .timeouts(Duration::from_secs(5), Duration::from_secs(5))
}

#[tokio::test]
async fn submits_over_loopback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(scripted_server(listener, "250 ok\r\n"));

    let from = Address::new("alice@example.com").unwrap();
    let to = Address::new("bob@example.com").unwrap();
    submit(&config(port), &from, &[to], b"Subject: hi\r\n\r\n.leading dot\r\n")
        .await
        .unwrap();

    let data = server.await.unwrap();
    assert_eq!(data, vec!["Subject: hi", "", "..leading dot"]);
}

#[tokio::test]
async fn mailbox_full_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(scripted_server(listener, "452 4.2.2 mailbox full\r\n"));

    let from = Address::new("alice@example.com").unwrap();
    let to = Address::new("bob@example.com").unwrap();
    let err = submit(&config(port), &from, &[to], b"hello").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
}

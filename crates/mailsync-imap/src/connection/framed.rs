//! Framed I/O for the IMAP protocol.
//!
//! IMAP responses are CRLF-terminated lines that may embed `{n}` literals.
//! [`FramedStream`] returns one whole response at a time, literals included.

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{Error, Result};

const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Maximum line length accepted from the server.
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Maximum literal size accepted from the server.
const MAX_LITERAL_SIZE: usize = 100 * 1024 * 1024;

/// Buffered reader and writer speaking IMAP framing.
pub struct FramedStream<S> {
    reader: BufReader<S>,
    write_buffer: BytesMut,
    io_timeout: Option<Duration>,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a framed stream without a read timeout.
    pub fn new(stream: S) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, stream),
            write_buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            io_timeout: None,
        }
    }

    /// Bounds every [`read_response`](Self::read_response) by `timeout`.
    #[must_use]
    pub const fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    /// Returns the read timeout, if one is set.
    #[must_use]
    pub const fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout
    }

    /// Reads one complete response, following any literals.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the configured timeout elapses, an I/O
    /// error when the peer closes, or a protocol error for oversized input.
    pub async fn read_response(&mut self) -> Result<Vec<u8>> {
        match self.io_timeout {
            Some(limit) => tokio::time::timeout(limit, self.read_response_inner())
                .await
                .map_err(|_| Error::Timeout(limit))?,
            None => self.read_response_inner().await,
        }
    }

    async fn read_response_inner(&mut self) -> Result<Vec<u8>> {
        let mut response = Vec::new();

        loop {
            let line = self.read_line().await?;
            response.extend_from_slice(&line);

            let Some(literal_len) = parse_literal_length(&line) else {
                break;
            };
            if literal_len > MAX_LITERAL_SIZE {
                return Err(Error::Protocol(format!(
                    "literal too large: {literal_len} bytes (max {MAX_LITERAL_SIZE})"
                )));
            }
            let mut literal = vec![0u8; literal_len];
            self.reader.read_exact(&mut literal).await?;
            response.extend_from_slice(&literal);
        }

        Ok(response)
    }

    async fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();

        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }

            // A CR at the end of the previous chunk pairs with a LF here.
            if line.last() == Some(&b'\r') && buf[0] == b'\n' {
                line.push(b'\n');
                self.reader.consume(1);
                break;
            }

            if let Some(pos) = find_crlf(buf) {
                line.extend_from_slice(&buf[..pos + 2]);
                self.reader.consume(pos + 2);
                break;
            }

            let len = buf.len();
            line.extend_from_slice(buf);
            self.reader.consume(len);

            if line.len() > MAX_LINE_LENGTH {
                return Err(Error::Protocol("line too long".to_string()));
            }
        }

        Ok(line)
    }

    /// Writes a serialized command and flushes.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write fails.
    pub async fn write_command(&mut self, data: &[u8]) -> Result<()> {
        self.write_buffer.clear();
        self.write_buffer.extend_from_slice(data);

        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buffer).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Consumes the framed stream and returns the inner stream.
    ///
    /// Buffered input is discarded, which is only safe at a point where the
    /// server has nothing in flight (after a STARTTLS completion).
    pub fn into_inner(self) -> S {
        self.reader.into_inner()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Parses `{123}` or `{123+}` at the end of a CRLF line.
fn parse_literal_length(line: &[u8]) -> Option<usize> {
    let line = line.strip_suffix(b"\r\n")?;
    let inner = line.strip_suffix(b"}")?;
    let inner = inner.strip_suffix(b"+").unwrap_or(inner);
    let open = inner.iter().rposition(|&b| b == b'{')?;
    std::str::from_utf8(&inner[open + 1..]).ok()?.parse().ok()
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
    use crate::ErrorKind;

    #[test]
    fn literal_length() {
        assert_eq!(parse_literal_length(b"* 1 FETCH (BODY[] {42}\r\n"), Some(42));
        assert_eq!(parse_literal_length(b"A1 APPEND {7+}\r\n"), Some(7));
        assert_eq!(parse_literal_length(b"* OK done\r\n"), None);
        assert_eq!(parse_literal_length(b"* OK {abc}\r\n"), None);
        assert_eq!(parse_literal_length(b"{5}"), None);
    }

    #[tokio::test]
    async fn reads_lines_and_literals() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* OK ready\r\n")
            .read(b"* 1 FETCH (BODY[] {5}\r\nhello)\r\n")
            .build();
        let mut framed = FramedStream::new(mock);

        assert_eq!(framed.read_response().await.unwrap(), b"* OK ready\r\n");
        assert_eq!(
            framed.read_response().await.unwrap(),
            b"* 1 FETCH (BODY[] {5}\r\nhello)\r\n"
        );
    }

    #[tokio::test]
    async fn crlf_split_across_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(b"A0001 OK done\r")
            .read(b"\n")
            .build();
        let mut framed = FramedStream::new(mock);
        assert_eq!(framed.read_response().await.unwrap(), b"A0001 OK done\r\n");
    }

    #[tokio::test]
    async fn eof_is_transient() {
        let mock = tokio_test::io::Builder::new().read(b"* OK partial").build();
        let mut framed = FramedStream::new(mock);
        let err = framed.read_response().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn oversized_literal_rejected() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* 1 FETCH (BODY[] {999999999999}\r\n")
            .build();
        let mut framed = FramedStream::new(mock);
        assert!(matches!(
            framed.read_response().await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn read_times_out() {
        let mock = tokio_test::io::Builder::new()
            .wait(Duration::from_secs(10))
            .build();
        let mut framed = FramedStream::new(mock).with_io_timeout(Duration::from_secs(1));
        let err = framed.read_response().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn writes_command() {
        let mock = tokio_test::io::Builder::new()
            .write(b"A0001 NOOP\r\n")
            .build();
        let mut framed = FramedStream::new(mock);
        framed.write_command(b"A0001 NOOP\r\n").await.unwrap();
    }
}

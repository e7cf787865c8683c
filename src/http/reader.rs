//! Buffered, bounded, timeout-aware stream reader.
//!
//! Wraps one half of a TCP stream and feeds the HTTP parser. When multiple
//! documents arrive on the same connection, the same reader instance must be
//! reused so buffered bytes carry over between messages.
//!
//! Two timeouts govern reads: while the buffer is empty (between messages)
//! the generous [`idle_timeout`](crate::limits::ReaderLimits::idle_timeout)
//! applies; once any byte of the current message has been read, the stricter
//! [`active_timeout`](crate::limits::ReaderLimits::active_timeout) takes
//! over. Each read pulls at most `max_read_size` bytes so one connection
//! cannot monopolize the reactor.

use memchr::memchr;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::errors::{Error, HttpError, Result};
use crate::limits::ReaderLimits;

pub struct HttpReader<R> {
    reader: R,
    limits: ReaderLimits,
    buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin> HttpReader<R> {
    pub fn new(reader: R, limits: ReaderLimits) -> Self {
        Self {
            reader,
            limits,
            buffer: Vec::new(),
        }
    }

    /// Pull one block from the underlying stream into the buffer.
    ///
    /// A zero-byte read signals end-of-stream ([`Error::Eof`]), which is a
    /// distinct condition from the window expiring ([`Error::Timeout`]).
    pub async fn read_block(&mut self) -> Result<()> {
        let window = if self.buffer.is_empty() {
            self.limits.idle_timeout
        } else {
            self.limits.active_timeout
        };

        let mut chunk = vec![0u8; self.limits.max_read_size];
        let count = timeout(window, self.reader.read(&mut chunk))
            .await
            .map_err(|_| Error::Timeout)??;

        if count == 0 {
            return Err(Error::Eof);
        }

        self.buffer.extend_from_slice(&chunk[..count]);
        Ok(())
    }

    /// Read exactly `length` bytes.
    pub async fn read(&mut self, length: usize) -> Result<Vec<u8>> {
        while self.buffer.len() < length {
            self.read_block().await?;
        }
        let rest = self.buffer.split_off(length);
        Ok(std::mem::replace(&mut self.buffer, rest))
    }

    /// Read the next line, terminated by `\n` or `\r\n`, as ASCII.
    ///
    /// The terminator is trimmed. A line longer than `max_line_length`,
    /// with or without a terminator in sight, fails with
    /// `431 Request Header Fields Too Large`.
    pub async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(position) = memchr(b'\n', &self.buffer) {
                let rest = self.buffer.split_off(position + 1);
                let mut line = std::mem::replace(&mut self.buffer, rest);
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.len() > self.limits.max_line_length {
                    return Err(HttpError::header_fields_too_large("header line too long").into());
                }
                if !line.is_ascii() {
                    return Err(HttpError::bad_request("non-ascii header data").into());
                }
                // ASCII verified above, so this cannot fail
                return Ok(String::from_utf8(line).expect("ascii line"));
            }

            if self.buffer.len() > self.limits.max_line_length {
                return Err(
                    HttpError::header_fields_too_large("no end of line encountered").into(),
                );
            }
            self.read_block().await?;
        }
    }

    pub(crate) fn limits(&self) -> &ReaderLimits {
        &self.limits
    }

    /// True if bytes of the current message are already buffered.
    pub(crate) fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }
}

//! Connection guard
//!
//! Wraps a freshly accepted stream and bounds two resources a hostile peer
//! could otherwise hold on to: time and line-buffer memory.
//!
//! The deadline starts when the connection is accepted and is only re-armed by
//! a complete line. Dribbling bytes in below any single-read timeout does not
//! buy more time.

use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardConfig {
    /// Time a peer has to deliver each complete line, starting at accept.
    pub timeout: Duration,
    /// Largest line, excluding the terminator, that will be buffered.
    pub max_line_length: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            max_line_length: 10 * 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("connection deadline exceeded")]
    Timeout,
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GuardError {
    /// Whether the peer was cut off for breaching a guard limit, as opposed to
    /// a transport failure.
    pub fn is_limit(&self) -> bool {
        matches!(self, GuardError::Timeout | GuardError::LineTooLong { .. })
    }
}

pub struct GuardedConnection<S> {
    stream: S,
    buf: BytesMut,
    deadline: Instant,
    config: GuardConfig,
}

impl<S> GuardedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, config: GuardConfig) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
            deadline: Instant::now() + config.timeout,
            config,
        }
    }

    /// Next line without its `\n` / `\r\n` terminator, or `None` at end of
    /// stream. A final unterminated line is returned as is.
    pub async fn read_line(&mut self) -> Result<Option<String>, GuardError> {
        let limit = self.config.max_line_length;

        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let len = if pos > 0 && self.buf[pos - 1] == b'\r' { pos - 1 } else { pos };
                if len > limit {
                    return Err(GuardError::LineTooLong { limit });
                }
                let line = self.buf.split_to(pos + 1);
                self.deadline = Instant::now() + self.config.timeout;
                return Ok(Some(decode_line(&line)));
            }

            // One byte past the limit is only allowed if it is a `\r` whose
            // `\n` has not arrived yet.
            let over = match self.buf.len().checked_sub(limit) {
                Some(0) | None => false,
                Some(1) => self.buf.last() != Some(&b'\r'),
                Some(_) => true,
            };
            if over {
                return Err(GuardError::LineTooLong { limit });
            }

            self.buf.reserve(READ_CHUNK);
            let n = match timeout_at(self.deadline, self.stream.read_buf(&mut self.buf)).await {
                Ok(read) => read?,
                Err(_) => return Err(GuardError::Timeout),
            };

            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let line = decode_line(&self.buf.split());
                if line.len() > limit {
                    return Err(GuardError::LineTooLong { limit });
                }
                return Ok(Some(line));
            }
        }
    }

    /// Write `line` followed by `\n`, bounded by the current deadline.
    pub async fn write_line(&mut self, line: &str) -> Result<(), GuardError> {
        let mut out = Vec::with_capacity(line.len() + 1);
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');

        let deadline = self.deadline;
        let stream = &mut self.stream;
        match timeout_at(deadline, async move {
            stream.write_all(&out).await?;
            stream.flush().await
        })
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(GuardError::Timeout),
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), GuardError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

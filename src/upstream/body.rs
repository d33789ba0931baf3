//! Upstream response bodies and their HTTP/1.1 framing.

use std::fmt;
use std::io;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::TransportError;

/// Largest upstream body we are willing to buffer (64 MiB).
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// How the end of a response body is signalled (RFC 9112 §6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Exactly this many bytes follow the head.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// The body runs until the origin closes the connection.
    UntilClose,
}

/// A response body that has not been read yet.
///
/// The transport hands one of these out with the response head; reading it is
/// left to whoever consumes the response. [`collect`](Self::collect) drains it
/// into memory, removing the transfer framing.
pub struct UpstreamBody {
    kind: Kind,
}

enum Kind {
    Full(Bytes),
    Stream {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        buffered: BytesMut,
        framing: Framing,
        io_timeout: Option<Duration>,
    },
}

impl UpstreamBody {
    /// A body with no content.
    pub fn empty() -> Self {
        Self::full(Bytes::new())
    }

    /// A body that is already in memory.
    pub fn full(bytes: impl Into<Bytes>) -> Self {
        Self {
            kind: Kind::Full(bytes.into()),
        }
    }

    /// A body still to be read from `reader`.
    ///
    /// `buffered` holds bytes already read past the response head.
    pub fn from_reader<R>(reader: R, buffered: BytesMut, framing: Framing) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            kind: Kind::Stream {
                reader: Box::new(reader),
                buffered,
                framing,
                io_timeout: None,
            },
        }
    }

    /// Bounds every individual read of a streamed body.
    #[must_use]
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        if let Kind::Stream { io_timeout, .. } = &mut self.kind {
            *io_timeout = Some(timeout);
        }
        self
    }

    /// Reads the whole body into memory.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Io`]: the connection failed or closed before the
    ///   framing said the body was complete.
    /// - [`TransportError::Timeout`]: a single read took longer than the I/O timeout.
    /// - [`TransportError::MalformedResponse`]: the chunked encoding is invalid.
    /// - [`TransportError::BodyTooLarge`]: the body exceeds [`MAX_BODY_SIZE`].
    pub async fn collect(self) -> Result<Bytes, TransportError> {
        match self.kind {
            Kind::Full(bytes) => Ok(bytes),
            Kind::Stream {
                reader,
                buffered,
                framing,
                io_timeout,
            } => {
                let source = Source {
                    reader,
                    buf: buffered,
                    io_timeout,
                };
                match framing {
                    Framing::Length(len) => source.read_exact_len(len).await,
                    Framing::UntilClose => source.read_until_close().await,
                    Framing::Chunked => source.read_chunked().await,
                }
            }
        }
    }
}

impl fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Full(bytes) => f.debug_tuple("UpstreamBody::Full").field(&bytes.len()).finish(),
            Kind::Stream { framing, .. } => f
                .debug_struct("UpstreamBody::Stream")
                .field("framing", framing)
                .finish_non_exhaustive(),
        }
    }
}

struct Source {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    buf: BytesMut,
    io_timeout: Option<Duration>,
}

impl Source {
    /// Reads more data into the buffer. Returns the number of bytes read,
    /// zero meaning EOF.
    async fn fill(&mut self) -> Result<usize, TransportError> {
        self.buf.reserve(READ_CHUNK);
        let read = self.reader.read_buf(&mut self.buf);
        let n = match self.io_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| TransportError::Timeout { phase: "body read" })??,
            None => read.await?,
        };
        Ok(n)
    }

    async fn fill_or_eof(&mut self, context: &'static str) -> Result<(), TransportError> {
        if self.fill().await? == 0 {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                context,
            )));
        }
        Ok(())
    }

    async fn read_exact_len(mut self, len: u64) -> Result<Bytes, TransportError> {
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= MAX_BODY_SIZE)
            .ok_or(TransportError::BodyTooLarge {
                max_bytes: MAX_BODY_SIZE,
            })?;

        while self.buf.len() < len {
            self.fill_or_eof("origin closed before sending the full body")
                .await?;
        }
        self.buf.truncate(len);
        Ok(self.buf.freeze())
    }

    async fn read_until_close(mut self) -> Result<Bytes, TransportError> {
        loop {
            if self.buf.len() > MAX_BODY_SIZE {
                return Err(TransportError::BodyTooLarge {
                    max_bytes: MAX_BODY_SIZE,
                });
            }
            if self.fill().await? == 0 {
                return Ok(self.buf.freeze());
            }
        }
    }

    async fn read_chunked(mut self) -> Result<Bytes, TransportError> {
        let mut body = BytesMut::new();

        loop {
            let (consumed, size) = loop {
                match httparse::parse_chunk_size(&self.buf) {
                    Ok(httparse::Status::Complete(parsed)) => break parsed,
                    Ok(httparse::Status::Partial) => {
                        self.fill_or_eof("origin closed inside a chunk header")
                            .await?
                    }
                    Err(httparse::InvalidChunkSize) => {
                        return Err(TransportError::MalformedResponse(
                            "invalid chunk size".to_owned(),
                        ));
                    }
                }
            };
            self.buf.advance(consumed);

            if size == 0 {
                self.skip_trailers().await?;
                return Ok(body.freeze());
            }

            let size = usize::try_from(size)
                .ok()
                .filter(|size| body.len() + size <= MAX_BODY_SIZE)
                .ok_or(TransportError::BodyTooLarge {
                    max_bytes: MAX_BODY_SIZE,
                })?;

            while self.buf.len() < size + 2 {
                self.fill_or_eof("origin closed inside a chunk").await?;
            }
            if &self.buf[size..size + 2] != b"\r\n" {
                return Err(TransportError::MalformedResponse(
                    "chunk data not followed by CRLF".to_owned(),
                ));
            }
            body.extend_from_slice(&self.buf[..size]);
            self.buf.advance(size + 2);
        }
    }

    // Trailer fields are discarded; the body ends at the first empty line.
    async fn skip_trailers(&mut self) -> Result<(), TransportError> {
        loop {
            match self.buf.windows(2).position(|w| w == b"\r\n") {
                Some(0) => {
                    self.buf.advance(2);
                    return Ok(());
                }
                Some(end) => self.buf.advance(end + 2),
                None => {
                    self.fill_or_eof("origin closed inside chunked trailers")
                        .await?
                }
            }
        }
    }
}

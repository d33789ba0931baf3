//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler function.
//! Supports HTTP/1.1 persistent connections (keep-alive) out of the box. Every
//! connection runs on its own Tokio task, so requests on different connections
//! are handled concurrently.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// How long a connection may sit without sending a byte before it is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// The HTTP/1.1 listener in front of the proxy.
///
/// Binds to a TCP address and dispatches incoming HTTP/1.1 requests to a
/// handler function.
///
/// # Examples
///
/// ```rust,no_run
/// use rcache::server::Server;
/// use rcache::http::{Request, Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(|_req: Request| async {
///         Response::new(StatusCode::OK).body("Hello!")
///     }).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    idle_timeout: Duration,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        })
    }

    /// Sets how long a client connection may stay silent, between or within
    /// requests, before it is dropped.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections and dispatches requests to `handler`
    /// until the process is terminated.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        self.run_until(handler, std::future::pending()).await
    }

    /// Starts accepting connections and dispatches requests to `handler`
    /// until `shutdown` resolves.
    ///
    /// The handler receives a [`Request`] and must return a [`Future`] that
    /// resolves to a [`Response`]. The handler is wrapped in an [`Arc`] and
    /// shared across all spawned Tokio tasks, so it must be `Send + Sync + 'static`.
    ///
    /// Once `shutdown` completes the listener stops accepting; connections
    /// already in flight finish on their own tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run_until<H, F, S>(self, handler: H, shutdown: S) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
        S: Future<Output = ()>,
    {
        let handler = Arc::new(handler);
        info!(address = %self.local_addr, "rcache listening");

        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => {
                    info!(address = %self.local_addr, "shutdown requested: no longer accepting");
                    break;
                }
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);
            let idle_timeout = self.idle_timeout;

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler, idle_timeout).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }

        Ok(())
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection or either
/// side signals `Connection: close`, or the peer stays silent for longer
/// than `idle_timeout`.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
    idle_timeout: Duration,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        // A pipelined request may already be sitting in the buffer.
        if buf.is_empty() || matches!(Request::parse(&buf), Err(RequestError::Incomplete)) {
            let Some(bytes_read) = read_idle(&mut stream, &mut buf, idle_timeout).await? else {
                debug!(peer = %peer_addr, "idle timeout: closing connection");
                break;
            };
            if bytes_read == 0 {
                debug!(peer = %peer_addr, "connection closed by peer");
                break;
            }
        }

        // Guard against excessively large requests.
        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large: sending 413");
            reject(&mut stream, StatusCode::PAYLOAD_TOO_LARGE, "Request entity too large").await?;
            break;
        }

        // Attempt to parse the buffered data as an HTTP request.
        let (mut request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                // Headers not yet fully received: read more data.
                continue;
            }
            Err(e @ RequestError::UnsupportedTransferEncoding(_)) => {
                warn!(peer = %peer_addr, error = %e, "unsupported request framing: sending 501");
                reject(&mut stream, StatusCode::NOT_IMPLEMENTED, &e.to_string()).await?;
                break;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request: sending 400");
                reject(&mut stream, StatusCode::BAD_REQUEST, &format!("Bad Request: {e}")).await?;
                break;
            }
        };

        let content_length = request.content_length().unwrap_or(0);
        if content_length > MAX_REQUEST_SIZE {
            let e = RequestError::BodyTooLarge {
                max_bytes: MAX_REQUEST_SIZE,
            };
            warn!(peer = %peer_addr, error = %e, "sending 413");
            reject(&mut stream, StatusCode::PAYLOAD_TOO_LARGE, &e.to_string()).await?;
            break;
        }

        // Wait for the full body to arrive.
        let total_needed = body_offset + content_length;
        if buf.len() < total_needed {
            let Some(bytes_read) = read_idle(&mut stream, &mut buf, idle_timeout).await? else {
                debug!(peer = %peer_addr, "idle timeout mid-body: closing connection");
                break;
            };
            if bytes_read == 0 {
                debug!(peer = %peer_addr, "connection closed mid-body");
                break;
            }
            continue;
        }

        request.set_peer_addr(peer_addr);
        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            uri = %request.request_uri(),
            "dispatching request"
        );

        let response = handler(request).await.keep_alive_if(keep_alive);
        let keep_alive = response.is_keep_alive();
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        // Drop the consumed request bytes from the buffer.
        buf.advance(total_needed);

        if !keep_alive {
            debug!(peer = %peer_addr, "client asked to close the connection");
            break;
        }
    }

    Ok(())
}

// `None` when nothing arrived within `idle_timeout`.
async fn read_idle(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    idle_timeout: Duration,
) -> std::io::Result<Option<usize>> {
    match tokio::time::timeout(idle_timeout, stream.read_buf(buf)).await {
        Ok(read) => read.map(Some),
        Err(_) => Ok(None),
    }
}

async fn reject(stream: &mut TcpStream, status: StatusCode, message: &str) -> std::io::Result<()> {
    let response = Response::new(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(message.to_owned())
        .keep_alive(false);
    stream.write_all(&response.into_bytes()).await?;
    stream.flush().await
}

impl Response {
    // A handler may force `close`; the client may too.
    fn keep_alive_if(self, client_keep_alive: bool) -> Self {
        let keep = self.is_keep_alive() && client_keep_alive;
        self.keep_alive(keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    async fn spawn_echo_server() -> (SocketAddr, oneshot::Sender<()>) {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            server
                .run_until(
                    |req: Request| async move {
                        let peer = req.peer_addr().map(|a| a.ip().to_string()).unwrap_or_default();
                        Response::new(StatusCode::OK)
                            .header("X-Peer", peer)
                            .body_bytes(req.body().clone())
                    },
                    async {
                        let _ = rx.await;
                    },
                )
                .await
                .unwrap();
        });
        (addr, tx)
    }

    async fn read_response(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn bind_reports_ephemeral_port() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let err = Server::bind("not-an-address").await.err().unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[tokio::test]
    async fn body_split_across_reads_is_reassembled() {
        let (addr, _shutdown) = spawn_echo_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 10\r\nConnection: close\r\n\r\nhello")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.write_all(b"world").await.unwrap();

        let text = read_response(&mut stream).await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("X-Peer: 127.0.0.1\r\n"));
        assert!(text.ends_with("\r\n\r\nhelloworld"));
    }

    #[tokio::test]
    async fn pipelined_requests_are_each_answered() {
        let (addr, _shutdown) = spawn_echo_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"POST / HTTP/1.1\r\nContent-Length: 1\r\n\r\naPOST / HTTP/1.1\r\nContent-Length: 1\r\nConnection: close\r\n\r\nb",
            )
            .await
            .unwrap();

        let text = read_response(&mut stream).await;
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(text.ends_with("\r\n\r\nb"));
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let (addr, _shutdown) = spawn_echo_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"NOT HTTP AT ALL\r\n\r\n").await.unwrap();
        let text = read_response(&mut stream).await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn chunked_request_gets_501() {
        let (addr, _shutdown) = spawn_echo_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n")
            .await
            .unwrap();
        let text = read_response(&mut stream).await;
        assert!(text.starts_with("HTTP/1.1 501 Not Implemented\r\n"));
    }

    #[tokio::test]
    async fn silent_connection_is_closed_after_idle_timeout() {
        let server = Server::bind("127.0.0.1:0")
            .await
            .unwrap()
            .with_idle_timeout(Duration::from_millis(50));
        let addr = server.local_addr();
        tokio::spawn(server.run(|_req: Request| async { Response::new(StatusCode::OK) }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut buf))
            .await
            .expect("idle connection was not closed");

        assert_eq!(read.unwrap(), 0);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn idle_timeout_applies_between_keep_alive_requests() {
        let server = Server::bind("127.0.0.1:0")
            .await
            .unwrap()
            .with_idle_timeout(Duration::from_millis(50));
        let addr = server.local_addr();
        tokio::spawn(server.run(|_req: Request| async { Response::new(StatusCode::OK).body("ok") }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

        let text = tokio::time::timeout(Duration::from_secs(2), read_response(&mut stream))
            .await
            .expect("kept-alive connection was not closed");
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\nok"));
    }

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(
            |_req: Request| async { Response::new(StatusCode::OK) },
            async {
                let _ = rx.await;
            },
        ));
        tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
    }
}

//! Upstream transport: forwards requests to the origin and hands back the
//! response head with an unread body.
//!
//! [`Transport`] is the seam between the cache and the network. The proxy
//! only ever talks to the origin through it, which lets tests substitute an
//! in-process origin. [`HttpTransport`] is the real implementation: one
//! HTTP/1.1 exchange per TCP connection, built on the same `httparse` parser
//! the inbound server uses.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::Origin;
use crate::http::{Headers, Method, Request, StatusCode};

mod body;

pub use body::{Framing, MAX_BODY_SIZE, UpstreamBody};

/// Largest response head we will buffer (64 KiB).
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Maximum number of response headers we parse.
const MAX_HEADERS: usize = 128;

/// Errors produced while talking to the origin.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to origin {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("origin timed out during {phase}")]
    Timeout { phase: &'static str },

    #[error("I/O error talking to origin: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed response from origin: {0}")]
    MalformedResponse(String),

    #[error("origin response body exceeds {max_bytes} bytes")]
    BodyTooLarge { max_bytes: usize },
}

impl TransportError {
    /// Returns `true` for errors that should surface as `504 Gateway Timeout`.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// A response from the origin whose body has not been read yet.
///
/// Hop-by-hop headers have already been removed; the remaining headers are
/// end-to-end and safe to relay or cache.
#[derive(Debug)]
pub struct UpstreamResponse {
    status: StatusCode,
    headers: Headers,
    body: UpstreamBody,
}

impl UpstreamResponse {
    pub fn new(status: StatusCode, headers: Headers, body: UpstreamBody) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn into_parts(self) -> (StatusCode, Headers, UpstreamBody) {
        (self.status, self.headers, self.body)
    }
}

/// Boxed future returned by [`Transport::round_trip`].
pub type RoundTrip<'a> =
    Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>>;

/// Something that can forward a request to the origin.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync`; one transport is shared by
///   every in-flight request.
/// - The returned future resolves once the response head is available. The
///   body is read later through [`UpstreamBody::collect`].
/// - Retries, if any, are the implementation's business. The cache layer
///   never retries.
pub trait Transport: Send + Sync {
    /// Forward `request` to the origin.
    fn round_trip<'a>(&'a self, request: &'a Request) -> RoundTrip<'a>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn round_trip<'a>(&'a self, request: &'a Request) -> RoundTrip<'a> {
        (**self).round_trip(request)
    }
}

/// HTTP/1.1 client for a single `http://` origin.
///
/// Each round trip opens a fresh connection and asks the origin to close it
/// afterwards, so `UntilClose` framing is always well-defined.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    origin: Origin,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl HttpTransport {
    pub fn new(origin: Origin, connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            origin,
            connect_timeout,
            io_timeout,
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    async fn send(&self, request: &Request) -> Result<UpstreamResponse, TransportError> {
        let addr = self.origin.socket_addr();
        let mut stream = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout { phase: "connect" })?
            .map_err(|source| TransportError::Connect {
                addr: addr.clone(),
                source,
            })?;

        debug!(origin = %addr, method = %request.method(), uri = %request.request_uri(), "forwarding upstream");

        let head = encode_request_head(request, &self.origin);
        timeout(self.io_timeout, async {
            stream.write_all(&head).await?;
            stream.write_all(request.body()).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| TransportError::Timeout { phase: "request write" })??;

        let mut buf = BytesMut::with_capacity(8 * 1024);
        let (status, mut headers) = loop {
            if let Some((consumed, status, headers)) = parse_response_head(&buf)? {
                buf.advance(consumed);
                // Interim responses carry no body; the final one follows.
                if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
                    continue;
                }
                break (status, headers);
            }
            if buf.len() > MAX_HEAD_SIZE {
                return Err(TransportError::MalformedResponse(
                    "response head too large".to_owned(),
                ));
            }
            let n = timeout(self.io_timeout, stream.read_buf(&mut buf))
                .await
                .map_err(|_| TransportError::Timeout { phase: "response head" })??;
            if n == 0 {
                return Err(TransportError::MalformedResponse(
                    "origin closed the connection before sending a response".to_owned(),
                ));
            }
        };

        let body = match response_framing(request.method(), status, &headers)? {
            None => UpstreamBody::empty(),
            Some(framing) => {
                UpstreamBody::from_reader(stream, buf, framing).with_io_timeout(self.io_timeout)
            }
        };
        headers.remove_hop_by_hop();

        Ok(UpstreamResponse::new(status, headers, body))
    }
}

impl Transport for HttpTransport {
    fn round_trip<'a>(&'a self, request: &'a Request) -> RoundTrip<'a> {
        Box::pin(self.send(request))
    }
}

/// Serializes the request line and headers sent to the origin.
///
/// `Host` is rewritten to the origin, the client's `Host` moves to
/// `X-Forwarded-Host`, the client address is appended to `X-Forwarded-For`,
/// and hop-by-hop headers are dropped.
fn encode_request_head(request: &Request, origin: &Origin) -> BytesMut {
    let mut headers = request.headers().clone();
    headers.remove_hop_by_hop();
    // The body is already fully buffered, so there is nothing to wait for.
    headers.remove("expect");

    let client_host = headers.get_bytes("host").map(<[u8]>::to_vec);
    headers.remove("host");
    headers.remove("content-length");

    if let Some(host) = client_host {
        headers.set("X-Forwarded-Host", host);
    }
    if let Some(peer) = request.peer_addr() {
        let forwarded_for = match headers.get("x-forwarded-for") {
            Some(prior) => format!("{prior}, {}", peer.ip()),
            None => peer.ip().to_string(),
        };
        headers.set("X-Forwarded-For", forwarded_for);
    }

    let mut buf = BytesMut::with_capacity(256 + headers.len() * 64);
    buf.put(format!("{} {} HTTP/1.1\r\n", request.method(), request.request_uri()).as_bytes());
    buf.put(format!("Host: {}\r\n", origin.authority()).as_bytes());
    headers.write_to(&mut buf);
    let body_len = request.body().len();
    if body_len > 0 || matches!(request.method(), Method::Post | Method::Put | Method::Patch) {
        buf.put(format!("Content-Length: {body_len}\r\n").as_bytes());
    }
    buf.put(&b"Connection: close\r\n\r\n"[..]);
    buf
}

/// Parses a response head out of `buf`, returning the head length, status
/// and headers once the head is complete.
fn parse_response_head(
    buf: &[u8],
) -> Result<Option<(usize, StatusCode, Headers)>, TransportError> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut raw = httparse::Response::new(&mut raw_headers);

    let consumed = match raw.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => consumed,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(TransportError::MalformedResponse(e.to_string())),
    };

    let status = raw
        .code
        .and_then(StatusCode::from_u16)
        .ok_or_else(|| TransportError::MalformedResponse("missing status code".to_owned()))?;

    let mut headers = Headers::with_capacity(raw.headers.len());
    for header in raw.headers.iter() {
        headers.insert(header.name, header.value);
    }

    Ok(Some((consumed, status, headers)))
}

/// Decides how the body is delimited, or `None` when the response has no body.
fn response_framing(
    method: &Method,
    status: StatusCode,
    headers: &Headers,
) -> Result<Option<Framing>, TransportError> {
    if *method == Method::Head
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(None);
    }

    let chunked = headers
        .get_all("transfer-encoding")
        .flat_map(|value| value.split(','))
        .last()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return Ok(Some(Framing::Chunked));
    }
    if headers.contains("transfer-encoding") {
        return Ok(Some(Framing::UntilClose));
    }

    match headers.get_bytes("content-length") {
        Some(raw) => std::str::from_utf8(raw)
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(|len| Some(Framing::Length(len)))
            .ok_or_else(|| {
                TransportError::MalformedResponse(format!(
                    "invalid Content-Length: {}",
                    String::from_utf8_lossy(raw)
                ))
            }),
        None => Ok(Some(Framing::UntilClose)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn origin(addr: SocketAddr) -> Origin {
        Origin::parse(&format!("http://{addr}")).unwrap()
    }

    fn client_request(raw: &str) -> Request {
        let (mut req, _) = Request::parse(raw.as_bytes()).unwrap();
        req.set_peer_addr("10.1.2.3:5555".parse().unwrap());
        req
    }

    /// Accepts one connection, captures the request head, answers with `reply`.
    async fn one_shot_origin(reply: &'static [u8]) -> (SocketAddr, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut data = Vec::new();
            let mut chunk = [0u8; 1024];
            while !data.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                data.extend_from_slice(&chunk[..n]);
            }
            socket.write_all(reply).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8(data).unwrap()
        });
        (addr, handle)
    }

    fn transport(addr: SocketAddr) -> HttpTransport {
        HttpTransport::new(origin(addr), Duration::from_secs(2), Duration::from_secs(2))
    }

    #[test]
    fn request_head_rewrites_host_and_forwarding_headers() {
        let req = client_request(
            "GET /foo?x=1 HTTP/1.1\r\nHost: proxy.local\r\nConnection: keep-alive\r\nX-Forwarded-For: 1.1.1.1\r\nAccept: */*\r\n\r\n",
        );
        let origin = Origin::parse("http://api.example.com").unwrap();
        let head = String::from_utf8(encode_request_head(&req, &origin).to_vec()).unwrap();

        assert!(head.starts_with("GET /foo?x=1 HTTP/1.1\r\nHost: api.example.com\r\n"));
        assert!(head.contains("X-Forwarded-Host: proxy.local\r\n"));
        assert!(head.contains("X-Forwarded-For: 1.1.1.1, 10.1.2.3\r\n"));
        assert!(head.contains("Accept: */*\r\n"));
        assert!(!head.contains("keep-alive"));
        assert!(head.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn framing_rules() {
        let mut h = Headers::new();
        assert_eq!(response_framing(&Method::Get, StatusCode::OK, &h).unwrap(), Some(Framing::UntilClose));
        assert_eq!(response_framing(&Method::Head, StatusCode::OK, &h).unwrap(), None);
        assert_eq!(response_framing(&Method::Get, StatusCode::NOT_MODIFIED, &h).unwrap(), None);

        h.insert("Content-Length", "12");
        assert_eq!(response_framing(&Method::Get, StatusCode::OK, &h).unwrap(), Some(Framing::Length(12)));

        h.insert("Transfer-Encoding", "gzip, chunked");
        assert_eq!(response_framing(&Method::Get, StatusCode::OK, &h).unwrap(), Some(Framing::Chunked));
    }

    #[test]
    fn invalid_content_length_is_malformed() {
        let mut h = Headers::new();
        h.insert("Content-Length", "ten");
        assert!(matches!(
            response_framing(&Method::Get, StatusCode::OK, &h),
            Err(TransportError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn round_trip_content_length() {
        let (addr, seen) = one_shot_origin(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
        )
        .await;
        let t = transport(addr);
        let req = client_request("GET /greeting HTTP/1.1\r\nHost: proxy.local\r\n\r\n");

        let resp = t.round_trip(&req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("content-type"), Some("text/plain"));
        assert!(!resp.headers().contains("connection"));
        let (_, _, body) = resp.into_parts();
        assert_eq!(body.collect().await.unwrap().as_ref(), b"hello");

        let head = seen.await.unwrap();
        assert!(head.starts_with("GET /greeting HTTP/1.1\r\n"));
        assert!(head.contains(&format!("Host: {addr}\r\n")));
    }

    #[tokio::test]
    async fn round_trip_chunked_skips_interim_response() {
        let (addr, _seen) = one_shot_origin(
            b"HTTP/1.1 103 Early Hints\r\nLink: </style.css>\r\n\r\nHTTP/1.1 201 Created\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
        )
        .await;
        let t = transport(addr);
        let req = client_request("GET /items HTTP/1.1\r\n\r\n");

        let resp = t.round_trip(&req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert!(!resp.headers().contains("transfer-encoding"));
        let (_, _, body) = resp.into_parts();
        assert_eq!(body.collect().await.unwrap().as_ref(), b"abc");
    }

    #[tokio::test]
    async fn non_utf8_header_values_survive_the_round_trip() {
        let (addr, _seen) = one_shot_origin(
            b"HTTP/1.1 200 OK\r\nContent-Disposition: attachment; filename=\"caf\xe9.txt\"\r\nContent-Length: 2\r\n\r\nok",
        )
        .await;
        let resp = transport(addr)
            .round_trip(&client_request("GET /download HTTP/1.1\r\n\r\n"))
            .await
            .unwrap();

        assert_eq!(
            resp.headers().get_bytes("content-disposition"),
            Some(&b"attachment; filename=\"caf\xe9.txt\""[..])
        );
    }

    #[test]
    fn request_head_forwards_non_utf8_values_verbatim() {
        let raw = b"GET /x HTTP/1.1\r\nHost: proxy.local\r\nX-Name: Jos\xe9\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        let origin = Origin::parse("http://api.example.com").unwrap();
        let head = encode_request_head(&req, &origin);

        let needle = b"X-Name: Jos\xe9\r\n";
        assert!(head.windows(needle.len()).any(|w| w == needle));
    }

    #[tokio::test]
    async fn garbage_response_is_malformed() {
        let (addr, _seen) = one_shot_origin(b"this is not http\r\n\r\n").await;
        let err = transport(addr)
            .round_trip(&client_request("GET / HTTP/1.1\r\n\r\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = transport(addr)
            .round_trip(&client_request("GET / HTTP/1.1\r\n\r\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(!err.is_timeout());
    }
}

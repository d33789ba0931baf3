//! HTTP/1.1 request parsing using the [`httparse`] crate.

use std::net::SocketAddr;

use bytes::Bytes;
use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete: more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("request body exceeds maximum allowed size of {max_bytes} bytes")]
    BodyTooLarge { max_bytes: usize },

    #[error("unsupported transfer encoding: {0}")]
    UnsupportedTransferEncoding(String),
}

/// A fully parsed HTTP/1.1 request.
///
/// Created by [`Request::parse`] from a raw byte buffer. The body is stored
/// as a [`Bytes`] buffer and is never inspected by the cache; it is passed
/// through to the origin untouched.
///
/// # Examples
///
/// ```
/// use rcache::http::request::Request;
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.query_string(), Some("name=world"));
/// assert_eq!(request.request_uri(), "/hello?name=world");
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    target: String,
    path_len: usize,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    body: Bytes,
    peer_addr: Option<SocketAddr>,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Parse a raw HTTP/1.1 request from a byte slice.
    ///
    /// Returns the parsed `Request` and the byte offset at which the body begins
    /// in `buf` (i.e. immediately after the `\r\n\r\n` header terminator). The
    /// body holds at most `Content-Length` bytes of what follows the headers;
    /// callers compare [`content_length`](Self::content_length) against the
    /// buffered amount to know when the body is complete.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: more data is needed to complete the request headers.
    /// - [`RequestError::Parse`]: the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`]: a required field (method, path, version) is absent.
    /// - [`RequestError::InvalidContentLength`]: `Content-Length` is not a number.
    /// - [`RequestError::UnsupportedTransferEncoding`]: the body uses a transfer coding.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method: Method = match raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse()
        {
            Ok(method) => method,
            Err(never) => match never {},
        };

        let target = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?
            .to_owned();
        let path_len = target.find('?').unwrap_or(target.len());

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            header_map.insert(header.name, header.value);
        }

        if let Some(coding) = header_map.get_bytes("transfer-encoding") {
            return Err(RequestError::UnsupportedTransferEncoding(
                String::from_utf8_lossy(coding).into_owned(),
            ));
        }

        let content_length = match header_map.get_bytes("content-length") {
            Some(raw) => std::str::from_utf8(raw)
                .ok()
                .and_then(|value| value.trim().parse::<usize>().ok())
                .ok_or(RequestError::InvalidContentLength)?,
            None => 0,
        };

        let available = &buf[body_offset..];
        let body = Bytes::copy_from_slice(&available[..available.len().min(content_length)]);

        Ok((
            Self {
                method,
                target,
                path_len,
                version,
                headers: header_map,
                body,
                peer_addr: None,
            },
            body_offset,
        ))
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.target[..self.path_len]
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.target[self.path_len..].strip_prefix('?')
    }

    /// Returns the path and query exactly as the client sent them.
    pub fn request_uri(&self) -> &str {
        &self.target
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the address of the client that sent this request, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Records the address of the client that sent this request.
    pub fn set_peer_addr(&mut self, addr: SocketAddr) {
        self.peer_addr = Some(addr);
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) if conn.eq_ignore_ascii_case("close") => false,
            Some(conn) if conn.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version == 1,
        }
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.trim().parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, offset) = Request::parse(raw).unwrap();
        assert_eq!(req.method().as_str(), "GET");
        assert_eq!(req.path(), "/");
        assert_eq!(req.request_uri(), "/");
        assert_eq!(req.query_string(), None);
        assert_eq!(req.version(), 1);
        assert_eq!(req.headers().get("host"), Some("localhost"));
        assert_eq!(offset, raw.len()); // no body
    }

    #[test]
    fn parse_query_string() {
        let raw = b"GET /search?q=rust&page=2 HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query_string(), Some("q=rust&page=2"));
        assert_eq!(req.request_uri(), "/search?q=rust&page=2");
    }

    #[test]
    fn request_uri_preserves_trailing_slash_and_empty_query() {
        let raw = b"GET /a/? HTTP/1.1\r\nHost: x\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert_eq!(req.path(), "/a/");
        assert_eq!(req.query_string(), Some(""));
        assert_eq!(req.request_uri(), "/a/?");
    }

    #[test]
    fn incomplete_request() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(Request::parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn keep_alive_http11_default() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert!(req.is_keep_alive());
    }

    #[test]
    fn http10_defaults_to_close() {
        let raw = b"GET / HTTP/1.0\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn connection_close() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn content_length() {
        let raw = b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello";
        let (req, body_offset) = Request::parse(raw).unwrap();
        assert_eq!(req.content_length(), Some(5));
        assert_eq!(&raw[body_offset..], b"hello");
        assert_eq!(req.body().as_ref(), b"hello");
    }

    #[test]
    fn body_stops_at_content_length() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 2\r\n\r\nhiGET / HTTP/1.1\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert_eq!(req.body().as_ref(), b"hi");
    }

    #[test]
    fn chunked_request_rejected() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert!(matches!(
            Request::parse(raw),
            Err(RequestError::UnsupportedTransferEncoding(_))
        ));
    }

    #[test]
    fn bad_content_length_rejected() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: many\r\n\r\n";
        assert!(matches!(
            Request::parse(raw),
            Err(RequestError::InvalidContentLength)
        ));
    }
}

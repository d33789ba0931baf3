//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing HTTP responses and
//! serializing them to a byte buffer for transmission over TCP.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Headers, StatusCode};

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use rcache::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::OK)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    keep_alive: bool,
    head: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
            keep_alive: true,
            head: false,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets a header in-place, replacing any existing values for that name.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.headers.set(name, value);
    }

    /// Replaces the whole header set.
    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the response body from a string.
    ///
    /// The `Content-Length` header is written automatically by [`into_bytes`](Self::into_bytes).
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Bytes::from(body.into());
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Marks this response as the answer to a `HEAD` request.
    ///
    /// No body is sent, and a `Content-Length` already in the header set is
    /// sent unchanged since it describes the representation a `GET` would
    /// return.
    #[must_use]
    pub fn for_head(mut self, head: bool) -> Self {
        self.head = head;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the response body.
    pub fn body_data(&self) -> &Bytes {
        &self.body
    }

    /// Returns `true` if the connection may be reused after this response.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Framing is owned by the serializer:
    /// - `Connection` entries in the header set are replaced by
    ///   `Connection: keep-alive` or `Connection: close`.
    /// - `Content-Length` is recomputed from the body and written last, except
    ///   where the body is empty by rule. 1xx and `204` responses carry no
    ///   `Content-Length` at all. Answers to `HEAD` and `304` responses keep the
    ///   one in the header set, if any.
    pub fn into_bytes(self) -> BytesMut {
        let no_length = self.status.is_informational() || self.status == StatusCode::NO_CONTENT;
        let bodiless = no_length || self.head || self.status == StatusCode::NOT_MODIFIED;
        let declared = bodiless && !no_length && self.headers.contains("content-length");

        let body_len = if bodiless { 0 } else { self.body.len() };
        let estimated_size = 128 + self.headers.len() * 64 + body_len;
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Status line
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        // Headers
        let mut headers = self.headers;
        headers.remove("connection");
        if !declared {
            headers.remove("content-length");
        }
        headers.write_to(&mut buf);

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        buf.put(format!("Connection: {connection}\r\n").as_bytes());

        // A HEAD answer built locally still advertises its would-be length.
        if !no_length && !declared && !(bodiless && self.body.is_empty()) {
            buf.put(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }

        // Header/body separator
        buf.put(&b"\r\n"[..]);

        // Body
        if !bodiless && !self.body.is_empty() {
            buf.put(self.body);
        }

        buf
    }
}

//! HTTP/1.1 protocol types and parsing.
//!
//! This module provides the core HTTP primitives shared by the inbound server
//! and the upstream transport: [`Method`], [`StatusCode`], [`Headers`],
//! [`Request`], and [`Response`].

use std::fmt;

pub mod headers;
pub mod request;
pub mod response;

pub use headers::Headers;
pub use request::Request;
pub use response::Response;

/// An HTTP response status code.
///
/// Stored as a raw `u16` so that any three-digit code an origin sends can be
/// relayed and cached unchanged. Well-known codes are available as associated
/// constants.
///
/// # Examples
///
/// ```
/// use rcache::http::StatusCode;
///
/// let status = StatusCode::OK;
/// assert_eq!(status.as_u16(), 200);
/// assert_eq!(status.canonical_reason(), "OK");
///
/// let custom = StatusCode::from_u16(299).unwrap();
/// assert_eq!(custom.canonical_reason(), "");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(u16);

impl StatusCode {
    // 1xx Informational
    pub const SWITCHING_PROTOCOLS: StatusCode = StatusCode(101);

    // 2xx Success
    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const NO_CONTENT: StatusCode = StatusCode(204);

    // 3xx Redirection
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);

    // 4xx Client Error
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const PAYLOAD_TOO_LARGE: StatusCode = StatusCode(413);

    // 5xx Server Error
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);
    pub const BAD_GATEWAY: StatusCode = StatusCode(502);
    pub const GATEWAY_TIMEOUT: StatusCode = StatusCode(504);

    /// Builds a status code from its numeric value.
    ///
    /// Returns `None` unless `code` is a three-digit value (`100..=999`).
    pub fn from_u16(code: u16) -> Option<Self> {
        (100..=999).contains(&code).then_some(Self(code))
    }

    /// Returns the numeric status code as a `u16`.
    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns `true` for `1xx` codes.
    pub fn is_informational(self) -> bool {
        (100..200).contains(&self.0)
    }

    /// Returns the canonical reason phrase for this status code, or an empty
    /// string for codes without a registered phrase.
    pub fn canonical_reason(self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            203 => "Non-Authoritative Information",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            409 => "Conflict",
            410 => "Gone",
            411 => "Length Required",
            413 => "Payload Too Large",
            414 => "URI Too Long",
            415 => "Unsupported Media Type",
            422 => "Unprocessable Entity",
            429 => "Too Many Requests",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            _ => "",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.canonical_reason())
    }
}

/// An HTTP request method.
///
/// Standard methods are represented as unit variants for zero-cost comparison.
/// Non-standard methods are captured in the `Custom` variant.
///
/// # Examples
///
/// ```
/// use rcache::http::Method;
///
/// let method: Method = "GET".parse().unwrap();
/// assert_eq!(method, Method::Get);
/// assert_eq!(method.as_str(), "GET");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET: retrieve a representation of the target resource.
    Get,
    /// POST: perform resource-specific processing on the request payload.
    Post,
    /// PUT: replace the target resource's current representation.
    Put,
    /// DELETE: remove the association between the target resource and its functionality.
    Delete,
    /// HEAD: identical to GET but without a response body.
    Head,
    /// OPTIONS: describe the communication options for the target resource.
    Options,
    /// PATCH: apply partial modifications to a resource.
    Patch,
    /// CONNECT: establish a tunnel to the server identified by the target resource.
    Connect,
    /// TRACE: perform a message loop-back test along the path to the target resource.
    Trace,
    /// A non-standard extension method.
    Custom(String),
}

impl Method {
    /// Returns the method as a string slice.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Connect => "CONNECT",
            Self::Trace => "TRACE",
            Self::Custom(s) => s.as_str(),
        }
    }

}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            "PATCH" => Self::Patch,
            "CONNECT" => Self::Connect,
            "TRACE" => Self::Trace,
            other => Self::Custom(other.to_owned()),
        })
    }
}

/// Hop-by-hop header names (RFC 9110 §7.6.1). These describe a single
/// connection and are never forwarded by a proxy in either direction.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

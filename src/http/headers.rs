//! HTTP header map with case-insensitive name lookup.
//!
//! HTTP headers are order-preserving and case-insensitive per [RFC 9110 §5].

use bytes::{BufMut, BytesMut};

use super::HOP_BY_HOP_HEADERS;

/// A case-insensitive, multi-value HTTP header map.
///
/// Preserves insertion order and the original spelling of each name, and
/// allows multiple values per header name, matching the semantics of HTTP/1.1
/// header fields (RFC 9110 §5.3). Cloning produces an independent map, which
/// is what cache entries rely on to never alias a live response's headers.
///
/// Values are kept as raw bytes. Field values may legally carry obs-text
/// (e.g. Latin-1 filenames), and a proxy must relay those unchanged. The
/// `&str` accessors only see values that are valid UTF-8; [`get_bytes`] and
/// [`iter`] see everything.
///
/// [`get_bytes`]: Self::get_bytes
/// [`iter`]: Self::iter
///
/// # Examples
///
/// ```
/// use rcache::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Content-Type", "text/html; charset=utf-8");
/// headers.insert("X-Custom", "first");
/// headers.insert("X-Custom", "second");
///
/// assert_eq!(headers.get("content-type"), Some("text/html; charset=utf-8"));
/// let all: Vec<_> = headers.get_all("x-custom").collect();
/// assert_eq!(all, vec!["first", "second"]);
///
/// headers.set("x-custom", "only");
/// assert_eq!(headers.get_all("X-Custom").count(), 1);
///
/// headers.insert("Content-Disposition", &b"attachment; filename=\"caf\xe9.txt\""[..]);
/// assert_eq!(headers.get("content-disposition"), None);
/// assert_eq!(
///     headers.get_bytes("content-disposition"),
///     Some(&b"attachment; filename=\"caf\xe9.txt\""[..])
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    inner: Vec<(String, Vec<u8>)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a header map with pre-allocated capacity for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Appends a header entry. Multiple values for the same name are preserved.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Replaces every entry named `name` with a single `name: value` entry.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        let name = name.into();
        self.remove(&name);
        self.inner.push((name, value.into()));
    }

    /// Returns the first value for the given header name (case-insensitive),
    /// or `None` if it is absent or not valid UTF-8.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_bytes(name)
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    /// Returns the raw bytes of the first value for the given header name.
    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// Returns an iterator over all UTF-8 values for the given header name
    /// (case-insensitive).
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.inner
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .filter_map(|(_, v)| std::str::from_utf8(v).ok())
    }

    /// Removes all entries with the given header name (case-insensitive).
    ///
    /// Returns `true` if any entries were removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.inner.len();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.inner.len() < before
    }

    /// Removes hop-by-hop headers, including any extra names the `Connection`
    /// header lists.
    pub fn remove_hop_by_hop(&mut self) {
        let listed: Vec<String> = self
            .get_all("connection")
            .flat_map(|value| value.split(','))
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect();

        self.inner.retain(|(k, _)| {
            !HOP_BY_HOP_HEADERS
                .iter()
                .any(|hop| k.eq_ignore_ascii_case(hop))
                && !listed.iter().any(|name| k.eq_ignore_ascii_case(name))
        });
    }

    /// Returns `true` if the map contains at least one entry with the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Returns the total number of header entries (not unique names).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if there are no header entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an iterator over all `(name, raw value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Writes every entry as `name: value\r\n`, value bytes untouched.
    pub fn write_to(&self, buf: &mut BytesMut) {
        for (name, value) in self.iter() {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value);
            buf.put_slice(b"\r\n");
        }
    }
}

use crate::http::{Method, Request};

/// Derives the cache key for a request.
///
/// The key is `"{method} {origin_host}{request_uri}"`. Neither the scheme nor
/// the client-visible `Host` take part, so virtual hosts that share one origin
/// share one key space. The URI is used verbatim: query parameter order and
/// trailing slashes both produce distinct keys.
///
/// # Examples
///
/// ```
/// use rcache::cache::derive_key;
/// use rcache::http::Method;
///
/// let key = derive_key(&Method::Get, "api.example.com", "/foo?x=1");
/// assert_eq!(key, "GET api.example.com/foo?x=1");
/// ```
pub fn derive_key(method: &Method, origin_host: &str, request_uri: &str) -> String {
    let mut key =
        String::with_capacity(method.as_str().len() + 1 + origin_host.len() + request_uri.len());
    key.push_str(method.as_str());
    key.push(' ');
    key.push_str(origin_host);
    key.push_str(request_uri);
    key
}

/// [`derive_key`] applied to a parsed request.
pub fn key_for(request: &Request, origin_host: &str) -> String {
    derive_key(request.method(), origin_host, request.request_uri())
}

//! Incoming HTTP request type.

use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, Uri};

/// What is known about a request once its [`Context`](crate::Context) is gone.
///
/// Handed to the write-error callback. `method` and `uri` are `None` when a
/// connection failed outside any single request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: Option<Method>,
    pub uri: Option<String>,
    pub remote_addr: Option<SocketAddr>,
}

impl RequestInfo {
    pub(crate) fn connection(peer: SocketAddr) -> Self {
        Self { method: None, uri: None, remote_addr: Some(peer) }
    }
}

/// An incoming HTTP request with its body fully read.
pub struct Request {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) params: HashMap<String, String>,
    pub(crate) remote_addr: Option<SocketAddr>,
}

impl Request {
    /// Wraps an `http::Request` whose body has already been collected.
    pub fn from_http(req: http::Request<Bytes>, remote_addr: Option<SocketAddr>) -> Self {
        let (parts, body) = req.into_parts();
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            params: HashMap::new(),
            remote_addr,
        }
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn path(&self) -> &str { self.uri.path() }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &[u8] { &self.body }
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }

    /// An owned summary for callbacks that outlive the request.
    pub fn info(&self) -> RequestInfo {
        RequestInfo {
            method: Some(self.method.clone()),
            uri: Some(self.request_uri().to_owned()),
            remote_addr: self.remote_addr,
        }
    }

    /// Path plus query string, e.g. `/search?q=rust`. The ETag and
    /// whole-response caches key on it.
    pub fn request_uri(&self) -> &str {
        self.uri.path_and_query().map_or("/", |pq| pq.as_str())
    }

    /// Case-insensitive header lookup. Values that are not visible ASCII are
    /// treated as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// First value of `key` in the query string.
    pub fn query(&self, key: &str) -> Option<Cow<'_, str>> {
        let query = self.uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// First value of `key` in an `application/x-www-form-urlencoded` body,
    /// falling back to the query string.
    pub fn form_value(&self, key: &str) -> Option<Cow<'_, str>> {
        let is_form = self
            .header(CONTENT_TYPE.as_str())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
        if is_form {
            let found = url::form_urlencoded::parse(&self.body)
                .find(|(k, _)| k == key)
                .map(|(_, v)| v);
            if found.is_some() {
                return found;
            }
        }
        self.query(key)
    }

    pub(crate) fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = params;
        self
    }
}

/// The placeholder a pooled context holds between requests: `GET /`, no
/// headers, no body.
impl Default for Request {
    fn default() -> Self {
        Self {
            method: Method::GET,
            uri: Uri::default(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            params: HashMap::new(),
            remote_addr: None,
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, content_type: Option<&str>, body: &'static str) -> Request {
        let mut builder = http::Request::post(uri);
        if let Some(ct) = content_type {
            builder = builder.header(CONTENT_TYPE, ct);
        }
        Request::from_http(builder.body(Bytes::from_static(body.as_bytes())).unwrap(), None)
    }

    #[test]
    fn request_uri_keeps_query() {
        let req = request("/search?q=rust&page=2", None, "");
        assert_eq!(req.path(), "/search");
        assert_eq!(req.request_uri(), "/search?q=rust&page=2");
        assert_eq!(req.query("page").as_deref(), Some("2"));
        assert_eq!(req.query("missing"), None);
    }

    #[test]
    fn form_value_prefers_body() {
        let req = request(
            "/?name=query",
            Some("application/x-www-form-urlencoded"),
            "name=linda&mobile=xxxxxxxx",
        );
        assert_eq!(req.form_value("name").as_deref(), Some("linda"));
        assert_eq!(req.form_value("mobile").as_deref(), Some("xxxxxxxx"));
    }

    #[test]
    fn form_value_ignores_non_form_body() {
        let req = request("/?name=query", Some("application/json"), "name=linda");
        assert_eq!(req.form_value("name").as_deref(), Some("query"));
    }
}

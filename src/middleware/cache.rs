//! Whole-response cache.
//!
//! A hit replays the stored headers and body without running the rest of the
//! chain. A miss registers a hook that snapshots the final headers and body of
//! a `200` response under the request URI.
//!
//! Clients that accept gzip and clients that do not are cached under separate
//! keys, so a body compressed by a `gzip` listed after `cache` is only ever
//! replayed to clients that can decode it.
//!
//! There is no single-flight: concurrent misses for the same URI each run the
//! handler and the last one to finish wins the slot.

use std::sync::Arc;

use dashmap::DashMap;
use http::header::HeaderName;
use http::{HeaderMap, HeaderValue, StatusCode};
use tracing::warn;

use crate::context::Context;
use crate::handler::{from_fn, Middleware};
use crate::middleware::gzip::accepts_gzip;
use crate::request::Request;

/// Byte-oriented key/value store the cache middleware writes through.
///
/// Implement it over an external cache to share responses between processes;
/// [`MemoryCache`] keeps them in this process.
pub trait ByteCache: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&self, key: &str, value: Vec<u8>);
    fn del(&self, key: &str);
}

/// In-process [`ByteCache`]. Entries live until deleted.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ByteCache for MemoryCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    fn set(&self, key: &str, value: Vec<u8>) {
        self.entries.insert(key.to_owned(), value);
    }

    fn del(&self, key: &str) {
        self.entries.remove(key);
    }
}

/// Caches complete `200` responses by request URI.
///
/// Hooks registered by middlewares listed **after** this one run before the
/// snapshot, so their output is what gets stored. Hooks from middlewares
/// listed **before** it run on every response, hit or miss. Put `gzip` before
/// `cache` to store plain bodies and compress per request.
pub fn cache(store: Arc<dyn ByteCache>) -> Middleware {
    from_fn(move |c: &mut Context| {
        let key = cache_key(c.request());

        if let Some(raw) = store.get(&key) {
            match CachedResponse::decode(&raw) {
                Some(hit) => {
                    hit.restore(c.response_headers_mut());
                    c.write(StatusCode::OK, hit.body);
                    return;
                }
                None => {
                    warn!(key, "dropping undecodable cache entry");
                    store.del(&key);
                }
            }
        }

        let store = Arc::clone(&store);
        c.hook(move |c, buf| {
            if c.status() == Some(StatusCode::OK) {
                store.set(&key, CachedResponse::encode(c.response_headers(), &buf));
            }
            Ok(buf)
        });
        c.next();
    })
}

/// The request URI, prefixed for clients that accept gzip.
fn cache_key(req: &Request) -> String {
    if accepts_gzip(req) {
        format!("gzip:{}", req.request_uri())
    } else {
        req.request_uri().to_owned()
    }
}

/// Stored form of a response.
///
/// Layout: `u32` header count, then per header a `u16`-prefixed name and a
/// `u32`-prefixed value, then the body. Integers are big-endian.
struct CachedResponse<'a> {
    headers: Vec<(&'a [u8], &'a [u8])>,
    body: &'a [u8],
}

impl<'a> CachedResponse<'a> {
    fn encode(headers: &HeaderMap, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(body.len() + 64 * headers.len() + 4);
        out.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        for (name, value) in headers {
            let name = name.as_str().as_bytes();
            out.extend_from_slice(&(name.len() as u16).to_be_bytes());
            out.extend_from_slice(name);
            out.extend_from_slice(&(value.len() as u32).to_be_bytes());
            out.extend_from_slice(value.as_bytes());
        }
        out.extend_from_slice(body);
        out
    }

    fn decode(raw: &'a [u8]) -> Option<Self> {
        let (count, mut rest) = split_u32(raw)?;
        let mut headers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (len, tail) = rest.split_first_chunk::<2>()?;
            let (name, tail) = tail.split_at_checked(u16::from_be_bytes(*len) as usize)?;
            let (len, tail) = split_u32(tail)?;
            let (value, tail) = tail.split_at_checked(len as usize)?;
            headers.push((name, value));
            rest = tail;
        }
        Some(Self { headers, body: rest })
    }

    /// Copies the stored headers over `into`. The first stored value of a
    /// name replaces whatever is pending; further values are appended.
    fn restore(&self, into: &mut HeaderMap) {
        let mut seen: Vec<HeaderName> = Vec::new();
        for (name, value) in &self.headers {
            let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name), HeaderValue::from_bytes(value)) else {
                continue;
            };
            if seen.contains(&name) {
                into.append(name, value);
            } else {
                into.insert(name.clone(), value);
                seen.push(name);
            }
        }
    }
}

fn split_u32(raw: &[u8]) -> Option<(u32, &[u8])> {
    let (len, rest) = raw.split_first_chunk::<4>()?;
    Some((u32::from_be_bytes(*len), rest))
}

#[cfg(test)]
mod tests {
    use http::header::{CONTENT_TYPE, SET_COOKIE};

    use super::*;

    #[test]
    fn stored_response_keeps_repeated_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(SET_COOKIE, HeaderValue::from_static("b=2"));
        let raw = CachedResponse::encode(&headers, b"payload");

        let decoded = CachedResponse::decode(&raw).unwrap();
        assert_eq!(decoded.body, b"payload");

        let mut restored = HeaderMap::new();
        restored.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        decoded.restore(&mut restored);
        assert_eq!(restored[CONTENT_TYPE], "text/plain");
        assert_eq!(restored.get_all(SET_COOKIE).iter().count(), 2);
    }

    #[test]
    fn truncated_entries_do_not_decode() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let raw = CachedResponse::encode(&headers, b"");
        assert!(CachedResponse::decode(&raw[..raw.len() - 3]).is_none());
        assert!(CachedResponse::decode(&[0, 0]).is_none());
    }

    #[test]
    fn memory_cache_get_set_del() {
        let cache = MemoryCache::new();
        cache.set("/a", b"x".to_vec());
        assert_eq!(cache.get("/a").as_deref(), Some(&b"x"[..]));
        cache.del("/a");
        assert!(cache.get("/a").is_none());
        assert!(cache.is_empty());
    }
}

//! Conditional GET over content hashes.

use std::sync::Arc;

use dashmap::DashMap;
use http::header::{CACHE_CONTROL, ETAG, IF_NONE_MATCH};
use http::StatusCode;

use crate::context::Context;
use crate::files::etag_of;
use crate::handler::{from_fn, Middleware};
use crate::request::Request;

/// Whether the client asked to skip validation caches: its `Cache-Control`
/// contains `no-store`, `no-cache`, `must-revalidate` or `max-age=0`,
/// compared case-insensitively.
pub fn bypasses_cache(req: &Request) -> bool {
    let Some(cc) = req.header(CACHE_CONTROL.as_str()) else {
        return false;
    };
    let cc = cc.to_ascii_lowercase();
    ["no-store", "no-cache", "must-revalidate", "max-age=0"]
        .iter()
        .any(|d| cc.contains(d))
}

/// Answers `304 Not Modified` when the client already holds the current body.
///
/// `tags` maps request URI (path plus query) to the last ETag produced for
/// it. Share one map across the routes that should remember their hashes.
///
/// The hashing hook is registered before the `If-None-Match` check, so the
/// first request for a URI computes and stores its tag and every later one can
/// be answered without running the handler. Only `200` responses are hashed.
pub fn etag(tags: Arc<DashMap<String, String>>) -> Middleware {
    from_fn(move |c: &mut Context| {
        let uri = c.request().request_uri().to_owned();

        let store = Arc::clone(&tags);
        let key = uri.clone();
        c.hook(move |c, buf| {
            if c.status() == Some(StatusCode::OK) {
                let tag = etag_of(&buf);
                c.set_header(ETAG, &tag);
                store.insert(key, tag);
            }
            Ok(buf)
        });

        if !bypasses_cache(c.request()) {
            let fresh = tags.get(&uri).is_some_and(|tag| {
                c.header(IF_NONE_MATCH.as_str()).is_some_and(|inm| inm.contains(tag.as_str()))
            });
            if fresh {
                c.write_header(StatusCode::NOT_MODIFIED);
                return;
            }
        }
        c.next();
    })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn request(cache_control: Option<&str>) -> Request {
        let mut b = http::Request::get("/");
        if let Some(cc) = cache_control {
            b = b.header(CACHE_CONTROL, cc);
        }
        Request::from_http(b.body(Bytes::new()).unwrap(), None)
    }

    #[test]
    fn cache_control_directives_bypass() {
        assert!(!bypasses_cache(&request(None)));
        assert!(!bypasses_cache(&request(Some("max-age=60"))));
        assert!(bypasses_cache(&request(Some("No-Store"))));
        assert!(bypasses_cache(&request(Some("private, no-cache"))));
        assert!(bypasses_cache(&request(Some("must-revalidate"))));
        assert!(bypasses_cache(&request(Some("MAX-AGE=0"))));
    }
}

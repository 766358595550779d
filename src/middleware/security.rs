//! Fixed response headers.

use http::header::{CONTENT_SECURITY_POLICY, X_FRAME_OPTIONS};
use http::{HeaderName, HeaderValue};
use tracing::warn;

use crate::context::Context;
use crate::handler::{from_fn, Middleware};

/// Forbids embedding the response in any frame, via both
/// `X-Frame-Options: DENY` and CSP `frame-ancestors 'none'`.
pub fn clickjacking() -> Middleware {
    from_fn(|c: &mut Context| {
        let headers = c.response_headers_mut();
        headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
        headers.insert(CONTENT_SECURITY_POLICY, HeaderValue::from_static("frame-ancestors 'none'"));
        c.next();
    })
}

/// Appends every `(name, value)` pair to the response before the handler runs.
///
/// Pairs that are not valid header names or values are logged and skipped
/// once, at construction.
pub fn headers<I, K, V>(pairs: I) -> Middleware
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let fixed: Vec<(HeaderName, HeaderValue)> = pairs
        .into_iter()
        .filter_map(|(k, v)| {
            let (k, v) = (k.as_ref(), v.as_ref());
            match (HeaderName::try_from(k), HeaderValue::try_from(v)) {
                (Ok(name), Ok(value)) => Some((name, value)),
                _ => {
                    warn!(name = k, value = v, "skipping invalid fixed header");
                    None
                }
            }
        })
        .collect();

    from_fn(move |c: &mut Context| {
        let headers = c.response_headers_mut();
        for (name, value) in &fixed {
            headers.append(name.clone(), value.clone());
        }
        c.next();
    })
}

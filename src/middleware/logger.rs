//! Access log.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use http::StatusCode;
use tracing::{debug, error, warn};

use crate::context::Context;
use crate::handler::{from_fn, Middleware};

/// Logs one line per request: latency, peer, status, method, URI and body
/// size.
///
/// `5xx` logs at error level, `4xx` at warn, everything else at debug. The
/// size is the body as committed, so list `logger` before `gzip` to report
/// compressed sizes. Responses that skip the hooks (`304`, direct file
/// streams) report `0`.
pub fn logger() -> Middleware {
    from_fn(|c: &mut Context| {
        let bytes = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&bytes);
        c.hook(move |_, buf| {
            seen.store(buf.len(), Ordering::Relaxed);
            Ok(buf)
        });

        let start = Instant::now();
        c.next();
        let latency = start.elapsed();

        let status = c.status().unwrap_or(StatusCode::OK).as_u16();
        let req = c.request();
        let peer = req.remote_addr().map(|a| a.to_string()).unwrap_or_default();
        let bytes = bytes.load(Ordering::Relaxed);
        match status {
            500.. => error!(?latency, peer = %peer, status, method = %req.method(), uri = req.request_uri(), bytes, "request"),
            400.. => warn!(?latency, peer = %peer, status, method = %req.method(), uri = req.request_uri(), bytes, "request"),
            _ => debug!(?latency, peer = %peer, status, method = %req.method(), uri = req.request_uri(), bytes, "request"),
        }
    })
}

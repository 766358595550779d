//! Response compression.

use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, VARY};

use crate::context::Context;
use crate::files;
use crate::handler::{from_fn, Middleware};
use crate::request::Request;

/// Whether the request's `Accept-Encoding` mentions `gzip`.
pub(crate) fn accepts_gzip(req: &Request) -> bool {
    req.header(ACCEPT_ENCODING.as_str()).is_some_and(|ae| ae.contains("gzip"))
}

/// Gzips the response body when the request's `Accept-Encoding` mentions
/// `gzip`. `level` is the flate2 compression level, 0 to 9.
///
/// Requests that do not accept gzip pass through untouched, with no
/// `Content-Encoding` header.
pub fn gzip(level: u32) -> Middleware {
    let level = level.min(9);
    from_fn(move |c: &mut Context| {
        if accepts_gzip(c.request()) {
            c.hook(move |c, buf| {
                let compressed = files::gzip(level, &buf)?;
                c.set_header(CONTENT_ENCODING, "gzip");
                c.set_header(VARY, "Accept-Encoding");
                Ok(compressed)
            });
        }
        c.next();
    })
}

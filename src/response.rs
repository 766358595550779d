//! Outgoing response sink.
//!
//! A [`ResponseWriter`] behaves like the writer of a classic HTTP server: the
//! first call to [`write_header`](ResponseWriter::write_header) (or the first
//! body write, which implies `200 OK`) commits the status line and the header
//! set. Header changes after that point are dropped, and so is any second
//! status. This is the constraint the response hooks in
//! [`Context`](crate::Context) exist to work around.
//!
//! Nothing here touches the network, so writes never fail. Once the chain
//! finishes, the dispatcher turns the writer into an `http::Response` and
//! hands it to the transport, which reports send failures itself.

use std::io;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tracing::warn;

/// Per-request response sink. Commits status and headers exactly once.
#[derive(Default)]
pub struct ResponseWriter {
    headers: HeaderMap,
    committed: Option<(StatusCode, HeaderMap)>,
    body: Vec<u8>,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Headers that will be sent on commit.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the pending header set. After commit, changes made
    /// here never reach the client.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Replaces a header value, skipping values that are not valid header text.
    pub fn set_header(&mut self, name: HeaderName, value: &str) {
        match HeaderValue::from_str(value) {
            Ok(v) => {
                self.headers.insert(name, v);
            }
            Err(_) => warn!(header = %name, "dropping invalid header value"),
        }
    }

    /// Commits the status line and the current headers.
    pub fn write_header(&mut self, status: StatusCode) {
        if let Some((first, _)) = &self.committed {
            warn!(first = %first, ignored = %status, "superfluous write_header call");
            return;
        }
        self.committed = Some((status, std::mem::take(&mut self.headers)));
    }

    /// The committed status, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.committed.as_ref().map(|(s, _)| *s)
    }

    pub fn is_committed(&self) -> bool {
        self.committed.is_some()
    }

    /// Appends to the body, committing `200 OK` first if nothing is committed.
    pub fn write_body(&mut self, body: &[u8]) {
        if self.committed.is_none() {
            self.write_header(StatusCode::OK);
        }
        self.body.extend_from_slice(body);
    }

    /// Bytes written so far.
    pub fn written(&self) -> usize {
        self.body.len()
    }

    /// Finalizes into an `http::Response`. An uncommitted writer is sent as
    /// `fallback` with whatever headers are pending.
    pub(crate) fn into_response(self, fallback: StatusCode) -> http::Response<Bytes> {
        let (status, headers) = self.committed.unwrap_or((fallback, self.headers));
        let mut res = http::Response::new(Bytes::from(self.body));
        *res.status_mut() = status;
        *res.headers_mut() = headers;
        res
    }
}

impl io::Write for ResponseWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_body(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A body-less plain response built outside any context (404, 405, panics).
pub(crate) fn plain(status: StatusCode, body: impl Into<Bytes>) -> http::Response<Bytes> {
    let mut res = http::Response::new(body.into());
    *res.status_mut() = status;
    res.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use http::header::{CONTENT_TYPE, ETAG};

    use super::*;

    #[test]
    fn headers_after_commit_are_dropped() {
        let mut w = ResponseWriter::new();
        w.set_header(CONTENT_TYPE, "text/plain");
        w.write_header(StatusCode::CREATED);
        w.set_header(ETAG, "\"late\"");
        w.write_header(StatusCode::INTERNAL_SERVER_ERROR);

        let res = w.into_response(StatusCode::OK);
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(res.headers()[CONTENT_TYPE], "text/plain");
        assert!(res.headers().get(ETAG).is_none());
    }

    #[test]
    fn first_write_implies_ok() {
        let mut w = ResponseWriter::new();
        w.write_all(b"hi").unwrap();
        assert_eq!(w.status(), Some(StatusCode::OK));
        let res = w.into_response(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body().as_ref(), b"hi");
    }

    #[test]
    fn uncommitted_uses_fallback() {
        let res = ResponseWriter::new().into_response(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(res.body().is_empty());
    }
}

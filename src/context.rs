//! Per-request context, continuation, and deferred response hooks.
//!
//! # The chain
//!
//! Every route owns an ordered slice of steps: global middlewares, route
//! middlewares, then the terminal handler. The context carries a cursor into
//! it. [`Context::next`] advances the cursor and runs the step it lands on, so
//! a middleware can do work before the rest of the chain, after it, or both:
//!
//! ```text
//! A ──▶ B ──▶ C ──▶ handler
//! A1    B1    C1    <->
//! A2 ◀── B2 ◀── C2 ◀──┘
//! ```
//!
//! Returning without calling `next` short-circuits everything downstream.
//!
//! # Response hooks
//!
//! The writer commits status and headers on first write, so a middleware that
//! wants to hash, compress, cache, or measure the body cannot simply wrap the
//! handler. Instead it registers a [`Hook`] with [`Context::hook`]. When the
//! handler calls an output method:
//!
//! - **no hooks**: status is committed and bytes go straight to the writer;
//! - **hooks**: the body is collected in a pooled buffer, every hook runs over
//!   it, and only then are status, headers, and the final buffer committed.
//!
//! Hooks run in **reverse registration order**. The middleware closest to the
//! handler registered last and transforms first; the outermost middleware sees
//! the final bytes. With `[logger, etag, gzip]` the ETag is computed over the
//! compressed body and the logger reports the compressed size.
//!
//! A hook that returns `Err` aborts the write: nothing is committed, the error
//! goes to the dispatcher's write-error callback, and the request ends as an
//! empty `500`.
//!
//! # Ownership
//!
//! A context belongs to exactly one dispatch. It is reset and returned to the
//! pool when the chain unwinds, so nothing may hold on to it afterwards. The
//! key/value store takes `&self` and is lock-guarded, which lets a handler
//! share `&Context` with scoped threads (`std::thread::scope`) while it is
//! still running.

use std::any::Any;
use std::fs::File;
use std::io::{self, Read};
use std::mem;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::header::{CONTENT_TYPE, IF_MODIFIED_SINCE, LAST_MODIFIED};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{error, warn};

use crate::dispatcher::Services;
use crate::error::Error;
use crate::files::{clean_path, content_type, http_date, parse_http_date};
use crate::handler::Middleware;
use crate::pool::Reset;
use crate::request::Request;
use crate::response::ResponseWriter;
use crate::validate::Validate;

/// A body transform run once, right before the response is committed.
///
/// Receives the current body and returns the body to pass on, or an error to
/// abort the write.
pub type Hook = Box<dyn FnOnce(&mut Context, Vec<u8>) -> Result<Vec<u8>, Error> + Send + Sync>;

type Value = Arc<dyn Any + Send + Sync>;

/// Buffers that grew past this are dropped instead of pooled.
const MAX_POOLED_BUFFER: usize = 64 * 1024;

/// Per-request state handed to every step of the chain.
pub struct Context {
    index: usize,
    depth: usize,
    status: Option<StatusCode>,
    aborted: bool,
    chain: Option<Arc<[Middleware]>>,
    keys: RwLock<Vec<(String, Value)>>,
    request: Request,
    writer: ResponseWriter,
    hooks: Vec<Hook>,
    services: Option<Arc<Services>>,
}

impl Context {
    pub(crate) fn new() -> Self {
        Self {
            index: 0,
            depth: 0,
            status: None,
            aborted: false,
            chain: None,
            keys: RwLock::new(Vec::new()),
            request: Request::default(),
            writer: ResponseWriter::new(),
            hooks: Vec::new(),
            services: None,
        }
    }

    pub(crate) fn prepare(&mut self, chain: Arc<[Middleware]>, request: Request, services: Arc<Services>) {
        self.index = 0;
        self.chain = Some(chain);
        self.request = request;
        self.services = Some(services);
    }

    /// Runs the first step of the chain.
    pub(crate) fn run(&mut self) {
        self.index = 0;
        self.depth = 0;
        let first = self.chain.as_ref().and_then(|c| c.first()).cloned();
        if let Some(step) = first {
            step(self);
        }
    }

    /// Runs the next step of the chain, if there is one.
    ///
    /// Each step advances the chain at most once. Calling it after the
    /// terminal handler, or a second time from the same middleware, is a
    /// no-op, so a downstream short-circuit cannot be bypassed by retrying.
    pub fn next(&mut self) {
        let caller = self.depth;
        if self.index != caller {
            return;
        }
        let Some(step) = self.chain.as_ref().and_then(|c| c.get(caller + 1)).cloned() else {
            return;
        };
        self.index = caller + 1;
        self.depth = caller + 1;
        step(self);
        self.depth = caller;
    }

    /// Finalizes the writer into a response. Called once, after the chain.
    pub(crate) fn take_response(&mut self) -> http::Response<bytes::Bytes> {
        let fallback = if self.aborted {
            if !self.writer.is_committed() {
                self.writer.headers_mut().clear();
            }
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            self.status.unwrap_or(StatusCode::OK)
        };
        mem::take(&mut self.writer).into_response(fallback)
    }

    // ── Key/value store ──────────────────────────────────────────────────────

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set<V: Any + Send + Sync>(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let value: Value = Arc::new(value);
        let mut keys = self.keys.write();
        match keys.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => keys.push((key, value)),
        }
    }

    /// Returns the value under `key` if it exists and has type `V`.
    pub fn get<V: Any + Send + Sync>(&self, key: &str) -> Option<Arc<V>> {
        let value = self.keys.read().iter().find(|(k, _)| k == key).map(|(_, v)| Arc::clone(v))?;
        value.downcast::<V>().ok()
    }

    pub fn del(&self, key: &str) {
        self.keys.write().retain(|(k, _)| k != key);
    }

    // ── Request side ─────────────────────────────────────────────────────────

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Shortcut for `self.request().param(key)`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.request.param(key)
    }

    /// Shortcut for `self.request().header(name)`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.header(name)
    }

    /// Deserializes the request body as JSON.
    pub fn bind_json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_slice(self.request.body())?)
    }

    /// [`bind_json`](Context::bind_json) followed by the dispatcher's validator.
    pub fn bind_valid<T: DeserializeOwned + Validate>(&self) -> Result<T, Error> {
        let value: T = self.bind_json()?;
        if let Some(services) = &self.services {
            services.validator.structure(&value)?;
        }
        Ok(value)
    }

    /// Checks `value` against `rules` with the dispatcher's validator.
    pub fn validate_var(&self, value: &str, rules: &str) -> Result<(), Error> {
        match &self.services {
            Some(services) => services.validator.var(value, rules),
            None => Ok(()),
        }
    }

    /// Whether the owning dispatcher runs in debug mode.
    pub fn is_debug(&self) -> bool {
        self.services.as_ref().is_some_and(|s| s.debug)
    }

    // ── Response side ────────────────────────────────────────────────────────

    /// Status chosen by the output method, or by [`write_header`](Context::write_header).
    ///
    /// After a response hook fails this is `500`, the status actually sent.
    pub fn status(&self) -> Option<StatusCode> {
        if self.aborted && !self.writer.is_committed() {
            return Some(StatusCode::INTERNAL_SERVER_ERROR);
        }
        self.status
    }

    /// Pending response headers.
    pub fn response_headers(&self) -> &HeaderMap {
        self.writer.headers()
    }

    pub fn response_headers_mut(&mut self) -> &mut HeaderMap {
        self.writer.headers_mut()
    }

    pub fn set_header(&mut self, name: HeaderName, value: &str) {
        self.writer.set_header(name, value);
    }

    fn set_default_header(&mut self, name: HeaderName, value: &'static str) {
        self.writer.headers_mut().entry(name).or_insert(HeaderValue::from_static(value));
    }

    /// Registers a response hook. See the [module docs](self) for ordering.
    pub fn hook<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Context, Vec<u8>) -> Result<Vec<u8>, Error> + Send + Sync + 'static,
    {
        self.hooks.push(Box::new(f));
    }

    /// Commits `status` with no body and without running hooks.
    /// Used for short-circuits such as `304 Not Modified`.
    pub fn write_header(&mut self, status: StatusCode) {
        self.record_status(status);
        self.writer.write_header(status);
    }

    /// Plain-text response.
    pub fn string(&mut self, status: StatusCode, body: impl AsRef<str>) {
        self.set_default_header(CONTENT_TYPE, "text/plain; charset=utf-8");
        self.write(status, body.as_ref().as_bytes());
    }

    /// JSON response. A value that fails to serialize becomes a `500`.
    pub fn json<T: Serialize + ?Sized>(&mut self, status: StatusCode, value: &T) {
        let mut buf = self.take_buffer();
        if let Err(e) = serde_json::to_writer(&mut buf, value) {
            self.give_buffer(buf);
            self.string(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            return;
        }
        self.set_header(CONTENT_TYPE, "application/json");
        self.write_buffer(status, buf);
    }

    /// Raw bytes with an explicit content type.
    pub fn blob(&mut self, status: StatusCode, content_type: &str, data: &[u8]) {
        self.set_header(CONTENT_TYPE, content_type);
        self.write(status, data);
    }

    /// Serves a file from disk with `Last-Modified` / `If-Modified-Since`
    /// handling.
    ///
    /// Without hooks the file is streamed into the writer; with hooks it is
    /// read into a pooled buffer first so the hooks can see all of it. A
    /// satisfied `If-Modified-Since` answers `304` without running hooks.
    pub fn file(&mut self, path: impl AsRef<Path>) {
        let path = clean_path(path.as_ref());
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                error!(path = %path.display(), error = %e, "open file failed");
                self.string(StatusCode::NOT_FOUND, "404 page not found");
                return;
            }
        };
        let meta = match file.metadata() {
            Ok(m) => m,
            Err(e) => {
                error!(path = %path.display(), error = %e, "stat file failed");
                self.string(StatusCode::FORBIDDEN, "forbidden");
                return;
            }
        };
        if meta.is_dir() {
            error!(path = %path.display(), "directory is not supported");
            self.string(StatusCode::FORBIDDEN, "forbidden");
            return;
        }

        if let Ok(modified) = meta.modified() {
            let modified = DateTime::<Utc>::from(modified);
            self.set_header(LAST_MODIFIED, &http_date(modified));
            let since = self.request.header(IF_MODIFIED_SINCE.as_str()).map(str::to_owned);
            if let Some(since) = since {
                match parse_http_date(&since) {
                    Some(since) if modified.timestamp() <= since.timestamp() => {
                        self.write_header(StatusCode::NOT_MODIFIED);
                        return;
                    }
                    Some(_) => {}
                    None => warn!(value = %since, "unparseable If-Modified-Since"),
                }
            }
        }
        if let Some(ct) = content_type(&path) {
            self.set_header(CONTENT_TYPE, ct);
        }

        self.record_status(StatusCode::OK);
        if self.hooks.is_empty() {
            self.writer.write_header(StatusCode::OK);
            if let Err(e) = io::copy(&mut file, &mut self.writer) {
                let written = self.writer.written();
                self.report_write_error(written, &e.into());
            }
            return;
        }

        let mut buf = self.take_buffer();
        if let Err(e) = file.read_to_end(&mut buf) {
            self.aborted = true;
            self.report_write_error(0, &e.into());
            return;
        }
        self.write_buffer(StatusCode::OK, buf);
    }

    /// Renders template `name` with the dispatcher's [`Renderer`](crate::Renderer).
    ///
    /// The template always renders into a buffer first, so a failing template
    /// becomes a clean `500` instead of a half-written page.
    pub fn render<T: Serialize + ?Sized>(&mut self, status: StatusCode, name: &str, data: &T) {
        let Some(renderer) = self.services.as_ref().and_then(|s| s.renderer.clone()) else {
            error!(template = name, "renderer not configured");
            self.string(StatusCode::INTERNAL_SERVER_ERROR, "server error");
            return;
        };
        let data = match serde_json::to_value(data) {
            Ok(v) => v,
            Err(e) => {
                error!(template = name, error = %e, "render data is not serializable");
                self.string(StatusCode::INTERNAL_SERVER_ERROR, "server error");
                return;
            }
        };
        let mut buf = self.take_buffer();
        if let Err(e) = renderer.execute_template(&mut buf, name, &data) {
            error!(template = name, error = %e, "render failed");
            self.give_buffer(buf);
            self.string(StatusCode::INTERNAL_SERVER_ERROR, "server error");
            return;
        }
        self.set_default_header(CONTENT_TYPE, "text/html; charset=utf-8");
        self.write_buffer(status, buf);
    }

    // ── Write paths ──────────────────────────────────────────────────────────

    fn record_status(&mut self, status: StatusCode) {
        if !self.writer.is_committed() {
            self.status = Some(status);
        }
    }

    /// Writes `body` through the hook chain without touching `Content-Type`.
    pub(crate) fn write(&mut self, status: StatusCode, body: &[u8]) {
        if self.hooks.is_empty() {
            self.record_status(status);
            self.commit(status, body);
            return;
        }
        let mut buf = self.take_buffer();
        buf.extend_from_slice(body);
        self.write_buffer(status, buf);
    }

    fn write_buffer(&mut self, status: StatusCode, buf: Vec<u8>) {
        self.record_status(status);
        let buf = match self.apply_hooks(buf) {
            Ok(buf) => buf,
            Err(e) => {
                self.aborted = true;
                self.report_write_error(0, &e);
                return;
            }
        };
        self.commit(status, &buf);
        self.give_buffer(buf);
    }

    fn commit(&mut self, status: StatusCode, body: &[u8]) {
        self.writer.write_header(status);
        self.writer.write_body(body);
    }

    fn apply_hooks(&mut self, mut buf: Vec<u8>) -> Result<Vec<u8>, Error> {
        let mut hooks = mem::take(&mut self.hooks);
        let outcome = loop {
            let Some(hook) = hooks.pop() else { break Ok(buf) };
            match hook(self, buf) {
                Ok(next) => buf = next,
                Err(e) => break Err(e),
            }
        };
        hooks.clear();
        self.hooks = hooks;
        outcome
    }

    fn take_buffer(&self) -> Vec<u8> {
        self.services.as_ref().map(|s| s.buffers.get()).unwrap_or_default()
    }

    fn give_buffer(&self, buf: Vec<u8>) {
        if let Some(services) = &self.services {
            if buf.capacity() <= MAX_POOLED_BUFFER {
                services.buffers.put(buf);
            }
        }
    }

    fn report_write_error(&self, written: usize, err: &Error) {
        match self.services.clone() {
            Some(services) => (services.on_write_error)(&self.request.info(), written, err),
            None => warn!(written, error = %err, "response write failed"),
        }
    }
}

impl Reset for Context {
    fn reset(&mut self) {
        self.index = 0;
        self.depth = 0;
        self.status = None;
        self.aborted = false;
        self.chain = None;
        self.keys.get_mut().clear();
        self.request = Request::default();
        self.writer = ResponseWriter::new();
        self.hooks.clear();
        self.services = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;

    use super::*;
    use crate::handler::from_fn;
    use crate::pool::Pool;
    use crate::request::RequestInfo;

    fn services() -> Arc<Services> {
        Arc::new(Services::default())
    }

    fn get(uri: &str) -> Request {
        Request::from_http(http::Request::get(uri).body(Bytes::new()).unwrap(), None)
    }

    fn run(chain: Vec<Middleware>) -> (Context, http::Response<Bytes>) {
        let mut c = Context::new();
        c.prepare(chain.into(), get("/"), services());
        c.run();
        let res = c.take_response();
        (c, res)
    }

    #[test]
    fn hooks_run_last_registered_first() {
        let order = Arc::new(Mutex::new(String::new()));
        let (o1, o2) = (Arc::clone(&order), Arc::clone(&order));
        let (_, res) = run(vec![
            from_fn(move |c: &mut Context| {
                let order = Arc::clone(&o1);
                c.hook(move |_, mut buf| {
                    order.lock().unwrap().push_str("outer ");
                    buf.extend_from_slice(b"+outer");
                    Ok(buf)
                });
                c.next();
            }),
            from_fn(move |c: &mut Context| {
                let order = Arc::clone(&o2);
                c.hook(move |_, mut buf| {
                    order.lock().unwrap().push_str("inner ");
                    buf.extend_from_slice(b"+inner");
                    Ok(buf)
                });
                c.next();
            }),
            from_fn(|c: &mut Context| c.string(StatusCode::OK, "body")),
        ]);
        assert_eq!(*order.lock().unwrap(), "inner outer ");
        assert_eq!(res.body().as_ref(), b"body+inner+outer");
    }

    #[test]
    fn hooks_may_set_headers_before_commit() {
        let (_, res) = run(vec![
            from_fn(|c: &mut Context| {
                c.hook(|c, buf| {
                    c.set_header(HeaderName::from_static("x-len"), &buf.len().to_string());
                    Ok(buf)
                });
                c.next();
            }),
            from_fn(|c: &mut Context| c.string(StatusCode::CREATED, "abc")),
        ]);
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(res.headers()["x-len"], "3");
    }

    #[test]
    fn failing_hook_aborts_without_commit() {
        let reported = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&reported);
        let mut services = Services::default();
        services.on_write_error = Arc::new(move |_: &RequestInfo, n: usize, e: &Error| {
            *seen.lock().unwrap() = Some((n, e.to_string()));
        });

        let mut c = Context::new();
        let chain: Vec<Middleware> = vec![
            from_fn(|c: &mut Context| {
                c.hook(|_, _| Err(Error::Hook("nope".into())));
                c.next();
            }),
            from_fn(|c: &mut Context| c.string(StatusCode::OK, "secret")),
        ];
        c.prepare(chain.into(), get("/"), Arc::new(services));
        c.run();
        let res = c.take_response();

        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(res.body().is_empty());
        let (n, msg) = reported.lock().unwrap().clone().unwrap();
        assert_eq!(n, 0);
        assert!(msg.contains("nope"));
    }

    #[test]
    fn next_past_the_end_is_a_no_op() {
        let (_, res) = run(vec![from_fn(|c: &mut Context| {
            c.string(StatusCode::OK, "done");
            c.next();
            c.next();
        })]);
        assert_eq!(res.body().as_ref(), b"done");
    }

    #[test]
    fn second_next_cannot_bypass_a_short_circuit() {
        let handled = Arc::new(Mutex::new(0));
        let hits = Arc::clone(&handled);
        let (_, res) = run(vec![
            from_fn(|c: &mut Context| {
                c.next();
                c.next();
            }),
            from_fn(|c: &mut Context| c.string(StatusCode::FORBIDDEN, "no")),
            from_fn(move |c: &mut Context| {
                *hits.lock().unwrap() += 1;
                c.string(StatusCode::OK, "secret");
            }),
        ]);
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert_eq!(res.body().as_ref(), b"no");
        assert_eq!(*handled.lock().unwrap(), 0);
    }

    #[test]
    fn every_step_still_runs_once_on_a_full_chain() {
        let trail = Arc::new(Mutex::new(String::new()));
        let step = |name: &'static str, trail: &Arc<Mutex<String>>| {
            let trail = Arc::clone(trail);
            from_fn(move |c: &mut Context| {
                trail.lock().unwrap().push_str(name);
                c.next();
                c.next();
            })
        };
        let t = Arc::clone(&trail);
        let (_, res) = run(vec![
            step("a", &trail),
            step("b", &trail),
            from_fn(move |c: &mut Context| {
                t.lock().unwrap().push('h');
                c.string(StatusCode::OK, "ok");
            }),
        ]);
        assert_eq!(*trail.lock().unwrap(), "abh");
        assert_eq!(res.body().as_ref(), b"ok");
    }

    #[test]
    fn status_reports_500_after_hook_failure() {
        let seen = Arc::new(Mutex::new(None));
        let outer = Arc::clone(&seen);
        let (_, res) = run(vec![
            from_fn(move |c: &mut Context| {
                c.next();
                *outer.lock().unwrap() = c.status();
            }),
            from_fn(|c: &mut Context| {
                c.hook(|_, _| Err(Error::Hook("disk full".into())));
                c.next();
            }),
            from_fn(|c: &mut Context| c.string(StatusCode::OK, "lost")),
        ]);
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(*seen.lock().unwrap(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn keys_are_typed_and_shareable_with_scoped_threads() {
        let c = Context::new();
        c.set("user", String::from("linda"));
        std::thread::scope(|s| {
            s.spawn(|| c.set("count", 3_u32));
        });
        assert_eq!(c.get::<String>("user").as_deref().map(String::as_str), Some("linda"));
        assert_eq!(c.get::<u32>("count").as_deref(), Some(&3));
        assert!(c.get::<u64>("count").is_none());
        c.del("user");
        assert!(c.get::<String>("user").is_none());
    }

    #[test]
    fn pooled_context_is_clean_on_reacquire() {
        let pool = Pool::new(8, Context::new);
        {
            let mut c = pool.acquire();
            let chain: Vec<Middleware> = vec![from_fn(|c: &mut Context| {
                c.set("leak", 1_u8);
                c.hook(|_, buf| Ok(buf));
                c.string(StatusCode::IM_A_TEAPOT, "x");
            })];
            c.prepare(chain.into(), get("/first?x=1"), services());
            c.run();
            assert_eq!(c.status(), Some(StatusCode::IM_A_TEAPOT));
        }

        let mut c = pool.acquire();
        assert!(c.get::<u8>("leak").is_none());
        assert!(c.keys.read().is_empty());
        assert!(c.hooks.is_empty());
        assert!(c.chain.is_none());
        assert!(c.services.is_none());
        assert_eq!(c.status(), None);
        assert_eq!(c.request().request_uri(), "/");
        assert!(c.response_headers().is_empty());
        assert!(!c.writer.is_committed());
    }

    #[test]
    fn json_sets_content_type() {
        let (_, res) = run(vec![from_fn(|c: &mut Context| {
            c.json(StatusCode::OK, &serde_json::json!({ "id": 1 }));
        })]);
        assert_eq!(res.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(res.body().as_ref(), br#"{"id":1}"#);
    }

    #[test]
    fn render_without_renderer_is_500() {
        let (_, res) = run(vec![from_fn(|c: &mut Context| {
            c.render(StatusCode::OK, "page", &());
        })]);
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.body().as_ref(), b"server error");
    }
}

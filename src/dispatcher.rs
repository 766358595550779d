//! Route registration, chain construction, and the per-request dispatch loop.
//!
//! ```text
//! request ─▶ route table ─┬─ 404 / 405 (no context drawn)
//!                         └─ chain ─▶ pool.acquire() ─▶ catch_unwind(chain[0])
//!                                            │                 │
//!                                            │          panic ─┴─▶ 500
//!                                            ▼
//!                            writer ─▶ http::Response ─▶ guard drop: reset + release
//! ```

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{ALLOW, CONTENT_ENCODING, IF_NONE_MATCH, VARY};
use http::{HeaderValue, Method, StatusCode};
use tracing::{error, info_span, warn};

use crate::context::Context;
use crate::error::Error;
use crate::files::{map_path, MemoryFiles};
use crate::handler::{Handler, Middleware};
use crate::middleware::etag::bypasses_cache;
use crate::middleware::gzip::accepts_gzip;
use crate::pool::Pool;
use crate::render::Renderer;
use crate::request::{Request, RequestInfo};
use crate::response::plain;
use crate::router::{Lookup, Router};
use crate::validate::{RuleValidator, Validator};

/// Called whenever a response body could not be produced or sent.
///
/// Covers failing response hooks and file reads inside the chain, and output
/// I/O failures in the [`Server`](crate::Server) such as a client that hung
/// up. Arguments: the failing request, body bytes written so far, and the
/// error.
pub type WriteErrorHandler = Arc<dyn Fn(&RequestInfo, usize, &Error) + Send + Sync>;

const MAX_IDLE_CONTEXTS: usize = 1024;
const MAX_IDLE_BUFFERS: usize = 256;

/// What every context can reach through its back-reference to the dispatcher.
#[derive(Clone)]
pub(crate) struct Services {
    pub(crate) debug: bool,
    pub(crate) renderer: Option<Arc<dyn Renderer>>,
    pub(crate) validator: Arc<dyn Validator>,
    pub(crate) buffers: Arc<Pool<Vec<u8>>>,
    pub(crate) on_write_error: WriteErrorHandler,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            debug: false,
            renderer: None,
            validator: Arc::new(RuleValidator::new()),
            buffers: Arc::new(Pool::new(MAX_IDLE_BUFFERS, || Vec::with_capacity(4096))),
            on_write_error: Arc::new(log_write_error),
        }
    }
}

fn log_write_error(info: &RequestInfo, written: usize, err: &Error) {
    warn!(
        method = ?info.method,
        uri = ?info.uri,
        peer = ?info.remote_addr,
        written,
        error = %err,
        "response write failed"
    );
}

/// The application: a route table, the global middlewares, and everything a
/// request needs while it runs.
///
/// Build it once at startup; hand it to [`Server::serve`](crate::Server::serve)
/// or call [`dispatch`](Dispatcher::dispatch) directly. Every builder method
/// returns `self` so registrations chain naturally.
///
/// ```rust
/// use http::StatusCode;
/// use peel::{middleware, Context, Dispatcher};
///
/// fn hello(c: &mut Context) {
///     c.string(StatusCode::OK, "Hi");
/// }
///
/// let app = Dispatcher::new()
///     .with(middleware::logger())
///     .get("/", hello);
/// ```
pub struct Dispatcher {
    router: Router,
    global: Vec<Middleware>,
    services: Arc<Services>,
    contexts: Pool<Context>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            router: Router::default(),
            global: Vec::new(),
            services: Arc::new(Services::default()),
            contexts: Pool::new(MAX_IDLE_CONTEXTS, Context::new),
        }
    }

    // ── Configuration ────────────────────────────────────────────────────────

    /// In debug mode a handler panic returns its message and backtrace in the
    /// `500` body.
    pub fn debug(mut self, on: bool) -> Self {
        Arc::make_mut(&mut self.services).debug = on;
        self
    }

    pub fn renderer(mut self, renderer: impl Renderer) -> Self {
        Arc::make_mut(&mut self.services).renderer = Some(Arc::new(renderer));
        self
    }

    /// Replaces the default [`RuleValidator`].
    pub fn validator(mut self, validator: impl Validator) -> Self {
        Arc::make_mut(&mut self.services).validator = Arc::new(validator);
        self
    }

    /// Replaces the default write-error callback, which logs a warning.
    pub fn on_write_error(mut self, f: impl Fn(&RequestInfo, usize, &Error) + Send + Sync + 'static) -> Self {
        Arc::make_mut(&mut self.services).on_write_error = Arc::new(f);
        self
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Adds a global middleware.
    ///
    /// Global middlewares are prepended to the chain of every route registered
    /// **after** this call, so register them first. They run first on the way
    /// in and last on the way out.
    pub fn with(mut self, middleware: Middleware) -> Self {
        self.global.push(middleware);
        self
    }

    /// Binds `handler` to `method` + `path` with no route middlewares.
    pub fn on(self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.route(method, path, std::iter::empty(), handler)
    }

    /// Binds `[global…, middlewares…, handler]` to `method` + `path`.
    ///
    /// Path parameters use `{name}` syntax; `c.param("name")` retrieves them.
    ///
    /// # Panics
    ///
    /// Panics on an invalid or duplicate pattern.
    pub fn route(
        mut self,
        method: Method,
        path: &str,
        middlewares: impl IntoIterator<Item = Middleware>,
        handler: impl Handler,
    ) -> Self {
        let chain: Vec<Middleware> = self.global.iter().cloned()
            .chain(middlewares)
            .chain(std::iter::once(handler.into_middleware()))
            .collect();
        self.router.insert(method, path, chain.into());
        self
    }

    pub fn get(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::GET, path, handler)
    }

    pub fn post(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::POST, path, handler)
    }

    pub fn put(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::PUT, path, handler)
    }

    pub fn delete(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::DELETE, path, handler)
    }

    pub fn patch(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::PATCH, path, handler)
    }

    /// Serves one file from disk at `path` (`GET`).
    pub fn static_file(
        self,
        path: &str,
        file: impl Into<PathBuf>,
        middlewares: impl IntoIterator<Item = Middleware>,
    ) -> Self {
        let file = file.into();
        self.route(Method::GET, path, middlewares, move |c: &mut Context| c.file(&file))
    }

    /// Serves every file below `root` under the URL prefix `prefix` (`GET`).
    /// Paths that try to climb out of `root` answer 404.
    pub fn static_dir(
        self,
        prefix: &str,
        root: impl Into<PathBuf>,
        middlewares: impl IntoIterator<Item = Middleware>,
    ) -> Self {
        let root = root.into();
        let pattern = format!("{}/{{*path}}", prefix.trim_end_matches('/'));
        self.route(Method::GET, &pattern, middlewares, move |c: &mut Context| {
            let mapped = c.param("path").and_then(|p| map_path(&root, p));
            match mapped {
                Some(path) => c.file(path),
                None => c.string(StatusCode::NOT_FOUND, "404 page not found"),
            }
        })
    }

    /// Loads `file` into `store` and serves it from memory at `path` (`GET`),
    /// with a precomputed ETag.
    ///
    /// With `gzip_level` set the asset is stored compressed and clients that
    /// do not send `Accept-Encoding: gzip` get `406`. Images are never
    /// compressed.
    pub fn cache_file(
        self,
        path: &str,
        file: impl Into<PathBuf>,
        store: Arc<MemoryFiles>,
        gzip_level: Option<u32>,
        middlewares: impl IntoIterator<Item = Middleware>,
    ) -> Result<Self, Error> {
        let file = file.into();
        store.load(path, &file, gzip_level)?;
        let key = path.to_owned();
        Ok(self.route(Method::GET, path, middlewares, move |c: &mut Context| {
            serve_memory_file(c, &store, &key)
        }))
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Runs one request through its chain and returns the committed response.
    ///
    /// Blocking: the whole chain runs on the calling thread. The server calls
    /// this from a blocking worker; tests can call it directly.
    pub fn dispatch(&self, req: Request) -> http::Response<Bytes> {
        let (chain, params) = match self.router.lookup(req.method(), req.path()) {
            Lookup::Found(chain, params) => (chain, params),
            Lookup::MethodNotAllowed(allowed) => {
                error!(method = %req.method(), path = req.path(), "method not allowed");
                return method_not_allowed(&allowed);
            }
            Lookup::NotFound => return plain(StatusCode::NOT_FOUND, "404 page not found"),
        };

        let span = info_span!("request", method = %req.method(), uri = req.request_uri());
        let _enter = span.enter();

        let mut c = self.contexts.acquire();
        c.prepare(chain, req.with_params(params), Arc::clone(&self.services));
        match panic::catch_unwind(AssertUnwindSafe(|| c.run())) {
            Ok(()) => c.take_response(),
            Err(payload) => self.recover(payload),
        }
        // `c` drops here: reset and back to the pool, on both arms.
    }

    pub(crate) fn write_error_handler(&self) -> WriteErrorHandler {
        Arc::clone(&self.services.on_write_error)
    }

    fn recover(&self, payload: Box<dyn Any + Send>) -> http::Response<Bytes> {
        let message = panic_message(payload.as_ref());
        let backtrace = Backtrace::force_capture();
        error!(panic = %message, backtrace = %backtrace, "handler panicked");
        if self.services.debug {
            plain(StatusCode::INTERNAL_SERVER_ERROR, format!("{message}\n\n{backtrace}"))
        } else {
            plain(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self { Self::new() }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

fn method_not_allowed(allowed: &[Method]) -> http::Response<Bytes> {
    let mut res = plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    let list = allowed.iter().map(Method::as_str).collect::<Vec<_>>().join(", ");
    if let Ok(v) = HeaderValue::from_str(&list) {
        res.headers_mut().insert(ALLOW, v);
    }
    res
}

fn serve_memory_file(c: &mut Context, store: &MemoryFiles, key: &str) {
    let Some(file) = store.get(key) else {
        c.string(StatusCode::NOT_FOUND, "404 page not found");
        return;
    };
    let matches = c.header(IF_NONE_MATCH.as_str()).is_some_and(|inm| inm.contains(&file.etag));
    if matches && !bypasses_cache(c.request()) {
        c.write_header(StatusCode::NOT_MODIFIED);
        return;
    }
    if file.gzipped {
        if !accepts_gzip(c.request()) {
            c.string(StatusCode::NOT_ACCEPTABLE, "need gzip");
            return;
        }
        c.set_header(CONTENT_ENCODING, "gzip");
        c.set_header(VARY, "Accept-Encoding");
    }
    c.set_header(http::header::ETAG, &file.etag);
    let content_type = file.content_type.unwrap_or("application/octet-stream");
    c.blob(StatusCode::OK, content_type, &file.data);
}

//! HTTP server and graceful shutdown.
//!
//! Each request body is collected on the connection task, then the chain runs
//! on a tokio blocking worker, since middlewares and handlers are plain
//! synchronous functions. The committed response goes back to hyper as a
//! single-frame body.
//!
//! # Output failures
//!
//! Sending can still fail after the chain is done. Both ways it does end up
//! in the dispatcher's write-error callback:
//!
//! - the connection drops the response before taking its body, e.g. the
//!   client hung up while the chain ran;
//! - the connection fails with an I/O error, e.g. a reset while writing. The
//!   request is unknown at that level, so only the peer is reported.
//!
//! # Graceful shutdown
//!
//! On **SIGTERM** or Ctrl-C the server:
//! 1. stops accepting connections,
//! 2. lets every in-flight connection task run to completion,
//! 3. returns from [`Server::serve`].

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::dispatcher::{Dispatcher, WriteErrorHandler};
use crate::error::Error;
use crate::request::{Request, RequestInfo};
use crate::response::plain;

/// The HTTP server.
pub struct Server {
    addr: SocketAddr,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    ///
    /// ```rust
    /// use peel::Server;
    /// let server = Server::bind("0.0.0.0:3000").unwrap();
    /// ```
    pub fn bind(addr: &str) -> Result<Self, Error> {
        let addr = addr.parse().map_err(|_| Error::InvalidAddr(addr.to_owned()))?;
        Ok(Self { addr })
    }

    /// Serves `app` until SIGTERM or Ctrl-C, then drains in-flight
    /// connections.
    pub async fn serve(self, app: Dispatcher) -> Result<(), Error> {
        self.serve_with_shutdown(app, shutdown_signal()).await
    }

    /// Serves `app` until `shutdown` resolves, then drains in-flight
    /// connections.
    pub async fn serve_with_shutdown(
        self,
        app: Dispatcher,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        let listener = TcpListener::bind(self.addr).await?;
        let app = Arc::new(app);

        info!(addr = %self.addr, "peel listening");

        let mut tasks = tokio::task::JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let app = Arc::clone(&app);
                    let on_error = app.write_error_handler();
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        let svc = service_fn(move |req| {
                            let app = Arc::clone(&app);
                            async move { handle(app, req, remote_addr).await }
                        });

                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            match io_cause(e.as_ref()) {
                                Some(cause) => {
                                    on_error(&RequestInfo::connection(remote_addr), 0, &Error::Io(cause))
                                }
                                None => error!(peer = %remote_addr, "connection error: {e}"),
                            }
                        }
                    });
                }

                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        info!("peel stopped");
        Ok(())
    }
}

// ── Request hand-off ──────────────────────────────────────────────────────────

/// Collects the body, runs the chain on a blocking worker, and converts the
/// result for hyper. Every failure becomes a response; hyper never sees an
/// error.
async fn handle(
    app: Arc<Dispatcher>,
    req: hyper::Request<Incoming>,
    remote_addr: SocketAddr,
) -> Result<http::Response<ResponseBody>, Infallible> {
    let on_error = app.write_error_handler();
    let (parts, body) = req.into_parts();
    let info = RequestInfo {
        method: Some(parts.method.clone()),
        uri: Some(parts.uri.path_and_query().map_or("/", |pq| pq.as_str()).to_owned()),
        remote_addr: Some(remote_addr),
    };
    let head = parts.method == Method::HEAD;

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!(peer = %remote_addr, "read body failed: {e}");
            let res = plain(StatusCode::BAD_REQUEST, "bad request");
            return Ok(ResponseBody::wrap(res, head, info, on_error));
        }
    };
    let req = Request::from_http(http::Request::from_parts(parts, body), Some(remote_addr));

    let res = match tokio::task::spawn_blocking(move || app.dispatch(req)).await {
        Ok(res) => res,
        Err(e) => {
            error!("dispatch worker failed: {e}");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    };
    Ok(ResponseBody::wrap(res, head, info, on_error))
}

/// A committed response body on its way to the connection.
///
/// Dropped while still holding bytes that were meant to be sent, it reports
/// the loss to the write-error callback.
pub(crate) struct ResponseBody {
    data: Option<Bytes>,
    /// Whether the connection is expected to send `data` at all.
    expected: bool,
    info: RequestInfo,
    on_error: WriteErrorHandler,
}

impl ResponseBody {
    fn wrap(
        res: http::Response<Bytes>,
        head: bool,
        info: RequestInfo,
        on_error: WriteErrorHandler,
    ) -> http::Response<Self> {
        let bodiless = head
            || res.status().is_informational()
            || res.status() == StatusCode::NO_CONTENT
            || res.status() == StatusCode::NOT_MODIFIED;
        res.map(|data| Self {
            expected: !bodiless && !data.is_empty(),
            data: Some(data).filter(|d| !d.is_empty()),
            info,
            on_error,
        })
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        Poll::Ready(self.get_mut().data.take().map(|d| Ok(Frame::data(d))))
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.data.as_ref().map_or(0, |d| d.len() as u64))
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        if self.expected && self.data.is_some() {
            let err = io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed before the body was sent");
            (self.on_error)(&self.info, 0, &Error::Io(err));
        }
    }
}

/// The first I/O error in `err`'s source chain, rebuilt as an owned error.
fn io_cause(err: &(dyn std::error::Error + 'static)) -> Option<io::Error> {
    let mut cur = Some(err);
    while let Some(e) = cur {
        if let Some(io) = e.downcast_ref::<io::Error>() {
            return Some(io::Error::new(io.kind(), io.to_string()));
        }
        cur = e.source();
    }
    None
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first of SIGTERM (Unix) or Ctrl-C.
///
/// If a handler cannot be installed its arm never resolves, so the server
/// keeps running on the other signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    type Reports = Arc<Mutex<Vec<(RequestInfo, usize, String)>>>;

    fn recorder() -> (Reports, WriteErrorHandler) {
        let reports: Reports = Arc::default();
        let sink = Arc::clone(&reports);
        let handler: WriteErrorHandler = Arc::new(move |info: &RequestInfo, n: usize, e: &Error| {
            sink.lock().unwrap().push((info.clone(), n, e.to_string()));
        });
        (reports, handler)
    }

    fn info(method: Method) -> RequestInfo {
        RequestInfo {
            method: Some(method),
            uri: Some("/report?x=1".to_owned()),
            remote_addr: "127.0.0.1:9000".parse().ok(),
        }
    }

    fn ok(body: &'static str) -> http::Response<Bytes> {
        plain(StatusCode::OK, body)
    }

    #[test]
    fn bind_rejects_bad_addresses() {
        assert!(Server::bind("127.0.0.1:8080").is_ok());
        assert!(matches!(Server::bind("localhost"), Err(Error::InvalidAddr(_))));
    }

    #[test]
    fn unsent_body_is_reported() {
        let (reports, handler) = recorder();
        drop(ResponseBody::wrap(ok("payload"), false, info(Method::GET), handler));

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        let (who, written, err) = &reports[0];
        assert_eq!(who, &info(Method::GET));
        assert_eq!(*written, 0);
        assert!(err.contains("connection closed"), "{err}");
    }

    #[tokio::test]
    async fn sent_body_is_not_reported() {
        let (reports, handler) = recorder();
        let res = ResponseBody::wrap(ok("payload"), false, info(Method::GET), handler);
        assert_eq!(res.body().size_hint().exact(), Some(7));

        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"payload");
        assert!(reports.lock().unwrap().is_empty());
    }

    #[test]
    fn bodiless_responses_are_not_reported() {
        let (reports, handler) = recorder();
        drop(ResponseBody::wrap(ok("payload"), true, info(Method::HEAD), Arc::clone(&handler)));
        drop(ResponseBody::wrap(plain(StatusCode::NOT_MODIFIED, ""), false, info(Method::GET), Arc::clone(&handler)));
        drop(ResponseBody::wrap(ok(""), false, info(Method::GET), handler));
        assert!(reports.lock().unwrap().is_empty());
    }

    #[test]
    fn io_cause_walks_the_source_chain() {
        #[derive(Debug, thiserror::Error)]
        #[error("connection failed")]
        struct Wrapped(#[source] io::Error);

        let err = Wrapped(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        let cause = io_cause(&err).unwrap();
        assert_eq!(cause.kind(), io::ErrorKind::BrokenPipe);

        let plain_err = Error::Other("no io here".into());
        assert!(io_cause(&plain_err).is_none());
    }
}

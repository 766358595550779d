//! # peel
//!
//! An onion-style HTTP middleware engine.
//!
//! A request travels inwards through an ordered chain of middlewares to a
//! terminal handler and back out again. Every step is a plain function over a
//! pooled [`Context`] and decides for itself whether to continue with
//! [`Context::next`], short-circuit, or do work on the way out.
//!
//! ## Response hooks
//!
//! Headers commit on the first write, which normally makes ETags, compression
//! and response caching step on each other's toes. peel lets a middleware
//! register a [hook](Context::hook) instead: when a handler writes, the body
//! is buffered, every hook transforms it (last registered first), and only
//! then are status, headers and bytes committed, exactly once.
//!
//! ```text
//!          ┌──────── logger ────────┐
//!          │   ┌───── etag ──────┐  │
//!          │   │   ┌── gzip ──┐  │  │
//! request ─┼───┼───┼─▶ handler│  │  │
//!          │   │   └─ hook ◀──┘  │  │   body: raw ─▶ gzip ─▶ hash ─▶ measure ─▶ commit
//!          │   └─── hook ◀───────┘  │
//!          └─────── hook ◀──────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use dashmap::DashMap;
//! use http::{Method, StatusCode};
//! use peel::{middleware, Context, Dispatcher, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), peel::Error> {
//!     let tags = Arc::new(DashMap::new());
//!     let app = Dispatcher::new()
//!         .with(middleware::logger())
//!         .route(Method::GET, "/users/{id}", [middleware::etag(tags)], get_user)
//!         .post("/users", create_user);
//!
//!     Server::bind("0.0.0.0:3000")?.serve(app).await
//! }
//!
//! fn get_user(c: &mut Context) {
//!     let id = c.param("id").unwrap_or("unknown").to_owned();
//!     c.json(StatusCode::OK, &serde_json::json!({ "id": id }));
//! }
//!
//! fn create_user(c: &mut Context) {
//!     if c.request().body().is_empty() {
//!         c.string(StatusCode::BAD_REQUEST, "empty body");
//!         return;
//!     }
//!     c.set_header(http::header::LOCATION, "/users/99");
//!     c.string(StatusCode::CREATED, "");
//! }
//! ```

mod context;
mod dispatcher;
mod error;
mod files;
mod handler;
mod pool;
mod render;
mod request;
mod response;
mod router;
mod server;
mod validate;

pub mod health;
pub mod middleware;

pub use context::{Context, Hook};
pub use dispatcher::{Dispatcher, WriteErrorHandler};
pub use error::Error;
pub use files::{MemoryFile, MemoryFiles, GZIP_EXCLUDED_EXTENSIONS};
pub use handler::{Handler, Middleware};
pub use pool::{Pool, Pooled, Reset};
pub use render::Renderer;
pub use request::{Request, RequestInfo};
pub use response::ResponseWriter;
pub use server::Server;
pub use validate::{RuleValidator, Validate, Validator};

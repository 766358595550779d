//! Built-in middlewares.
//!
//! Every constructor here returns a [`Middleware`](crate::Middleware): an
//! `Arc<dyn Fn(&mut Context)>` that can be passed to
//! [`Dispatcher::with`](crate::Dispatcher::with) or listed in
//! [`Dispatcher::route`](crate::Dispatcher::route).
//!
//! Middlewares that need to see the finished body (`etag`, `cache`, `gzip`,
//! `logger`) register a response hook. Hooks run in reverse registration
//! order, so list them outermost first:
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use dashmap::DashMap;
//! use http::{Method, StatusCode};
//! use peel::{middleware, Context, Dispatcher};
//!
//! let tags = Arc::new(DashMap::new());
//! let app = Dispatcher::new().route(
//!     Method::GET,
//!     "/report",
//!     [middleware::logger(), middleware::etag(tags), middleware::gzip(6)],
//!     |c: &mut Context| c.string(StatusCode::OK, "quarterly numbers"),
//! );
//! ```
//!
//! Here gzip compresses first, the ETag hashes the compressed bytes, and the
//! logger reports the size that went on the wire.

pub mod auth;
pub mod cache;
pub mod etag;
pub mod gzip;
pub mod ip;
pub mod jwt;
pub mod logger;
pub mod rate_limit;
pub mod security;
pub mod validator;

pub use auth::basic_auth;
pub use cache::{cache, ByteCache, MemoryCache};
pub use etag::etag;
pub use gzip::gzip;
pub use ip::{client_ip, client_public_ip, is_local_ip, IpAdmission};
pub use jwt::Jwt;
pub use logger::logger;
pub use rate_limit::{rate_limit, Limiter, RateLimitConfig, TokenBucket};
pub use security::{clickjacking, headers};
pub use validator::validator;

pub use crate::handler::from_fn;

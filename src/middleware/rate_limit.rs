//! Token-bucket rate limiting.
//!
//! ```text
//! request ─▶ rate_limit ─▶ Limiter::take(1) ─┬─ Ok  ─▶ next()
//!                                            └─ Err ─▶ 429
//! ```
//!
//! One bucket guards everything the middleware is attached to. Attach
//! separate limiters to separate routes for per-route budgets.

use std::sync::Arc;
use std::time::Instant;

use http::StatusCode;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::Context;
use crate::error::Error;
use crate::handler::{from_fn, Middleware};

/// Anything that can hand out permits.
pub trait Limiter: Send + Sync + 'static {
    /// Takes `n` permits, or fails with [`Error::RateLimited`] without taking
    /// any.
    fn take(&self, n: u32) -> Result<(), Error>;
}

/// Settings for a [`TokenBucket`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained permits per second (default: 100).
    pub rate: f64,
    /// Bucket capacity, the largest instantaneous burst (default: 10).
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { rate: 100.0, burst: 10 }
    }
}

impl RateLimitConfig {
    pub fn new(rate: f64) -> Self {
        Self { rate, ..Default::default() }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_update: Instant,
}

/// Classic token bucket: starts full, refills continuously at `rate`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    state: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        info!(rate = config.rate, burst = config.burst, "creating token bucket");
        let capacity = f64::from(config.burst.max(1));
        Self {
            capacity,
            rate: config.rate.max(0.0),
            state: Mutex::new(Bucket { tokens: capacity, last_update: Instant::now() }),
        }
    }

    /// Whole permits currently available.
    pub fn available(&self) -> u32 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens.floor() as u32
    }

    fn refill(&self, state: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_update = now;
    }
}

impl Limiter for TokenBucket {
    fn take(&self, n: u32) -> Result<(), Error> {
        let mut state = self.state.lock();
        self.refill(&mut state);
        let want = f64::from(n);
        if state.tokens >= want {
            state.tokens -= want;
            return Ok(());
        }
        Err(Error::RateLimited(format!(
            "{n} requested, {:.0} available",
            state.tokens.floor()
        )))
    }
}

/// Answers `429 Too Many Requests` once `limiter` runs dry.
pub fn rate_limit(limiter: Arc<dyn Limiter>) -> Middleware {
    from_fn(move |c: &mut Context| match limiter.take(1) {
        Ok(()) => c.next(),
        Err(e) => c.string(StatusCode::TOO_MANY_REQUESTS, e.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_fill_missing_fields() {
        let cfg: RateLimitConfig = serde_json::from_str(r#"{ "burst": 3 }"#).unwrap();
        assert_eq!(cfg, RateLimitConfig { rate: 100.0, burst: 3 });
    }

    #[test]
    fn bucket_drains_then_rejects() {
        let bucket = TokenBucket::new(RateLimitConfig::new(0.0).with_burst(2));
        assert!(bucket.take(1).is_ok());
        assert!(bucket.take(1).is_ok());
        let err = bucket.take(1).unwrap_err();
        assert!(matches!(err, Error::RateLimited(_)));
        assert_eq!(bucket.available(), 0);
    }

    #[test]
    fn middleware_answers_429_when_dry() {
        use bytes::Bytes;

        use crate::dispatcher::Dispatcher;
        use crate::request::Request;

        let bucket = Arc::new(TokenBucket::new(RateLimitConfig::new(0.0).with_burst(1)));
        let app = Dispatcher::new().route(http::Method::GET, "/", [rate_limit(bucket)], |c: &mut Context| {
            c.string(StatusCode::OK, "ok")
        });
        let get = || Request::from_http(http::Request::get("/").body(Bytes::new()).unwrap(), None);

        assert_eq!(app.dispatch(get()).status(), StatusCode::OK);
        assert_eq!(app.dispatch(get()).status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn oversized_take_takes_nothing() {
        let bucket = TokenBucket::new(RateLimitConfig::new(0.0).with_burst(3));
        assert!(bucket.take(5).is_err());
        assert_eq!(bucket.available(), 3);
    }
}

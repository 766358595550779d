//! Handler trait and type erasure.
//!
//! # How handlers are stored
//!
//! A route's chain mixes middlewares built by different constructors with
//! the terminal handler the user wrote. Rust collections hold one concrete
//! type, so every step is erased to the same trait object and stored in a
//! shared slice built once at registration time:
//!
//! ```text
//! fn hello(c: &mut Context) { … }                ← user writes this
//!        ↓ dispatcher.get("/", hello)
//! hello.into_middleware()                        ← Handler blanket impl
//!        ↓
//! Arc<dyn Fn(&mut Context) + Send + Sync>        ← Middleware
//!        ↓  [global…, route…, handler] as Arc<[Middleware]>
//! chain[c.index](c)  at request time             ← one vtable call per step
//! ```
//!
//! The per-request cost of walking the chain is one `Arc` clone per step.
//! Nothing is boxed per request.

use std::sync::Arc;

use crate::context::Context;

/// One step of a route's chain: a global middleware, a route middleware, or
/// the terminal handler. All three share this type.
pub type Middleware = Arc<dyn Fn(&mut Context) + Send + Sync + 'static>;

/// Implemented for every valid route handler.
///
/// You never implement this yourself. It is satisfied by any function or
/// closure with the signature:
///
/// ```text
/// fn name(c: &mut Context)
/// ```
///
/// The trait is **sealed** (via the private `Sealed` supertrait): only the
/// blanket impl below can satisfy it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_middleware(self) -> Middleware;
}

mod private {
    pub trait Sealed {}
}

impl<F> private::Sealed for F where F: Fn(&mut Context) + Send + Sync + 'static {}

impl<F> Handler for F
where
    F: Fn(&mut Context) + Send + Sync + 'static,
{
    fn into_middleware(self) -> Middleware {
        Arc::new(self)
    }
}

/// Wraps a closure as a [`Middleware`].
///
/// ```rust
/// use peel::{middleware, Context};
///
/// let timing = middleware::from_fn(|c: &mut Context| {
///     let start = std::time::Instant::now();
///     c.next();
///     tracing::debug!(elapsed = ?start.elapsed(), "done");
/// });
/// ```
pub fn from_fn(f: impl Handler) -> Middleware {
    f.into_middleware()
}

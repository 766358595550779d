//! Health-check handlers for orchestrator probes.
//!
//! | Probe | Path | Question |
//! |---|---|---|
//! | **Liveness** | `/healthz` | Is the process alive? Failure → restart. |
//! | **Readiness** | `/readyz` | Can the pod serve traffic? Failure → pulled from load-balancer. |
//!
//! ```rust
//! use peel::{health, Dispatcher};
//!
//! let app = Dispatcher::new()
//!     .get("/healthz", health::liveness)
//!     .get("/readyz", health::readiness);
//! ```
//!
//! Replace `readiness` with your own handler to gate on dependencies.

use http::StatusCode;

use crate::context::Context;

/// Always `200 ok`.
pub fn liveness(c: &mut Context) {
    c.string(StatusCode::OK, "ok");
}

/// Always `200 ready`.
pub fn readiness(c: &mut Context) {
    c.string(StatusCode::OK, "ready");
}

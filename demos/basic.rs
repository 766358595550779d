//! Minimal peel demo: JSON endpoints, conditional GET, compression, a cached
//! page, basic auth, and health checks.
//!
//! Run with:
//!   RUST_LOG=debug cargo run --example basic
//!
//! Try:
//!   curl -i http://localhost:3000/users/42
//!   curl -i -H 'If-None-Match: "<etag from above>"' http://localhost:3000/users/42
//!   curl -i --compressed http://localhost:3000/report
//!   curl -X POST http://localhost:3000/users -d '{"name":"alice"}'
//!   curl -u admin:secret http://localhost:3000/admin
//!   curl http://localhost:3000/healthz

use std::sync::Arc;

use dashmap::DashMap;
use http::{Method, StatusCode};
use peel::middleware::{self, MemoryCache};
use peel::{health, Context, Dispatcher, Server};
use serde::Deserialize;

#[derive(Deserialize)]
struct NewUser {
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), peel::Error> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let tags = Arc::new(DashMap::new());
    let pages = Arc::new(MemoryCache::new());

    let app = Dispatcher::new()
        .with(middleware::logger())
        .with(middleware::clickjacking())
        .route(Method::GET, "/users/{id}", [middleware::etag(Arc::clone(&tags))], get_user)
        .post("/users", create_user)
        .route(Method::GET, "/report", [middleware::gzip(6), middleware::cache(pages)], report)
        .route(
            Method::GET,
            "/admin",
            [middleware::basic_auth(|_, user, pass| user == "admin" && pass == "secret")],
            |c: &mut Context| c.string(StatusCode::OK, "welcome, admin"),
        )
        .get("/healthz", health::liveness)
        .get("/readyz", health::readiness);

    Server::bind("0.0.0.0:3000")?.serve(app).await
}

// GET /users/{id}
fn get_user(c: &mut Context) {
    let id = c.param("id").unwrap_or("unknown").to_owned();
    c.json(StatusCode::OK, &serde_json::json!({ "id": id, "name": "alice" }));
}

// POST /users
fn create_user(c: &mut Context) {
    match c.bind_json::<NewUser>() {
        Ok(user) => c.json(StatusCode::CREATED, &serde_json::json!({ "id": "99", "name": user.name })),
        Err(e) => c.string(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

// GET /report: rendered once, then served from the cache and gzipped per
// request.
fn report(c: &mut Context) {
    let rows: Vec<String> = (1..=200).map(|i| format!("row {i}: all systems nominal")).collect();
    c.string(StatusCode::OK, rows.join("\n"));
}

//! Unified error type.

/// The error type returned by peel's fallible operations.
///
/// Application-level outcomes (401, 404, 422, etc.) are written to the
/// response through the [`Context`](crate::Context), not returned as `Error`s.
/// This type surfaces everything else: transport failures, codec failures,
/// body hooks that give up, and collaborator errors (templates, tokens,
/// validation rules).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("template: {0}")]
    Template(#[from] minijinja::Error),

    #[error("jwt: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("invalid token: {0}")]
    Token(&'static str),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid rule `{0}`")]
    InvalidRule(String),

    #[error("invalid address `{0}`")]
    InvalidAddr(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("response hook failed: {0}")]
    Hook(String),

    #[error("{0}")]
    Other(String),
}

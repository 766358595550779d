//! Bearer tokens signed with HMAC-SHA256.
//!
//! ```text
//! Authorization: [Bearer ]<jwt> ─▶ parse_token ─▶ required claims ─▶ c.set(..) ─▶ next()
//!                                      │                  │
//!                                      └──── 401 ◀────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use http::header::AUTHORIZATION;
use http::StatusCode;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{Map, Value};
use tracing::debug;

use crate::context::Context;
use crate::error::Error;
use crate::handler::{from_fn, Middleware};

/// Claim set as stored in the context under [`Jwt::CLAIMS_KEY`].
pub type Claims = Map<String, Value>;

/// Issues and verifies HS256 tokens with one shared secret.
#[derive(Clone)]
pub struct Jwt {
    encoding: EncodingKey,
    decoding: DecodingKey,
    expires: Duration,
}

impl Jwt {
    /// Context key holding the verified [`Claims`].
    pub const CLAIMS_KEY: &'static str = "jwt_claims";

    pub fn new(signing_key: &[u8], expires: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(signing_key),
            decoding: DecodingKey::from_secret(signing_key),
            expires,
        }
    }

    /// Signs `claims` plus fresh `iat` and `exp`.
    pub fn create_token(&self, claims: &Claims) -> Result<String, Error> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.expires.as_secs()).unwrap_or(i64::MAX);
        let mut claims = claims.clone();
        claims.insert("iat".into(), now.into());
        claims.insert("exp".into(), now.saturating_add(ttl).into());
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    /// Verifies signature, algorithm and expiry, and returns the claims.
    /// A leading `Bearer ` is ignored.
    pub fn parse_token(&self, token: &str) -> Result<Claims, Error> {
        let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
        if token.is_empty() {
            return Err(Error::Token("empty token"));
        }
        let data = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))?;
        Ok(data.claims)
    }

    /// Re-signs the claims verified for this request and sends the new token
    /// in the response `Authorization` header.
    pub fn refresh_token(&self, c: &mut Context) -> Result<(), Error> {
        let claims = c
            .get::<Claims>(Self::CLAIMS_KEY)
            .ok_or(Error::Token("no claims found"))?;
        let token = self.create_token(&claims)?;
        c.set_header(AUTHORIZATION, &token);
        Ok(())
    }

    /// Requires a valid token carrying every claim in `required`.
    ///
    /// Each required claim is stored in the context under its own name (as a
    /// [`serde_json::Value`]) and the full claim set under
    /// [`CLAIMS_KEY`](Jwt::CLAIMS_KEY). Failures answer `401`.
    pub fn middleware(&self, required: &[&str]) -> Middleware {
        let jwt = Arc::new(self.clone());
        let required: Vec<String> = required.iter().map(|s| (*s).to_owned()).collect();
        from_fn(move |c: &mut Context| {
            let Some(header) = c.header(AUTHORIZATION.as_str()).map(str::to_owned) else {
                c.string(StatusCode::UNAUTHORIZED, "missing token");
                return;
            };
            let claims = match jwt.parse_token(&header) {
                Ok(claims) => claims,
                Err(e) => {
                    debug!(error = %e, "rejecting token");
                    c.string(StatusCode::UNAUTHORIZED, "invalid token");
                    return;
                }
            };
            for name in &required {
                match claims.get(name) {
                    Some(value) => c.set(name.clone(), value.clone()),
                    None => {
                        c.string(StatusCode::UNAUTHORIZED, "token missing required claim");
                        return;
                    }
                }
            }
            c.set(Self::CLAIMS_KEY, claims);
            c.next();
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::request::Request;

    fn jwt() -> Jwt {
        Jwt::new(b"test-secret", Duration::from_secs(3600))
    }

    fn claims(v: Value) -> Claims {
        v.as_object().cloned().unwrap()
    }

    fn get(auth: Option<&str>) -> Request {
        let mut b = http::Request::get("/me");
        if let Some(a) = auth {
            b = b.header(AUTHORIZATION, a);
        }
        Request::from_http(b.body(Bytes::new()).unwrap(), None)
    }

    #[test]
    fn create_then_parse() {
        let jwt = jwt();
        let token = jwt.create_token(&claims(json!({ "uid": 7 }))).unwrap();
        let parsed = jwt.parse_token(&format!("Bearer {token}")).unwrap();
        assert_eq!(parsed["uid"], 7);
        assert!(parsed["exp"].as_i64().unwrap() > parsed["iat"].as_i64().unwrap());
    }

    #[test]
    fn rejects_foreign_signature_and_empty() {
        let token = Jwt::new(b"other", Duration::from_secs(60))
            .create_token(&claims(json!({ "uid": 7 })))
            .unwrap();
        assert!(matches!(jwt().parse_token(&token), Err(Error::Jwt(_))));
        assert!(matches!(jwt().parse_token(""), Err(Error::Token(_))));
    }

    #[test]
    fn middleware_exposes_claims_and_refreshes() {
        let jwt = jwt();
        let refresher = jwt.clone();
        let app = Dispatcher::new().route(
            http::Method::GET,
            "/me",
            [jwt.middleware(&["uid"])],
            move |c: &mut Context| {
                let uid = c.get::<Value>("uid").map(|v| v.to_string()).unwrap_or_default();
                if let Err(e) = refresher.refresh_token(c) {
                    c.string(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
                    return;
                }
                c.string(StatusCode::OK, uid);
            },
        );

        let token = jwt.create_token(&claims(json!({ "uid": 42 }))).unwrap();
        let res = app.dispatch(get(Some(&token)));
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body().as_ref(), b"42");
        let fresh = res.headers()[AUTHORIZATION].to_str().unwrap();
        assert_eq!(jwt.parse_token(fresh).unwrap()["uid"], 42);
    }

    #[test]
    fn middleware_rejects() {
        let jwt = jwt();
        let app = Dispatcher::new().route(
            http::Method::GET,
            "/me",
            [jwt.middleware(&["role"])],
            |c: &mut Context| c.string(StatusCode::OK, "in"),
        );
        let token = jwt.create_token(&claims(json!({ "uid": 1 }))).unwrap();

        for auth in [None, Some("garbage"), Some(token.as_str())] {
            assert_eq!(app.dispatch(get(auth)).status(), StatusCode::UNAUTHORIZED);
        }
    }
}

//! HTTP Basic authentication.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use http::StatusCode;

use crate::context::Context;
use crate::handler::{from_fn, Middleware};

const CHALLENGE: &str = r#"Basic realm="Restricted", charset="UTF-8""#;

/// Requires `Authorization: Basic <base64(user:pass)>` accepted by `valid`.
///
/// Missing or rejected credentials answer `401` with a `WWW-Authenticate`
/// challenge; a payload that is not valid base64 answers `400`.
pub fn basic_auth<F>(valid: F) -> Middleware
where
    F: Fn(&Context, &str, &str) -> bool + Send + Sync + 'static,
{
    from_fn(move |c: &mut Context| {
        let encoded = c
            .header(AUTHORIZATION.as_str())
            .and_then(|auth| {
                let (scheme, rest) = auth.split_once(' ')?;
                scheme.eq_ignore_ascii_case("basic").then(|| rest.trim().to_owned())
            });

        if let Some(encoded) = encoded {
            let decoded = match STANDARD.decode(&encoded) {
                Ok(d) => d,
                Err(e) => {
                    c.string(StatusCode::BAD_REQUEST, e.to_string());
                    return;
                }
            };
            let cred = String::from_utf8_lossy(&decoded);
            if let Some((user, pass)) = cred.split_once(':') {
                if valid(c, user, pass) {
                    c.next();
                    return;
                }
            }
        }

        c.set_header(WWW_AUTHENTICATE, CHALLENGE);
        c.string(StatusCode::UNAUTHORIZED, "");
    })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::request::Request;

    fn app() -> Dispatcher {
        let auth = basic_auth(|_, user, pass| user == "joe" && pass == "secret");
        Dispatcher::new().route(http::Method::GET, "/", [auth], |c: &mut Context| {
            c.string(StatusCode::OK, "welcome")
        })
    }

    fn get(auth: Option<&str>) -> Request {
        let mut b = http::Request::get("/");
        if let Some(a) = auth {
            b = b.header(AUTHORIZATION, a);
        }
        Request::from_http(b.body(Bytes::new()).unwrap(), None)
    }

    #[test]
    fn accepts_valid_credentials_with_any_scheme_case() {
        let app = app();
        let token = STANDARD.encode("joe:secret");
        for scheme in ["Basic", "basic", "BASIC"] {
            let res = app.dispatch(get(Some(&format!("{scheme} {token}"))));
            assert_eq!(res.status(), StatusCode::OK);
        }
    }

    #[test]
    fn rejects_wrong_or_missing_credentials() {
        let app = app();
        let wrong = format!("Basic {}", STANDARD.encode("joe:guess"));
        for auth in [Some(wrong.as_str()), None, Some("Bearer abc")] {
            let res = app.dispatch(get(auth));
            assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(res.headers()[WWW_AUTHENTICATE], CHALLENGE);
        }
    }

    #[test]
    fn bad_base64_is_400() {
        let res = app().dispatch(get(Some("Basic !!!")));
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}

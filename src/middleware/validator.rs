//! Declarative input checks.

use http::StatusCode;

use crate::context::Context;
use crate::handler::{from_fn, Middleware};

/// Validates named inputs before the handler runs.
///
/// Each field is `"name:rules"`, e.g. `"id:numeric,min=1"`. For every field the
/// path parameter `name` and the form/query value `name` are checked, when
/// present and non-empty, with the dispatcher's validator. The first failure
/// answers `400` naming the input and the rule list.
///
/// Rule names are left to that validator, so a custom
/// [`Validator`](crate::Validator) may define its own. A rule it does not
/// know fails the request like any other rule.
///
/// # Panics
///
/// Panics if a field is not `name:rules` with both sides non-empty.
pub fn validator(fields: &[&str]) -> Middleware {
    let fields: Vec<(String, String)> = fields
        .iter()
        .map(|field| {
            let (name, rules) = field
                .split_once(':')
                .filter(|(name, rules)| !name.is_empty() && !rules.is_empty() && !rules.contains(':'))
                .unwrap_or_else(|| panic!("validator: malformed field `{field}`"));
            (name.to_owned(), rules.to_owned())
        })
        .collect();

    from_fn(move |c: &mut Context| {
        for (name, rules) in &fields {
            let param = c.param(name).filter(|v| !v.is_empty()).map(str::to_owned);
            let form = c.request().form_value(name).filter(|v| !v.is_empty()).map(|v| v.into_owned());
            for value in param.iter().chain(form.iter()) {
                if let Err(e) = c.validate_var(value, rules) {
                    c.string(StatusCode::BAD_REQUEST, format!("validate {name} {rules} failed: {e}"));
                    return;
                }
            }
        }
        c.next();
    })
}

//! Input validation collaborator.
//!
//! Two entry points, mirroring the usual validator libraries:
//!
//! - [`Validator::var`] checks one string against a comma-separated rule list
//!   such as `"required,min=3,max=20"`. The `validator` middleware uses it for
//!   path parameters and form values.
//! - [`Validator::structure`] checks a whole value that implements
//!   [`Validate`], used by [`Context::bind_valid`](crate::Context::bind_valid).
//!
//! [`RuleValidator`] is the bundled implementation.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Error;

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s.]+(\.[^@\s.]+)+$").expect("email pattern is valid")
});

pub trait Validator: Send + Sync + 'static {
    /// Checks `value` against `rules`.
    fn var(&self, value: &str, rules: &str) -> Result<(), Error>;

    /// Checks a structured value.
    fn structure(&self, value: &dyn Validate) -> Result<(), Error>;
}

/// Implemented by request payloads that know how to validate their fields.
///
/// ```rust
/// use peel::{Error, Validate, Validator};
///
/// struct SignUp { username: String, email: String }
///
/// impl Validate for SignUp {
///     fn validate(&self, v: &dyn Validator) -> Result<(), Error> {
///         v.var(&self.username, "required,min=3")?;
///         v.var(&self.email, "required,email")
///     }
/// }
/// ```
pub trait Validate {
    fn validate(&self, validator: &dyn Validator) -> Result<(), Error>;
}

/// Built-in rule engine.
///
/// | Rule | Passes when |
/// |---|---|
/// | `required` | value is not empty |
/// | `min=N` / `max=N` | numeric value ≥ / ≤ N, or char count for non-numbers |
/// | `len=N` | char count is exactly N |
/// | `numeric` | value parses as a number |
/// | `alpha` / `alphanum` | ASCII letters / letters and digits only |
/// | `email` | `local@domain.tld` shape, no whitespace |
/// | `oneof=a b c` | value equals one of the space-separated options |
///
/// Empty values skip every rule except `required`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleValidator;

impl RuleValidator {
    pub fn new() -> Self {
        Self
    }

    /// Parses `rules` without applying them, so an application using the
    /// bundled rules can reject a malformed list at startup.
    pub fn check_rules(rules: &str) -> Result<(), Error> {
        for rule in rules.split(',').map(str::trim) {
            Rule::parse(rule)?;
        }
        Ok(())
    }
}

enum Rule<'a> {
    Required,
    Min(f64),
    Max(f64),
    Len(usize),
    Numeric,
    Alpha,
    AlphaNum,
    Email,
    OneOf(&'a str),
}

impl<'a> Rule<'a> {
    fn parse(rule: &'a str) -> Result<Self, Error> {
        let bad = || Error::InvalidRule(rule.to_owned());
        let (name, arg) = match rule.split_once('=') {
            Some((n, a)) => (n, Some(a)),
            None => (rule, None),
        };
        let number = |a: Option<&str>| a.and_then(|a| a.parse::<f64>().ok()).ok_or_else(bad);
        Ok(match name {
            "required" => Self::Required,
            "min" => Self::Min(number(arg)?),
            "max" => Self::Max(number(arg)?),
            "len" => Self::Len(arg.and_then(|a| a.parse().ok()).ok_or_else(bad)?),
            "numeric" => Self::Numeric,
            "alpha" => Self::Alpha,
            "alphanum" => Self::AlphaNum,
            "email" => Self::Email,
            "oneof" => Self::OneOf(arg.filter(|a| !a.is_empty()).ok_or_else(bad)?),
            _ => return Err(bad()),
        })
    }

    fn check(&self, value: &str) -> bool {
        if value.is_empty() {
            return !matches!(self, Self::Required);
        }
        let size = || value.parse::<f64>().unwrap_or(value.chars().count() as f64);
        match self {
            Self::Required => true,
            Self::Min(n) => size() >= *n,
            Self::Max(n) => size() <= *n,
            Self::Len(n) => value.chars().count() == *n,
            Self::Numeric => value.parse::<f64>().is_ok(),
            Self::Alpha => value.chars().all(|c| c.is_ascii_alphabetic()),
            Self::AlphaNum => value.chars().all(|c| c.is_ascii_alphanumeric()),
            Self::Email => EMAIL.is_match(value),
            Self::OneOf(options) => options.split(' ').any(|o| o == value),
        }
    }
}

impl Validator for RuleValidator {
    fn var(&self, value: &str, rules: &str) -> Result<(), Error> {
        for raw in rules.split(',').map(str::trim) {
            if !Rule::parse(raw)?.check(value) {
                return Err(Error::Validation(format!("`{value}` does not satisfy `{raw}`")));
            }
        }
        Ok(())
    }

    fn structure(&self, value: &dyn Validate) -> Result<(), Error> {
        value.validate(self)
    }
}

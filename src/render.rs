//! Template rendering collaborator.
//!
//! [`Context::render`](crate::Context::render) only needs "execute template
//! `name` with `data` into this sink". Any engine can sit behind it; a
//! `minijinja::Environment` works out of the box.

use std::io;

use serde_json::Value;

use crate::error::Error;

/// Executes named templates into a byte sink.
pub trait Renderer: Send + Sync + 'static {
    fn execute_template(&self, out: &mut dyn io::Write, name: &str, data: &Value) -> Result<(), Error>;
}

impl Renderer for minijinja::Environment<'static> {
    fn execute_template(&self, out: &mut dyn io::Write, name: &str, data: &Value) -> Result<(), Error> {
        self.get_template(name)?.render_to_write(data, out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn minijinja_renders_into_sink() {
        let mut env = minijinja::Environment::new();
        env.add_template("hello", "<h1>Hello {{ name }}!</h1>").unwrap();

        let mut out = Vec::new();
        env.execute_template(&mut out, "hello", &json!({ "name": "World" })).unwrap();
        assert_eq!(out, b"<h1>Hello World!</h1>");
    }

    #[test]
    fn unknown_template_is_an_error() {
        let env = minijinja::Environment::new();
        let mut out = Vec::new();
        let err = env.execute_template(&mut out, "missing", &Value::Null).unwrap_err();
        assert!(matches!(err, Error::Template(_)));
    }
}

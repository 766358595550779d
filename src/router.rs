//! Radix-tree route table.
//!
//! One tree per HTTP method, O(path-length) lookup via [`matchit`]. The table
//! only answers "which chain handles this method + path"; chain construction
//! and execution live in the dispatcher and the context.

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use matchit::Router as MatchitRouter;

use crate::handler::Middleware;

/// Result of resolving a request against the table.
pub(crate) enum Lookup {
    Found(Arc<[Middleware]>, HashMap<String, String>),
    /// The path exists, but only for these methods.
    MethodNotAllowed(Vec<Method>),
    NotFound,
}

#[derive(Default)]
pub(crate) struct Router {
    routes: HashMap<Method, MatchitRouter<Arc<[Middleware]>>>,
}

impl Router {
    /// Binds `chain` to `method` + `path`.
    ///
    /// # Panics
    ///
    /// Panics on an invalid or conflicting pattern. Route tables are built at
    /// startup, so a bad pattern is a programming error, not a request error.
    pub(crate) fn insert(&mut self, method: Method, path: &str, chain: Arc<[Middleware]>) {
        self.routes
            .entry(method.clone())
            .or_default()
            .insert(path, chain)
            .unwrap_or_else(|e| panic!("invalid route `{method} {path}`: {e}"));
    }

    pub(crate) fn lookup(&self, method: &Method, path: &str) -> Lookup {
        if let Some(matched) = self.routes.get(method).and_then(|tree| tree.at(path).ok()) {
            let chain = Arc::clone(matched.value);
            let params = matched.params.iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect();
            return Lookup::Found(chain, params);
        }

        let mut allowed: Vec<Method> = self.routes.iter()
            .filter(|(m, tree)| *m != method && tree.at(path).is_ok())
            .map(|(m, _)| m.clone())
            .collect();
        if allowed.is_empty() {
            return Lookup::NotFound;
        }
        allowed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Lookup::MethodNotAllowed(allowed)
    }
}

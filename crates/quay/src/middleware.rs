//! Middleware
//!
//! Middleware wraps request handling for the paths it is mapped to. `before`
//! hooks run in registration order and may short-circuit with a response;
//! `after` hooks run in reverse order for every middleware whose `before` ran.

use crate::{Error, Request, Response, Result};
use quay_router::UrlPattern;
use std::sync::Arc;

/// Middleware trait - process request/response
pub trait Middleware: Send + Sync + 'static {
    /// Process request before handler
    fn before(&self, _req: &mut Request) -> Option<Response> {
        None
    }

    /// Process response after handler
    fn after(&self, _req: &Request, _res: &mut Response) {}
}

/// A middleware tagged with the URL patterns it applies to
#[derive(Clone)]
pub struct MiddlewareRegistration {
    pub(crate) name: String,
    pub(crate) patterns: Vec<String>,
    pub(crate) middleware: Arc<dyn Middleware>,
}

impl MiddlewareRegistration {
    pub fn new<I, S, M>(patterns: I, middleware: M) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        M: Middleware,
    {
        Self {
            name: std::any::type_name::<M>().to_string(),
            patterns: patterns.into_iter().map(Into::into).collect(),
            middleware: Arc::new(middleware),
        }
    }

    /// Name used in logs and configuration errors
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub(crate) fn is_declared(&self) -> bool {
        self.patterns.iter().any(|p| !p.trim().is_empty())
    }
}

impl std::fmt::Debug for MiddlewareRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareRegistration")
            .field("name", &self.name)
            .field("patterns", &self.patterns)
            .finish()
    }
}

struct Entry {
    patterns: Vec<UrlPattern>,
    middleware: Arc<dyn Middleware>,
}

/// Path-filtered middleware chain
#[derive(Default)]
pub(crate) struct MiddlewareChain {
    entries: Vec<Entry>,
}

impl MiddlewareChain {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a registration, parsing its patterns
    pub(crate) fn add(&mut self, registration: &MiddlewareRegistration) -> Result<()> {
        let patterns = registration
            .patterns
            .iter()
            .filter(|p| !p.trim().is_empty())
            .map(|p| UrlPattern::parse(p))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::InvalidPattern(format!("{} ({})", e, registration.name)))?;

        self.entries.push(Entry {
            patterns,
            middleware: registration.middleware.clone(),
        });
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Middleware mapped to a path, in registration order
    pub(crate) fn matching(&self, path: &str) -> Vec<Arc<dyn Middleware>> {
        self.entries
            .iter()
            .filter(|e| e.patterns.iter().any(|p| p.matches(path)))
            .map(|e| e.middleware.clone())
            .collect()
    }
}

/// Run before hooks, returning how many ran and any short-circuit response
pub(crate) fn run_before(
    chain: &[Arc<dyn Middleware>],
    req: &mut Request,
) -> (usize, Option<Response>) {
    for (i, m) in chain.iter().enumerate() {
        if let Some(res) = m.before(req) {
            return (i + 1, Some(res));
        }
    }
    (chain.len(), None)
}

/// Run after hooks in reverse order for the first `ran` middleware
pub(crate) fn run_after(chain: &[Arc<dyn Middleware>], ran: usize, req: &Request, res: &mut Response) {
    for m in chain[..ran.min(chain.len())].iter().rev() {
        m.after(req, res);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Method, StatusCode};
    use parking_lot::Mutex;

    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        block: bool,
    }

    impl Middleware for Recorder {
        fn before(&self, _req: &mut Request) -> Option<Response> {
            self.log.lock().push(format!("before {}", self.tag));
            if self.block {
                return Some(Response::new(StatusCode::FORBIDDEN));
            }
            None
        }

        fn after(&self, _req: &Request, res: &mut Response) {
            self.log.lock().push(format!("after {}", self.tag));
            res.add_header("x-seen", self.tag);
        }
    }

    fn chain(specs: &[(&'static str, &str, bool)], log: &Arc<Mutex<Vec<String>>>) -> MiddlewareChain {
        let mut chain = MiddlewareChain::new();
        for (tag, pattern, block) in specs {
            let registration = MiddlewareRegistration::new(
                [*pattern],
                Recorder {
                    tag: *tag,
                    log: log.clone(),
                    block: *block,
                },
            );
            chain.add(&registration).unwrap();
        }
        chain
    }

    #[test]
    fn test_order_and_filtering() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&[("a", "/*", false), ("b", "/api/*", false), ("c", "/", false)], &log);
        assert_eq!(chain.len(), 3);

        let matched = chain.matching("/api/x");
        assert_eq!(matched.len(), 3);
        assert_eq!(chain.matching("/other").len(), 2);

        let mut req = Request::new(Method::Get, "/api/x");
        let (ran, early) = run_before(&matched, &mut req);
        assert_eq!(ran, 3);
        assert!(early.is_none());

        let mut res = Response::ok();
        run_after(&matched, ran, &req, &mut res);

        assert_eq!(
            *log.lock(),
            vec!["before a", "before b", "before c", "after c", "after b", "after a"]
        );
    }

    #[test]
    fn test_short_circuit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&[("a", "/*", false), ("b", "/*", true), ("c", "/*", false)], &log);

        let matched = chain.matching("/x");
        let mut req = Request::new(Method::Get, "/x");
        let (ran, early) = run_before(&matched, &mut req);
        assert_eq!(ran, 2);

        let mut res = early.unwrap();
        run_after(&matched, ran, &req, &mut res);
        assert_eq!(res.status, StatusCode::FORBIDDEN);
        assert_eq!(*log.lock(), vec!["before a", "before b", "after b", "after a"]);
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let mut chain = MiddlewareChain::new();
        let registration = MiddlewareRegistration::new(["nope"], Recorder {
            tag: "x",
            log: Arc::default(),
            block: false,
        });
        assert!(matches!(chain.add(&registration), Err(Error::InvalidPattern(_))));
    }
}

//! Pattern-based request router.
//!
//! A route table is an ordered list of `(pattern, method)` entries, declared
//! as data through [`RouteSpec`] and compiled once at server configuration.
//! Patterns are regular expressions anchored to match the complete resource
//! path; their capture groups become the positional `args` of the matched
//! request. Lookup walks the table in insertion order and the first full
//! match with an equal method wins.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use regex::Regex;

use crate::errors::{Error, HttpError, Result};
use crate::http::document::{Content, Document};
use crate::http::format::Reply;
use crate::params::{BoundArgs, ParamDescriptor};

/// What handlers produce: a [`Reply`] on success, or an error the
/// connection loop maps to a response (`Error::Http` renders verbatim,
/// anything else becomes a 500).
pub type HandlerResult = std::result::Result<Reply, Error>;

/// Boxed handler future; sync handlers wrap an immediate value.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

type DocumentFn = Arc<dyn Fn(Arc<Document>) -> HandlerFuture + Send + Sync>;
type ContentFn = Arc<dyn Fn(Content) -> HandlerFuture + Send + Sync>;
type ParamsFn = Arc<dyn Fn(BoundArgs) -> HandlerFuture + Send + Sync>;

/// A pre-processor invoked with the request before parameter binding.
/// May mutate the content or refuse the request with an [`HttpError`].
pub type BeforeFn = Arc<
    dyn for<'a> Fn(
            &'a mut Document,
        )
            -> Pin<Box<dyn Future<Output = std::result::Result<(), HttpError>> + Send + 'a>>
        + Send
        + Sync,
>;

/// Wrap a synchronous pre-processor.
pub fn before_sync<F>(f: F) -> BeforeFn
where
    F: Fn(&mut Document) -> std::result::Result<(), HttpError> + Send + Sync + 'static,
{
    Arc::new(move |document| {
        let result = f(document);
        Box::pin(std::future::ready(result))
    })
}

/// A registered handler, in one of the argument shapes the binder knows how
/// to feed.
///
/// # Examples
///
/// ```
/// use rivulet::{Endpoint, ParamDescriptor, ParamKind, Reply};
///
/// // a constant answer, pure data
/// let ping = Endpoint::literal("pong");
///
/// // the whole request document
/// let echo = Endpoint::document_sync(|request| Ok(Reply::Content(request.content.clone())));
///
/// // an async handler with declared, converted parameters
/// let shout = Endpoint::params(
///     vec![ParamDescriptor::required("word", ParamKind::Str {
///         min_length: 1,
///         max_length: Some(64),
///     })],
///     |args| async move {
///         let word = args.arg(0).and_then(|v| v.as_str()).unwrap_or_default();
///         Ok(Reply::from(word.to_uppercase()))
///     },
/// );
/// # let _ = (ping, echo, shout);
/// ```
#[derive(Clone)]
pub enum Endpoint {
    /// A constant handler returning the string. Lets route tables be pure
    /// data.
    Literal(String),
    /// Receives the whole request [`Document`].
    Document(DocumentFn),
    /// Receives the decoded request content.
    Content(ContentFn),
    /// Receives an argument vector bound from the declared parameters.
    Params {
        func: ParamsFn,
        params: Arc<Vec<ParamDescriptor>>,
    },
}

impl Endpoint {
    pub fn literal(text: impl Into<String>) -> Self {
        Endpoint::Literal(text.into())
    }

    pub fn document<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<Document>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Endpoint::Document(Arc::new(move |document| Box::pin(f(document))))
    }

    pub fn document_sync<F>(f: F) -> Self
    where
        F: Fn(Arc<Document>) -> HandlerResult + Send + Sync + 'static,
    {
        Endpoint::Document(Arc::new(move |document| {
            Box::pin(std::future::ready(f(document)))
        }))
    }

    pub fn content<F, Fut>(f: F) -> Self
    where
        F: Fn(Content) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Endpoint::Content(Arc::new(move |content| Box::pin(f(content))))
    }

    pub fn content_sync<F>(f: F) -> Self
    where
        F: Fn(Content) -> HandlerResult + Send + Sync + 'static,
    {
        Endpoint::Content(Arc::new(move |content| {
            Box::pin(std::future::ready(f(content)))
        }))
    }

    /// A handler with declared parameters; the descriptor list is built once
    /// here and reused for every invocation.
    pub fn params<F, Fut>(params: Vec<ParamDescriptor>, f: F) -> Self
    where
        F: Fn(BoundArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Endpoint::Params {
            func: Arc::new(move |args| Box::pin(f(args))),
            params: Arc::new(params),
        }
    }

    pub fn params_sync<F>(params: Vec<ParamDescriptor>, f: F) -> Self
    where
        F: Fn(BoundArgs) -> HandlerResult + Send + Sync + 'static,
    {
        Endpoint::Params {
            func: Arc::new(move |args| Box::pin(std::future::ready(f(args)))),
            params: Arc::new(params),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Literal(text) => write!(f, "Literal({text:?})"),
            Endpoint::Document(_) => f.write_str("Document(..)"),
            Endpoint::Content(_) => f.write_str("Content(..)"),
            Endpoint::Params { params, .. } => write!(f, "Params({params:?})"),
        }
    }
}

/// A reference to a handler in a route declaration: a direct endpoint, a
/// name resolved through the [`Registry`] at compile time, or a literal
/// string that becomes a constant handler.
#[derive(Clone, Debug)]
pub enum HandlerRef {
    Endpoint(Endpoint),
    Named(String),
    Literal(String),
}

impl HandlerRef {
    pub fn named(name: impl Into<String>) -> Self {
        HandlerRef::Named(name.into())
    }

    pub fn literal(text: impl Into<String>) -> Self {
        HandlerRef::Literal(text.into())
    }
}

impl From<Endpoint> for HandlerRef {
    fn from(endpoint: Endpoint) -> Self {
        HandlerRef::Endpoint(endpoint)
    }
}

/// A plain string is a literal handler unless it looks like a dotted
/// registry name.
impl From<&str> for HandlerRef {
    fn from(text: &str) -> Self {
        if text.contains('.') {
            HandlerRef::Named(text.to_string())
        } else {
            HandlerRef::Literal(text.to_string())
        }
    }
}

/// Explicit name-to-endpoint table for routes declared by string.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<String, Endpoint>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, endpoint: Endpoint) {
        self.entries.insert(name.into(), endpoint);
    }

    fn resolve(&self, name: &str) -> Option<&Endpoint> {
        self.entries.get(name)
    }
}

/// Full configuration of one route entry.
#[derive(Clone)]
pub struct RouteConfig {
    pub handler: HandlerRef,
    pub before: Vec<BeforeFn>,
    pub silent: bool,
}

impl RouteConfig {
    pub fn new(handler: impl Into<HandlerRef>) -> Self {
        Self {
            handler: handler.into(),
            before: Vec::new(),
            silent: false,
        }
    }

    /// Append a pre-processor; they run in insertion order.
    pub fn before(mut self, f: BeforeFn) -> Self {
        self.before.push(f);
        self
    }

    /// Suppress per-connection log lines for requests hitting this route.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

impl From<HandlerRef> for RouteConfig {
    fn from(handler: HandlerRef) -> Self {
        RouteConfig::new(handler)
    }
}

impl From<Endpoint> for RouteConfig {
    fn from(endpoint: Endpoint) -> Self {
        RouteConfig::new(endpoint)
    }
}

impl From<&str> for RouteConfig {
    fn from(text: &str) -> Self {
        RouteConfig::new(text)
    }
}

/// Ordered route declarations, pattern by pattern.
///
/// # Examples
/// ```
/// use rivulet::{RouteSpec, Endpoint};
///
/// let routes = RouteSpec::new()
///     .get("/ping", "pong")
///     .on("/echo", "POST", Endpoint::content_sync(|content| Ok(content.into())));
/// ```
#[derive(Default)]
pub struct RouteSpec {
    entries: Vec<(String, Vec<(String, RouteConfig)>)>,
}

impl RouteSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a `GET` route.
    pub fn get(self, pattern: &str, config: impl Into<RouteConfig>) -> Self {
        self.on(pattern, "GET", config)
    }

    /// Declare a route for an explicit method.
    pub fn on(mut self, pattern: &str, method: &str, config: impl Into<RouteConfig>) -> Self {
        let config = config.into();
        let method = method.to_uppercase();
        match self.entries.iter_mut().find(|(p, _)| p == pattern) {
            Some((_, methods)) => methods.push((method, config)),
            None => self.entries.push((pattern.to_string(), vec![(method, config)])),
        }
        self
    }
}

struct Route {
    pattern: Regex,
    method: String,
    endpoint: Endpoint,
    before: Vec<BeforeFn>,
    silent: bool,
}

/// A successful lookup.
pub struct RouteMatch<'a> {
    pub endpoint: &'a Endpoint,
    pub before: &'a [BeforeFn],
    pub silent: bool,
    /// Capture groups from the pattern, in group order.
    pub args: Vec<String>,
}

/// Compiled, immutable route table.
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Compile a route spec, resolving named handlers through the registry.
    ///
    /// The control words `handler`, `before`, and `silent` are reserved and
    /// rejected as method names.
    pub fn compile(spec: RouteSpec, registry: &Registry) -> Result<Self> {
        let mut routes = Vec::new();

        for (pattern, methods) in spec.entries {
            let regex = Regex::new(&format!("^(?:{pattern})$"))
                .map_err(|e| Error::Config(format!("invalid route pattern {pattern}: {e}")))?;

            for (method, config) in methods {
                if matches!(method.to_lowercase().as_str(), "handler" | "before" | "silent") {
                    return Err(Error::Config(format!(
                        "method name missing in route {pattern} ({method})"
                    )));
                }

                let endpoint = match config.handler {
                    HandlerRef::Endpoint(endpoint) => endpoint,
                    HandlerRef::Literal(text) => Endpoint::Literal(text),
                    HandlerRef::Named(name) => registry
                        .resolve(&name)
                        .cloned()
                        .ok_or_else(|| Error::Config(format!("unknown handler: {name}")))?,
                };

                routes.push(Route {
                    pattern: regex.clone(),
                    method,
                    endpoint,
                    before: config.before,
                    silent: config.silent,
                });
            }
        }

        Ok(Self { routes })
    }

    /// Match `(resource, method)` against the table; first full match wins.
    pub fn lookup(&self, resource: &str, method: &str) -> Option<RouteMatch<'_>> {
        for route in &self.routes {
            if route.method != method {
                continue;
            }
            if let Some(captures) = route.pattern.captures(resource) {
                let args = captures
                    .iter()
                    .skip(1)
                    .map(|group| group.map_or_else(String::new, |m| m.as_str().to_string()))
                    .collect();
                return Some(RouteMatch {
                    endpoint: &route.endpoint,
                    before: &route.before,
                    silent: route.silent,
                    args,
                });
            }
        }
        None
    }
}

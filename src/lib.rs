//! rivulet - lightweight HTTP/1.1 serving and client framework
//!
//! A small library for building HTTP/1.1 services: it accepts TCP
//! connections, parses requests with strict size and time bounds,
//! dispatches them through a pattern-based router, binds handler parameters
//! with type validation, and writes well-formed responses. The same
//! parsing and formatting machinery powers an outbound client with a
//! configurable retry policy.
//!
//! # Features
//!
//! - **Bounded wire parsing** - line length, header count, and body size
//!   limits with separate idle and active timeouts; adversarial input maps
//!   to precise `400`/`413`/`431` answers.
//! - **Routes as data** - ordered regex route tables with per-method
//!   handlers, `before` pre-processors, and `silent` routes; handlers may
//!   be literal strings, registry names, or closures.
//! - **Typed parameter binding** - declared parameters are extracted from
//!   query strings, JSON, or form bodies, converted, and validated, with
//!   structured `400` errors on any mismatch.
//! - **Keep-alive connection loop** - one task per connection, requests
//!   handled strictly in order, structured log lines per connection and
//!   request.
//! - **Client with retries** - one-shot calls with redirect handling and
//!   fixed, linear, or exponential backoff with jitter.
//!
//! # Quick Start
//!
//! ```no_run
//! use rivulet::{Endpoint, ParamDescriptor, ParamKind, Reply, RouteSpec, Server};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> rivulet::Result<()> {
//!     let routes = RouteSpec::new()
//!         .get("/ping", "pong")
//!         .get(
//!             "/add",
//!             Endpoint::params_sync(
//!                 vec![
//!                     ParamDescriptor::required("a", ParamKind::Int),
//!                     ParamDescriptor::required("b", ParamKind::Int),
//!                 ],
//!                 |args| {
//!                     let a = args.arg(0).and_then(|v| v.as_i64()).unwrap_or(0);
//!                     let b = args.arg(1).and_then(|v| v.as_i64()).unwrap_or(0);
//!                     Ok(Reply::from(a + b))
//!                 },
//!             ),
//!         );
//!
//!     Server::builder()
//!         .name("demo")
//!         .listener(TcpListener::bind("127.0.0.1:8080").await?)
//!         .routes(routes)
//!         .build()?
//!         .serve()
//!         .await
//! }
//! ```
//!
//! And from the client side:
//!
//! ```no_run
//! # async fn demo() -> rivulet::Result<()> {
//! let response = rivulet::client::get("http://localhost:8080/add?a=2&b=3").await?;
//! assert_eq!(response.content.as_text(), Some("5"));
//! # Ok(())
//! # }
//! ```

pub mod http {
    pub mod document;
    pub mod format;
    pub mod parser;
    pub mod query;
    pub mod reader;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod server_impl;
}
pub mod client;
pub mod errors;
pub mod limits;
pub mod params;
pub mod retry;
pub mod router;
pub(crate) mod stream;

pub use crate::{
    client::{call, CallOptions},
    errors::{BindError, Error, HttpError, Result},
    http::{
        document::{Content, Document, Headers},
        format::{ClientRequest, Reply, Response},
        reader::HttpReader,
    },
    params::{BoundArgs, BoundValue, ParamDescriptor, ParamKind},
    retry::{Backoff, ExponentialBackoff, FixedBackoff, LinearBackoff, RetryPolicy},
    router::{
        before_sync, BeforeFn, Endpoint, HandlerFuture, HandlerRef, HandlerResult, Registry,
        RouteConfig, RouteSpec, Router,
    },
    server::connection::ResponseHook,
    server::server_impl::{Server, ServerBuilder},
};

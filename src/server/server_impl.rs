//! Server construction and the accept loop.
//!
//! # Examples
//!
//! ```no_run
//! use rivulet::{RouteSpec, Server};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> rivulet::Result<()> {
//!     let routes = RouteSpec::new().get("/ping", "pong");
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

use std::sync::Arc;

use log::{debug, info};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::errors::{Error, Result};
use crate::limits::{ConnLimits, ReaderLimits};
use crate::router::{Registry, RouteSpec, Router};
use crate::server::connection::{self, ConnectionContext, Counters, ResponseHook};
use crate::stream::MaybeTls;

/// An HTTP/1.1 server: a compiled route table bound to a listener.
///
/// Each accepted connection is served by its own task; there is no state
/// shared between connections beyond the immutable route table and the
/// monotonic counters.
pub struct Server {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    context: ConnectionContext,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// The bound address, useful when listening on port 0.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    pub async fn serve(self) -> Result<()> {
        let addr = self.listener.local_addr()?;
        info!("starting server {} on {}", self.context.name, addr);

        loop {
            let Ok((stream, peer)) = self.listener.accept().await else {
                continue;
            };

            let context = self.context.clone();
            let tls = self.tls.clone();
            tokio::spawn(async move {
                let stream = match tls {
                    None => MaybeTls::Plain(stream),
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => MaybeTls::Server(Box::new(stream)),
                        Err(err) => {
                            debug!("tls handshake with {peer} failed: {err}");
                            return;
                        }
                    },
                };
                connection::run(context, stream, peer).await;
            });
        }
    }
}

/// Builder for [`Server`] instances.
pub struct ServerBuilder {
    name: String,
    listener: Option<TcpListener>,
    routes: Option<RouteSpec>,
    registry: Registry,
    reader_limits: ReaderLimits,
    conn_limits: ConnLimits,
    tls: Option<TlsAcceptor>,
    on_404: Option<ResponseHook>,
    on_500: Option<ResponseHook>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            name: "server".into(),
            listener: None,
            routes: None,
            registry: Registry::new(),
            reader_limits: ReaderLimits::default(),
            conn_limits: ConnLimits::default(),
            tls: None,
            on_404: None,
            on_500: None,
        }
    }
}

impl ServerBuilder {
    /// Server name used in the `open` log line.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The TCP listener to accept from. **Required.**
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// The route declarations. **Required.**
    pub fn routes(mut self, routes: RouteSpec) -> Self {
        self.routes = Some(routes);
        self
    }

    /// Name registry for routes declared with string handler references.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn reader_limits(mut self, limits: ReaderLimits) -> Self {
        self.reader_limits = limits;
        self
    }

    pub fn conn_limits(mut self, limits: ConnLimits) -> Self {
        self.conn_limits = limits;
        self
    }

    /// Serve TLS with a pre-built acceptor. Certificate loading is the
    /// caller's concern.
    pub fn tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Custom body for `404` answers.
    pub fn on_404(mut self, hook: ResponseHook) -> Self {
        self.on_404 = Some(hook);
        self
    }

    /// Custom body for `500` answers.
    pub fn on_500(mut self, hook: ResponseHook) -> Self {
        self.on_500 = Some(hook);
        self
    }

    /// Compile the route table and assemble the server.
    pub fn build(self) -> Result<Server> {
        let listener = self
            .listener
            .ok_or_else(|| Error::Config("a listener is required".into()))?;
        let routes = self
            .routes
            .ok_or_else(|| Error::Config("routes are required".into()))?;
        let router = Router::compile(routes, &self.registry)?;

        Ok(Server {
            listener,
            tls: self.tls,
            context: ConnectionContext {
                name: self.name.into(),
                router: Arc::new(router),
                reader_limits: self.reader_limits,
                conn_limits: self.conn_limits,
                counters: Arc::new(Counters::default()),
                on_404: self.on_404,
                on_500: self.on_500,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{self, CallOptions};
    use crate::errors::HttpError;
    use crate::http::document::Content;
    use crate::http::parser::{parse, Mode};
    use crate::http::reader::HttpReader;
    use crate::params::{ParamDescriptor, ParamKind};
    use crate::retry::{Backoff, FixedBackoff, RetryPolicy};
    use crate::router::{before_sync, Endpoint, RouteConfig, RouteSpec};
    use crate::Reply;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    fn add_endpoint() -> Endpoint {
        Endpoint::params_sync(
            vec![
                ParamDescriptor::required("a", ParamKind::Int),
                ParamDescriptor::required("b", ParamKind::Int),
            ],
            |args| {
                let a = args.arg(0).and_then(|v| v.as_i64()).unwrap_or(0);
                let b = args.arg(1).and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(Reply::from(a + b))
            },
        )
    }

    async fn start(routes: RouteSpec) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::builder()
            .name("test")
            .listener(listener)
            .routes(routes)
            .build()
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());
        addr
    }

    #[tokio::test]
    async fn literal_route_answers_with_plain_text() {
        let addr = start(RouteSpec::new().get("/ping", "pong")).await;

        let response = client::get(&format!("http://{addr}/ping")).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.status_message, "OK");
        assert_eq!(response.content_type.as_deref(), Some("text/plain"));
        assert_eq!(response.charset.as_deref(), Some("utf-8"));
        assert_eq!(response.content.as_text(), Some("pong"));
        assert!(response.sent.is_some());
    }

    #[tokio::test]
    async fn query_parameters_bind_and_convert() {
        let addr = start(RouteSpec::new().get("/add", add_endpoint())).await;

        let response = client::get(&format!("http://{addr}/add?a=2&b=3"))
            .await
            .unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.content_type.as_deref(), Some("text/plain"));
        assert_eq!(response.content.as_text(), Some("5"));
    }

    #[tokio::test]
    async fn json_body_reaches_a_document_handler() {
        let routes = RouteSpec::new().on(
            "/echo",
            "POST",
            Endpoint::document_sync(|request| Ok(Reply::Content(request.content.clone()))),
        );
        let addr = start(routes).await;

        let response = client::post(&format!("http://{addr}/echo"), json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.content_type.as_deref(), Some("application/json"));
        assert_eq!(response.content.as_object().unwrap()["x"], 1);
    }

    #[tokio::test]
    async fn missing_required_parameter_is_400() {
        let addr = start(RouteSpec::new().get("/add", add_endpoint())).await;

        let response = client::get(&format!("http://{addr}/add")).await.unwrap();
        assert_eq!(response.status_code, 400);
        assert_eq!(response.status_message, "Bad Request");
        assert_eq!(
            response.content.as_text(),
            Some("missing required attribute: a")
        );
    }

    #[tokio::test]
    async fn conversion_failure_is_400() {
        let addr = start(RouteSpec::new().get("/add", add_endpoint())).await;

        let response = client::get(&format!("http://{addr}/add?a=foo&b=1"))
            .await
            .unwrap();
        assert_eq!(response.status_code, 400);
        assert_eq!(
            response.content.as_text(),
            Some("invalid a value: not an integer")
        );
    }

    #[tokio::test]
    async fn keep_alive_survives_a_404() {
        let addr = start(RouteSpec::new().get("/ping", "pong")).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = HttpReader::new(read_half, crate::limits::ReaderLimits::default());

        write_half
            .write_all(b"GET /undefined HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let first = parse(&mut reader, Mode::Client).await.unwrap().unwrap();
        assert_eq!(first.status_code, 404);
        assert_eq!(first.status_message, "Not Found");

        write_half
            .write_all(b"GET /ping HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let second = parse(&mut reader, Mode::Client).await.unwrap().unwrap();
        assert_eq!(second.status_code, 200);
        assert_eq!(second.content.as_text(), Some("pong"));
    }

    struct RecordingBackoff {
        inner: FixedBackoff,
        delays: Arc<Mutex<Vec<u64>>>,
    }

    impl Backoff for RecordingBackoff {
        fn next(&mut self) -> Option<u64> {
            let delay = self.inner.next();
            if let Some(delay) = delay {
                self.delays.lock().unwrap().push(delay);
            }
            delay
        }
    }

    #[tokio::test]
    async fn retry_policy_reissues_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let routes = RouteSpec::new().get(
            "/flaky",
            Endpoint::document_sync(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(HttpError::new(503, "Service Unavailable").into())
                } else {
                    Ok(Reply::from("recovered"))
                }
            }),
        );
        let addr = start(routes).await;

        let delays = Arc::new(Mutex::new(Vec::new()));
        let backoff = RecordingBackoff {
            inner: FixedBackoff::new(2, 10),
            delays: delays.clone(),
        };
        let response = client::call(
            &format!("http://{addr}/flaky"),
            CallOptions {
                retry: Some(RetryPolicy::new(backoff)),
                ..CallOptions::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(response.status_code, 200);
        assert_eq!(response.content.as_text(), Some("recovered"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(*delays.lock().unwrap(), vec![10, 10]);
    }

    #[tokio::test]
    async fn before_processors_run_in_order_and_may_refuse() {
        let routes = RouteSpec::new()
            .on(
                "/guarded",
                "POST",
                RouteConfig::new(Endpoint::document_sync(|request| {
                    Ok(Reply::Content(request.content.clone()))
                }))
                .before(before_sync(|request| {
                    if let Some(map) = request.content.as_object() {
                        if map.contains_key("token") {
                            return Ok(());
                        }
                    }
                    Err(HttpError::new(401, "Unauthorized"))
                })),
            );
        let addr = start(routes).await;

        let denied = client::post(&format!("http://{addr}/guarded"), json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(denied.status_code, 401);

        let allowed = client::post(&format!("http://{addr}/guarded"), json!({"token": "t"}))
            .await
            .unwrap();
        assert_eq!(allowed.status_code, 200);
    }

    #[tokio::test]
    async fn path_captures_become_positional_args() {
        let routes = RouteSpec::new().get(
            "/add/(\\d+)/(\\d+)",
            add_endpoint(),
        );
        let addr = start(routes).await;

        let response = client::get(&format!("http://{addr}/add/4/7")).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.content.as_text(), Some("11"));
    }

    #[tokio::test]
    async fn on_404_hook_customizes_the_body() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::builder()
            .listener(listener)
            .routes(RouteSpec::new().get("/ping", "pong"))
            .on_404(Arc::new(|| Reply::from("nothing here")))
            .build()
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());

        let response = client::get(&format!("http://{addr}/missing")).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.content.as_text(), Some("nothing here"));
    }

    #[tokio::test]
    async fn handler_errors_without_http_semantics_become_500() {
        let routes = RouteSpec::new().get(
            "/boom",
            Endpoint::document_sync(|_| {
                Err(Error::Handler("database exploded".into()))
            }),
        );
        let addr = start(routes).await;

        let response = client::get(&format!("http://{addr}/boom")).await.unwrap();
        assert_eq!(response.status_code, 500);
        assert_eq!(response.status_message, "Internal Server Error");
    }

    #[tokio::test]
    async fn wire_errors_render_their_status() {
        let addr = start(RouteSpec::new().get("/ping", "pong")).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = HttpReader::new(read_half, crate::limits::ReaderLimits::default());

        write_half
            .write_all(b"GET /ping HTTP/1.2\r\n\r\n")
            .await
            .unwrap();
        let response = parse(&mut reader, Mode::Client).await.unwrap().unwrap();
        assert_eq!(response.status_code, 400);
        assert_eq!(
            response.content.as_text(),
            Some("unsupported HTTP protocol: HTTP/1.2")
        );
    }

    #[tokio::test]
    async fn redirects_are_followed() {
        let routes = RouteSpec::new()
            .get(
                "/old",
                Endpoint::document_sync(|_| {
                    Ok(Reply::from(
                        crate::Response::with_status(302, "Found", "").header("Location", "/new"),
                    ))
                }),
            )
            .get("/new", "made it");
        let addr = start(routes).await;

        let response = client::get(&format!("http://{addr}/old")).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.content.as_text(), Some("made it"));
    }

    #[tokio::test]
    async fn compressed_request_bodies_are_transparent() {
        let routes = RouteSpec::new().on(
            "/echo",
            "POST",
            Endpoint::content_sync(|content| Ok(Reply::Content(content))),
        );
        let addr = start(routes).await;

        let response = client::call(
            &format!("http://{addr}/echo"),
            CallOptions {
                method: "POST".into(),
                content: Content::Text("squeeze me please".into()),
                compress: true,
                ..CallOptions::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.content.as_text(), Some("squeeze me please"));
    }

    #[tokio::test]
    async fn chunked_request_bodies_are_reassembled() {
        let routes = RouteSpec::new().on(
            "/echo",
            "POST",
            Endpoint::content_sync(|content| Ok(Reply::Content(content))),
        );
        let addr = start(routes).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = HttpReader::new(read_half, crate::limits::ReaderLimits::default());

        write_half
            .write_all(
                b"POST /echo HTTP/1.1\r\n\
                  Content-Type: text/plain\r\n\
                  Transfer-Encoding: chunked\r\n\r\n\
                  6\r\nin pie\r\n3\r\nces\r\n0\r\n\r\n",
            )
            .await
            .unwrap();
        let response = parse(&mut reader, Mode::Client).await.unwrap().unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.content.as_text(), Some("in pieces"));
    }

    #[tokio::test]
    async fn connection_id_parameter_is_injected() {
        let routes = RouteSpec::new().get(
            "/whoami",
            Endpoint::params_sync(
                vec![ParamDescriptor::connection_id("cid")],
                |args| {
                    let cid = args.arg(0).and_then(|v| v.as_str()).unwrap_or_default();
                    Ok(Reply::from(cid.to_string()))
                },
            ),
        );
        let addr = start(routes).await;

        let response = client::get(&format!("http://{addr}/whoami")).await.unwrap();
        let body = response.content.as_text().unwrap();
        assert!(body.starts_with("con="), "{body}");
        assert!(body.contains(" req="), "{body}");
    }

    #[tokio::test]
    async fn oversized_body_is_413_before_reading() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::builder()
            .listener(listener)
            .routes(RouteSpec::new().get("/ping", "pong"))
            .reader_limits(crate::limits::ReaderLimits {
                max_content_length: 10,
                ..crate::limits::ReaderLimits::default()
            })
            .build()
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = HttpReader::new(read_half, crate::limits::ReaderLimits::default());

        write_half
            .write_all(b"POST /ping HTTP/1.1\r\nContent-Length: 100\r\n\r\n")
            .await
            .unwrap();
        let response = parse(&mut reader, Mode::Client).await.unwrap().unwrap();
        assert_eq!(response.status_code, 413);
        assert_eq!(response.status_message, "Request Entity Too Large");
    }

    #[tokio::test]
    async fn overlong_header_line_is_431() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::builder()
            .listener(listener)
            .routes(RouteSpec::new().get("/ping", "pong"))
            .reader_limits(crate::limits::ReaderLimits {
                max_line_length: 64,
                ..crate::limits::ReaderLimits::default()
            })
            .build()
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = HttpReader::new(read_half, crate::limits::ReaderLimits::default());

        let mut request = b"GET /ping HTTP/1.1\r\nx-long: ".to_vec();
        request.extend(std::iter::repeat(b'a').take(100));
        request.extend(b"\r\n\r\n");
        write_half.write_all(&request).await.unwrap();

        let response = parse(&mut reader, Mode::Client).await.unwrap().unwrap();
        assert_eq!(response.status_code, 431);
    }

    #[tokio::test]
    async fn named_routes_resolve_through_the_registry() {
        let mut registry = crate::Registry::new();
        registry.insert(
            "app.greet",
            Endpoint::content_sync(|_| Ok(Reply::from("hello"))),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::builder()
            .listener(listener)
            .routes(RouteSpec::new().get("/greet", "app.greet"))
            .registry(registry)
            .build()
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());

        let response = client::get(&format!("http://{addr}/greet")).await.unwrap();
        assert_eq!(response.content.as_text(), Some("hello"));
    }

    #[tokio::test]
    async fn form_body_binds_parameters() {
        let addr = start(RouteSpec::new().on("/add", "POST", add_endpoint())).await;

        let response = client::call(
            &format!("http://{addr}/add"),
            CallOptions {
                method: "POST".into(),
                content: Content::Value(json!({"a": "20", "b": "22"})),
                content_type: Some("form".into()),
                ..CallOptions::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.content.as_text(), Some("42"));
    }
}

//! Per-connection request state machine.
//!
//! One accepted socket gets one long-lived task running [`run`]:
//!
//! ```text
//! ACCEPT -> OPEN -> (IDLE -> READING -> DISPATCH -> RESPOND)+ -> CLOSE
//! ```
//!
//! Requests on a connection are handled strictly in arrival order; a new
//! request is parsed only after the previous response is fully written.
//! Every failure is caught here: wire errors render their status code,
//! binder errors render `400`, handler errors with HTTP semantics render
//! verbatim, and anything else is logged and rendered as `500`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::sleep;

use crate::errors::Error;
use crate::http::format::{Reply, Response};
use crate::http::parser::{parse, Mode};
use crate::http::reader::HttpReader;
use crate::limits::{ConnLimits, ReaderLimits};
use crate::params;
use crate::router::{Endpoint, Router};
use crate::stream::MaybeTls;

/// Monotonic connection and request counters, owned by the server runtime.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    connections: AtomicU64,
    requests: AtomicU64,
}

impl Counters {
    pub(crate) fn next_connection(&self) -> u64 {
        self.connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn next_request(&self) -> u64 {
        self.requests.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Produces the body for a customized `404` or `500` answer.
pub type ResponseHook = Arc<dyn Fn() -> Reply + Send + Sync>;

/// Everything a connection task needs; cheap to clone per accept.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub name: Arc<str>,
    pub router: Arc<Router>,
    pub reader_limits: ReaderLimits,
    pub conn_limits: ConnLimits,
    pub counters: Arc<Counters>,
    pub on_404: Option<ResponseHook>,
    pub on_500: Option<ResponseHook>,
}

type Writer = WriteHalf<MaybeTls>;

/// Drive one connection from OPEN to CLOSE.
pub(crate) async fn run(ctx: ConnectionContext, stream: MaybeTls, peer: SocketAddr) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = HttpReader::new(read_half, ctx.reader_limits.clone());

    let cid = ctx.counters.next_connection();
    let started = Instant::now();
    let mut open_msg = Some(format!(
        "open server={} socket={}:{} cid={}",
        ctx.name,
        peer.ip(),
        peer.port(),
        cid
    ));
    let mut silent = false;

    while handle(&ctx, &mut reader, &mut write_half, cid, &mut open_msg, &mut silent).await {}

    if !silent {
        if let Some(msg) = open_msg.take() {
            info!("{msg}");
        }
        info!("close cid={cid} t={:.6}", started.elapsed().as_secs_f64());
    }

    // reset-by-peer on close is not worth reporting
    let _ = write_half.shutdown().await;
}

fn flush_open(open_msg: &mut Option<String>, silent: bool) {
    if let Some(msg) = open_msg.take() {
        if !silent {
            info!("{msg}");
        }
    }
}

/// Handle one request; the return value decides whether the loop continues.
async fn handle(
    ctx: &ConnectionContext,
    reader: &mut HttpReader<ReadHalf<MaybeTls>>,
    writer: &mut Writer,
    cid: u64,
    open_msg: &mut Option<String>,
    silent: &mut bool,
) -> bool {
    let mut document = match parse(reader, Mode::Server).await {
        // clean end of stream between requests: close quietly
        Ok(None) => return false,
        Ok(Some(document)) => document,
        Err(Error::Timeout) => {
            flush_open(open_msg, *silent);
            if !*silent {
                info!("timeout cid={cid}");
            }
            return false;
        }
        // the peer vanished mid-message
        Err(Error::Eof) => return false,
        Err(err) => {
            // wire errors have a definite status; framing is lost, so the
            // connection closes after the response
            flush_open(open_msg, *silent);
            match err.http_parts() {
                Some((code, reason, body)) => {
                    let response = Response::with_status(code, reason, body);
                    let _ = respond(ctx, writer, &response).await;
                }
                None => error!("exception: cid={cid} {err}"),
            }
            return false;
        }
    };

    let rid = ctx.counters.next_request();
    document.id = rid;
    document.connection_id = cid;
    let request_start = Instant::now();
    let request_msg = format!(
        "request cid={cid} rid={rid} method={} resource={}",
        document.method, document.resource
    );

    let keep_alive = document.is_keep_alive;
    let (status, written) = dispatch(ctx, document, writer, cid, open_msg, silent).await;

    if !*silent {
        info!(
            "{request_msg} status={status} t={:.6}",
            request_start.elapsed().as_secs_f64()
        );
    }

    written && keep_alive
}

/// Route, pre-process, bind, invoke, and write the response. Returns the
/// response status and whether the write succeeded.
async fn dispatch(
    ctx: &ConnectionContext,
    mut document: crate::http::document::Document,
    writer: &mut Writer,
    cid: u64,
    open_msg: &mut Option<String>,
    silent: &mut bool,
) -> (u16, bool) {
    let Some(route) = ctx.router.lookup(&document.resource, &document.method) else {
        flush_open(open_msg, *silent);
        let response = match &ctx.on_404 {
            Some(hook) => hook.as_ref()().into_response(),
            None => Response::with_status(404, "Not Found", ""),
        };
        return (404, respond(ctx, writer, &response).await);
    };

    *silent = route.silent;
    flush_open(open_msg, *silent);
    document.args = route.args;

    for before in route.before {
        if let Err(err) = before.as_ref()(&mut document).await {
            let response = Response::with_status(err.code, err.reason, err.explanation);
            return (response.code, respond(ctx, writer, &response).await);
        }
    }

    let result = invoke(route.endpoint, document).await;

    let (status, response) = match result {
        Ok(reply) => {
            let response = reply.into_response();
            (response.code, response)
        }
        Err(err) => match err.http_parts() {
            Some((code, reason, body)) => {
                let response = match (&ctx.on_404, code) {
                    (Some(hook), 404) => hook.as_ref()().into_response(),
                    _ => Response::with_status(code, reason, body),
                };
                (code, response)
            }
            None => {
                error!("exception: cid={cid} {err}");
                let response = match &ctx.on_500 {
                    Some(hook) => hook.as_ref()().into_response(),
                    None => Response::with_status(500, "Internal Server Error", ""),
                };
                (500, response)
            }
        },
    };

    (status, respond(ctx, writer, &response).await)
}

/// Invoke the endpoint with the argument shape it was registered with.
async fn invoke(
    endpoint: &Endpoint,
    mut document: crate::http::document::Document,
) -> crate::router::HandlerResult {
    match endpoint {
        Endpoint::Literal(text) => Ok(Reply::from(text.as_str())),
        Endpoint::Content(f) => f.as_ref()(document.content.clone()).await,
        Endpoint::Document(f) => f.as_ref()(Arc::new(document)).await,
        Endpoint::Params { func, params } => {
            let plan = params::bind(params, &mut document)?;
            let frozen = Arc::new(document);
            func.as_ref()(plan.materialize(&frozen)).await
        }
    }
}

/// Write a response within the socket write timeout.
async fn respond(ctx: &ConnectionContext, writer: &mut Writer, response: &Response) -> bool {
    let bytes = match response.serial() {
        Ok(bytes) => bytes,
        Err(err) => {
            error!("response serialization failed: {err}");
            match Response::with_status(500, "Internal Server Error", "").serial() {
                Ok(bytes) => bytes,
                Err(_) => return false,
            }
        }
    };

    write_bytes(writer, &bytes, ctx.conn_limits.socket_write_timeout)
        .await
        .is_ok()
}

async fn write_bytes(
    writer: &mut Writer,
    bytes: &[u8],
    timeout: Duration,
) -> std::io::Result<()> {
    tokio::select! {
        biased;

        result = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        } => result,
        _ = sleep(timeout) => {
            Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout"))
        },
    }
}

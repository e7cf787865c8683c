//! Outbound HTTP/1.1 client.
//!
//! One call opens a connection, writes one request, reads one response, and
//! closes. A [`RetryPolicy`] re-issues the request after the delays the
//! policy produces; `301`/`302` redirects re-issue without consuming the
//! retry budget.

use std::time::Duration;

use log::debug;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::errors::{Error, Result};
use crate::http::document::{Content, Document};
use crate::http::format::ClientRequest;
use crate::http::parser::{parse, Mode};
use crate::http::reader::HttpReader;
use crate::limits::ReaderLimits;
use crate::retry::RetryPolicy;
use crate::stream::MaybeTls;

const MAX_REDIRECTS: u32 = 5;

/// Options for [`call`].
///
/// # Examples
/// ```no_run
/// use rivulet::{client, CallOptions, Content};
/// use rivulet::retry::{FixedBackoff, RetryPolicy};
/// use serde_json::json;
///
/// # async fn demo() -> rivulet::Result<()> {
/// let response = client::call(
///     "http://localhost:8080/orders",
///     CallOptions {
///         method: "POST".into(),
///         content: Content::Value(json!({"item": "tea", "count": 2})),
///         bearer: Some("token".into()),
///         retry: Some(RetryPolicy::new(FixedBackoff::new(3, 100))),
///         ..CallOptions::default()
///     },
/// )
/// .await?;
/// assert_eq!(response.status_code, 200);
/// # Ok(())
/// # }
/// ```
pub struct CallOptions {
    pub method: String,
    pub content: Content,
    pub headers: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub charset: Option<String>,
    pub compress: bool,
    pub bearer: Option<String>,
    /// How long to wait for the first response byte.
    pub timeout: Duration,
    /// How long to wait for further bytes of a started response.
    pub active_timeout: Duration,
    pub max_read_size: usize,
    pub retry: Option<RetryPolicy>,
    /// Required for `https` targets; contexts are built by the caller.
    pub tls: Option<TlsConnector>,
    /// Log the outbound payload and a response summary at debug level.
    pub verbose: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            method: "GET".into(),
            content: Content::Text(String::new()),
            headers: Vec::new(),
            content_type: None,
            charset: Some("utf-8".into()),
            compress: false,
            bearer: None,
            timeout: Duration::from_secs(60),
            active_timeout: Duration::from_secs(5),
            max_read_size: 5000,
            retry: None,
            tls: None,
            verbose: false,
        }
    }
}

/// Issue one HTTP call and return the parsed response.
///
/// The returned [`Document`] carries the serialized outbound request in its
/// `sent` field for introspection.
///
/// # Examples
/// ```no_run
/// # async fn demo() -> rivulet::Result<()> {
/// let response = rivulet::client::get("http://localhost:8080/ping").await?;
/// assert_eq!(response.status_code, 200);
/// # Ok(())
/// # }
/// ```
pub async fn call(url: &str, mut options: CallOptions) -> Result<Document> {
    let mut target = Url::parse(url)?;
    let mut retry = options.retry.take();
    let mut redirects = 0;

    loop {
        let mut response = one_shot(&target, &options).await?;

        if matches!(response.status_code, 301 | 302) && redirects < MAX_REDIRECTS {
            if let Some(location) = response.headers.get("location") {
                target = target.redirect(location)?;
                redirects += 1;
                continue;
            }
        }

        if let Some(policy) = retry.as_mut() {
            if let Some(delay_ms) = policy.retry(response.status_code) {
                sleep(Duration::from_millis(delay_ms)).await;
                continue;
            }
        }

        if options.verbose {
            debug!("{} {}", response.status_code, response.status_message);
        }
        return Ok(response);
    }
}

pub async fn get(url: &str) -> Result<Document> {
    call(url, CallOptions::default()).await
}

pub async fn post(url: &str, content: impl Into<Content>) -> Result<Document> {
    method_call(url, "POST", content).await
}

pub async fn put(url: &str, content: impl Into<Content>) -> Result<Document> {
    method_call(url, "PUT", content).await
}

pub async fn patch(url: &str, content: impl Into<Content>) -> Result<Document> {
    method_call(url, "PATCH", content).await
}

pub async fn delete(url: &str) -> Result<Document> {
    method_call(url, "DELETE", Content::Text(String::new())).await
}

async fn method_call(url: &str, method: &str, content: impl Into<Content>) -> Result<Document> {
    call(
        url,
        CallOptions {
            method: method.into(),
            content: content.into(),
            ..CallOptions::default()
        },
    )
    .await
}

async fn one_shot(target: &Url, options: &CallOptions) -> Result<Document> {
    let mut client = Connection::open(target, options.tls.clone()).await?;

    let request = ClientRequest {
        method: options.method.to_uppercase(),
        path: target.path.clone(),
        query: target.query.clone(),
        host: Some(target.host.clone()),
        headers: options.headers.clone(),
        content: options.content.clone(),
        content_type: options.content_type.clone(),
        charset: options.charset.clone(),
        compress: options.compress,
        bearer: options.bearer.clone(),
        close: true,
    };

    let sent = client.write(&request, options.verbose).await?;

    let limits = ReaderLimits {
        idle_timeout: options.timeout,
        active_timeout: options.active_timeout,
        max_read_size: options.max_read_size,
        max_content_length: usize::MAX,
        ..ReaderLimits::default()
    };
    let mut response = client.read(limits).await?;
    client.close().await;

    response.sent = Some(sent);
    Ok(response)
}

/// One open connection: split stream halves, consumed by a single
/// write/read exchange.
struct Connection {
    read_half: Option<ReadHalf<MaybeTls>>,
    write_half: WriteHalf<MaybeTls>,
}

impl Connection {
    async fn open(target: &Url, tls: Option<TlsConnector>) -> Result<Self> {
        let tcp = TcpStream::connect((target.host.as_str(), target.port)).await?;

        let stream = if target.is_ssl {
            let connector =
                tls.ok_or_else(|| Error::Client("https requires a TLS connector".into()))?;
            let name = ServerName::try_from(target.host.clone())
                .map_err(|_| Error::Client(format!("invalid host name: {}", target.host)))?;
            MaybeTls::Client(Box::new(connector.connect(name, tcp).await?))
        } else {
            MaybeTls::Plain(tcp)
        };

        let (read_half, write_half) = tokio::io::split(stream);
        Ok(Self {
            read_half: Some(read_half),
            write_half,
        })
    }

    async fn write(&mut self, request: &ClientRequest, verbose: bool) -> Result<Vec<u8>> {
        let bytes = request.serial()?;
        self.write_half.write_all(&bytes).await?;
        self.write_half.flush().await?;
        if verbose {
            debug!("{}", String::from_utf8_lossy(&bytes));
        }
        Ok(bytes)
    }

    async fn read(&mut self, limits: ReaderLimits) -> Result<Document> {
        let read_half = self
            .read_half
            .take()
            .ok_or_else(|| Error::Client("response already read".into()))?;
        let mut reader = HttpReader::new(read_half, limits);
        parse(&mut reader, Mode::Client).await?.ok_or(Error::Eof)
    }

    async fn close(&mut self) {
        let _ = self.write_half.shutdown().await;
    }
}

/// Parsed call target.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Url {
    is_ssl: bool,
    host: String,
    port: u16,
    path: String,
    query: String,
}

impl Url {
    fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::Client(format!("invalid url: {url}")))?;
        let is_ssl = match scheme {
            "http" => false,
            "https" => true,
            other => return Err(Error::Client(format!("unsupported scheme: {other}"))),
        };

        let (authority, path_and_query) = match rest.find('/') {
            Some(index) => (&rest[..index], &rest[index..]),
            None => (rest, ""),
        };

        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => (
                host,
                port.parse()
                    .map_err(|_| Error::Client(format!("invalid port: {port}")))?,
            ),
            None => (authority, if is_ssl { 443 } else { 80 }),
        };
        if host.is_empty() {
            return Err(Error::Client(format!("invalid url: {url}")));
        }

        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, query),
            None => (path_and_query, ""),
        };

        Ok(Self {
            is_ssl,
            host: host.to_string(),
            port,
            path: if path.is_empty() { "/" } else { path }.to_string(),
            query: query.to_string(),
        })
    }

    /// Apply a `location` header: absolute URLs replace scheme and host,
    /// relative ones replace only path and query.
    fn redirect(&self, location: &str) -> Result<Self> {
        if location.contains("://") {
            return Self::parse(location);
        }
        let (path, query) = match location.split_once('?') {
            Some((path, query)) => (path, query),
            None => (location, ""),
        };
        Ok(Self {
            path: if path.is_empty() { "/" } else { path }.to_string(),
            query: query.to_string(),
            ..self.clone()
        })
    }
}

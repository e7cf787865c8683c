//! HTTP/1.1 message formatter.
//!
//! Serializes responses and client requests from structured form. Both
//! directions share one normalization pass: content-type inference, content
//! encoding, charset application, optional gzip, and the `Date` /
//! `Content-Length` / `Connection` headers.

use std::io::Write;
use std::time::SystemTime;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;

use crate::errors::{Error, Result};
use crate::http::document::Content;
use crate::http::query;

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Content::Text(value.to_string())
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Content::Text(value)
    }
}

impl From<i64> for Content {
    fn from(value: i64) -> Self {
        Content::Value(Value::from(value))
    }
}

impl From<Value> for Content {
    fn from(value: Value) -> Self {
        Content::Value(value)
    }
}

impl From<Vec<u8>> for Content {
    fn from(value: Vec<u8>) -> Self {
        Content::Bytes(value)
    }
}

impl From<()> for Content {
    fn from(_: ()) -> Self {
        Content::Text(String::new())
    }
}

/// What a handler hands back: either plain content that gets wrapped in a
/// `200 OK` response with an inferred content type, or a full [`Response`].
#[derive(Debug, Clone)]
pub enum Reply {
    Content(Content),
    Response(Box<Response>),
}

impl From<Content> for Reply {
    fn from(value: Content) -> Self {
        Reply::Content(value)
    }
}

impl From<&str> for Reply {
    fn from(value: &str) -> Self {
        Reply::Content(value.into())
    }
}

impl From<String> for Reply {
    fn from(value: String) -> Self {
        Reply::Content(value.into())
    }
}

impl From<i64> for Reply {
    fn from(value: i64) -> Self {
        Reply::Content(value.into())
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Content(value.into())
    }
}

impl From<()> for Reply {
    fn from(value: ()) -> Self {
        Reply::Content(value.into())
    }
}

impl From<Response> for Reply {
    fn from(value: Response) -> Self {
        Reply::Response(Box::new(value))
    }
}

impl Reply {
    pub(crate) fn into_response(self) -> Response {
        match self {
            Reply::Content(content) => Response::new(content),
            Reply::Response(response) => *response,
        }
    }
}

/// An HTTP response in structured form.
///
/// # Examples
/// ```
/// use rivulet::Response;
///
/// let bytes = Response::with_status(404, "Not Found", "no such user")
///     .close()
///     .serial()
///     .unwrap();
/// assert!(bytes.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    pub code: u16,
    pub message: String,
    headers: Vec<(String, String)>,
    content: Content,
    content_type: Option<String>,
    charset: Option<String>,
    close: bool,
    compress: bool,
}

impl Response {
    /// A `200 OK` response around the given content.
    pub fn new(content: impl Into<Content>) -> Self {
        Self::with_status(200, "", content)
    }

    pub fn with_status(code: u16, message: impl Into<String>, content: impl Into<Content>) -> Self {
        Self {
            code,
            message: message.into(),
            headers: Vec::new(),
            content: content.into(),
            content_type: None,
            charset: Some("utf-8".into()),
            close: false,
            compress: false,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = Some(charset.into());
        self
    }

    /// Request a `Connection: close` header.
    pub fn close(mut self) -> Self {
        self.close = true;
        self
    }

    /// Gzip the body and declare `Content-Encoding: gzip`.
    pub fn compress(mut self) -> Self {
        self.compress = true;
        self
    }

    /// Serialize to wire bytes.
    pub fn serial(&self) -> Result<Vec<u8>> {
        let message = if self.code == 200 && self.message.is_empty() {
            "OK"
        } else {
            &self.message
        };
        let status = format!("HTTP/1.1 {} {}", self.code, message);

        serialize(
            status,
            self.headers.clone(),
            &self.content,
            self.content_type.as_deref(),
            self.charset.as_deref(),
            self.close,
            self.compress,
        )
    }
}

/// An outbound HTTP request in structured form.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub host: Option<String>,
    pub headers: Vec<(String, String)>,
    pub content: Content,
    pub content_type: Option<String>,
    pub charset: Option<String>,
    pub compress: bool,
    pub bearer: Option<String>,
    pub close: bool,
}

impl Default for ClientRequest {
    fn default() -> Self {
        Self {
            method: "GET".into(),
            path: "/".into(),
            query: String::new(),
            host: None,
            headers: Vec::new(),
            content: Content::Text(String::new()),
            content_type: None,
            charset: Some("utf-8".into()),
            compress: false,
            bearer: None,
            close: false,
        }
    }
}

impl ClientRequest {
    /// Serialize to wire bytes.
    ///
    /// For `GET`, mapping content folds into the query string; any other
    /// non-empty content on `GET` is a caller error.
    pub fn serial(&self) -> Result<Vec<u8>> {
        let mut headers = self.headers.clone();
        if let Some(bearer) = &self.bearer {
            headers.push(("Authorization".into(), format!("Bearer {bearer}")));
        }
        if let Some(host) = &self.host {
            headers.push(("HOST".into(), host.clone()));
        }

        let mut content = self.content.clone();
        let mut path = self.path.clone();

        if self.method == "GET" {
            let mut pairs = query::parse_pairs(&self.query);
            match &content {
                Content::Value(Value::Object(map)) => {
                    pairs.extend(query::normalize(map));
                    content = Content::Text(String::new());
                }
                other if !is_empty(other) => {
                    return Err(Error::Client("content not allowed on GET".into()));
                }
                _ => {}
            }
            if !pairs.is_empty() {
                let encoded =
                    query::encode_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
                path = format!("{path}?{encoded}");
            }
        } else if !self.query.is_empty() {
            path = format!("{path}?{}", self.query);
        }

        let status = format!("{} {} HTTP/1.1", self.method, path);

        serialize(
            status,
            headers,
            &content,
            self.content_type.as_deref(),
            self.charset.as_deref(),
            self.close,
            self.compress,
        )
    }
}

fn is_empty(content: &Content) -> bool {
    match content {
        Content::Text(text) => text.is_empty(),
        Content::Bytes(bytes) => bytes.is_empty(),
        Content::Value(Value::Null) => true,
        Content::Value(Value::String(text)) => text.is_empty(),
        Content::Value(Value::Object(map)) => map.is_empty(),
        Content::Value(Value::Array(list)) => list.is_empty(),
        Content::Value(_) => false,
    }
}

fn header_get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// The shared normalization pass, applied in a fixed order: infer the
/// content type, encode the content, apply the charset, optionally gzip,
/// then add `Date`, `Content-Length`, and `Connection` as needed.
fn serialize(
    status: String,
    mut headers: Vec<(String, String)>,
    content: &Content,
    content_type: Option<&str>,
    charset: Option<&str>,
    close: bool,
    compress: bool,
) -> Result<Vec<u8>> {
    let content_type = content_type
        .map(str::to_string)
        .or_else(|| header_get(&headers, "content-type").map(str::to_string))
        .unwrap_or_else(|| infer_content_type(content).to_string());

    let (mut body, content_type, textual) = encode_content(content, &content_type, charset)?;

    if !body.is_empty() && header_get(&headers, "content-type").is_none() {
        let value = match (textual, charset) {
            (true, Some(charset)) => format!("{content_type}; charset={charset}"),
            _ => content_type,
        };
        headers.push(("Content-Type".into(), value));
    }

    if compress {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body)?;
        body = encoder.finish()?;
        headers.push(("Content-Encoding".into(), "gzip".into()));
    }

    if header_get(&headers, "date").is_none() {
        headers.push(("Date".into(), httpdate::fmt_http_date(SystemTime::now())));
    }

    if header_get(&headers, "content-length").is_none() {
        headers.push(("Content-Length".into(), body.len().to_string()));
    }

    if close && header_get(&headers, "connection").is_none() {
        headers.push(("Connection".into(), "close".into()));
    }

    let mut wire = Vec::with_capacity(status.len() + headers.len() * 32 + body.len() + 4);
    wire.extend(status.as_bytes());
    wire.extend(b"\r\n");
    for (name, value) in &headers {
        wire.extend(name.as_bytes());
        wire.extend(b": ");
        wire.extend(value.as_bytes());
        wire.extend(b"\r\n");
    }
    wire.extend(b"\r\n");
    wire.extend(body);

    Ok(wire)
}

fn infer_content_type(content: &Content) -> &'static str {
    match content {
        Content::Value(Value::Object(_)) | Content::Value(Value::Array(_)) => "application/json",
        Content::Bytes(_) => "application/octet-stream",
        _ => "text/plain",
    }
}

/// Encode the content per the resolved content type, returning the body
/// bytes, the full media type, and whether the body is textual (and so
/// gets a charset parameter).
fn encode_content(
    content: &Content,
    content_type: &str,
    charset: Option<&str>,
) -> Result<(Vec<u8>, String, bool)> {
    if is_empty(content) {
        return Ok((Vec::new(), content_type.to_string(), false));
    }

    match content_type {
        "json" | "application/json" => {
            let value = content_value(content);
            let body = serde_json::to_string(&value).map_err(|e| Error::Client(e.to_string()))?;
            Ok((encode_text(&body, charset)?, "application/json".into(), true))
        }
        "form" | "application/x-www-form-urlencoded" => {
            let map = content
                .as_object()
                .ok_or_else(|| Error::Client("form content requires a mapping".into()))?;
            let pairs = query::normalize(map);
            let body = query::encode_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            Ok((
                encode_text(&body, charset)?,
                "application/x-www-form-urlencoded".into(),
                true,
            ))
        }
        _ => match content {
            Content::Bytes(bytes) => Ok((bytes.clone(), content_type.to_string(), false)),
            other => Ok((
                encode_text(&scalar_text(other), charset)?,
                content_type.to_string(),
                true,
            )),
        },
    }
}

/// Encode a textual body with the message charset (default utf-8).
fn encode_text(text: &str, charset: Option<&str>) -> Result<Vec<u8>> {
    match charset.map(str::to_ascii_lowercase).as_deref() {
        None | Some("utf-8") | Some("utf8") => Ok(text.as_bytes().to_vec()),
        Some("ascii") | Some("us-ascii") => {
            if text.is_ascii() {
                Ok(text.as_bytes().to_vec())
            } else {
                Err(Error::Client("content is not pure ascii".into()))
            }
        }
        Some("latin-1") | Some("latin1") | Some("iso-8859-1") => text
            .chars()
            .map(|c| {
                u8::try_from(c as u32)
                    .map_err(|_| Error::Client("content does not fit latin-1".into()))
            })
            .collect(),
        Some(other) => Err(Error::Client(format!("unsupported charset: {other}"))),
    }
}

fn content_value(content: &Content) -> Value {
    match content {
        Content::Value(value) => value.clone(),
        Content::Text(text) => Value::String(text.clone()),
        Content::Bytes(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn scalar_text(content: &Content) -> String {
    match content {
        Content::Text(text) => text.clone(),
        Content::Value(Value::String(text)) => text.clone(),
        Content::Value(value) => value.to_string(),
        Content::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

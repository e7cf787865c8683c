//! Incremental HTTP/1.1 document parser.
//!
//! Consumes an [`HttpReader`] and produces one [`Document`]. The parser
//! runs in one of two modes: [`Mode::Server`] expects request lines,
//! [`Mode::Client`] expects status lines. All protocol violations surface
//! as [`HttpError`]s with a definite status code so the connection loop can
//! answer them directly.

use std::io::Read;
use std::sync::OnceLock;

use flate2::read::GzDecoder;
use regex::Regex;
use serde_json::Value;
use tokio::io::AsyncRead;

use crate::errors::{Error, HttpError, Result};
use crate::http::document::{Content, Document};
use crate::http::query;
use crate::http::reader::HttpReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
}

/// Lenient `type / subtype [; attribute = value]` grammar with whitespace
/// tolerated at every boundary. Deliberately loose: interoperability with
/// clients in the wild depends on it.
fn content_type_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?x)
            ^\s*
            (?P<type>.+?)          # content type
            \s*/\s*
            (?P<subtype>[^;]+?)    # content subtype
            (
                \s*;\s*
                (?P<attribute>.+?) # attribute name
                \s*=\s*
                (?P<value>.+?)     # attribute value
            )?
            \s*$",
        )
        .expect("content-type pattern")
    })
}

/// Parse the next document from the reader.
///
/// Returns `Ok(None)` on a clean end-of-stream before any byte of a new
/// message arrived; the connection loop treats that as a quiet close.
pub async fn parse<R: AsyncRead + Unpin>(
    reader: &mut HttpReader<R>,
    mode: Mode,
) -> Result<Option<Document>> {
    let status = match reader.read_line().await {
        Ok(line) => line,
        Err(Error::Eof) if !reader.has_buffered() => return Ok(None),
        Err(err) => return Err(err),
    };

    let mut document = Document::new();
    match mode {
        Mode::Server => parse_server(reader, &mut document, &status).await?,
        Mode::Client => parse_client(reader, &mut document, &status).await?,
    }
    Ok(Some(document))
}

/// Parse a request: `METHOD SP RESOURCE SP HTTP/1.1`.
async fn parse_server<R: AsyncRead + Unpin>(
    reader: &mut HttpReader<R>,
    document: &mut Document,
    status: &str,
) -> Result<()> {
    let tokens: Vec<&str> = status.split_whitespace().collect();

    if tokens.len() != 3 {
        return Err(HttpError::bad_request("malformed status line").into());
    }
    if tokens[2] != "HTTP/1.1" {
        return Err(
            HttpError::bad_request(format!("unsupported HTTP protocol: {}", tokens[2])).into(),
        );
    }

    document.method = tokens[0].to_uppercase();
    match tokens[1].split_once('?') {
        Some((path, query_string)) => {
            document.resource = path.to_string();
            document.query_string = query_string.to_string();
            document.query = query::parse_qs(query_string, false);
        }
        None => document.resource = tokens[1].to_string(),
    }

    parse_headers_and_body(reader, document).await?;

    if document.method == "GET" {
        document.content = Content::Value(Value::Object(document.query.clone()));
    } else if matches!(document.method.as_str(), "PATCH" | "POST" | "PUT") {
        parse_content(document)?;
    }

    Ok(())
}

/// Parse a response: `HTTP/1.1 SP CODE [SP MESSAGE]`.
async fn parse_client<R: AsyncRead + Unpin>(
    reader: &mut HttpReader<R>,
    document: &mut Document,
    status: &str,
) -> Result<()> {
    let tokens: Vec<&str> = status.split_whitespace().collect();

    if tokens.len() < 2 {
        return Err(HttpError::bad_request("malformed status line").into());
    }
    if tokens[0] != "HTTP/1.1" {
        return Err(
            HttpError::bad_request(format!("unsupported HTTP protocol: {}", tokens[0])).into(),
        );
    }

    document.status_code = tokens[1]
        .parse()
        .map_err(|_| HttpError::bad_request(format!("invalid status code: {}", tokens[1])))?;
    document.status_message = tokens[2..].join(" ");

    parse_headers_and_body(reader, document).await?;
    parse_content(document)
}

async fn parse_headers_and_body<R: AsyncRead + Unpin>(
    reader: &mut HttpReader<R>,
    document: &mut Document,
) -> Result<()> {
    loop {
        let header = reader.read_line().await?;
        if header.is_empty() {
            break;
        }
        if document.headers.len() == reader.limits().max_header_count {
            return Err(HttpError::bad_request("max header count exceeded").into());
        }
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| HttpError::bad_request("header missing colon"))?;
        document.headers.insert(name, value.trim());
    }

    document.is_keep_alive = document
        .headers
        .get("connection")
        .map_or(true, |value| value == "keep-alive");

    parse_http_content(reader, document).await?;

    if let Some(content_type) = document.headers.get("content-type") {
        let captures = content_type_pattern()
            .captures(content_type)
            .ok_or_else(|| HttpError::bad_request("invalid content-type header"))?;
        document.content_type = Some(format!("{}/{}", &captures["type"], &captures["subtype"]));
        if captures.name("attribute").map(|m| m.as_str()) == Some("charset") {
            document.charset = Some(captures["value"].to_string());
        }
    }

    if let Some(encoding) = document.headers.get("content-encoding") {
        if encoding != "gzip" {
            return Err(HttpError::bad_request("unsupported content encoding").into());
        }
        document.content_encoding = Some(encoding.to_string());
    }

    if document.content_encoding.is_some() && !document.http_content.is_empty() {
        let mut decoder = GzDecoder::new(document.http_content.as_slice());
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|_| HttpError::bad_request("malformed gzip data"))?;
        document.http_content = decompressed;
    }

    Ok(())
}

/// Read the message body, honoring `transfer-encoding: chunked` and the
/// `content-length` header (default 0).
async fn parse_http_content<R: AsyncRead + Unpin>(
    reader: &mut HttpReader<R>,
    document: &mut Document,
) -> Result<()> {
    if document.headers.get("transfer-encoding") == Some("chunked") {
        return parse_chunked(reader, document).await;
    }

    let length = document.headers.get("content-length").unwrap_or("0");
    let length: usize = length
        .trim()
        .parse()
        .map_err(|_| HttpError::bad_request("invalid content-length"))?;

    if length > reader.limits().max_content_length {
        return Err(HttpError::payload_too_large().into());
    }

    document.content_length = length;
    if length > 0 {
        document.http_content = reader.read(length).await?;
    }

    Ok(())
}

/// Decode `HEX[;ext] CRLF DATA CRLF` chunks, terminated by a zero-length
/// chunk. The decoded total is bounded by `max_content_length`.
async fn parse_chunked<R: AsyncRead + Unpin>(
    reader: &mut HttpReader<R>,
    document: &mut Document,
) -> Result<()> {
    loop {
        let line = reader.read_line().await?;
        let size = line.split(';').next().unwrap_or("").trim();
        let length = usize::from_str_radix(size, 16).map_err(|_| {
            HttpError::bad_request(format!("invalid transfer-encoding chunk length: {line}"))
        })?;
        if length == 0 {
            // trailing blank line after the terminal chunk
            reader.read_line().await?;
            break;
        }
        if document.http_content.len() + length > reader.limits().max_content_length {
            return Err(HttpError::payload_too_large().into());
        }
        document.http_content.extend(reader.read(length).await?);
        reader.read_line().await?;
    }

    document.content_length = document.http_content.len();
    Ok(())
}

/// Decode the typed `content` from the raw body per `content-type`.
fn parse_content(document: &mut Document) -> Result<()> {
    match document.content_type.as_deref() {
        Some("application/json") => {
            document.content = Content::Value(
                serde_json::from_slice(&document.http_content)
                    .map_err(|_| HttpError::bad_request("invalid json content"))?,
            );
        }
        Some("application/x-www-form-urlencoded") => {
            if !document.http_content.is_empty() {
                let body = std::str::from_utf8(&document.http_content)
                    .map_err(|_| HttpError::bad_request("invalid form content"))?;
                document.content = Content::Value(Value::Object(query::parse_qs(body, true)));
            }
        }
        Some("text/plain") => {
            document.content = Content::Text(decode_text(
                &document.http_content,
                document.charset.as_deref(),
            )?);
        }
        _ => {
            // a gzip body with no recognized type is still text by the time
            // it reaches the handler; anything else passes through raw
            if document.content_encoding.is_some() {
                document.content = Content::Text(decode_text(
                    &document.http_content,
                    document.charset.as_deref(),
                )?);
            } else if !document.http_content.is_empty() {
                document.content = Content::Bytes(document.http_content.clone());
            }
        }
    }
    Ok(())
}

fn decode_text(bytes: &[u8], charset: Option<&str>) -> Result<String> {
    match charset.map(str::to_ascii_lowercase).as_deref() {
        None | Some("utf-8") | Some("utf8") | Some("ascii") | Some("us-ascii") => {
            Ok(String::from_utf8(bytes.to_vec())
                .map_err(|_| HttpError::bad_request("invalid text content"))?)
        }
        Some("latin-1") | Some("latin1") | Some("iso-8859-1") => {
            Ok(bytes.iter().map(|&b| b as char).collect())
        }
        Some(other) => Err(HttpError::bad_request(format!("unsupported charset: {other}")).into()),
    }
}

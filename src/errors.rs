//! Error taxonomy for the request lifecycle.
//!
//! Every failure that can reach a client maps onto an [`HttpError`] with a
//! concrete status code; everything else is caught at the connection-loop
//! boundary and rendered as `500 Internal Server Error`.

use std::fmt;
use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// An error carrying HTTP response semantics.
///
/// Raised by the wire parser for protocol violations and available to
/// handlers that want to answer with a specific status. The connection loop
/// renders `code`/`reason` on the status line and `explanation` as the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    pub code: u16,
    pub reason: String,
    pub explanation: String,
}

impl HttpError {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            explanation: String::new(),
        }
    }

    pub fn explain(code: u16, reason: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            explanation: explanation.into(),
        }
    }

    pub(crate) fn bad_request(explanation: impl Into<String>) -> Self {
        Self::explain(400, "Bad Request", explanation)
    }

    pub(crate) fn payload_too_large() -> Self {
        Self::new(413, "Request Entity Too Large")
    }

    pub(crate) fn header_fields_too_large(explanation: impl Into<String>) -> Self {
        Self::explain(431, "Request Header Fields Too Large", explanation)
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.explanation.is_empty() {
            write!(f, "{} {}", self.code, self.reason)
        } else {
            write!(f, "{} {}: {}", self.code, self.reason, self.explanation)
        }
    }
}

impl std::error::Error for HttpError {}

/// Parameter-binding failures. All of these render as `400 Bad Request`
/// with the display text as the response body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    #[error("extra attribute(s): {0}")]
    Extra(String),

    #[error("duplicate attribute: {0}")]
    Duplicate(String),

    #[error("missing required attribute: {0}")]
    Required(String),

    #[error("{0}")]
    Payload(String),
}

impl BindError {
    /// Conversion failure for a named parameter.
    pub(crate) fn invalid_value(name: &str, err: impl fmt::Display) -> Self {
        BindError::Payload(format!("invalid {name} value: {err}"))
    }

    /// The request content cannot supply named parameters.
    pub(crate) fn not_a_mapping() -> Self {
        BindError::Payload("expecting content to be a dictionary".into())
    }
}

/// Top-level error for the serving and client machinery.
#[derive(Debug, Error)]
pub enum Error {
    /// A failure with a definite HTTP rendering.
    #[error("{0}")]
    Http(#[from] HttpError),

    /// Parameter binding failed; rendered as `400 Bad Request`.
    #[error("{0}")]
    Bind(#[from] BindError),

    /// The peer closed the stream. A clean signal, not a protocol error.
    #[error("end of stream")]
    Eof,

    /// No data arrived within the reader's idle or active window.
    #[error("read timed out")]
    Timeout,

    /// Route-table or registry misconfiguration detected at build time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Client-side usage error (bad URL, content on GET, missing TLS).
    #[error("{0}")]
    Client(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// Anything a handler bubbles up that carries no HTTP semantics;
    /// the connection loop logs it and answers `500`.
    #[error(transparent)]
    Handler(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// The `(code, reason, body)` this error renders as, if it renders at all.
    pub(crate) fn http_parts(&self) -> Option<(u16, String, String)> {
        match self {
            Error::Http(e) => Some((e.code, e.reason.clone(), e.explanation.clone())),
            Error::Bind(e) => Some((400, "Bad Request".into(), e.to_string())),
            _ => None,
        }
    }
}

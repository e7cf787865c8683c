//! Parsing limits and socket timeouts.
//!
//! Default limits are intentionally conservative to prevent:
//! - Resource exhaustion attacks
//! - Header flooding
//! - Slowloris-style trickle connections
//!
//! # Examples
//!
//! ```no_run
//! use rivulet::{Server, limits::ReaderLimits};
//! use std::time::Duration;
//!
//! # async fn build(listener: tokio::net::TcpListener, routes: rivulet::RouteSpec) {
//! let server = Server::builder()
//!     .listener(listener)
//!     .routes(routes)
//!     .reader_limits(ReaderLimits {
//!         max_content_length: 64 * 1024, // larger payloads for upload APIs
//!         idle_timeout: Duration::from_secs(30),
//!         ..ReaderLimits::default()
//!     })
//!     .build();
//! # }
//! ```

use std::time::Duration;

/// Bounds and timeouts for the incremental wire reader.
///
/// One instance parameterizes every [`HttpReader`](crate::http::reader::HttpReader)
/// the server or client creates. All bounds apply per message, not per
/// connection.
#[derive(Debug, Clone)]
pub struct ReaderLimits {
    /// Maximum bytes a single header or chunk-size line may span
    /// (default: `10_000`).
    ///
    /// Exceeding this, with or without a line terminator in sight, fails the
    /// request with `431 Request Header Fields Too Large`.
    pub max_line_length: usize,

    /// Maximum number of headers per message (default: `100`).
    ///
    /// One more header than this fails the request with `400 Bad Request`.
    pub max_header_count: usize,

    /// Maximum accepted `content-length` in bytes (default: `1 MiB`).
    ///
    /// Declared lengths above this fail with `413 Request Entity Too Large`
    /// before any body byte is consumed.
    pub max_content_length: usize,

    /// Maximum bytes pulled from the socket per read (default: `5000`).
    ///
    /// Keeps a single connection from monopolizing the reactor; large
    /// bodies arrive over several reads.
    pub max_read_size: usize,

    /// How long to wait for the first byte of a new message
    /// (default: `60 seconds`).
    ///
    /// Applies while the read buffer is empty, i.e. between keep-alive
    /// requests. Expiry closes the connection.
    pub idle_timeout: Duration,

    /// How long to wait for more data once a message has started arriving
    /// (default: `5 seconds`).
    ///
    /// The shorter window frees resources held by stalled mid-message peers.
    pub active_timeout: Duration,
}

impl Default for ReaderLimits {
    fn default() -> Self {
        Self {
            max_line_length: 10_000,
            max_header_count: 100,
            max_content_length: 1024 * 1024,
            max_read_size: 5000,
            idle_timeout: Duration::from_secs(60),
            active_timeout: Duration::from_secs(5),
        }
    }
}

/// Connection-level socket limits.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum duration for writing one response to the socket
    /// (default: `3 seconds`).
    ///
    /// If the peer cannot drain the response in time, the connection is
    /// terminated.
    pub socket_write_timeout: Duration,
}

impl Default for ConnLimits {
    #[inline]
    fn default() -> Self {
        Self {
            socket_write_timeout: Duration::from_secs(3),
        }
    }
}

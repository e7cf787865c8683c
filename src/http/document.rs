//! In-memory representation of one parsed HTTP message.

use serde_json::{Map, Value};

/// Decoded message body.
///
/// The parser populates this from the raw body bytes according to the
/// declared `content-type`; handlers see the decoded form, never the wire
/// bytes, unless the content type is undeclared.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    /// JSON, form, or query content. Mappings are `Value::Object`,
    /// multi-valued keys become `Value::Array`.
    Value(Value),
    /// `text/plain` content decoded with the message charset.
    Text(String),
    /// Raw body bytes for undeclared or unrecognized content types.
    Bytes(Vec<u8>),
}

impl Content {
    /// Empty mapping, the initial state of every document.
    pub fn empty() -> Self {
        Content::Value(Value::Object(Map::new()))
    }

    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        match self {
            Content::Value(Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    pub(crate) fn as_object_mut(&mut self) -> Option<&mut Map<String, Value>> {
        match self {
            Content::Value(Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(text) => Some(text),
            Content::Value(Value::String(text)) => Some(text),
            _ => None,
        }
    }
}

/// Header map with case-insensitive lookup.
///
/// Names are lowercased on insert; duplicate names overwrite in place
/// (last value wins), preserving first-insertion order for iteration.
///
/// # Examples
/// ```
/// use rivulet::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Content-Type", "text/plain");
/// headers.insert("X-Tag", "one");
/// headers.insert("x-tag", "two");
///
/// assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
/// assert_eq!(headers.get("x-tag"), Some("two"));
/// assert_eq!(headers.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        let name = name.trim().to_ascii_lowercase();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// One parsed HTTP/1.1 message, request or response.
///
/// The parser creates a `Document`, `before` processors and the parameter
/// binder may mutate it, handlers receive it read-only, and the connection
/// loop discards it once the response is written.
#[derive(Debug, Clone)]
pub struct Document {
    pub headers: Headers,
    pub content_length: usize,
    /// Media type only, e.g. `application/json`; parameters are split off.
    pub content_type: Option<String>,
    pub charset: Option<String>,
    /// `Some("gzip")` or `None`; other encodings are rejected by the parser.
    pub content_encoding: Option<String>,
    /// Raw body bytes after chunked/gzip decoding.
    pub http_content: Vec<u8>,
    pub is_keep_alive: bool,
    pub content: Content,

    // server variant
    pub method: String,
    pub resource: String,
    pub query_string: String,
    pub query: Map<String, Value>,
    /// Positional captures from the matched route pattern.
    pub args: Vec<String>,
    /// Monotonic request counter, assigned by the connection loop.
    pub id: u64,
    /// Monotonic connection counter, assigned by the connection loop.
    pub connection_id: u64,

    // client variant
    pub status_code: u16,
    pub status_message: String,
    /// The serialized outbound request, attached by the client for
    /// introspection.
    pub sent: Option<Vec<u8>>,
}

impl Document {
    pub fn new() -> Self {
        Self {
            headers: Headers::new(),
            content_length: 0,
            content_type: None,
            charset: None,
            content_encoding: None,
            http_content: Vec::new(),
            is_keep_alive: true,
            content: Content::empty(),

            method: String::new(),
            resource: String::new(),
            query_string: String::new(),
            query: Map::new(),
            args: Vec::new(),
            id: 0,
            connection_id: 0,

            status_code: 0,
            status_message: String::new(),
            sent: None,
        }
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

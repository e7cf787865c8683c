//! URL query string decoding and encoding.
//!
//! Parses `key=value&key=value` strings into a JSON mapping where a key seen
//! once yields a scalar and a key seen several times yields an array, and
//! encodes the reverse direction for the formatter.
//!
//! # Examples
//! ```
//! use rivulet::http::query;
//! use serde_json::json;
//!
//! let parsed = query::parse_qs("name=John+Doe&tag=a&tag=b", false);
//! assert_eq!(parsed["name"], "John Doe");
//! assert_eq!(parsed["tag"], json!(["a", "b"]));
//! ```

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::{Map, Value};

/// Everything except unreserved characters gets percent-encoded.
const QUERY: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Decode one query component: `+` means space, `%XX` sequences are decoded.
/// Invalid UTF-8 after decoding falls back to lossy replacement.
pub fn decode(component: &str) -> String {
    let plus_decoded = component.replace('+', " ");
    percent_decode_str(&plus_decoded)
        .decode_utf8_lossy()
        .into_owned()
}

/// Percent-encode one query component.
pub fn encode(component: &str) -> String {
    utf8_percent_encode(component, QUERY).to_string()
}

/// Parse a query string into a mapping.
///
/// A key with a single value yields a scalar string, a repeated key yields
/// an array of strings. With `keep_blank` false, `a=&b=2` drops `a`
/// entirely (the behavior for URL query strings); form bodies pass true.
pub fn parse_qs(query: &str, keep_blank: bool) -> Map<String, Value> {
    let mut result: Map<String, Value> = Map::new();

    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.split_once('=') {
            Some((key, value)) => (key, value),
            None => (pair, ""),
        };
        if value.is_empty() && !keep_blank {
            continue;
        }
        let key = decode(key);
        if key.is_empty() {
            continue;
        }
        let value = Value::String(decode(value));

        match result.get_mut(&key) {
            None => {
                result.insert(key, value);
            }
            Some(Value::Array(list)) => list.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
        }
    }

    result
}

/// Parse a query string into ordered `(key, value)` pairs, dropping pairs
/// with blank values. Used when an existing query string must be rebuilt.
pub fn parse_pairs(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key.is_empty() || value.is_empty() {
                None
            } else {
                Some((decode(key), decode(value)))
            }
        })
        .collect()
}

/// Encode `(key, value)` pairs into a query string, in order.
pub fn encode_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .into_iter()
        .map(|(key, value)| format!("{}={}", encode(key), encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Flatten a mapping into `(key, value)` pairs; array values repeat the key
/// once per element, in element order.
pub fn normalize(map: &Map<String, Value>) -> Vec<(String, String)> {
    let mut result = Vec::new();
    for (key, value) in map {
        match value {
            Value::Array(list) => {
                for item in list {
                    result.push((key.clone(), scalar_string(item)));
                }
            }
            other => result.push((key.clone(), scalar_string(other))),
        }
    }
    result
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

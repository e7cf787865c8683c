//! Handler parameter descriptors and the request binder.
//!
//! A handler registered with named parameters carries a list of
//! [`ParamDescriptor`]s, built once at registration. For each request the
//! binder folds the route's positional captures into the request content,
//! validates and converts every declared parameter, and produces the
//! argument vector the handler is invoked with. All binder failures map to
//! `400 Bad Request`.
//!
//! # Examples
//!
//! ```
//! use rivulet::{Endpoint, ParamDescriptor, ParamKind, Reply};
//! use serde_json::json;
//!
//! // add(a: int, b: int = 10)
//! let add = Endpoint::params_sync(
//!     vec![
//!         ParamDescriptor::required("a", ParamKind::Int),
//!         ParamDescriptor::optional("b", ParamKind::Int, json!(10)),
//!     ],
//!     |args| {
//!         let a = args.arg(0).and_then(|v| v.as_i64()).unwrap_or(0);
//!         let b = args
//!             .kwarg("b")
//!             .and_then(|v| v.as_value())
//!             .and_then(|v| v.as_i64())
//!             .unwrap_or(0);
//!         Ok(Reply::from(a + b))
//!     },
//! );
//! # let _ = add;
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::errors::BindError;
use crate::http::document::{Content, Document};

/// How a declared parameter is validated and converted.
#[derive(Clone)]
pub enum ParamKind {
    /// No conversion; the value passes through unchanged.
    Unannotated,
    /// Strict integer: digits only, as a number or a string of digits.
    Int,
    /// Accepts `1`, `"1"`, `true`, `0`, `"0"`, `false`, `"true"`, `"false"`
    /// case-insensitively.
    Bool,
    /// String with optional length bounds.
    Str {
        min_length: usize,
        max_length: Option<usize>,
    },
    /// Pseudo-parameter: receives the request [`Document`] itself.
    Request,
    /// Pseudo-parameter: receives the synthesized `"con=<cid> req=<rid>"`
    /// identifier.
    ConnectionId,
    /// Variadic keyword sink: collects content keys matching no declared
    /// parameter.
    Kwargs,
    /// User-supplied converter; an `Err` becomes a payload error naming the
    /// parameter.
    Custom(Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>),
}

impl fmt::Debug for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamKind::Unannotated => "Unannotated",
            ParamKind::Int => "Int",
            ParamKind::Bool => "Bool",
            ParamKind::Str { .. } => "Str",
            ParamKind::Request => "Request",
            ParamKind::ConnectionId => "ConnectionId",
            ParamKind::Kwargs => "Kwargs",
            ParamKind::Custom(_) => "Custom",
        };
        f.write_str(name)
    }
}

/// One declared handler parameter.
///
/// A parameter is either **required** (the request must supply it, and it
/// arrives positionally) or **optional** (a declared default fills in, and
/// it arrives as a keyword). The pseudo-kinds [`ParamKind::Request`] and
/// [`ParamKind::ConnectionId`] are injected by the binder and may never be
/// supplied by the client.
#[derive(Debug, Clone)]
pub struct ParamDescriptor {
    pub name: String,
    pub kind: ParamKind,
    /// A parameter without a default value must be supplied by the request.
    pub is_required: bool,
    pub default: Value,
}

impl ParamDescriptor {
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            is_required: true,
            default: Value::Null,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamKind, default: Value) -> Self {
        Self {
            name: name.into(),
            kind,
            is_required: false,
            default,
        }
    }

    pub fn request(name: impl Into<String>) -> Self {
        Self::required(name, ParamKind::Request)
    }

    pub fn connection_id(name: impl Into<String>) -> Self {
        Self::required(name, ParamKind::ConnectionId)
    }

    pub fn kwargs(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Kwargs,
            is_required: false,
            default: Value::Null,
        }
    }
}

/// One bound argument.
#[derive(Debug, Clone)]
pub enum BoundValue {
    Value(Value),
    Content(Content),
    Request(Arc<Document>),
}

impl BoundValue {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            BoundValue::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_request(&self) -> Option<&Arc<Document>> {
        match self {
            BoundValue::Request(document) => Some(document),
            _ => None,
        }
    }
}

/// The argument vector handed to a parameter-bound handler.
///
/// Required parameters arrive positionally in declaration order; defaulted
/// parameters arrive as keywords; the variadic sink, if declared, collects
/// the leftover content keys.
#[derive(Debug, Clone, Default)]
pub struct BoundArgs {
    pub args: Vec<BoundValue>,
    pub kwargs: Vec<(String, BoundValue)>,
    pub extra: Map<String, Value>,
}

impl BoundArgs {
    /// Positional argument as a JSON value.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index).and_then(BoundValue::as_value)
    }

    /// Keyword argument by name.
    pub fn kwarg(&self, name: &str) -> Option<&BoundValue> {
        self.kwargs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

#[derive(Debug)]
enum Slot {
    Value(Value),
    Content,
    Request,
    ConnectionId,
}

/// The outcome of binding, before the document is frozen for handlers.
///
/// Binding mutates the document (positional captures fold into content), so
/// it runs first; the plan then materializes against the frozen document.
#[derive(Debug, Default)]
pub(crate) struct BindPlan {
    positional: Vec<Slot>,
    keyword: Vec<(String, Slot)>,
    extra: Map<String, Value>,
}

impl BindPlan {
    pub(crate) fn materialize(self, document: &Arc<Document>) -> BoundArgs {
        let connection_id = format!("con={} req={}", document.connection_id, document.id);
        let fill = |slot: Slot| match slot {
            Slot::Value(value) => BoundValue::Value(value),
            Slot::Content => BoundValue::Content(document.content.clone()),
            Slot::Request => BoundValue::Request(document.clone()),
            Slot::ConnectionId => BoundValue::Value(Value::String(connection_id.clone())),
        };

        BoundArgs {
            args: self.positional.into_iter().map(&fill).collect(),
            kwargs: self
                .keyword
                .into_iter()
                .map(|(name, slot)| (name, fill(slot)))
                .collect(),
            extra: self.extra,
        }
    }
}

/// Assemble the argument plan for `params` from the request.
pub(crate) fn bind(
    params: &[ParamDescriptor],
    document: &mut Document,
) -> Result<BindPlan, BindError> {
    let mut plan = BindPlan::default();

    if params.is_empty() {
        return Ok(plan);
    }

    if params.len() == 1 {
        match params[0].kind {
            ParamKind::Unannotated => {
                plan.positional.push(Slot::Content);
                return Ok(plan);
            }
            ParamKind::Request => {
                plan.positional.push(Slot::Request);
                return Ok(plan);
            }
            _ => {}
        }
    }

    let content = document
        .content
        .as_object_mut()
        .ok_or_else(BindError::not_a_mapping)?;

    if document.args.len() > params.len() {
        return Err(BindError::Extra(document.args[params.len()..].join(", ")));
    }

    for (value, param) in document.args.iter().zip(params) {
        if content.contains_key(&param.name) {
            return Err(BindError::Duplicate(param.name.clone()));
        }
        content.insert(param.name.clone(), Value::String(value.clone()));
    }

    let declared: HashSet<&str> = params.iter().map(|p| p.name.as_str()).collect();
    let stray: Vec<String> = content
        .keys()
        .filter(|key| !declared.contains(key.as_str()))
        .cloned()
        .collect();

    if params.iter().any(|p| matches!(p.kind, ParamKind::Kwargs)) {
        for key in stray {
            let value = content.remove(&key).expect("stray key present");
            plan.extra.insert(key, value);
        }
    } else if !stray.is_empty() {
        return Err(BindError::Extra(stray.join(", ")));
    }

    for param in params {
        let slot = match &param.kind {
            ParamKind::Kwargs => continue,
            ParamKind::Request => {
                if content.contains_key(&param.name) {
                    return Err(BindError::Extra(param.name.clone()));
                }
                Slot::Request
            }
            ParamKind::ConnectionId => {
                if content.contains_key(&param.name) {
                    return Err(BindError::Extra(param.name.clone()));
                }
                Slot::ConnectionId
            }
            kind => match content.get(&param.name) {
                None if param.is_required => {
                    return Err(BindError::Required(param.name.clone()));
                }
                None => {
                    plan.keyword
                        .push((param.name.clone(), Slot::Value(param.default.clone())));
                    continue;
                }
                Some(value) => {
                    let converted = convert(kind, value)
                        .map_err(|err| BindError::invalid_value(&param.name, err))?;
                    Slot::Value(converted)
                }
            },
        };

        if param.is_required {
            plan.positional.push(slot);
        } else {
            plan.keyword.push((param.name.clone(), slot));
        }
    }

    Ok(plan)
}

fn convert(kind: &ParamKind, value: &Value) -> Result<Value, String> {
    match kind {
        ParamKind::Unannotated => Ok(value.clone()),
        ParamKind::Int => convert_int(value),
        ParamKind::Bool => convert_bool(value),
        ParamKind::Str {
            min_length,
            max_length,
        } => convert_str(*min_length, *max_length, value),
        ParamKind::Custom(converter) => converter(value),
        ParamKind::Request | ParamKind::ConnectionId | ParamKind::Kwargs => Ok(value.clone()),
    }
}

fn convert_int(value: &Value) -> Result<Value, String> {
    match value {
        Value::Number(number) if number.is_u64() => Ok(value.clone()),
        Value::String(text)
            if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) =>
        {
            text.parse::<u64>()
                .map(Value::from)
                .map_err(|_| "not an integer".to_string())
        }
        _ => Err("not an integer".into()),
    }
}

fn convert_bool(value: &Value) -> Result<Value, String> {
    match value {
        Value::Bool(_) => Ok(value.clone()),
        Value::Number(number) => match number.as_u64() {
            Some(1) => Ok(Value::Bool(true)),
            Some(0) => Ok(Value::Bool(false)),
            _ => Err("not a boolean".into()),
        },
        Value::String(text) => match text.to_ascii_lowercase().as_str() {
            "1" | "true" => Ok(Value::Bool(true)),
            "0" | "false" => Ok(Value::Bool(false)),
            _ => Err("not a boolean".into()),
        },
        _ => Err("not a boolean".into()),
    }
}

fn convert_str(min_length: usize, max_length: Option<usize>, value: &Value) -> Result<Value, String> {
    let text = match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    let length = text.chars().count();

    if length < min_length {
        return Err(format!("is shorter than the minimum length ({min_length})"));
    }
    if let Some(max_length) = max_length {
        if length > max_length {
            return Err(format!("is longer than the maximum length ({max_length})"));
        }
    }
    Ok(Value::String(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_with(content: Value, args: &[&str]) -> Document {
        let mut document = Document::new();
        document.content = Content::Value(content);
        document.args = args.iter().map(|s| s.to_string()).collect();
        document.connection_id = 7;
        document.id = 9;
        document
    }

    fn bound(
        params: &[ParamDescriptor],
        document: &mut Document,
    ) -> Result<BoundArgs, BindError> {
        let plan = bind(params, document)?;
        let frozen = Arc::new(document.clone());
        Ok(plan.materialize(&frozen))
    }

    #[test]
    fn zero_parameters_bind_empty() {
        let mut request = request_with(json!({"anything": "goes"}), &[]);
        let args = bound(&[], &mut request).unwrap();
        assert!(args.args.is_empty());
        assert!(args.kwargs.is_empty());
    }

    #[test]
    fn single_unannotated_receives_content() {
        let params = [ParamDescriptor::required("data", ParamKind::Unannotated)];
        let mut request = request_with(json!({"x": 1}), &[]);
        let args = bound(&params, &mut request).unwrap();

        match &args.args[0] {
            BoundValue::Content(Content::Value(value)) => assert_eq!(value["x"], 1),
            other => panic!("expected content, got {other:?}"),
        }
    }

    #[test]
    fn single_request_receives_document() {
        let params = [ParamDescriptor::request("request")];
        let mut request = request_with(json!({"x": 1}), &[]);
        let args = bound(&params, &mut request).unwrap();

        let document = args.args[0].as_request().unwrap();
        assert_eq!(document.connection_id, 7);
    }

    #[test]
    fn integer_conversion() {
        let params = [
            ParamDescriptor::required("a", ParamKind::Int),
            ParamDescriptor::required("b", ParamKind::Int),
        ];
        let mut request = request_with(json!({"a": "2", "b": 3}), &[]);
        let args = bound(&params, &mut request).unwrap();

        assert_eq!(args.arg(0), Some(&json!(2)));
        assert_eq!(args.arg(1), Some(&json!(3)));
    }

    #[test]
    fn conversion_failure_names_the_parameter() {
        let params = [
            ParamDescriptor::required("a", ParamKind::Int),
            ParamDescriptor::required("b", ParamKind::Int),
        ];
        let mut request = request_with(json!({"a": "foo", "b": "1"}), &[]);

        let err = bound(&params, &mut request).unwrap_err();
        assert_eq!(err.to_string(), "invalid a value: not an integer");
    }

    #[test]
    fn missing_required_parameter() {
        let params = [
            ParamDescriptor::required("a", ParamKind::Int),
            ParamDescriptor::required("b", ParamKind::Int),
        ];
        let mut request = request_with(json!({}), &[]);

        let err = bound(&params, &mut request).unwrap_err();
        assert_eq!(err.to_string(), "missing required attribute: a");
    }

    #[test]
    fn missing_optional_parameter_uses_default() {
        let params = [
            ParamDescriptor::required("a", ParamKind::Int),
            ParamDescriptor::optional("b", ParamKind::Int, json!(10)),
        ];
        let mut request = request_with(json!({"a": "1"}), &[]);
        let args = bound(&params, &mut request).unwrap();

        assert_eq!(args.args.len(), 1);
        assert_eq!(
            args.kwarg("b").and_then(BoundValue::as_value),
            Some(&json!(10))
        );
    }

    #[test]
    fn extra_content_key_without_sink() {
        let params = [
            ParamDescriptor::required("a", ParamKind::Int),
            ParamDescriptor::required("b", ParamKind::Int),
        ];
        let mut request = request_with(json!({"a": "1", "b": "2", "c": "3"}), &[]);

        let err = bound(&params, &mut request).unwrap_err();
        assert_eq!(err.to_string(), "extra attribute(s): c");
    }

    #[test]
    fn kwargs_sink_collects_extras() {
        let params = [
            ParamDescriptor::required("a", ParamKind::Int),
            ParamDescriptor::required("b", ParamKind::Int),
            ParamDescriptor::kwargs("rest"),
        ];
        let mut request = request_with(json!({"a": "1", "b": "2", "c": "3", "d": 4}), &[]);
        let args = bound(&params, &mut request).unwrap();

        assert_eq!(args.extra.len(), 2);
        assert_eq!(args.extra["c"], "3");
        assert_eq!(args.extra["d"], 4);
    }

    #[test]
    fn positional_args_fold_into_content() {
        let params = [
            ParamDescriptor::required("id", ParamKind::Int),
            ParamDescriptor::required("name", ParamKind::Unannotated),
        ];
        let mut request = request_with(json!({"name": "ada"}), &["42"]);
        let args = bound(&params, &mut request).unwrap();

        assert_eq!(args.arg(0), Some(&json!(42)));
        assert_eq!(args.arg(1), Some(&json!("ada")));
    }

    #[test]
    fn duplicate_positional_and_named_supply() {
        let params = [
            ParamDescriptor::required("id", ParamKind::Int),
            ParamDescriptor::required("name", ParamKind::Unannotated),
        ];
        let mut request = request_with(json!({"id": "1", "name": "ada"}), &["42"]);

        let err = bound(&params, &mut request).unwrap_err();
        assert_eq!(err.to_string(), "duplicate attribute: id");
    }

    #[test]
    fn more_captures_than_parameters() {
        let params = [ParamDescriptor::required("a", ParamKind::Int)];
        let mut request = request_with(json!({}), &["1", "2"]);
        // one declared parameter cannot absorb two captures, and the single
        // parameter shortcut does not apply to annotated kinds
        let err = bound(&params, &mut request).unwrap_err();
        assert_eq!(err.to_string(), "extra attribute(s): 2");
    }

    #[test]
    fn connection_id_is_synthesized() {
        let params = [
            ParamDescriptor::required("a", ParamKind::Int),
            ParamDescriptor::connection_id("cid"),
        ];
        let mut request = request_with(json!({"a": "1"}), &[]);
        let args = bound(&params, &mut request).unwrap();

        assert_eq!(args.arg(1), Some(&json!("con=7 req=9")));
    }

    #[test]
    fn pseudo_parameter_collision_is_extra() {
        let params = [
            ParamDescriptor::required("a", ParamKind::Int),
            ParamDescriptor::connection_id("cid"),
        ];
        let mut request = request_with(json!({"a": "1", "cid": "spoofed"}), &[]);

        let err = bound(&params, &mut request).unwrap_err();
        assert_eq!(err.to_string(), "extra attribute(s): cid");
    }

    #[test]
    fn non_mapping_content_is_rejected() {
        let params = [
            ParamDescriptor::required("a", ParamKind::Int),
            ParamDescriptor::required("b", ParamKind::Int),
        ];
        let mut request = Document::new();
        request.content = Content::Text("plain".into());

        let err = bound(&params, &mut request).unwrap_err();
        assert_eq!(err.to_string(), "expecting content to be a dictionary");
    }

    #[test]
    fn boolean_conversions() {
        for (raw, expected) in [
            (json!(true), true),
            (json!(1), true),
            (json!("1"), true),
            (json!("TRUE"), true),
            (json!(false), false),
            (json!(0), false),
            (json!("0"), false),
            (json!("False"), false),
        ] {
            assert_eq!(convert_bool(&raw).unwrap(), Value::Bool(expected), "{raw}");
        }
        assert!(convert_bool(&json!("yes")).is_err());
        assert!(convert_bool(&json!(2)).is_err());
    }

    #[test]
    fn integer_rejects_non_digits() {
        assert!(convert_int(&json!("12a")).is_err());
        assert!(convert_int(&json!("-3")).is_err());
        assert!(convert_int(&json!(1.5)).is_err());
        assert!(convert_int(&json!("")).is_err());
    }

    #[test]
    fn string_length_bounds() {
        let err = convert_str(3, None, &json!("ab")).unwrap_err();
        assert_eq!(err, "is shorter than the minimum length (3)");

        let err = convert_str(0, Some(2), &json!("abc")).unwrap_err();
        assert_eq!(err, "is longer than the maximum length (2)");

        assert_eq!(convert_str(1, Some(3), &json!("ab")).unwrap(), json!("ab"));
    }
}

//! Parameter type tags.
//!
//! Skill parameters are declared with loose textual annotations
//! (`"int"`, `"List[str]"`, `"tuple[float, float]"`). They are parsed once,
//! when the descriptor is built, into a closed [`ParamType`]. The same type
//! drives three things: the JSON schema sent to providers, the check on
//! default values, and best-effort coercion of provider-supplied arguments.

use std::fmt;

use serde_json::{json, Number, Value};

/// A scalar type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Int,
    Float,
    Str,
    Bool,
}

/// The closed set of supported parameter types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamType {
    Scalar(Primitive),
    /// Homogeneous sequence of one primitive.
    List(Primitive),
    /// Fixed-arity tuple of primitives.
    Tuple(Vec<Primitive>),
}

/// Why an annotation was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationError {
    /// A mapping type (`dict`, `Dict[str, int]`, `map`, ...), anywhere in the annotation.
    Mapping,
    Unsupported,
}

const MAPPING_NAMES: &[&str] = &[
    "dict", "map", "mapping", "object", "hashmap", "btreemap", "typeddict",
];

impl Primitive {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "int" | "integer" | "i32" | "i64" => Some(Self::Int),
            "float" | "number" | "f32" | "f64" => Some(Self::Float),
            "str" | "string" => Some(Self::Str),
            "bool" | "boolean" => Some(Self::Bool),
            _ => None,
        }
    }

    /// Short tag used in annotations and error messages.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::Bool => "bool",
        }
    }

    /// JSON schema `type` keyword.
    pub fn json_type(self) -> &'static str {
        match self {
            Self::Int => "integer",
            Self::Float => "number",
            Self::Str => "string",
            Self::Bool => "boolean",
        }
    }

    fn from_json_type(name: &str) -> Option<Self> {
        match name {
            "integer" => Some(Self::Int),
            "number" => Some(Self::Float),
            "string" => Some(Self::Str),
            "boolean" => Some(Self::Bool),
            _ => None,
        }
    }

    /// Strict check, used for declared defaults and enum values.
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Str => value.is_string(),
            Self::Bool => value.is_boolean(),
        }
    }

    /// Best-effort conversion of a provider-supplied value.
    fn coerce(self, value: &Value) -> Option<Value> {
        match (self, value) {
            (Self::Int, Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    Some(Value::from(i))
                } else {
                    n.as_f64().and_then(float_to_int).map(Value::from)
                }
            }
            (Self::Int, Value::String(s)) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(float_to_int))
                    .map(Value::from)
            }
            (Self::Float, Value::Number(n)) => n.as_f64().and_then(finite_number),
            (Self::Float, Value::String(s)) => s.trim().parse::<f64>().ok().and_then(finite_number),
            (Self::Str, Value::String(_)) => Some(value.clone()),
            (Self::Str, Value::Number(n)) => Some(Value::String(n.to_string())),
            (Self::Str, Value::Bool(b)) => Some(Value::String(b.to_string())),
            (Self::Bool, Value::Bool(_)) => Some(value.clone()),
            (Self::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            (Self::Bool, Value::Number(n)) => match n.as_i64() {
                Some(0) => Some(Value::Bool(false)),
                Some(1) => Some(Value::Bool(true)),
                _ => None,
            },
            _ => None,
        }
    }
}

fn float_to_int(f: f64) -> Option<i64> {
    (f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64).then_some(f as i64)
}

fn finite_number(f: f64) -> Option<Value> {
    Number::from_f64(f).map(Value::Number)
}

impl ParamType {
    /// Parses a loose annotation such as `"int"`, `"List[str]"` or
    /// `"tuple[float, float]"`. Matching is case-insensitive.
    pub fn parse(annotation: &str) -> Result<Self, AnnotationError> {
        let normalized = annotation.trim().to_ascii_lowercase();
        if mentions_mapping(&normalized) {
            return Err(AnnotationError::Mapping);
        }

        let (base, inner) = match normalized.split_once('[') {
            Some((base, rest)) => {
                let inner = rest.strip_suffix(']').ok_or(AnnotationError::Unsupported)?;
                (base.trim(), Some(inner))
            }
            None => (normalized.as_str(), None),
        };

        match (base, inner) {
            (name, None) => Primitive::parse(name)
                .map(Self::Scalar)
                .ok_or(AnnotationError::Unsupported),
            ("list" | "sequence" | "vec" | "array", Some(inner)) => Primitive::parse(inner.trim())
                .map(Self::List)
                .ok_or(AnnotationError::Unsupported),
            ("tuple", Some(inner)) => {
                let items = inner
                    .split(',')
                    .map(|item| Primitive::parse(item.trim()))
                    .collect::<Option<Vec<_>>>()
                    .ok_or(AnnotationError::Unsupported)?;
                if items.is_empty() {
                    return Err(AnnotationError::Unsupported);
                }
                Ok(Self::Tuple(items))
            }
            _ => Err(AnnotationError::Unsupported),
        }
    }

    /// JSON schema fragment for this type (without description).
    pub fn json_schema(&self) -> Value {
        match self {
            Self::Scalar(p) => json!({ "type": p.json_type() }),
            Self::List(p) => json!({
                "type": "array",
                "items": { "type": p.json_type() }
            }),
            Self::Tuple(items) => json!({
                "type": "array",
                "prefixItems": items
                    .iter()
                    .map(|p| json!({ "type": p.json_type() }))
                    .collect::<Vec<_>>(),
                "minItems": items.len(),
                "maxItems": items.len()
            }),
        }
    }

    /// Inverse of [`ParamType::json_schema`].
    pub fn from_json_schema(schema: &Value) -> Option<Self> {
        match schema.get("type")?.as_str()? {
            "array" => {
                if let Some(prefix) = schema.get("prefixItems").and_then(Value::as_array) {
                    let items = prefix
                        .iter()
                        .map(|item| item.get("type")?.as_str().and_then(Primitive::from_json_type))
                        .collect::<Option<Vec<_>>>()?;
                    (!items.is_empty()).then_some(Self::Tuple(items))
                } else {
                    let item = schema.get("items")?.get("type")?.as_str()?;
                    Primitive::from_json_type(item).map(Self::List)
                }
            }
            other => Primitive::from_json_type(other).map(Self::Scalar),
        }
    }

    /// Strict compatibility check for declared defaults and enum values.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Scalar(p), v) => p.accepts(v),
            (Self::List(p), Value::Array(items)) => items.iter().all(|v| p.accepts(v)),
            (Self::Tuple(types), Value::Array(items)) => {
                types.len() == items.len() && types.iter().zip(items).all(|(p, v)| p.accepts(v))
            }
            _ => false,
        }
    }

    /// Best-effort coercion: numeric strings to numbers, `"true"` to `true`,
    /// JSON-encoded arrays to arrays. Returns `None` when irreconcilable.
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        match (self, value) {
            (Self::Scalar(p), v) => p.coerce(v),
            (Self::List(_) | Self::Tuple(_), Value::String(s)) => {
                let parsed: Value = serde_json::from_str(s).ok()?;
                parsed.is_array().then(|| self.coerce(&parsed)).flatten()
            }
            (Self::List(p), Value::Array(items)) => items
                .iter()
                .map(|v| p.coerce(v))
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            (Self::Tuple(types), Value::Array(items)) if types.len() == items.len() => types
                .iter()
                .zip(items)
                .map(|(p, v)| p.coerce(v))
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            _ => None,
        }
    }
}

fn mentions_mapping(annotation: &str) -> bool {
    annotation
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .any(|word| MAPPING_NAMES.contains(&word))
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(p) => write!(f, "{}", p.tag()),
            Self::List(p) => write!(f, "list[{}]", p.tag()),
            Self::Tuple(items) => {
                let tags: Vec<&str> = items.iter().map(|p| p.tag()).collect();
                write!(f, "tuple[{}]", tags.join(", "))
            }
        }
    }
}

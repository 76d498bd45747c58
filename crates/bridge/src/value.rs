//! Marshaled JavaScript values.
//!
//! [`EngineValue`] is what crosses the bridge in both directions. It has two
//! representations: the binary form produced by [`crate::codec`] (lossless)
//! and the plain JSON view used by the method channel (see
//! [`EngineValue::to_json`]).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Largest integer a JS number represents exactly (2^53 - 1).
pub const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

const FUNCTION_KEY: &str = "$function";
const BIGINT_KEY: &str = "$bigint";

/// A JavaScript value copied out of (or into) an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineValue {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Decimal digits, optionally signed.
    BigInt(String),
    String(String),
    Array(Vec<EngineValue>),
    Object(BTreeMap<String, EngineValue>),
    Function(FunctionHandle),
}

/// A function kept alive inside one engine, addressable by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionHandle {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
}

/// The target of a `callFunction` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionRef {
    /// Dotted path from `globalThis`, e.g. `"Math.max"`.
    Global(String),
    /// A function previously returned as [`EngineValue::Function`].
    Retained(u64),
}

impl EngineValue {
    /// Build a number, normalizing integral floats to [`EngineValue::Int`].
    pub fn from_f64(f: f64) -> Self {
        let negative_zero = f == 0.0 && f.is_sign_negative();
        if f.is_finite() && f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER && !negative_zero {
            EngineValue::Int(f as i64)
        } else {
            EngineValue::Float(f)
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            EngineValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            EngineValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            EngineValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionHandle> {
        match self {
            EngineValue::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Plain JSON view for the method channel.
    ///
    /// Lossy by nature: `undefined` and non-finite floats become `null`.
    pub fn to_json(&self) -> Value {
        match self {
            EngineValue::Undefined | EngineValue::Null => Value::Null,
            EngineValue::Bool(b) => Value::Bool(*b),
            EngineValue::Int(i) => Value::Number((*i).into()),
            EngineValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            EngineValue::BigInt(digits) => {
                let mut m = Map::new();
                m.insert(BIGINT_KEY.into(), Value::String(digits.clone()));
                Value::Object(m)
            }
            EngineValue::String(s) => Value::String(s.clone()),
            EngineValue::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            EngineValue::Object(props) => Value::Object(
                props
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            EngineValue::Function(f) => {
                let mut m = Map::new();
                m.insert(FUNCTION_KEY.into(), Value::Number(f.id.into()));
                if let Some(name) = &f.name {
                    m.insert("name".into(), Value::String(name.clone()));
                }
                Value::Object(m)
            }
        }
    }

    /// Inverse of [`EngineValue::to_json`]. Objects carrying a `$function`
    /// or `$bigint` marker are read back as the tagged variants.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => EngineValue::Null,
            Value::Bool(b) => EngineValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => EngineValue::Int(i),
                None => EngineValue::from_f64(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => EngineValue::String(s.clone()),
            Value::Array(items) => EngineValue::Array(items.iter().map(Self::from_json).collect()),
            Value::Object(m) => {
                if let Some(id) = m.get(FUNCTION_KEY).and_then(Value::as_u64) {
                    return EngineValue::Function(FunctionHandle {
                        id,
                        name: m.get("name").and_then(Value::as_str).map(String::from),
                    });
                }
                if let (1, Some(digits)) = (m.len(), m.get(BIGINT_KEY).and_then(Value::as_str)) {
                    return EngineValue::BigInt(digits.to_string());
                }
                EngineValue::Object(
                    m.iter()
                        .map(|(k, v)| (k.clone(), Self::from_json(v)))
                        .collect(),
                )
            }
        }
    }
}

impl fmt::Display for EngineValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineValue::Undefined => f.write_str("undefined"),
            EngineValue::Null => f.write_str("null"),
            EngineValue::Bool(b) => write!(f, "{}", b),
            EngineValue::Int(i) => write!(f, "{}", i),
            EngineValue::Float(x) if x.is_nan() => f.write_str("NaN"),
            EngineValue::Float(x) if x.is_infinite() => {
                f.write_str(if *x > 0.0 { "Infinity" } else { "-Infinity" })
            }
            EngineValue::Float(x) => write!(f, "{}", x),
            EngineValue::BigInt(digits) => write!(f, "{}n", digits),
            EngineValue::String(s) => f.write_str(s),
            EngineValue::Function(func) => match &func.name {
                Some(name) if !name.is_empty() => write!(f, "[Function: {}]", name),
                _ => f.write_str("[Function (anonymous)]"),
            },
            EngineValue::Array(_) | EngineValue::Object(_) => {
                write!(f, "{}", self.to_json())
            }
        }
    }
}

impl FunctionRef {
    /// Read a function reference from the channel's JSON form: either a
    /// dotted global path or a `{"$function": id}` marker (a bare id works too).
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(path) if !path.is_empty() => Some(FunctionRef::Global(path.clone())),
            Value::Number(n) => n.as_u64().map(FunctionRef::Retained),
            Value::Object(m) => m
                .get(FUNCTION_KEY)
                .and_then(Value::as_u64)
                .map(FunctionRef::Retained),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integral_floats_normalize_to_int() {
        assert_eq!(EngineValue::from_f64(10.0), EngineValue::Int(10));
        assert_eq!(EngineValue::from_f64(-3.0), EngineValue::Int(-3));
        assert_eq!(EngineValue::from_f64(1.5), EngineValue::Float(1.5));
        assert!(matches!(EngineValue::from_f64(-0.0), EngineValue::Float(_)));
        assert!(matches!(EngineValue::from_f64(1e300), EngineValue::Float(_)));
    }

    #[test]
    fn test_json_view_is_plain() {
        let mut props = BTreeMap::new();
        props.insert("a".to_string(), EngineValue::Int(1));
        props.insert("b".to_string(), EngineValue::Undefined);
        let v = EngineValue::Array(vec![
            EngineValue::Object(props),
            EngineValue::Float(f64::NAN),
            EngineValue::String("x".into()),
        ]);
        assert_eq!(v.to_json(), json!([{ "a": 1, "b": null }, null, "x"]));
    }

    #[test]
    fn test_function_marker_survives_json() {
        let f = EngineValue::Function(FunctionHandle {
            id: 7,
            name: Some("add".into()),
        });
        let j = f.to_json();
        assert_eq!(j, json!({ "$function": 7, "name": "add" }));
        assert_eq!(EngineValue::from_json(&j), f);
        assert_eq!(FunctionRef::from_json(&j), Some(FunctionRef::Retained(7)));
    }

    #[test]
    fn test_from_json_numbers() {
        assert_eq!(EngineValue::from_json(&json!(2)), EngineValue::Int(2));
        assert_eq!(EngineValue::from_json(&json!(2.5)), EngineValue::Float(2.5));
        assert_eq!(
            EngineValue::from_json(&json!({ "$bigint": "12345678901234567890" })),
            EngineValue::BigInt("12345678901234567890".into())
        );
    }

    #[test]
    fn test_function_ref_from_json() {
        assert_eq!(
            FunctionRef::from_json(&json!("Math.max")),
            Some(FunctionRef::Global("Math.max".into()))
        );
        assert_eq!(FunctionRef::from_json(&json!(3)), Some(FunctionRef::Retained(3)));
        assert_eq!(FunctionRef::from_json(&json!("")), None);
        assert_eq!(FunctionRef::from_json(&json!(true)), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(EngineValue::Int(10).to_string(), "10");
        assert_eq!(EngineValue::Undefined.to_string(), "undefined");
        assert_eq!(EngineValue::Float(f64::INFINITY).to_string(), "Infinity");
        assert_eq!(EngineValue::BigInt("9".into()).to_string(), "9n");
    }
}

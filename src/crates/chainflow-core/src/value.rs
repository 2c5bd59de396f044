//! The runtime value model
//!
//! Everything flowing through the engine - runtime tree leaves, resolved
//! parameters, CEL results, executor outputs - is a [`Value`]: a closed
//! recursive sum over null, booleans, unbounded integers, terminating
//! decimals, strings, byte sequences, lists, and string-keyed maps. There is
//! deliberately no float arm; decimal arithmetic is exact by construction.
//!
//! Conversion to and from JSON goes through the tagged codec: integers
//! outside the `i64` range, all byte sequences, and all decimals round-trip
//! as `__ais_json_type`-tagged objects so checkpoint snapshots stay
//! type-faithful.

use chainflow_checkpoint::codec::{self, TaggedValue};
use chainflow_decimal::BigDecimal;
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{EvalError, EvalErrorKind};

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent / null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Unbounded integer.
    Int(BigInt),
    /// Terminating decimal.
    Decimal(BigDecimal),
    /// UTF-8 string.
    String(String),
    /// Raw byte sequence.
    Bytes(Vec<u8>),
    /// Ordered list.
    List(Vec<Value>),
    /// String-keyed mapping.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Short type name for diagnostics and the CEL `type()` builtin.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Decimal(_) => "decimal",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// An empty map.
    pub fn empty_map() -> Self {
        Value::Map(BTreeMap::new())
    }

    /// Build a byte-sequence value.
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(bytes.into())
    }

    /// Build an integer value.
    pub fn int(v: impl Into<BigInt>) -> Self {
        Value::Int(v.into())
    }

    /// Borrow as a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrow as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow as an integer.
    pub fn as_int(&self) -> Option<&BigInt> {
        match self {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    /// Borrow as a list.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow as a map.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// True when the value is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Walk a dotted path. Maps descend by key; lists descend by numeric
    /// segment. Returns `None` on the first missing segment.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for segment in path.split('.') {
            current = match current {
                Value::Map(map) => map.get(segment)?,
                Value::List(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Convert into tagged JSON. Integers that fit `i64` stay plain numbers;
    /// larger integers, byte sequences, and decimals become tagged objects.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => match i.to_i64() {
                Some(v) => Json::Number(v.into()),
                None => codec::encode_bigint(&i.to_string()),
            },
            Value::Decimal(d) => codec::encode_decimal(&d.to_string()),
            Value::String(s) => Json::String(s.clone()),
            Value::Bytes(b) => codec::encode_bytes(b),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Convert from tagged JSON. Numbers with a fractional part become
    /// decimals; tagged objects decode per their kind; `error` tags become
    /// maps carrying their fields.
    pub fn from_json(json: &Json) -> Result<Self, EvalError> {
        if let Some(tagged) = codec::decode_tagged(json)
            .map_err(|e| EvalError::new(EvalErrorKind::TypeMismatch, e.to_string()))?
        {
            return Ok(match tagged {
                TaggedValue::BigInt(s) => Value::Int(
                    BigInt::from_str(&s)
                        .map_err(|_| EvalError::new(EvalErrorKind::InvalidDecimal, "bad bigint"))?,
                ),
                TaggedValue::Decimal(s) => Value::Decimal(BigDecimal::parse(&s)?),
                TaggedValue::Bytes(b) => Value::Bytes(b),
                TaggedValue::Error {
                    name,
                    message,
                    stack,
                } => {
                    let mut map = BTreeMap::new();
                    map.insert("name".to_string(), Value::String(name));
                    map.insert("message".to_string(), Value::String(message));
                    if let Some(stack) = stack {
                        map.insert("stack".to_string(), Value::String(stack));
                    }
                    Value::Map(map)
                }
            });
        }
        Ok(match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(BigInt::from(i))
                } else if let Some(u) = n.as_u64() {
                    Value::Int(BigInt::from(u))
                } else {
                    Value::Decimal(BigDecimal::parse(&n.to_string()).map_err(|_| {
                        EvalError::new(
                            EvalErrorKind::InvalidDecimal,
                            format!("number {n} has no terminating decimal form"),
                        )
                    })?)
                }
            }
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::List(
                items
                    .iter()
                    .map(Value::from_json)
                    .collect::<Result<_, _>>()?,
            ),
            Json::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), Value::from_json(v)?)))
                    .collect::<Result<_, EvalError>>()?,
            ),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = Json::deserialize(deserializer)?;
        Value::from_json(&json).map_err(D::Error::custom)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(BigInt::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(BigInt::from(v))
    }
}

impl From<BigInt> for Value {
    fn from(v: BigInt) -> Self {
        Value::Int(v)
    }
}

impl From<BigDecimal> for Value {
    fn from(v: BigDecimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

/// Build a `Value::Map` from key/value pairs.
#[macro_export]
macro_rules! value_map {
    ($($key:expr => $value:expr),* $(,)?) => {{
        let mut map = std::collections::BTreeMap::new();
        $(map.insert($key.to_string(), $crate::value::Value::from($value));)*
        $crate::value::Value::Map(map)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn path_walks_maps_and_lists() {
        let v = value_map! {
            "a" => value_map! { "b" => Value::List(vec![Value::from(10i64), Value::from(20i64)]) }
        };
        assert_eq!(v.get_path("a.b.1"), Some(&Value::from(20i64)));
        assert_eq!(v.get_path("a.b.2"), None);
        assert_eq!(v.get_path("a.missing"), None);
    }

    #[test]
    fn small_ints_stay_plain_json_numbers() {
        assert_eq!(Value::from(42i64).to_json(), json!(42));
        assert_eq!(Value::from_json(&json!(42)).unwrap(), Value::from(42i64));
    }

    #[test]
    fn large_ints_round_trip_through_bigint_tag() {
        let big = BigInt::parse_bytes(b"340282366920938463463374607431768211455", 10).unwrap();
        let v = Value::Int(big.clone());
        let json = v.to_json();
        assert_eq!(json[codec::TAG_KEY], json!("bigint"));
        assert_eq!(Value::from_json(&json).unwrap(), Value::Int(big));
    }

    #[test]
    fn decimals_round_trip_through_decimal_tag() {
        let v = Value::Decimal(BigDecimal::parse("1.5").unwrap());
        let json = v.to_json();
        assert_eq!(json[codec::TAG_KEY], json!("decimal"));
        assert_eq!(Value::from_json(&json).unwrap(), v);
    }

    #[test]
    fn bytes_round_trip_through_uint8array_tag() {
        let v = Value::bytes(vec![1u8, 2, 3]);
        let json = v.to_json();
        assert_eq!(json[codec::TAG_KEY], json!("uint8array"));
        assert_eq!(Value::from_json(&json).unwrap(), v);
    }

    #[test]
    fn fractional_json_numbers_become_decimals() {
        let v = Value::from_json(&json!(1.5)).unwrap();
        assert_eq!(v, Value::Decimal(BigDecimal::parse("1.5").unwrap()));
    }

    #[test]
    fn nested_structures_round_trip() {
        let v = value_map! {
            "list" => Value::List(vec![Value::Null, Value::from(true), Value::from("x")]),
            "bytes" => Value::bytes(vec![0u8, 255]),
        };
        assert_eq!(Value::from_json(&v.to_json()).unwrap(), v);
    }
}

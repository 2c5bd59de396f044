//! Tagged JSON codec for values plain JSON cannot carry
//!
//! Checkpoint payloads and event details travel as JSON, but the runtime tree
//! holds big integers, byte sequences, decimals, and error objects. Each of
//! those is encoded as a JSON object carrying the reserved discriminator key
//! [`TAG_KEY`]:
//!
//! | kind | required fields |
//! |------|-----------------|
//! | `bigint` | `value` (decimal string) |
//! | `uint8array` | `encoding` (`"base64"`), `value` |
//! | `error` | `name`, `message`; optional `stack` |
//! | `decimal` | `value` (canonical decimal string) |
//!
//! [`decode_tagged`] rejects any object that carries the discriminator with a
//! field set that does not match its kind. [`stringify`] and [`parse`] apply
//! the codec profile from [`StringifyOptions`] over a whole document.

use serde_json::{Map, Value as Json};
use thiserror::Error;

/// Reserved discriminator key for codec-tagged objects.
pub const TAG_KEY: &str = "__ais_json_type";

/// Errors raised by the tagged codec.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// An object carried the discriminator key with an unknown kind.
    #[error("unknown codec tag kind {kind:?}")]
    UnknownKind {
        /// The offending kind string.
        kind: String,
    },

    /// A tagged object is missing required fields or carries extras.
    #[error("malformed {kind} tag: {reason}")]
    MalformedTag {
        /// The declared kind.
        kind: String,
        /// What is wrong with the field set.
        reason: String,
    },

    /// A number is NaN or infinite and the profile rejects those.
    #[error("non-finite number at {path}")]
    NonFiniteNumber {
        /// Dotted path to the offending value.
        path: String,
    },

    /// Base64 payload of a `uint8array` tag failed to decode.
    #[error("invalid base64 in uint8array tag: {0}")]
    InvalidBase64(String),

    /// A `bigint`/`decimal` tag value failed to parse.
    #[error("invalid {kind} literal {value:?}")]
    InvalidLiteral {
        /// The declared kind.
        kind: String,
        /// The unparseable literal.
        value: String,
    },
}

/// A value recovered from (or destined for) a tagged JSON object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaggedValue {
    /// Arbitrary-precision integer, as its decimal string.
    BigInt(String),
    /// Raw byte sequence.
    Bytes(Vec<u8>),
    /// Terminating decimal, as its canonical string.
    Decimal(String),
    /// An error object.
    Error {
        /// Error class name.
        name: String,
        /// Human-readable message.
        message: String,
        /// Optional stack trace.
        stack: Option<String>,
    },
}

/// Codec profile applied by [`stringify`] and [`parse`].
///
/// `reject_undefined` exists for parity with host profiles that distinguish
/// an absent value from `null`; JSON documents built through `serde_json`
/// cannot contain such a value, so the flag never triggers here but is kept
/// so profiles round-trip unchanged.
#[derive(Debug, Clone, Copy)]
pub struct StringifyOptions {
    /// Fail instead of silently dropping absent values.
    pub reject_undefined: bool,
    /// Fail on NaN or infinite numbers.
    pub reject_non_finite_number: bool,
    /// Keep the `stack` field when encoding `error` tags.
    pub include_error_stack: bool,
}

impl Default for StringifyOptions {
    fn default() -> Self {
        Self {
            reject_undefined: true,
            reject_non_finite_number: true,
            include_error_stack: false,
        }
    }
}

impl StringifyOptions {
    /// Keep or strip error stacks.
    pub fn with_error_stack(mut self, include: bool) -> Self {
        self.include_error_stack = include;
        self
    }

    /// Allow non-finite numbers through.
    pub fn with_non_finite_allowed(mut self) -> Self {
        self.reject_non_finite_number = false;
        self
    }
}

/// Encode a big integer as a tagged object.
pub fn encode_bigint(value: &str) -> Json {
    let mut map = Map::new();
    map.insert(TAG_KEY.into(), Json::String("bigint".into()));
    map.insert("value".into(), Json::String(value.into()));
    Json::Object(map)
}

/// Encode a byte sequence as a tagged object (base64 payload).
pub fn encode_bytes(bytes: &[u8]) -> Json {
    use base64::Engine as _;
    let mut map = Map::new();
    map.insert(TAG_KEY.into(), Json::String("uint8array".into()));
    map.insert("encoding".into(), Json::String("base64".into()));
    map.insert(
        "value".into(),
        Json::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
    );
    Json::Object(map)
}

/// Encode a decimal as a tagged object.
pub fn encode_decimal(value: &str) -> Json {
    let mut map = Map::new();
    map.insert(TAG_KEY.into(), Json::String("decimal".into()));
    map.insert("value".into(), Json::String(value.into()));
    Json::Object(map)
}

/// Encode an error as a tagged object, honoring the stack policy.
pub fn encode_error(name: &str, message: &str, stack: Option<&str>, include_stack: bool) -> Json {
    let mut map = Map::new();
    map.insert(TAG_KEY.into(), Json::String("error".into()));
    map.insert("name".into(), Json::String(name.into()));
    map.insert("message".into(), Json::String(message.into()));
    if include_stack {
        if let Some(stack) = stack {
            map.insert("stack".into(), Json::String(stack.into()));
        }
    }
    Json::Object(map)
}

/// Encode a [`TaggedValue`] into its JSON form.
pub fn encode_tagged(value: &TaggedValue, opts: &StringifyOptions) -> Json {
    match value {
        TaggedValue::BigInt(s) => encode_bigint(s),
        TaggedValue::Bytes(b) => encode_bytes(b),
        TaggedValue::Decimal(s) => encode_decimal(s),
        TaggedValue::Error {
            name,
            message,
            stack,
        } => encode_error(name, message, stack.as_deref(), opts.include_error_stack),
    }
}

fn field_str<'a>(map: &'a Map<String, Json>, key: &str, kind: &str) -> Result<&'a str, CodecError> {
    map.get(key)
        .and_then(Json::as_str)
        .ok_or_else(|| CodecError::MalformedTag {
            kind: kind.to_string(),
            reason: format!("missing or non-string field {key:?}"),
        })
}

fn expect_fields(
    map: &Map<String, Json>,
    kind: &str,
    required: &[&str],
    optional: &[&str],
) -> Result<(), CodecError> {
    for key in required {
        if !map.contains_key(*key) {
            return Err(CodecError::MalformedTag {
                kind: kind.to_string(),
                reason: format!("missing field {key:?}"),
            });
        }
    }
    for key in map.keys() {
        if key == TAG_KEY {
            continue;
        }
        if !required.contains(&key.as_str()) && !optional.contains(&key.as_str()) {
            return Err(CodecError::MalformedTag {
                kind: kind.to_string(),
                reason: format!("unexpected field {key:?}"),
            });
        }
    }
    Ok(())
}

/// Decode a JSON value into a [`TaggedValue`] when it carries the
/// discriminator key. Returns `Ok(None)` for anything untagged; returns an
/// error for a tagged object whose field set does not match its kind.
pub fn decode_tagged(value: &Json) -> Result<Option<TaggedValue>, CodecError> {
    let map = match value.as_object() {
        Some(map) if map.contains_key(TAG_KEY) => map,
        _ => return Ok(None),
    };
    let kind = map
        .get(TAG_KEY)
        .and_then(Json::as_str)
        .ok_or_else(|| CodecError::MalformedTag {
            kind: "<non-string>".to_string(),
            reason: "discriminator is not a string".to_string(),
        })?;
    match kind {
        "bigint" => {
            expect_fields(map, kind, &["value"], &[])?;
            let value = field_str(map, "value", kind)?;
            if !is_integer_literal(value) {
                return Err(CodecError::InvalidLiteral {
                    kind: kind.to_string(),
                    value: value.to_string(),
                });
            }
            Ok(Some(TaggedValue::BigInt(value.to_string())))
        }
        "decimal" => {
            expect_fields(map, kind, &["value"], &[])?;
            Ok(Some(TaggedValue::Decimal(
                field_str(map, "value", kind)?.to_string(),
            )))
        }
        "uint8array" => {
            use base64::Engine as _;
            expect_fields(map, kind, &["encoding", "value"], &[])?;
            let encoding = field_str(map, "encoding", kind)?;
            if encoding != "base64" {
                return Err(CodecError::MalformedTag {
                    kind: kind.to_string(),
                    reason: format!("unsupported encoding {encoding:?}"),
                });
            }
            let payload = field_str(map, "value", kind)?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(payload)
                .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;
            Ok(Some(TaggedValue::Bytes(bytes)))
        }
        "error" => {
            expect_fields(map, kind, &["name", "message"], &["stack"])?;
            Ok(Some(TaggedValue::Error {
                name: field_str(map, "name", kind)?.to_string(),
                message: field_str(map, "message", kind)?.to_string(),
                stack: map.get("stack").and_then(Json::as_str).map(str::to_string),
            }))
        }
        other => Err(CodecError::UnknownKind {
            kind: other.to_string(),
        }),
    }
}

fn is_integer_literal(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn check_document(value: &Json, path: &mut String, opts: &StringifyOptions) -> Result<(), CodecError> {
    match value {
        Json::Number(n) => {
            if opts.reject_non_finite_number {
                if let Some(f) = n.as_f64() {
                    if !f.is_finite() {
                        return Err(CodecError::NonFiniteNumber { path: path.clone() });
                    }
                }
            }
            Ok(())
        }
        Json::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                let len = path.len();
                if !path.is_empty() {
                    path.push('.');
                }
                path.push_str(&i.to_string());
                check_document(item, path, opts)?;
                path.truncate(len);
            }
            Ok(())
        }
        Json::Object(map) => {
            if map.contains_key(TAG_KEY) {
                decode_tagged(value)?;
            }
            for (key, item) in map {
                let len = path.len();
                if !path.is_empty() {
                    path.push('.');
                }
                path.push_str(key);
                check_document(item, path, opts)?;
                path.truncate(len);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Serialize a document, validating every tagged object it contains against
/// the codec profile.
pub fn stringify(value: &Json, opts: &StringifyOptions) -> Result<String, CodecError> {
    let mut path = String::new();
    check_document(value, &mut path, opts)?;
    Ok(value.to_string())
}

/// Parse a document and validate every tagged object it contains.
pub fn parse(input: &str, opts: &StringifyOptions) -> Result<Json, CodecError> {
    let value: Json = serde_json::from_str(input).map_err(|e| CodecError::MalformedTag {
        kind: "<document>".to_string(),
        reason: e.to_string(),
    })?;
    let mut path = String::new();
    check_document(&value, &mut path, opts)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bigint_round_trip() {
        let encoded = encode_bigint("-123456789012345678901234567890");
        let decoded = decode_tagged(&encoded).unwrap().unwrap();
        assert_eq!(
            decoded,
            TaggedValue::BigInt("-123456789012345678901234567890".to_string())
        );
    }

    #[test]
    fn bytes_round_trip() {
        let encoded = encode_bytes(&[0, 1, 2, 254, 255]);
        let decoded = decode_tagged(&encoded).unwrap().unwrap();
        assert_eq!(decoded, TaggedValue::Bytes(vec![0, 1, 2, 254, 255]));
    }

    #[test]
    fn error_round_trip_honors_stack_policy() {
        let with_stack = encode_error("EvalError", "boom", Some("at foo"), true);
        assert_eq!(with_stack["stack"], json!("at foo"));
        let without = encode_error("EvalError", "boom", Some("at foo"), false);
        assert!(without.get("stack").is_none());
        let decoded = decode_tagged(&with_stack).unwrap().unwrap();
        assert_eq!(
            decoded,
            TaggedValue::Error {
                name: "EvalError".to_string(),
                message: "boom".to_string(),
                stack: Some("at foo".to_string()),
            }
        );
    }

    #[test]
    fn untagged_objects_pass_through() {
        assert_eq!(decode_tagged(&json!({"a": 1})).unwrap(), None);
        assert_eq!(decode_tagged(&json!(42)).unwrap(), None);
    }

    #[test]
    fn mismatched_field_sets_are_rejected() {
        let missing = json!({ TAG_KEY: "bigint" });
        assert!(decode_tagged(&missing).is_err());

        let extra = json!({ TAG_KEY: "bigint", "value": "1", "padding": true });
        assert!(decode_tagged(&extra).is_err());

        let bad_encoding = json!({ TAG_KEY: "uint8array", "encoding": "hex", "value": "00" });
        assert!(decode_tagged(&bad_encoding).is_err());

        let unknown = json!({ TAG_KEY: "symbol", "value": "x" });
        assert!(matches!(
            decode_tagged(&unknown),
            Err(CodecError::UnknownKind { .. })
        ));
    }

    #[test]
    fn bigint_literal_is_validated() {
        let bad = json!({ TAG_KEY: "bigint", "value": "1e5" });
        assert!(matches!(
            decode_tagged(&bad),
            Err(CodecError::InvalidLiteral { .. })
        ));
    }

    #[test]
    fn stringify_validates_nested_tags() {
        let doc = json!({
            "ok": { TAG_KEY: "bigint", "value": "7" },
            "list": [{ TAG_KEY: "decimal", "value": "1.5" }],
        });
        assert!(stringify(&doc, &StringifyOptions::default()).is_ok());

        let bad = json!({ "inner": { TAG_KEY: "bigint" } });
        assert!(stringify(&bad, &StringifyOptions::default()).is_err());
    }

    #[test]
    fn parse_round_trips_stringify() {
        let doc = json!({
            "n": { TAG_KEY: "bigint", "value": "340282366920938463463374607431768211455" },
            "b": { TAG_KEY: "uint8array", "encoding": "base64", "value": "AAEC" },
        });
        let opts = StringifyOptions::default();
        let text = stringify(&doc, &opts).unwrap();
        let back = parse(&text, &opts).unwrap();
        assert_eq!(back, doc);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn bytes_always_round_trip(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
                let encoded = encode_bytes(&bytes);
                let decoded = decode_tagged(&encoded).unwrap().unwrap();
                prop_assert_eq!(decoded, TaggedValue::Bytes(bytes));
            }

            #[test]
            fn bigints_always_round_trip(v in any::<i128>()) {
                let text = v.to_string();
                let encoded = encode_bigint(&text);
                let decoded = decode_tagged(&encoded).unwrap().unwrap();
                prop_assert_eq!(decoded, TaggedValue::BigInt(text));
            }

            #[test]
            fn tagged_documents_survive_stringify_parse(
                key in "[a-z]{1,8}",
                v in any::<i64>(),
                bytes in proptest::collection::vec(any::<u8>(), 0..32),
            ) {
                let doc = json!({
                    key.clone(): encode_bigint(&v.to_string()),
                    "bytes": encode_bytes(&bytes),
                });
                let opts = StringifyOptions::default();
                let text = stringify(&doc, &opts).unwrap();
                prop_assert_eq!(parse(&text, &opts).unwrap(), doc);
            }
        }
    }
}

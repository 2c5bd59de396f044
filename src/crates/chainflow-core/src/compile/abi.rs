//! EVM ABI encoding and decoding
//!
//! Implements the contract ABI head/tail encoding for the type surface the
//! engine compiles: unsigned and signed integers, addresses, booleans,
//! fixed and dynamic bytes, strings, arrays, and tuples. Function selectors
//! are the first four bytes of `keccak256(name(type1,type2,...))` over
//! canonical types - aliases normalize (`uint` to `uint256`), tuples flatten
//! to `(t1,t2,...)`, and array suffixes are preserved.

use crate::error::CompileError;
use crate::value::Value;
use chainflow_checkpoint::canonical::keccak256_hex;
use num_bigint::{BigInt, Sign};
use num_traits::{Signed, Zero};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

const WORD: usize = 32;

/// One ABI parameter, as it appears in contract ABI JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiParam {
    /// Parameter name; may be empty in ABI JSON.
    #[serde(default)]
    pub name: String,
    /// Solidity type string (`uint256`, `address`, `tuple[]`, ...).
    #[serde(rename = "type")]
    pub ty: String,
    /// Tuple components, when the base type is `tuple`.
    #[serde(default)]
    pub components: Vec<AbiParam>,
}

/// A function item from contract ABI JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiFunction {
    /// Function name.
    pub name: String,
    /// Input parameters.
    #[serde(default)]
    pub inputs: Vec<AbiParam>,
    /// Output parameters.
    #[serde(default)]
    pub outputs: Vec<AbiParam>,
}

impl AbiFunction {
    /// Find a function in ABI JSON: either a single function object or an
    /// array to search by name.
    pub fn from_abi_json(abi: &Json, name: &str) -> Result<Self, CompileError> {
        let parse_item = |item: &Json| -> Option<AbiFunction> {
            serde_json::from_value::<AbiFunction>(item.clone()).ok()
        };
        match abi {
            Json::Array(items) => items
                .iter()
                .filter(|item| {
                    item.get("type").and_then(Json::as_str).unwrap_or("function") == "function"
                })
                .filter_map(parse_item)
                .find(|f| f.name == name)
                .ok_or_else(|| {
                    CompileError::field("abi", format!("function {name:?} not found in ABI"))
                }),
            Json::Object(_) => {
                let f = parse_item(abi).ok_or_else(|| {
                    CompileError::field("abi", "ABI object is not a function item")
                })?;
                if f.name == name {
                    Ok(f)
                } else {
                    Err(CompileError::field(
                        "abi",
                        format!("ABI function is {:?}, expected {name:?}", f.name),
                    ))
                }
            }
            _ => Err(CompileError::field("abi", "ABI must be an object or array")),
        }
    }

    /// Canonical signature `name(type1,type2,...)`.
    pub fn signature(&self) -> Result<String, CompileError> {
        let types: Vec<String> = self
            .inputs
            .iter()
            .map(canonical_type)
            .collect::<Result<_, _>>()?;
        Ok(format!("{}({})", self.name, types.join(",")))
    }

    /// First four bytes of `keccak256(signature)`.
    pub fn selector(&self) -> Result<[u8; 4], CompileError> {
        let signature = self.signature()?;
        let digest = keccak256_hex(signature.as_bytes());
        let bytes = hex::decode(&digest[..8])
            .map_err(|e| CompileError::new(format!("selector hex: {e}")))?;
        let mut selector = [0u8; 4];
        selector.copy_from_slice(&bytes);
        Ok(selector)
    }
}

/// Resolved ABI type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiType {
    Uint(u16),
    Int(u16),
    Address,
    Bool,
    FixedBytes(usize),
    Bytes,
    Str,
    Array(Box<AbiType>),
    FixedArray(Box<AbiType>, usize),
    Tuple(Vec<(String, AbiType)>),
}

/// Resolve a parameter's type string (with components) into an [`AbiType`].
pub fn resolve_type(param: &AbiParam) -> Result<AbiType, CompileError> {
    parse_type(&param.ty, &param.components)
        .ok_or_else(|| CompileError::field("abi", format!("unsupported ABI type {:?}", param.ty)))
}

fn parse_type(ty: &str, components: &[AbiParam]) -> Option<AbiType> {
    // Peel one array suffix from the right, recursing on the base.
    if let Some(open) = ty.rfind('[') {
        if !ty.ends_with(']') {
            return None;
        }
        let base = parse_type(&ty[..open], components)?;
        let len = &ty[open + 1..ty.len() - 1];
        return if len.is_empty() {
            Some(AbiType::Array(Box::new(base)))
        } else {
            Some(AbiType::FixedArray(Box::new(base), len.parse().ok()?))
        };
    }
    match ty {
        "address" => Some(AbiType::Address),
        "bool" => Some(AbiType::Bool),
        "bytes" => Some(AbiType::Bytes),
        "string" => Some(AbiType::Str),
        "uint" => Some(AbiType::Uint(256)),
        "int" => Some(AbiType::Int(256)),
        "tuple" => {
            let inner: Option<Vec<(String, AbiType)>> = components
                .iter()
                .map(|c| {
                    parse_type(&c.ty, &c.components).map(|t| (c.name.clone(), t))
                })
                .collect();
            Some(AbiType::Tuple(inner?))
        }
        _ => {
            if let Some(bits) = ty.strip_prefix("uint") {
                let bits: u16 = bits.parse().ok()?;
                (bits > 0 && bits <= 256 && bits % 8 == 0).then_some(AbiType::Uint(bits))
            } else if let Some(bits) = ty.strip_prefix("int") {
                let bits: u16 = bits.parse().ok()?;
                (bits > 0 && bits <= 256 && bits % 8 == 0).then_some(AbiType::Int(bits))
            } else if let Some(len) = ty.strip_prefix("bytes") {
                let len: usize = len.parse().ok()?;
                (len >= 1 && len <= 32).then_some(AbiType::FixedBytes(len))
            } else {
                None
            }
        }
    }
}

/// Canonical type string for signatures: aliases normalized, tuples
/// flattened, array suffixes preserved.
pub fn canonical_type(param: &AbiParam) -> Result<String, CompileError> {
    fn render(ty: &AbiType) -> String {
        match ty {
            AbiType::Uint(bits) => format!("uint{bits}"),
            AbiType::Int(bits) => format!("int{bits}"),
            AbiType::Address => "address".to_string(),
            AbiType::Bool => "bool".to_string(),
            AbiType::FixedBytes(len) => format!("bytes{len}"),
            AbiType::Bytes => "bytes".to_string(),
            AbiType::Str => "string".to_string(),
            AbiType::Array(inner) => format!("{}[]", render(inner)),
            AbiType::FixedArray(inner, len) => format!("{}[{len}]", render(inner)),
            AbiType::Tuple(components) => {
                let inner: Vec<String> = components.iter().map(|(_, t)| render(t)).collect();
                format!("({})", inner.join(","))
            }
        }
    }
    Ok(render(&resolve_type(param)?))
}

fn is_dynamic(ty: &AbiType) -> bool {
    match ty {
        AbiType::Bytes | AbiType::Str | AbiType::Array(_) => true,
        AbiType::FixedArray(inner, _) => is_dynamic(inner),
        AbiType::Tuple(components) => components.iter().any(|(_, t)| is_dynamic(t)),
        _ => false,
    }
}

/// Number of head words a static type occupies.
fn head_words(ty: &AbiType) -> usize {
    match ty {
        AbiType::FixedArray(inner, len) => head_words(inner) * len,
        AbiType::Tuple(components) => components.iter().map(|(_, t)| head_words(t)).sum(),
        _ => 1,
    }
}

fn word_from_bigint(v: &BigInt) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    let (_, bytes) = v.to_bytes_be();
    let start = WORD - bytes.len();
    word[start..].copy_from_slice(&bytes);
    word
}

fn encode_usize(v: usize) -> [u8; WORD] {
    word_from_bigint(&BigInt::from(v))
}

fn pow2(bits: u16) -> BigInt {
    BigInt::from(1u8) << bits as usize
}

fn coerce_bigint(value: &Value, field: &str) -> Result<BigInt, CompileError> {
    match value {
        Value::Int(i) => Ok(i.clone()),
        Value::Decimal(d) => d.to_bigint_exact().ok_or_else(|| {
            CompileError::field(field, format!("decimal {d} is not an integer"))
        }),
        Value::String(s) => {
            if let Some(hex_digits) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                BigInt::parse_bytes(hex_digits.as_bytes(), 16)
                    .ok_or_else(|| CompileError::field(field, format!("bad hex integer {s:?}")))
            } else {
                let digits = s.strip_prefix('-').unwrap_or(s);
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(CompileError::field(
                        field,
                        format!("cannot parse integer from {s:?}"),
                    ));
                }
                s.parse::<BigInt>()
                    .map_err(|_| CompileError::field(field, format!("bad integer {s:?}")))
            }
        }
        other => Err(CompileError::field(
            field,
            format!("expected integer, got {}", other.type_name()),
        )),
    }
}

/// Decode an address-like value into its 20 bytes.
pub fn coerce_address(value: &Value, field: &str) -> Result<[u8; 20], CompileError> {
    let text = match value {
        Value::String(s) => s.as_str(),
        Value::Bytes(b) if b.len() == 20 => {
            let mut out = [0u8; 20];
            out.copy_from_slice(b);
            return Ok(out);
        }
        other => {
            return Err(CompileError::field(
                field,
                format!("expected address, got {}", other.type_name()),
            ))
        }
    };
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .ok_or_else(|| CompileError::field(field, format!("address {text:?} lacks 0x prefix")))?;
    if digits.len() != 40 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(CompileError::field(
            field,
            format!("address {text:?} is not 40 hex digits"),
        ));
    }
    let bytes =
        hex::decode(digits).map_err(|e| CompileError::field(field, format!("address: {e}")))?;
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn coerce_bytes(value: &Value, field: &str) -> Result<Vec<u8>, CompileError> {
    match value {
        Value::Bytes(b) => Ok(b.clone()),
        Value::String(s) => {
            let digits = s
                .strip_prefix("0x")
                .or_else(|| s.strip_prefix("0X"))
                .ok_or_else(|| {
                    CompileError::field(field, format!("bytes string {s:?} lacks 0x prefix"))
                })?;
            hex::decode(digits).map_err(|e| CompileError::field(field, format!("bytes: {e}")))
        }
        other => Err(CompileError::field(
            field,
            format!("expected bytes, got {}", other.type_name()),
        )),
    }
}

/// Encode one value of one type. Static types yield their head words;
/// dynamic types yield their standalone tail encoding.
fn encode_value(ty: &AbiType, value: &Value, field: &str) -> Result<Vec<u8>, CompileError> {
    match ty {
        AbiType::Uint(bits) => {
            let v = coerce_bigint(value, field)?;
            if v.is_negative() || v >= pow2(*bits) {
                return Err(CompileError::field(
                    field,
                    format!("{v} out of range for uint{bits}"),
                ));
            }
            Ok(word_from_bigint(&v).to_vec())
        }
        AbiType::Int(bits) => {
            let v = coerce_bigint(value, field)?;
            let bound = pow2(bits - 1);
            if v < -bound.clone() || v >= bound {
                return Err(CompileError::field(
                    field,
                    format!("{v} out of range for int{bits}"),
                ));
            }
            let unsigned = if v.sign() == Sign::Minus {
                pow2(256) + v
            } else {
                v
            };
            Ok(word_from_bigint(&unsigned).to_vec())
        }
        AbiType::Address => {
            let addr = coerce_address(value, field)?;
            let mut word = [0u8; WORD];
            word[12..].copy_from_slice(&addr);
            Ok(word.to_vec())
        }
        AbiType::Bool => match value {
            Value::Bool(b) => {
                let mut word = [0u8; WORD];
                word[WORD - 1] = u8::from(*b);
                Ok(word.to_vec())
            }
            other => Err(CompileError::field(
                field,
                format!("expected bool, got {}", other.type_name()),
            )),
        },
        AbiType::FixedBytes(len) => {
            let bytes = coerce_bytes(value, field)?;
            if bytes.len() != *len {
                return Err(CompileError::field(
                    field,
                    format!("expected {len} bytes, got {}", bytes.len()),
                ));
            }
            let mut word = [0u8; WORD];
            word[..bytes.len()].copy_from_slice(&bytes);
            Ok(word.to_vec())
        }
        AbiType::Bytes => Ok(encode_length_prefixed(&coerce_bytes(value, field)?)),
        AbiType::Str => match value {
            Value::String(s) => Ok(encode_length_prefixed(s.as_bytes())),
            other => Err(CompileError::field(
                field,
                format!("expected string, got {}", other.type_name()),
            )),
        },
        AbiType::Array(inner) => {
            let items = value.as_list().ok_or_else(|| {
                CompileError::field(field, format!("expected list, got {}", value.type_name()))
            })?;
            let elems: Vec<(AbiType, Value, String)> = items
                .iter()
                .enumerate()
                .map(|(i, item)| ((**inner).clone(), item.clone(), format!("{field}.{i}")))
                .collect();
            let mut out = encode_usize(items.len()).to_vec();
            out.extend(encode_tuple(&elems)?);
            Ok(out)
        }
        AbiType::FixedArray(inner, len) => {
            let items = value.as_list().ok_or_else(|| {
                CompileError::field(field, format!("expected list, got {}", value.type_name()))
            })?;
            if items.len() != *len {
                return Err(CompileError::field(
                    field,
                    format!("expected {len} elements, got {}", items.len()),
                ));
            }
            let elems: Vec<(AbiType, Value, String)> = items
                .iter()
                .enumerate()
                .map(|(i, item)| ((**inner).clone(), item.clone(), format!("{field}.{i}")))
                .collect();
            encode_tuple(&elems)
        }
        AbiType::Tuple(components) => {
            let elems = tuple_values(components, value, field)?;
            encode_tuple(&elems)
        }
    }
}

/// Pull tuple component values from a map (by name) or list (positional).
fn tuple_values(
    components: &[(String, AbiType)],
    value: &Value,
    field: &str,
) -> Result<Vec<(AbiType, Value, String)>, CompileError> {
    match value {
        Value::Map(map) => components
            .iter()
            .map(|(name, ty)| {
                let item = map.get(name).ok_or_else(|| {
                    CompileError::field(field, format!("tuple component {name:?} missing"))
                })?;
                Ok((ty.clone(), item.clone(), format!("{field}.{name}")))
            })
            .collect(),
        Value::List(items) => {
            if items.len() != components.len() {
                return Err(CompileError::field(
                    field,
                    format!(
                        "tuple expects {} components, got {}",
                        components.len(),
                        items.len()
                    ),
                ));
            }
            Ok(components
                .iter()
                .zip(items)
                .enumerate()
                .map(|(i, ((_, ty), item))| (ty.clone(), item.clone(), format!("{field}.{i}")))
                .collect())
        }
        other => Err(CompileError::field(
            field,
            format!("expected tuple value, got {}", other.type_name()),
        )),
    }
}

fn encode_length_prefixed(data: &[u8]) -> Vec<u8> {
    let mut out = encode_usize(data.len()).to_vec();
    out.extend_from_slice(data);
    let pad = (WORD - data.len() % WORD) % WORD;
    out.extend(std::iter::repeat(0u8).take(pad));
    out
}

/// Head/tail encoding of a sequence of typed values.
fn encode_tuple(items: &[(AbiType, Value, String)]) -> Result<Vec<u8>, CompileError> {
    let head_size: usize = items
        .iter()
        .map(|(ty, _, _)| if is_dynamic(ty) { 1 } else { head_words(ty) })
        .sum::<usize>()
        * WORD;
    let mut head = Vec::with_capacity(head_size);
    let mut tail = Vec::new();
    for (ty, value, field) in items {
        let encoded = encode_value(ty, value, field)?;
        if is_dynamic(ty) {
            head.extend(encode_usize(head_size + tail.len()));
            tail.extend(encoded);
        } else {
            head.extend(encoded);
        }
    }
    head.extend(tail);
    Ok(head)
}

/// Encode function arguments (without selector) for the given inputs.
pub fn encode_args(
    inputs: &[AbiParam],
    mut lookup: impl FnMut(&str) -> Option<Value>,
) -> Result<Vec<u8>, CompileError> {
    let mut items = Vec::with_capacity(inputs.len());
    for (index, param) in inputs.iter().enumerate() {
        let key = if param.name.is_empty() {
            index.to_string()
        } else {
            param.name.clone()
        };
        let value = lookup(&key).ok_or_else(|| {
            CompileError::field(format!("args.{key}"), "argument not provided")
        })?;
        items.push((resolve_type(param)?, value, format!("args.{key}")));
    }
    encode_tuple(&items)
}

/// Full calldata: selector plus encoded arguments.
pub fn encode_call(
    function: &AbiFunction,
    lookup: impl FnMut(&str) -> Option<Value>,
) -> Result<Vec<u8>, CompileError> {
    let mut out = function.selector()?.to_vec();
    out.extend(encode_args(&function.inputs, lookup)?);
    Ok(out)
}

fn read_word(data: &[u8], offset: usize) -> Result<&[u8], CompileError> {
    data.get(offset..offset + WORD)
        .ok_or_else(|| CompileError::new("return data too short"))
}

fn read_usize(data: &[u8], offset: usize) -> Result<usize, CompileError> {
    let word = read_word(data, offset)?;
    let v = BigInt::from_bytes_be(Sign::Plus, word);
    usize::try_from(v).map_err(|_| CompileError::new("offset word out of range"))
}

/// Decode one value. `base` is the start of the enclosing tuple's encoding
/// (for dynamic offsets); `offset` is the head position of this value.
fn decode_value(ty: &AbiType, data: &[u8], base: usize, offset: usize) -> Result<Value, CompileError> {
    match ty {
        AbiType::Uint(_) => {
            let word = read_word(data, offset)?;
            Ok(Value::Int(BigInt::from_bytes_be(Sign::Plus, word)))
        }
        AbiType::Int(_) => {
            // Values are sign-extended to the full word, so the word's top
            // bit decides the sign regardless of declared width.
            let word = read_word(data, offset)?;
            let mut v = BigInt::from_bytes_be(Sign::Plus, word);
            if !v.is_zero() && (word[0] & 0x80) != 0 {
                v -= pow2(256);
            }
            Ok(Value::Int(v))
        }
        AbiType::Address => {
            let word = read_word(data, offset)?;
            Ok(Value::String(format!("0x{}", hex::encode(&word[12..]))))
        }
        AbiType::Bool => {
            let word = read_word(data, offset)?;
            Ok(Value::Bool(word[WORD - 1] != 0))
        }
        AbiType::FixedBytes(len) => {
            let word = read_word(data, offset)?;
            Ok(Value::Bytes(word[..*len].to_vec()))
        }
        AbiType::Bytes | AbiType::Str => {
            let start = base + read_usize(data, offset)?;
            let len = read_usize(data, start)?;
            let payload = data
                .get(start + WORD..start + WORD + len)
                .ok_or_else(|| CompileError::new("return data too short"))?;
            match ty {
                AbiType::Str => Ok(Value::String(
                    String::from_utf8(payload.to_vec())
                        .map_err(|e| CompileError::new(format!("bad utf8 string: {e}")))?,
                )),
                _ => Ok(Value::Bytes(payload.to_vec())),
            }
        }
        AbiType::Array(inner) => {
            let start = base + read_usize(data, offset)?;
            let len = read_usize(data, start)?;
            decode_sequence(inner, len, data, start + WORD)
        }
        AbiType::FixedArray(inner, len) => {
            if is_dynamic(ty) {
                let start = base + read_usize(data, offset)?;
                decode_sequence(inner, *len, data, start)
            } else {
                decode_sequence(inner, *len, data, offset)
            }
        }
        AbiType::Tuple(components) => {
            if is_dynamic(ty) {
                let start = base + read_usize(data, offset)?;
                decode_tuple(components, data, start)
            } else {
                decode_tuple(components, data, offset)
            }
        }
    }
}

fn decode_sequence(
    inner: &AbiType,
    len: usize,
    data: &[u8],
    base: usize,
) -> Result<Value, CompileError> {
    let stride = if is_dynamic(inner) {
        WORD
    } else {
        head_words(inner) * WORD
    };
    let mut items = Vec::with_capacity(len);
    for i in 0..len {
        items.push(decode_value(inner, data, base, base + i * stride)?);
    }
    Ok(Value::List(items))
}

/// Decode a tuple. When all component names are present and unique the
/// result is a map; otherwise a positional list.
fn decode_tuple(
    components: &[(String, AbiType)],
    data: &[u8],
    base: usize,
) -> Result<Value, CompileError> {
    let mut offset = base;
    let mut values = Vec::with_capacity(components.len());
    for (_, ty) in components {
        values.push(decode_value(ty, data, base, offset)?);
        offset += if is_dynamic(ty) {
            WORD
        } else {
            head_words(ty) * WORD
        };
    }
    Ok(shape_named(components.iter().map(|(n, _)| n.as_str()), values))
}

fn shape_named<'a>(names: impl Iterator<Item = &'a str>, values: Vec<Value>) -> Value {
    let names: Vec<&str> = names.collect();
    let all_named = !names.is_empty() && names.iter().all(|n| !n.is_empty());
    let unique = {
        let mut seen = std::collections::BTreeSet::new();
        names.iter().all(|n| seen.insert(*n))
    };
    if all_named && unique {
        Value::Map(
            names
                .into_iter()
                .map(str::to_string)
                .zip(values)
                .collect(),
        )
    } else {
        Value::List(values)
    }
}

/// Decode a function's return data against its outputs.
pub fn decode_outputs(outputs: &[AbiParam], data: &[u8]) -> Result<Value, CompileError> {
    let components: Vec<(String, AbiType)> = outputs
        .iter()
        .map(|p| Ok((p.name.clone(), resolve_type(p)?)))
        .collect::<Result<_, CompileError>>()?;
    decode_tuple(&components, data, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn erc20_transfer() -> AbiFunction {
        serde_json::from_value(json!({
            "name": "transfer",
            "type": "function",
            "inputs": [
                {"name": "to", "type": "address"},
                {"name": "amount", "type": "uint256"}
            ],
            "outputs": [{"name": "", "type": "bool"}]
        }))
        .unwrap()
    }

    #[test]
    fn canonical_signature_and_selector() {
        let f = erc20_transfer();
        assert_eq!(f.signature().unwrap(), "transfer(address,uint256)");
        // Well-known ERC-20 transfer selector.
        assert_eq!(f.selector().unwrap(), [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn uint_alias_normalizes_in_signature() {
        let f: AbiFunction = serde_json::from_value(json!({
            "name": "f",
            "inputs": [{"name": "x", "type": "uint"}, {"name": "y", "type": "int"}],
            "outputs": []
        }))
        .unwrap();
        assert_eq!(f.signature().unwrap(), "f(uint256,int256)");
    }

    #[test]
    fn tuple_flattens_in_signature() {
        let f: AbiFunction = serde_json::from_value(json!({
            "name": "post",
            "inputs": [{
                "name": "order",
                "type": "tuple[]",
                "components": [
                    {"name": "token", "type": "address"},
                    {"name": "qty", "type": "uint256"}
                ]
            }],
            "outputs": []
        }))
        .unwrap();
        assert_eq!(f.signature().unwrap(), "post((address,uint256)[])");
    }

    #[test]
    fn encode_static_args() {
        let f = erc20_transfer();
        let data = encode_call(&f, |name| match name {
            "to" => Some(Value::from("0x1111111111111111111111111111111111111111")),
            "amount" => Some(Value::from(1000i64)),
            _ => None,
        })
        .unwrap();
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(&data[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(&data[4 + 12..4 + 32], &[0x11u8; 20]);
        assert_eq!(data[4 + 63], 0xe8);
        assert_eq!(data[4 + 62], 0x03);
    }

    #[test]
    fn encode_rejects_out_of_range_and_bad_address() {
        let f = erc20_transfer();
        let err = encode_call(&f, |name| match name {
            "to" => Some(Value::from("0x1111111111111111111111111111111111111111")),
            "amount" => Some(Value::from(-1i64)),
            _ => None,
        })
        .unwrap_err();
        assert!(err.to_string().contains("uint256"));

        let err = encode_call(&f, |name| match name {
            "to" => Some(Value::from("not-an-address")),
            "amount" => Some(Value::from(1i64)),
            _ => None,
        })
        .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("args.to"));
    }

    #[test]
    fn encode_dynamic_string() {
        let f: AbiFunction = serde_json::from_value(json!({
            "name": "setName",
            "inputs": [{"name": "name", "type": "string"}],
            "outputs": []
        }))
        .unwrap();
        let data = encode_call(&f, |_| Some(Value::from("abc"))).unwrap();
        // selector + offset word + length word + one padded data word
        assert_eq!(data.len(), 4 + 32 * 3);
        assert_eq!(data[4 + 31], 0x20);
        assert_eq!(data[4 + 63], 3);
        assert_eq!(&data[4 + 64..4 + 67], b"abc");
    }

    #[test]
    fn encode_uint_accepts_strings_and_hex() {
        let f: AbiFunction = serde_json::from_value(json!({
            "name": "f",
            "inputs": [{"name": "x", "type": "uint256"}],
            "outputs": []
        }))
        .unwrap();
        let from_dec = encode_call(&f, |_| Some(Value::from("255"))).unwrap();
        let from_hex = encode_call(&f, |_| Some(Value::from("0xff"))).unwrap();
        assert_eq!(from_dec, from_hex);
    }

    #[test]
    fn decode_static_outputs_by_name() {
        let outputs = vec![
            AbiParam {
                name: "price".to_string(),
                ty: "uint256".to_string(),
                components: vec![],
            },
            AbiParam {
                name: "ok".to_string(),
                ty: "bool".to_string(),
                components: vec![],
            },
        ];
        let mut data = vec![0u8; 64];
        data[31] = 42;
        data[63] = 1;
        let decoded = decode_outputs(&outputs, &data).unwrap();
        let map = decoded.as_map().unwrap();
        assert_eq!(map.get("price"), Some(&Value::from(42i64)));
        assert_eq!(map.get("ok"), Some(&Value::Bool(true)));
    }

    #[test]
    fn decode_unnamed_outputs_positionally() {
        let outputs = vec![AbiParam {
            name: String::new(),
            ty: "uint256".to_string(),
            components: vec![],
        }];
        let mut data = vec![0u8; 32];
        data[31] = 7;
        let decoded = decode_outputs(&outputs, &data).unwrap();
        assert_eq!(decoded, Value::List(vec![Value::from(7i64)]));
    }

    #[test]
    fn decode_duplicate_names_fall_back_to_list() {
        let dup = AbiParam {
            name: "x".to_string(),
            ty: "uint8".to_string(),
            components: vec![],
        };
        let outputs = vec![dup.clone(), dup];
        let data = vec![0u8; 64];
        let decoded = decode_outputs(&outputs, &data).unwrap();
        assert!(matches!(decoded, Value::List(_)));
    }

    #[test]
    fn encode_decode_round_trip_dynamic_array() {
        let f: AbiFunction = serde_json::from_value(json!({
            "name": "sum",
            "inputs": [{"name": "xs", "type": "uint256[]"}],
            "outputs": [{"name": "xs", "type": "uint256[]"}]
        }))
        .unwrap();
        let xs = Value::List(vec![Value::from(1i64), Value::from(2i64), Value::from(3i64)]);
        let encoded = encode_args(&f.inputs, |_| Some(xs.clone())).unwrap();
        let decoded = decode_outputs(&f.outputs, &encoded).unwrap();
        assert_eq!(decoded.as_map().unwrap().get("xs"), Some(&xs));
    }

    #[test]
    fn decode_negative_int() {
        let outputs = vec![AbiParam {
            name: "delta".to_string(),
            ty: "int256".to_string(),
            components: vec![],
        }];
        let data = vec![0xffu8; 32];
        let decoded = decode_outputs(&outputs, &data).unwrap();
        assert_eq!(
            decoded.as_map().unwrap().get("delta"),
            Some(&Value::from(-1i64))
        );
    }

    #[test]
    fn decode_string_output() {
        let outputs = vec![AbiParam {
            name: "name".to_string(),
            ty: "string".to_string(),
            components: vec![],
        }];
        let mut data = vec![0u8; 96];
        data[31] = 0x20;
        data[63] = 4;
        data[64..68].copy_from_slice(b"USDC");
        let decoded = decode_outputs(&outputs, &data).unwrap();
        assert_eq!(
            decoded.as_map().unwrap().get("name"),
            Some(&Value::from("USDC"))
        );
    }

    #[test]
    fn rejects_unsupported_types() {
        let param = AbiParam {
            name: "x".to_string(),
            ty: "uint7".to_string(),
            components: vec![],
        };
        assert!(resolve_type(&param).is_err());
        let param = AbiParam {
            name: "x".to_string(),
            ty: "fixed128x18".to_string(),
            components: vec![],
        };
        assert!(resolve_type(&param).is_err());
    }
}

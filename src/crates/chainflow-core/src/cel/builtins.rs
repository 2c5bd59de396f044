//! Built-in functions for the CEL subset.
//!
//! Calls resolve by receiver-prepend, so `"s".contains(x)` lands here as
//! `contains("s", x)`. Token-amount conversions (`to_atomic` / `to_human`)
//! are the financial-precision workhorses: they never truncate silently.

use super::eval::as_decimal;
use crate::error::{EvalError, EvalErrorKind};
use crate::value::Value;
use chainflow_decimal::BigDecimal;
use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};
use std::collections::BTreeMap;

fn arity(name: &str, args: &[Value], expected: usize) -> Result<(), EvalError> {
    if args.len() != expected {
        return Err(EvalError::new(
            EvalErrorKind::InvalidArgument,
            format!("{name}() expects {expected} argument(s), got {}", args.len()),
        ));
    }
    Ok(())
}

fn str_arg<'a>(name: &str, args: &'a [Value], idx: usize) -> Result<&'a str, EvalError> {
    args[idx].as_str().ok_or_else(|| {
        EvalError::type_mismatch(format!(
            "{name}() argument {} must be a string, got {}",
            idx + 1,
            args[idx].type_name()
        ))
    })
}

fn numeric_arg(name: &str, args: &[Value], idx: usize) -> Result<BigDecimal, EvalError> {
    as_decimal(&args[idx]).ok_or_else(|| {
        EvalError::type_mismatch(format!(
            "{name}() argument {} must be a number, got {}",
            idx + 1,
            args[idx].type_name()
        ))
    })
}

fn int_arg(name: &str, args: &[Value], idx: usize) -> Result<BigInt, EvalError> {
    args[idx].as_int().cloned().ok_or_else(|| {
        EvalError::type_mismatch(format!(
            "{name}() argument {} must be an integer, got {}",
            idx + 1,
            args[idx].type_name()
        ))
    })
}

/// Dispatch a builtin by name.
pub fn call(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    match name {
        "size" => size(args),
        "contains" => {
            arity(name, args, 2)?;
            Ok(Value::Bool(
                str_arg(name, args, 0)?.contains(str_arg(name, args, 1)?),
            ))
        }
        "startsWith" => {
            arity(name, args, 2)?;
            Ok(Value::Bool(
                str_arg(name, args, 0)?.starts_with(str_arg(name, args, 1)?),
            ))
        }
        "endsWith" => {
            arity(name, args, 2)?;
            Ok(Value::Bool(
                str_arg(name, args, 0)?.ends_with(str_arg(name, args, 1)?),
            ))
        }
        "matches" => {
            arity(name, args, 2)?;
            let pattern = str_arg(name, args, 1)?;
            let re = regex::Regex::new(pattern).map_err(|e| {
                EvalError::new(
                    EvalErrorKind::InvalidArgument,
                    format!("matches() pattern invalid: {e}"),
                )
            })?;
            Ok(Value::Bool(re.is_match(str_arg(name, args, 0)?)))
        }
        "lower" => {
            arity(name, args, 1)?;
            Ok(Value::String(str_arg(name, args, 0)?.to_lowercase()))
        }
        "upper" => {
            arity(name, args, 1)?;
            Ok(Value::String(str_arg(name, args, 0)?.to_uppercase()))
        }
        "trim" => {
            arity(name, args, 1)?;
            Ok(Value::String(str_arg(name, args, 0)?.trim().to_string()))
        }
        "int" => coerce_int(args),
        "uint" => coerce_uint(args),
        "double" => coerce_double(args),
        "string" => coerce_string(args),
        "bool" => coerce_bool(args),
        "type" => {
            arity(name, args, 1)?;
            Ok(Value::String(args[0].type_name().to_string()))
        }
        "abs" => {
            arity(name, args, 1)?;
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(i.abs())),
                Value::Decimal(d) => Ok(Value::Decimal(d.abs())),
                other => Err(EvalError::type_mismatch(format!(
                    "abs() requires a number, got {}",
                    other.type_name()
                ))),
            }
        }
        "min" => fold_extremum(name, args, |a, b| a < b),
        "max" => fold_extremum(name, args, |a, b| a > b),
        "floor" => rounding(name, args, BigDecimal::floor),
        "ceil" => rounding(name, args, BigDecimal::ceil),
        "round" => rounding(name, args, BigDecimal::round),
        "pow" => pow(args),
        "mul_div" => mul_div(args),
        "to_atomic" => to_atomic(args),
        "to_human" => to_human(args),
        _ => Err(EvalError::new(
            EvalErrorKind::UnknownFunction,
            format!("unknown function {name:?}"),
        )),
    }
}

fn size(args: &[Value]) -> Result<Value, EvalError> {
    arity("size", args, 1)?;
    let len = match &args[0] {
        Value::String(s) => s.chars().count(),
        Value::List(items) => items.len(),
        Value::Map(map) => map.len(),
        other => {
            return Err(EvalError::type_mismatch(format!(
                "size() requires string, list or map, got {}",
                other.type_name()
            )))
        }
    };
    Ok(Value::Int(BigInt::from(len)))
}

fn parse_int_literal(s: &str) -> Result<BigInt, EvalError> {
    let trimmed = s.trim();
    let digits = trimmed.strip_prefix('-').unwrap_or(trimmed);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(EvalError::new(
            EvalErrorKind::InvalidArgument,
            format!("int() cannot parse {s:?}"),
        ));
    }
    trimmed.parse::<BigInt>().map_err(|_| {
        EvalError::new(
            EvalErrorKind::InvalidArgument,
            format!("int() cannot parse {s:?}"),
        )
    })
}

fn truncate(d: &BigDecimal) -> BigInt {
    if d.is_negative() {
        d.ceil()
    } else {
        d.floor()
    }
}

fn coerce_int(args: &[Value]) -> Result<Value, EvalError> {
    arity("int", args, 1)?;
    match &args[0] {
        Value::Int(i) => Ok(Value::Int(i.clone())),
        Value::Decimal(d) => Ok(Value::Int(truncate(d))),
        Value::String(s) => Ok(Value::Int(parse_int_literal(s)?)),
        other => Err(EvalError::type_mismatch(format!(
            "int() cannot convert {}",
            other.type_name()
        ))),
    }
}

fn coerce_uint(args: &[Value]) -> Result<Value, EvalError> {
    arity("uint", args, 1)?;
    match &args[0] {
        Value::Int(i) => Ok(Value::Int(i.abs())),
        Value::Decimal(d) => Ok(Value::Int(truncate(d).abs())),
        Value::String(s) => Ok(Value::Int(parse_int_literal(s)?.abs())),
        other => Err(EvalError::type_mismatch(format!(
            "uint() cannot convert {}",
            other.type_name()
        ))),
    }
}

fn coerce_double(args: &[Value]) -> Result<Value, EvalError> {
    arity("double", args, 1)?;
    match &args[0] {
        Value::Int(i) => Ok(Value::Decimal(BigDecimal::from_bigint(i.clone()))),
        Value::Decimal(d) => Ok(Value::Decimal(d.clone())),
        Value::String(s) => Ok(Value::Decimal(BigDecimal::parse(s)?)),
        other => Err(EvalError::type_mismatch(format!(
            "double() cannot convert {}",
            other.type_name()
        ))),
    }
}

fn coerce_string(args: &[Value]) -> Result<Value, EvalError> {
    arity("string", args, 1)?;
    match &args[0] {
        Value::String(s) => Ok(Value::String(s.clone())),
        Value::Int(i) => Ok(Value::String(i.to_string())),
        Value::Decimal(d) => Ok(Value::String(d.to_string())),
        Value::Bool(b) => Ok(Value::String(b.to_string())),
        Value::Bytes(b) => Ok(Value::String(format!("0x{}", hex::encode(b)))),
        other => Err(EvalError::type_mismatch(format!(
            "string() cannot convert {}",
            other.type_name()
        ))),
    }
}

fn coerce_bool(args: &[Value]) -> Result<Value, EvalError> {
    arity("bool", args, 1)?;
    match &args[0] {
        Value::Bool(b) => Ok(Value::Bool(*b)),
        Value::String(s) if s == "true" => Ok(Value::Bool(true)),
        Value::String(s) if s == "false" => Ok(Value::Bool(false)),
        other => Err(EvalError::type_mismatch(format!(
            "bool() cannot convert {other}"
        ))),
    }
}

fn fold_extremum(
    name: &str,
    args: &[Value],
    better: impl Fn(&BigDecimal, &BigDecimal) -> bool,
) -> Result<Value, EvalError> {
    if args.is_empty() {
        return Err(EvalError::new(
            EvalErrorKind::InvalidArgument,
            format!("{name}() expects at least one argument"),
        ));
    }
    let mut best_idx = 0;
    let mut best = numeric_arg(name, args, 0)?;
    for idx in 1..args.len() {
        let candidate = numeric_arg(name, args, idx)?;
        if better(&candidate, &best) {
            best = candidate;
            best_idx = idx;
        }
    }
    Ok(args[best_idx].clone())
}

fn rounding(
    name: &str,
    args: &[Value],
    f: impl Fn(&BigDecimal) -> BigInt,
) -> Result<Value, EvalError> {
    arity(name, args, 1)?;
    match &args[0] {
        Value::Int(i) => Ok(Value::Int(i.clone())),
        Value::Decimal(d) => Ok(Value::Int(f(d))),
        other => Err(EvalError::type_mismatch(format!(
            "{name}() requires a number, got {}",
            other.type_name()
        ))),
    }
}

fn pow(args: &[Value]) -> Result<Value, EvalError> {
    arity("pow", args, 2)?;
    let base = int_arg("pow", args, 0)?;
    let exp = int_arg("pow", args, 1)?;
    if exp.is_negative() || exp > BigInt::from(10_000) {
        return Err(EvalError::new(
            EvalErrorKind::InvalidArgument,
            "pow() exponent must be in [0, 10000]",
        ));
    }
    let exp = exp.to_u32().ok_or_else(|| {
        EvalError::new(EvalErrorKind::InvalidArgument, "pow() exponent out of range")
    })?;
    Ok(Value::Int(base.pow(exp)))
}

fn mul_div(args: &[Value]) -> Result<Value, EvalError> {
    arity("mul_div", args, 3)?;
    let a = int_arg("mul_div", args, 0)?;
    let b = int_arg("mul_div", args, 1)?;
    let denom = int_arg("mul_div", args, 2)?;
    if a.is_negative() || b.is_negative() || denom.is_negative() {
        return Err(EvalError::new(
            EvalErrorKind::InvalidArgument,
            "mul_div() requires non-negative integers",
        ));
    }
    if denom.is_zero() {
        return Err(EvalError::new(
            EvalErrorKind::DivisionByZero,
            "mul_div() denominator is zero",
        ));
    }
    Ok(Value::Int((a * b) / denom))
}

/// Resolve an asset argument to a decimals count. The asset may be an
/// integer, a string of digits, or a map with a `decimals` field.
fn asset_decimals(name: &str, asset: &Value) -> Result<u32, EvalError> {
    let as_count = |i: &BigInt| -> Result<u32, EvalError> {
        i.to_u32()
            .filter(|d| *d <= 77)
            .ok_or_else(|| {
                EvalError::new(
                    EvalErrorKind::InvalidArgument,
                    format!("{name}() decimals out of range: {i}"),
                )
            })
    };
    match asset {
        Value::Int(i) => as_count(i),
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
            let parsed = s.parse::<BigInt>().map_err(|_| {
                EvalError::new(
                    EvalErrorKind::InvalidArgument,
                    format!("{name}() cannot parse decimals {s:?}"),
                )
            })?;
            as_count(&parsed)
        }
        Value::Map(map) => match map.get("decimals") {
            Some(inner @ (Value::Int(_) | Value::String(_))) => asset_decimals(name, inner),
            _ => Err(EvalError::new(
                EvalErrorKind::InvalidArgument,
                format!("{name}() asset map lacks a usable 'decimals' field"),
            )),
        },
        other => Err(EvalError::type_mismatch(format!(
            "{name}() asset must be an integer, digit string, or map, got {}",
            other.type_name()
        ))),
    }
}

fn amount_decimal(name: &str, value: &Value) -> Result<BigDecimal, EvalError> {
    match value {
        Value::Int(i) => Ok(BigDecimal::from_bigint(i.clone())),
        Value::Decimal(d) => Ok(d.clone()),
        Value::String(s) => BigDecimal::parse(s).map_err(|_| {
            EvalError::new(
                EvalErrorKind::InvalidArgument,
                format!("{name}() cannot parse amount {s:?}"),
            )
        }),
        other => Err(EvalError::type_mismatch(format!(
            "{name}() amount must be numeric, got {}",
            other.type_name()
        ))),
    }
}

fn to_atomic(args: &[Value]) -> Result<Value, EvalError> {
    arity("to_atomic", args, 2)?;
    let amount = amount_decimal("to_atomic", &args[0])?;
    if amount.is_negative() {
        return Err(EvalError::new(
            EvalErrorKind::InvalidArgument,
            "to_atomic() amount must be non-negative",
        ));
    }
    let decimals = asset_decimals("to_atomic", &args[1])?;
    let scaled = amount.shift_left(decimals);
    match scaled.to_bigint_exact() {
        Some(i) => Ok(Value::Int(i)),
        None => Err(EvalError::new(
            EvalErrorKind::Truncation,
            format!(
                "to_atomic() disallows truncation: {amount} has more than {decimals} fractional digits"
            ),
        )),
    }
}

fn to_human(args: &[Value]) -> Result<Value, EvalError> {
    arity("to_human", args, 2)?;
    let atomic = amount_decimal("to_human", &args[0])?;
    let atomic = atomic.to_bigint_exact().ok_or_else(|| {
        EvalError::new(
            EvalErrorKind::InvalidArgument,
            "to_human() atomic amount must be an integer",
        )
    })?;
    let decimals = asset_decimals("to_human", &args[1])?;
    let human = BigDecimal::from_bigint(atomic).shift_right(decimals);
    Ok(Value::String(human.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_map;
    use std::str::FromStr;

    fn v(src: &str) -> Value {
        crate::cel::evaluate(src, &Value::empty_map()).unwrap()
    }

    fn expect_err(src: &str) -> EvalError {
        crate::cel::evaluate(src, &Value::empty_map()).unwrap_err()
    }

    #[test]
    fn string_builtins() {
        assert_eq!(v("contains('haystack', 'stack')"), Value::Bool(true));
        assert_eq!(v("'HayStack'.lower()"), Value::from("haystack"));
        assert_eq!(v("'  x '.trim()"), Value::from("x"));
        assert_eq!(v("'0x1234'.startsWith('0x')"), Value::Bool(true));
        assert_eq!(v("'file.json'.endsWith('.json')"), Value::Bool(true));
        assert_eq!(v("'abc123'.matches('^[a-z]+[0-9]+$')"), Value::Bool(true));
    }

    #[test]
    fn size_over_families() {
        assert_eq!(v("size('abc')"), Value::from(3i64));
        assert_eq!(v("size([1, 2])"), Value::from(2i64));
        assert_eq!(v("size({'a': 1})"), Value::from(1i64));
        assert!(crate::cel::evaluate("size(1)", &Value::empty_map()).is_err());
    }

    #[test]
    fn coercions() {
        assert_eq!(v("int('42')"), Value::from(42i64));
        assert_eq!(v("int('-42')"), Value::from(-42i64));
        assert_eq!(v("int(2.9)"), Value::from(2i64));
        assert_eq!(v("int(-2.9)"), Value::from(-2i64));
        assert_eq!(expect_err("int('1e5')").kind, EvalErrorKind::InvalidArgument);
        assert_eq!(v("uint(-5)"), Value::from(5i64));
        assert_eq!(v("double('1.5')"), Value::Decimal(BigDecimal::parse("1.5").unwrap()));
        assert_eq!(v("string(42)"), Value::from("42"));
        assert_eq!(v("string(true)"), Value::from("true"));
        assert_eq!(v("bool('true')"), Value::Bool(true));
        assert_eq!(v("type(1.5)"), Value::from("decimal"));
        assert_eq!(v("type(null)"), Value::from("null"));
    }

    #[test]
    fn numeric_builtins() {
        assert_eq!(v("abs(-3)"), Value::from(3i64));
        assert_eq!(v("min(3, 1, 2)"), Value::from(1i64));
        assert_eq!(v("max(3, 1.5, 2)"), Value::from(3i64));
        assert_eq!(v("min(1.5)"), Value::Decimal(BigDecimal::parse("1.5").unwrap()));
        assert_eq!(v("floor(2.7)"), Value::from(2i64));
        assert_eq!(v("ceil(2.1)"), Value::from(3i64));
        assert_eq!(v("round(2.5)"), Value::from(3i64));
        assert_eq!(v("round(-2.5)"), Value::from(-3i64));
    }

    #[test]
    fn pow_bounds() {
        assert_eq!(v("pow(2, 10)"), Value::from(1024i64));
        assert_eq!(v("pow(10, 0)"), Value::from(1i64));
        assert!(crate::cel::evaluate("pow(2, -1)", &Value::empty_map()).is_err());
        assert!(crate::cel::evaluate("pow(2, 10001)", &Value::empty_map()).is_err());
    }

    #[test]
    fn mul_div_truncates_toward_zero() {
        assert_eq!(v("mul_div(10, 3, 4)"), Value::from(7i64));
        assert_eq!(expect_err("mul_div(1, 1, 0)").kind, EvalErrorKind::DivisionByZero);
        assert!(crate::cel::evaluate("mul_div(-1, 1, 1)", &Value::empty_map()).is_err());
    }

    #[test]
    fn to_atomic_scales_exactly() {
        assert_eq!(
            v("to_atomic('1.5', 18)"),
            Value::Int(BigInt::from_str("1500000000000000000").unwrap())
        );
        assert_eq!(v("to_atomic(25, 6)"), Value::from(25_000_000i64));
        assert_eq!(v("to_atomic('0.000001', '6')"), Value::from(1i64));
    }

    #[test]
    fn to_atomic_rejects_truncation_and_negatives() {
        let err = expect_err("to_atomic('1.0000001', 6)");
        assert_eq!(err.kind, EvalErrorKind::Truncation);
        assert!(err.message.contains("disallows truncation"));
        assert!(crate::cel::evaluate("to_atomic('-1', 6)", &Value::empty_map()).is_err());
    }

    #[test]
    fn to_atomic_accepts_asset_map() {
        let root = value_map! {
            "asset" => value_map! { "decimals" => 6i64, "symbol" => "USDC" }
        };
        let out = crate::cel::evaluate("to_atomic('2.5', asset)", &root).unwrap();
        assert_eq!(out, Value::from(2_500_000i64));
    }

    #[test]
    fn to_human_inverts_to_atomic() {
        assert_eq!(
            v("to_human(1500000000000000000, 18)"),
            Value::from("1.5")
        );
        assert_eq!(v("to_human(25000000, 6)"), Value::from("25"));
        assert_eq!(v("to_human(1, 6)"), Value::from("0.000001"));
    }
}

//! Tree-walking evaluator for the CEL subset.
//!
//! Arithmetic promotes int to decimal as needed; `int / int` stays an
//! integer when exact and otherwise promotes through the terminating-decimal
//! rule, so a non-terminating quotient is an error rather than a rounded
//! float. `&&` and `||` short-circuit and never evaluate their right operand
//! when the left already decides. Member access on null or a non-map is an
//! error; a missing map key is `null`.

use super::builtins;
use super::parser::{parse, BinOp, Expr, UnOp};
use crate::error::{EvalError, EvalErrorKind};
use crate::value::Value;
use chainflow_decimal::BigDecimal;
use num_traits::Signed;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Parse and evaluate a CEL expression against a root value.
pub fn evaluate(source: &str, root: &Value) -> Result<Value, EvalError> {
    let ast = parse(source)?;
    evaluate_expr(&ast, root).map_err(|e| attach_expr(e, source))
}

fn attach_expr(mut err: EvalError, source: &str) -> EvalError {
    if err.path.is_none() {
        err.path = Some(source.to_string());
    }
    err
}

/// Evaluate a parsed expression against a root value.
pub fn evaluate_expr(expr: &Expr, root: &Value) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => match root {
            Value::Map(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
            _ => Err(EvalError::type_mismatch(
                "evaluation root is not a map",
            )),
        },
        Expr::Member { object, property } => {
            let obj = evaluate_expr(object, root)?;
            member(&obj, property)
        }
        Expr::Index { object, index } => {
            let obj = evaluate_expr(object, root)?;
            let idx = evaluate_expr(index, root)?;
            index_value(&obj, &idx)
        }
        Expr::Unary { op, expr } => {
            let v = evaluate_expr(expr, root)?;
            match op {
                UnOp::Not => match v {
                    Value::Bool(b) => Ok(Value::Bool(!b)),
                    other => Err(EvalError::type_mismatch(format!(
                        "'!' requires bool, got {}",
                        other.type_name()
                    ))),
                },
                UnOp::Neg => match v {
                    Value::Int(i) => Ok(Value::Int(-i)),
                    Value::Decimal(d) => Ok(Value::Decimal(d.neg())),
                    other => Err(EvalError::type_mismatch(format!(
                        "'-' requires a number, got {}",
                        other.type_name()
                    ))),
                },
            }
        }
        Expr::Binary { op, left, right } => binary(*op, left, right, root),
        Expr::Ternary {
            cond,
            then,
            otherwise,
        } => match evaluate_expr(cond, root)? {
            Value::Bool(true) => evaluate_expr(then, root),
            Value::Bool(false) => evaluate_expr(otherwise, root),
            other => Err(EvalError::type_mismatch(format!(
                "ternary condition must be bool, got {}",
                other.type_name()
            ))),
        },
        Expr::List(elems) => Ok(Value::List(
            elems
                .iter()
                .map(|e| evaluate_expr(e, root))
                .collect::<Result<_, _>>()?,
        )),
        Expr::Map(entries) => {
            let mut map = BTreeMap::new();
            for (key_expr, value_expr) in entries {
                let key = match evaluate_expr(key_expr, root)? {
                    Value::String(s) => s,
                    other => {
                        return Err(EvalError::type_mismatch(format!(
                            "map key must be string, got {}",
                            other.type_name()
                        )))
                    }
                };
                map.insert(key, evaluate_expr(value_expr, root)?);
            }
            Ok(Value::Map(map))
        }
        Expr::Call { callee, args } => {
            // Receiver-prepend: "s".contains(x) == contains("s", x).
            let (name, mut arg_values) = match callee.as_ref() {
                Expr::Ident(name) => (name.clone(), Vec::with_capacity(args.len())),
                Expr::Member { object, property } => {
                    let receiver = evaluate_expr(object, root)?;
                    (property.clone(), vec![receiver])
                }
                other => {
                    return Err(EvalError::type_mismatch(format!(
                        "expression {other:?} is not callable"
                    )))
                }
            };
            for arg in args {
                arg_values.push(evaluate_expr(arg, root)?);
            }
            builtins::call(&name, &arg_values)
        }
    }
}

fn member(obj: &Value, property: &str) -> Result<Value, EvalError> {
    match obj {
        Value::Map(map) => Ok(map.get(property).cloned().unwrap_or(Value::Null)),
        Value::List(items) => match property.parse::<usize>() {
            Ok(i) => Ok(items.get(i).cloned().unwrap_or(Value::Null)),
            Err(_) => Err(EvalError::type_mismatch(format!(
                "cannot access member {property:?} on a list"
            ))),
        },
        Value::Null => Err(EvalError::type_mismatch(format!(
            "member access {property:?} on null"
        ))),
        other => Err(EvalError::type_mismatch(format!(
            "member access {property:?} on {}",
            other.type_name()
        ))),
    }
}

fn index_value(obj: &Value, idx: &Value) -> Result<Value, EvalError> {
    match (obj, idx) {
        (Value::List(items), Value::Int(i)) => {
            if i.is_negative() {
                return Err(EvalError::type_mismatch("list index must be non-negative"));
            }
            let i: usize = i
                .try_into()
                .map_err(|_| EvalError::type_mismatch("list index out of range"))?;
            Ok(items.get(i).cloned().unwrap_or(Value::Null))
        }
        (Value::String(s), Value::Int(i)) => {
            if i.is_negative() {
                return Err(EvalError::type_mismatch(
                    "string index must be non-negative",
                ));
            }
            let i: usize = i
                .try_into()
                .map_err(|_| EvalError::type_mismatch("string index out of range"))?;
            Ok(s.chars()
                .nth(i)
                .map(|c| Value::String(c.to_string()))
                .unwrap_or(Value::Null))
        }
        (Value::Map(map), Value::String(key)) => {
            Ok(map.get(key).cloned().unwrap_or(Value::Null))
        }
        (obj, idx) => Err(EvalError::type_mismatch(format!(
            "cannot index {} with {}",
            obj.type_name(),
            idx.type_name()
        ))),
    }
}

fn binary(op: BinOp, left: &Expr, right: &Expr, root: &Value) -> Result<Value, EvalError> {
    // Short-circuit forms first: the right operand must not be evaluated
    // when the left decides.
    match op {
        BinOp::And => {
            return match evaluate_expr(left, root)? {
                Value::Bool(false) => Ok(Value::Bool(false)),
                Value::Bool(true) => match evaluate_expr(right, root)? {
                    Value::Bool(b) => Ok(Value::Bool(b)),
                    other => Err(non_bool_operand("&&", &other)),
                },
                other => Err(non_bool_operand("&&", &other)),
            }
        }
        BinOp::Or => {
            return match evaluate_expr(left, root)? {
                Value::Bool(true) => Ok(Value::Bool(true)),
                Value::Bool(false) => match evaluate_expr(right, root)? {
                    Value::Bool(b) => Ok(Value::Bool(b)),
                    other => Err(non_bool_operand("||", &other)),
                },
                other => Err(non_bool_operand("||", &other)),
            }
        }
        _ => {}
    }

    let l = evaluate_expr(left, root)?;
    let r = evaluate_expr(right, root)?;
    match op {
        BinOp::Add => add(&l, &r),
        BinOp::Sub => match (&l, &r) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a - b)),
            _ => numeric_op("-", &l, &r, |a, b| a.sub(b)),
        },
        BinOp::Mul => match (&l, &r) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a * b)),
            _ => numeric_op("*", &l, &r, |a, b| a.mul(b)),
        },
        BinOp::Div => divide(&l, &r),
        BinOp::Mod => modulo(&l, &r),
        BinOp::Eq => Ok(Value::Bool(value_equals(&l, &r))),
        BinOp::Ne => Ok(Value::Bool(!value_equals(&l, &r))),
        BinOp::Lt => compare(&l, &r).map(|o| Value::Bool(o == Ordering::Less)),
        BinOp::Le => compare(&l, &r).map(|o| Value::Bool(o != Ordering::Greater)),
        BinOp::Gt => compare(&l, &r).map(|o| Value::Bool(o == Ordering::Greater)),
        BinOp::Ge => compare(&l, &r).map(|o| Value::Bool(o != Ordering::Less)),
        BinOp::In => membership(&l, &r),
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn non_bool_operand(op: &str, value: &Value) -> EvalError {
    EvalError::type_mismatch(format!(
        "'{op}' requires bool operands, got {}",
        value.type_name()
    ))
}

/// Numeric view of a value, promoting int to decimal.
pub(crate) fn as_decimal(value: &Value) -> Option<BigDecimal> {
    match value {
        Value::Int(i) => Some(BigDecimal::from_bigint(i.clone())),
        Value::Decimal(d) => Some(d.clone()),
        _ => None,
    }
}

fn numeric_op(
    op: &str,
    l: &Value,
    r: &Value,
    f: impl Fn(&BigDecimal, &BigDecimal) -> BigDecimal,
) -> Result<Value, EvalError> {
    let (a, b) = match (as_decimal(l), as_decimal(r)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(EvalError::type_mismatch(format!(
                "'{op}' requires numbers, got {} and {}",
                l.type_name(),
                r.type_name()
            )))
        }
    };
    Ok(normalize_numeric(f(&a, &b)))
}

/// Collapse an integer-valued decimal back to an int.
fn normalize_numeric(d: BigDecimal) -> Value {
    match d.to_bigint_exact() {
        Some(i) => Value::Int(i),
        None => Value::Decimal(d),
    }
}

fn add(l: &Value, r: &Value) -> Result<Value, EvalError> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
        (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
        (Value::List(a), Value::List(b)) => {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            Ok(Value::List(out))
        }
        _ => numeric_op("+", l, r, |a, b| a.add(b)),
    }
}

fn divide(l: &Value, r: &Value) -> Result<Value, EvalError> {
    if let (Value::Int(a), Value::Int(b)) = (l, r) {
        use num_traits::Zero;
        if b.is_zero() {
            return Err(EvalError::new(
                EvalErrorKind::DivisionByZero,
                "division by zero",
            ));
        }
        if (a % b).is_zero() {
            return Ok(Value::Int(a / b));
        }
    }
    let (a, b) = match (as_decimal(l), as_decimal(r)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(EvalError::type_mismatch(format!(
                "'/' requires numbers, got {} and {}",
                l.type_name(),
                r.type_name()
            )))
        }
    };
    Ok(normalize_numeric(a.div(&b)?))
}

fn modulo(l: &Value, r: &Value) -> Result<Value, EvalError> {
    use num_traits::Zero;
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => {
            if b.is_zero() {
                return Err(EvalError::new(
                    EvalErrorKind::DivisionByZero,
                    "modulo by zero",
                ));
            }
            Ok(Value::Int(a % b))
        }
        _ => Err(EvalError::type_mismatch(format!(
            "'%' requires integers, got {} and {}",
            l.type_name(),
            r.type_name()
        ))),
    }
}

/// Structural equality, cross-form for numerics (`1 == 1.0`).
pub fn value_equals(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Int(_) | Value::Decimal(_), Value::Int(_) | Value::Decimal(_)) => {
            match (as_decimal(l), as_decimal(r)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        (Value::List(a), Value::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| value_equals(x, y))
        }
        (Value::Map(a), Value::Map(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|w| value_equals(v, w)))
        }
        _ => l == r,
    }
}

fn compare(l: &Value, r: &Value) -> Result<Ordering, EvalError> {
    match (l, r) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => match (as_decimal(l), as_decimal(r)) {
            (Some(a), Some(b)) => Ok(a.cmp(&b)),
            _ => Err(EvalError::type_mismatch(format!(
                "cannot compare {} with {}",
                l.type_name(),
                r.type_name()
            ))),
        },
    }
}

fn membership(l: &Value, r: &Value) -> Result<Value, EvalError> {
    match r {
        Value::List(items) => Ok(Value::Bool(items.iter().any(|item| value_equals(l, item)))),
        Value::Map(map) => match l {
            Value::String(key) => Ok(Value::Bool(map.contains_key(key))),
            other => Err(EvalError::type_mismatch(format!(
                "'in' on a map requires a string key, got {}",
                other.type_name()
            ))),
        },
        other => Err(EvalError::type_mismatch(format!(
            "'in' requires a list or map, got {}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_map;
    use num_bigint::BigInt;

    fn eval(src: &str) -> Value {
        evaluate(src, &Value::empty_map()).unwrap()
    }

    fn eval_with(src: &str, root: &Value) -> Value {
        evaluate(src, root).unwrap()
    }

    #[test]
    fn integer_arithmetic_stays_integral() {
        assert_eq!(eval("2 + 3 * 4"), Value::from(14i64));
        assert_eq!(eval("10 / 2"), Value::from(5i64));
        assert_eq!(eval("10 % 3"), Value::from(1i64));
        assert_eq!(eval("-7 % 3"), Value::from(-1i64));
    }

    #[test]
    fn inexact_integer_division_promotes_or_fails() {
        assert_eq!(
            eval("5 / 2"),
            Value::Decimal(BigDecimal::parse("2.5").unwrap())
        );
        let err = evaluate("1 / 3", &Value::empty_map()).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::NonTerminating);
    }

    #[test]
    fn mixed_arithmetic_promotes_to_decimal() {
        assert_eq!(
            eval("1 + 0.5"),
            Value::Decimal(BigDecimal::parse("1.5").unwrap())
        );
        // Integer-valued results collapse back to int.
        assert_eq!(eval("0.5 + 0.5"), Value::from(1i64));
        assert_eq!(eval("2.5 * 2"), Value::from(5i64));
    }

    #[test]
    fn string_and_list_concatenation() {
        assert_eq!(eval("'foo' + 'bar'"), Value::from("foobar"));
        assert_eq!(
            eval("[1] + [2, 3]"),
            Value::List(vec![Value::from(1i64), Value::from(2i64), Value::from(3i64)])
        );
    }

    #[test]
    fn equality_is_cross_form_for_numerics() {
        assert_eq!(eval("1 == 1.0"), Value::Bool(true));
        assert_eq!(eval("1 == '1'"), Value::Bool(false));
        assert_eq!(eval("[1, 2] == [1.0, 2]"), Value::Bool(true));
        assert_eq!(eval("null == null"), Value::Bool(true));
        assert_eq!(eval("{'a': 1} == {'a': 1.0}"), Value::Bool(true));
    }

    #[test]
    fn comparison_requires_same_family() {
        assert_eq!(eval("1 < 1.5"), Value::Bool(true));
        assert_eq!(eval("'a' < 'b'"), Value::Bool(true));
        assert!(evaluate("1 < 'a'", &Value::empty_map()).is_err());
    }

    #[test]
    fn short_circuit_skips_right_operand() {
        // The right side would error on member access through null.
        let root = value_map! { "a" => false };
        assert_eq!(eval_with("a && missing.x", &root), Value::Bool(false));
        let root = value_map! { "a" => true };
        assert_eq!(eval_with("a || missing.x", &root), Value::Bool(true));
    }

    #[test]
    fn member_access_rules() {
        let root = value_map! { "obj" => value_map! { "x" => 1i64 } };
        assert_eq!(eval_with("obj.x", &root), Value::from(1i64));
        assert_eq!(eval_with("obj.missing", &root), Value::Null);
        assert!(evaluate("nothere.x", &root).is_err());
        assert!(evaluate("obj.x.y", &root).is_err());
    }

    #[test]
    fn indexing_rules() {
        let root = value_map! {
            "list" => Value::List(vec![Value::from(10i64), Value::from(20i64)]),
            "s" => "abc",
            "m" => value_map! { "k" => 5i64 },
        };
        assert_eq!(eval_with("list[1]", &root), Value::from(20i64));
        assert_eq!(eval_with("list[9]", &root), Value::Null);
        assert_eq!(eval_with("s[0]", &root), Value::from("a"));
        assert_eq!(eval_with("s[10]", &root), Value::Null);
        assert_eq!(eval_with("m['k']", &root), Value::from(5i64));
        assert_eq!(eval_with("m['nope']", &root), Value::Null);
        assert!(evaluate("list[-1]", &root).is_err());
    }

    #[test]
    fn ternary_and_membership() {
        assert_eq!(eval("1 < 2 ? 'yes' : 'no'"), Value::from("yes"));
        assert_eq!(eval("2 in [1, 2, 3]"), Value::Bool(true));
        assert_eq!(eval("'k' in {'k': 1}"), Value::Bool(true));
        assert_eq!(eval("4 in [1, 2, 3]"), Value::Bool(false));
    }

    #[test]
    fn receiver_prepend_calls() {
        assert_eq!(eval("'hello'.contains('ell')"), Value::Bool(true));
        assert_eq!(eval("size('abc')"), Value::from(3i64));
    }

    #[test]
    fn big_integers_do_not_overflow() {
        let v = eval("1000000000000000000000 * 1000000000000000000000");
        let expected = BigInt::parse_bytes(b"1000000000000000000000000000000000000000000", 10)
            .unwrap();
        assert_eq!(v, Value::Int(expected));
    }
}

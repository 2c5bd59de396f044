//! Exact decimal arithmetic on arbitrary-precision integers
//!
//! This crate provides [`BigDecimal`], a terminating decimal represented as an
//! unscaled [`BigInt`] plus a base-ten scale. It exists so that financial math
//! in the workflow engine is deterministic by construction: there are no
//! floats anywhere, addition and multiplication are exact, and division either
//! produces a terminating decimal or fails.
//!
//! # Representation
//!
//! A value is `int · 10^-scale`. `1.50` is `{int: 150, scale: 2}` and
//! normalizes to `{int: 15, scale: 1}`. Display always prints the canonical
//! form: no leading zeros (except a single `0`), no trailing fractional
//! zeros, no exponent notation.
//!
//! # Division
//!
//! [`BigDecimal::div`] reduces the fraction to lowest terms and then factors
//! the denominator into powers of 2 and 5. Any other prime factor means the
//! quotient does not terminate and the operation fails with
//! [`DecimalError::NonTerminating`]. Otherwise the result scale is
//! `max(#2s, #5s)` with the numerator padded by the complementary factors.
//!
//! # Example
//!
//! ```
//! use chainflow_decimal::BigDecimal;
//!
//! let a: BigDecimal = "1.5".parse().unwrap();
//! let b: BigDecimal = "0.25".parse().unwrap();
//! assert_eq!(a.add(&b).to_string(), "1.75");
//! assert_eq!(a.div(&b).unwrap().to_string(), "6");
//! assert!("1".parse::<BigDecimal>().unwrap().div(&"3".parse().unwrap()).is_err());
//! ```

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{One, Signed, Zero};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced by decimal parsing and arithmetic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecimalError {
    /// The input string is not a valid decimal literal.
    #[error("invalid decimal literal: {0:?}")]
    InvalidDecimal(String),

    /// The quotient has no terminating decimal expansion.
    #[error("non-terminating decimal: {num} / {den}")]
    NonTerminating {
        /// Reduced numerator.
        num: String,
        /// Reduced denominator.
        den: String,
    },

    /// Division by zero.
    #[error("decimal division by zero")]
    DivisionByZero,
}

/// A terminating decimal: an unscaled integer and a base-ten scale.
///
/// Equality and ordering are value-based: `1.50 == 1.5`. Construction via
/// [`BigDecimal::new`] normalizes eagerly, so two equal values also share a
/// representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BigDecimal {
    int: BigInt,
    scale: u32,
}

impl BigDecimal {
    /// Build a decimal from an unscaled integer and a scale, normalizing
    /// trailing fractional zeros away.
    pub fn new(int: BigInt, scale: u32) -> Self {
        Self { int, scale }.normalized()
    }

    /// Zero.
    pub fn zero() -> Self {
        Self {
            int: BigInt::zero(),
            scale: 0,
        }
    }

    /// An integer-valued decimal.
    pub fn from_bigint(int: BigInt) -> Self {
        Self { int, scale: 0 }
    }

    /// The unscaled integer.
    pub fn unscaled(&self) -> &BigInt {
        &self.int
    }

    /// The scale (number of fractional digits in the normalized form).
    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Parse a decimal literal.
    ///
    /// Accepts an optional leading `-`, one or more digits, and an optional
    /// `.` followed by one or more digits. Exponent notation, internal
    /// whitespace, a leading or trailing `.`, and an empty fractional part
    /// are all rejected.
    pub fn parse(s: &str) -> Result<Self, DecimalError> {
        let invalid = || DecimalError::InvalidDecimal(s.to_string());
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => (i, Some(f)),
            None => (body, None),
        };
        if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let frac_part = match frac_part {
            Some(f) if f.is_empty() || !f.bytes().all(|b| b.is_ascii_digit()) => {
                return Err(invalid())
            }
            Some(f) => f,
            None => "",
        };
        let scale = u32::try_from(frac_part.len()).map_err(|_| invalid())?;
        let digits = format!("{int_part}{frac_part}");
        let mut int = BigInt::from_str(&digits).map_err(|_| invalid())?;
        if negative {
            int = -int;
        }
        Ok(Self { int, scale }.normalized())
    }

    /// Strip trailing zeros from the fractional part.
    pub fn normalized(mut self) -> Self {
        if self.int.is_zero() {
            self.scale = 0;
            return self;
        }
        let ten = BigInt::from(10u8);
        while self.scale > 0 {
            let (q, r) = self.int.div_rem(&ten);
            if !r.is_zero() {
                break;
            }
            self.int = q;
            self.scale -= 1;
        }
        self
    }

    /// True when the value is zero.
    pub fn is_zero(&self) -> bool {
        self.int.is_zero()
    }

    /// True when the value is negative.
    pub fn is_negative(&self) -> bool {
        self.int.is_negative()
    }

    /// True when the normalized value has no fractional part.
    pub fn is_integer(&self) -> bool {
        self.scale == 0
    }

    /// The exact integer value, if the decimal has no fractional part.
    pub fn to_bigint_exact(&self) -> Option<BigInt> {
        if self.scale == 0 {
            Some(self.int.clone())
        } else {
            None
        }
    }

    /// Bring both operands to a common scale, returning the aligned unscaled
    /// integers and that scale.
    fn aligned(&self, other: &Self) -> (BigInt, BigInt, u32) {
        let scale = self.scale.max(other.scale);
        let a = &self.int * pow10(scale - self.scale);
        let b = &other.int * pow10(scale - other.scale);
        (a, b, scale)
    }

    /// Exact addition.
    pub fn add(&self, other: &Self) -> Self {
        let (a, b, scale) = self.aligned(other);
        Self { int: a + b, scale }.normalized()
    }

    /// Exact subtraction.
    pub fn sub(&self, other: &Self) -> Self {
        let (a, b, scale) = self.aligned(other);
        Self { int: a - b, scale }.normalized()
    }

    /// Exact multiplication; scales add.
    pub fn mul(&self, other: &Self) -> Self {
        Self {
            int: &self.int * &other.int,
            scale: self.scale + other.scale,
        }
        .normalized()
    }

    /// Negation.
    pub fn neg(&self) -> Self {
        Self {
            int: -&self.int,
            scale: self.scale,
        }
    }

    /// Absolute value.
    pub fn abs(&self) -> Self {
        Self {
            int: self.int.abs(),
            scale: self.scale,
        }
    }

    /// Exact division, failing when the quotient does not terminate.
    ///
    /// The fraction `self / other` is first reduced to lowest terms. The
    /// reduced denominator must factor entirely into 2s and 5s; the result
    /// scale is the larger exponent and the numerator is padded by the
    /// complementary factors.
    pub fn div(&self, other: &Self) -> Result<Self, DecimalError> {
        if other.int.is_zero() {
            return Err(DecimalError::DivisionByZero);
        }
        // self / other == (a · 10^ob) / (b · 10^oa) after alignment; aligning
        // first keeps the fraction in plain integers.
        let (a, b, _) = self.aligned(other);
        let g = a.gcd(&b);
        let mut num = &a / &g;
        let mut den = &b / &g;
        if den.is_negative() {
            num = -num;
            den = -den;
        }
        let two = BigInt::from(2u8);
        let five = BigInt::from(5u8);
        let mut twos = 0u32;
        let mut fives = 0u32;
        while (&den % &two).is_zero() {
            den /= &two;
            twos += 1;
        }
        while (&den % &five).is_zero() {
            den /= &five;
            fives += 1;
        }
        if !den.is_one() {
            return Err(DecimalError::NonTerminating {
                num: num.to_string(),
                den: (&b / &g).abs().to_string(),
            });
        }
        let scale = twos.max(fives);
        // Pad the numerator so the denominator becomes exactly 10^scale.
        let pad = two.pow(scale - twos) * five.pow(scale - fives);
        Ok(Self {
            int: num * pad,
            scale,
        }
        .normalized())
    }

    /// Truncated quotient and non-negative remainder against `10^scale`.
    fn split(&self) -> (BigInt, BigInt) {
        if self.scale == 0 {
            return (self.int.clone(), BigInt::zero());
        }
        let p = pow10(self.scale);
        let q = &self.int / &p;
        let r = (&self.int % &p).abs();
        (q, r)
    }

    /// Largest integer not greater than the value.
    pub fn floor(&self) -> BigInt {
        let (q, r) = self.split();
        if self.int.is_negative() && !r.is_zero() {
            q - 1
        } else {
            q
        }
    }

    /// Smallest integer not less than the value.
    pub fn ceil(&self) -> BigInt {
        let (q, r) = self.split();
        if self.int.is_positive() && !r.is_zero() {
            q + 1
        } else {
            q
        }
    }

    /// Round half away from zero.
    pub fn round(&self) -> BigInt {
        let (q, r) = self.split();
        if self.scale == 0 {
            return q;
        }
        let half = pow10(self.scale) / 2;
        if r >= half {
            if self.int.is_negative() {
                q - 1
            } else {
                q + 1
            }
        } else {
            q
        }
    }

    /// Shift the decimal point right by `digits` (multiply by `10^digits`).
    pub fn shift_left(&self, digits: u32) -> Self {
        if self.scale >= digits {
            Self {
                int: self.int.clone(),
                scale: self.scale - digits,
            }
            .normalized()
        } else {
            Self {
                int: &self.int * pow10(digits - self.scale),
                scale: 0,
            }
        }
    }

    /// Shift the decimal point left by `digits` (divide by `10^digits`,
    /// always exact).
    pub fn shift_right(&self, digits: u32) -> Self {
        Self {
            int: self.int.clone(),
            scale: self.scale + digits,
        }
        .normalized()
    }

}

fn pow10(exp: u32) -> BigInt {
    BigInt::from(10u8).pow(exp)
}

impl fmt::Display for BigDecimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let norm = self.clone().normalized();
        if norm.scale == 0 {
            return write!(f, "{}", norm.int);
        }
        let digits = norm.int.abs().to_string();
        let scale = norm.scale as usize;
        let sign = if norm.int.is_negative() { "-" } else { "" };
        if digits.len() > scale {
            let (int_part, frac_part) = digits.split_at(digits.len() - scale);
            write!(f, "{sign}{int_part}.{frac_part}")
        } else {
            write!(f, "{sign}0.{}{digits}", "0".repeat(scale - digits.len()))
        }
    }
}

impl FromStr for BigDecimal {
    type Err = DecimalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BigDecimal {
    type Error = DecimalError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<BigDecimal> for String {
    fn from(d: BigDecimal) -> Self {
        d.to_string()
    }
}

impl From<BigInt> for BigDecimal {
    fn from(int: BigInt) -> Self {
        Self::from_bigint(int)
    }
}

impl From<i64> for BigDecimal {
    fn from(v: i64) -> Self {
        Self::from_bigint(BigInt::from(v))
    }
}

impl PartialEq for BigDecimal {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BigDecimal {}

impl PartialOrd for BigDecimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BigDecimal {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b, _) = self.aligned(other);
        a.cmp(&b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::parse(s).unwrap()
    }

    #[test]
    fn parse_and_display_canonicalize() {
        assert_eq!(dec("1.50").to_string(), "1.5");
        assert_eq!(dec("007").to_string(), "7");
        assert_eq!(dec("-0.250").to_string(), "-0.25");
        assert_eq!(dec("0.00").to_string(), "0");
        assert_eq!(dec("0.001").to_string(), "0.001");
        assert_eq!(dec("-12.0034").to_string(), "-12.0034");
    }

    #[test]
    fn parse_rejects_malformed_literals() {
        for bad in [
            "", "-", ".", ".5", "5.", "1.", "1..2", "1.2.3", "1e5", "1E5", " 1", "1 ", "+1",
            "1_000", "--1", "1.-2",
        ] {
            assert!(BigDecimal::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn addition_aligns_scales() {
        assert_eq!(dec("1.5").add(&dec("0.25")).to_string(), "1.75");
        assert_eq!(dec("-1.5").add(&dec("1.5")).to_string(), "0");
        assert_eq!(dec("0.1").add(&dec("0.2")).to_string(), "0.3");
    }

    #[test]
    fn subtraction_and_multiplication() {
        assert_eq!(dec("1").sub(&dec("0.001")).to_string(), "0.999");
        assert_eq!(dec("1.5").mul(&dec("1.5")).to_string(), "2.25");
        assert_eq!(dec("-0.5").mul(&dec("0.5")).to_string(), "-0.25");
        assert_eq!(dec("2.50").mul(&dec("4")).to_string(), "10");
    }

    #[test]
    fn division_is_exact_or_fails() {
        assert_eq!(dec("1").div(&dec("4")).unwrap().to_string(), "0.25");
        assert_eq!(dec("3").div(&dec("-8")).unwrap().to_string(), "-0.375");
        assert_eq!(dec("1.5").div(&dec("0.25")).unwrap().to_string(), "6");
        assert_eq!(dec("7").div(&dec("7")).unwrap().to_string(), "1");
        assert!(matches!(
            dec("1").div(&dec("3")),
            Err(DecimalError::NonTerminating { .. })
        ));
        assert!(matches!(
            dec("10").div(&dec("0")),
            Err(DecimalError::DivisionByZero)
        ));
        // 6/3 reduces to 2/1, so the 3 in the denominator is fine.
        assert_eq!(dec("6").div(&dec("3")).unwrap().to_string(), "2");
    }

    #[test]
    fn comparison_aligns_scales() {
        assert_eq!(dec("1.5"), dec("1.50"));
        assert!(dec("1.5") < dec("1.51"));
        assert!(dec("-2") < dec("-1.99"));
        assert!(dec("0.3") > dec("0.29999"));
    }

    #[test]
    fn floor_ceil_round() {
        assert_eq!(dec("2.5").floor(), BigInt::from(2));
        assert_eq!(dec("-2.5").floor(), BigInt::from(-3));
        assert_eq!(dec("2.1").ceil(), BigInt::from(3));
        assert_eq!(dec("-2.1").ceil(), BigInt::from(-2));
        assert_eq!(dec("2").floor(), BigInt::from(2));
        assert_eq!(dec("2").ceil(), BigInt::from(2));

        // Half away from zero.
        assert_eq!(dec("2.5").round(), BigInt::from(3));
        assert_eq!(dec("-2.5").round(), BigInt::from(-3));
        assert_eq!(dec("2.4").round(), BigInt::from(2));
        assert_eq!(dec("-2.4").round(), BigInt::from(-2));
        assert_eq!(dec("0.5").round(), BigInt::from(1));
        assert_eq!(dec("-0.5").round(), BigInt::from(-1));
    }

    #[test]
    fn shifting_moves_the_point() {
        assert_eq!(dec("1.5").shift_left(3).to_string(), "1500");
        assert_eq!(dec("1.5").shift_right(2).to_string(), "0.015");
        assert_eq!(dec("1500").shift_right(3).to_string(), "1.5");
    }

    #[test]
    fn serde_round_trips_as_string() {
        let d = dec("-12.75");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, "\"-12.75\"");
        let back: BigDecimal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    proptest! {
        #[test]
        fn display_parse_round_trip(int in -1_000_000_000i64..1_000_000_000, scale in 0u32..9) {
            let d = BigDecimal::new(BigInt::from(int), scale);
            let back = BigDecimal::parse(&d.to_string()).unwrap();
            prop_assert_eq!(back, d);
        }

        #[test]
        fn add_commutes(a in -1_000_000i64..1_000_000, b in -1_000_000i64..1_000_000,
                        sa in 0u32..6, sb in 0u32..6) {
            let x = BigDecimal::new(BigInt::from(a), sa);
            let y = BigDecimal::new(BigInt::from(b), sb);
            prop_assert_eq!(x.add(&y), y.add(&x));
        }

        #[test]
        fn mul_commutes(a in -100_000i64..100_000, b in -100_000i64..100_000,
                        sa in 0u32..6, sb in 0u32..6) {
            let x = BigDecimal::new(BigInt::from(a), sa);
            let y = BigDecimal::new(BigInt::from(b), sb);
            prop_assert_eq!(x.mul(&y), y.mul(&x));
        }

        #[test]
        fn sub_then_add_restores(a in -1_000_000i64..1_000_000, b in -1_000_000i64..1_000_000,
                                 sa in 0u32..6, sb in 0u32..6) {
            let x = BigDecimal::new(BigInt::from(a), sa);
            let y = BigDecimal::new(BigInt::from(b), sb);
            prop_assert_eq!(x.sub(&y).add(&y), x);
        }
    }
}

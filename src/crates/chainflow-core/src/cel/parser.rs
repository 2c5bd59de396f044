//! Recursive-descent parser for the CEL expression subset.
//!
//! Precedence, low to high: ternary, `||`, `&&`, `in`, equality,
//! relational, additive, multiplicative, unary, postfix
//! (member / index / call).

use super::lexer::{tokenize, Token, TokenKind};
use crate::error::EvalError;
use crate::value::Value;
use chainflow_decimal::BigDecimal;
use num_bigint::BigInt;
use std::str::FromStr;

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    In,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal value (int, decimal, string, bool, null).
    Literal(Value),
    /// A bare identifier resolved against the evaluation root.
    Ident(String),
    /// Binary operation.
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Unary operation.
    Unary { op: UnOp, expr: Box<Expr> },
    /// Member access `obj.prop`.
    Member { object: Box<Expr>, property: String },
    /// Index access `obj[idx]`.
    Index { object: Box<Expr>, index: Box<Expr> },
    /// Function call. `"s".contains(x)` parses as a call on a member and is
    /// rewritten to `contains("s", x)` at evaluation.
    Call { callee: Box<Expr>, args: Vec<Expr> },
    /// Ternary `c ? t : e`.
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// List literal.
    List(Vec<Expr>),
    /// Map literal with expression keys.
    Map(Vec<(Expr, Expr)>),
}

/// Parse a CEL source string into an expression tree.
pub fn parse(source: &str) -> Result<Expr, EvalError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
    };
    let expr = parser.ternary()?;
    if let Some(token) = parser.peek() {
        return Err(parser.err_at(token.pos, "unexpected trailing tokens"));
    }
    Ok(expr)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().map(|t| &t.kind) == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), EvalError> {
        if self.eat(&kind) {
            Ok(())
        } else {
            let pos = self.peek().map(|t| t.pos).unwrap_or(self.source.len());
            Err(self.err_at(pos, format!("expected {what}")))
        }
    }

    fn err_at(&self, pos: usize, message: impl Into<String>) -> EvalError {
        EvalError::cel(
            self.source,
            format!("{} at position {pos}", message.into()),
        )
    }

    fn ternary(&mut self) -> Result<Expr, EvalError> {
        let cond = self.or()?;
        if self.eat(&TokenKind::Question) {
            let then = self.ternary()?;
            self.expect(TokenKind::Colon, "':' in ternary")?;
            let otherwise = self.ternary()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(cond)
    }

    fn or(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.and()?;
        while self.eat(&TokenKind::OrOr) {
            let right = self.and()?;
            left = Expr::Binary {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.membership()?;
        while self.eat(&TokenKind::AndAnd) {
            let right = self.membership()?;
            left = Expr::Binary {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn membership(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.equality()?;
        while self.eat(&TokenKind::In) {
            let right = self.equality()?;
            left = Expr::Binary {
                op: BinOp::In,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.relational()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::EqEq) => BinOp::Eq,
                Some(TokenKind::NotEq) => BinOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let right = self.relational()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn relational(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Lt) => BinOp::Lt,
                Some(TokenKind::Le) => BinOp::Le,
                Some(TokenKind::Gt) => BinOp::Gt,
                Some(TokenKind::Ge) => BinOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let right = self.additive()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Plus) => BinOp::Add,
                Some(TokenKind::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Star) => BinOp::Mul,
                Some(TokenKind::Slash) => BinOp::Div,
                Some(TokenKind::Percent) => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        if self.eat(&TokenKind::Bang) {
            return Ok(Expr::Unary {
                op: UnOp::Not,
                expr: Box::new(self.unary()?),
            });
        }
        if self.eat(&TokenKind::Minus) {
            return Ok(Expr::Unary {
                op: UnOp::Neg,
                expr: Box::new(self.unary()?),
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&TokenKind::Dot) {
                let pos = self.peek().map(|t| t.pos).unwrap_or(self.source.len());
                match self.advance().map(|t| t.kind) {
                    Some(TokenKind::Ident(name)) => {
                        expr = Expr::Member {
                            object: Box::new(expr),
                            property: name,
                        };
                    }
                    Some(TokenKind::Int(digits)) => {
                        // Numeric member access doubles as list indexing in
                        // dotted runtime paths.
                        expr = Expr::Member {
                            object: Box::new(expr),
                            property: digits,
                        };
                    }
                    _ => return Err(self.err_at(pos, "expected member name after '.'")),
                }
            } else if self.eat(&TokenKind::LBracket) {
                let index = self.ternary()?;
                self.expect(TokenKind::RBracket, "']' after index")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat(&TokenKind::LParen) {
                let mut args = Vec::new();
                if !self.eat(&TokenKind::RParen) {
                    loop {
                        args.push(self.ternary()?);
                        if self.eat(&TokenKind::Comma) {
                            continue;
                        }
                        self.expect(TokenKind::RParen, "')' after call arguments")?;
                        break;
                    }
                }
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, EvalError> {
        let pos = self.peek().map(|t| t.pos).unwrap_or(self.source.len());
        let token = self
            .advance()
            .ok_or_else(|| self.err_at(pos, "unexpected end of expression"))?;
        match token.kind {
            TokenKind::Int(digits) => Ok(Expr::Literal(Value::Int(
                BigInt::from_str(&digits)
                    .map_err(|_| self.err_at(token.pos, "invalid integer literal"))?,
            ))),
            TokenKind::Decimal(text) => Ok(Expr::Literal(Value::Decimal(
                BigDecimal::parse(&text)
                    .map_err(|_| self.err_at(token.pos, "invalid decimal literal"))?,
            ))),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::String(s))),
            TokenKind::True => Ok(Expr::Literal(Value::Bool(true))),
            TokenKind::False => Ok(Expr::Literal(Value::Bool(false))),
            TokenKind::Null => Ok(Expr::Literal(Value::Null)),
            TokenKind::Ident(name) => Ok(Expr::Ident(name)),
            TokenKind::LParen => {
                let inner = self.ternary()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                let mut elems = Vec::new();
                if !self.eat(&TokenKind::RBracket) {
                    loop {
                        elems.push(self.ternary()?);
                        if self.eat(&TokenKind::Comma) {
                            if self.eat(&TokenKind::RBracket) {
                                break;
                            }
                            continue;
                        }
                        self.expect(TokenKind::RBracket, "']' after list")?;
                        break;
                    }
                }
                Ok(Expr::List(elems))
            }
            TokenKind::LBrace => {
                let mut entries = Vec::new();
                if !self.eat(&TokenKind::RBrace) {
                    loop {
                        let key = self.ternary()?;
                        self.expect(TokenKind::Colon, "':' in map entry")?;
                        let value = self.ternary()?;
                        entries.push((key, value));
                        if self.eat(&TokenKind::Comma) {
                            if self.eat(&TokenKind::RBrace) {
                                break;
                            }
                            continue;
                        }
                        self.expect(TokenKind::RBrace, "'}' after map")?;
                        break;
                    }
                }
                Ok(Expr::Map(entries))
            }
            other => Err(self.err_at(token.pos, format!("unexpected token {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(src: &str) -> Expr {
        parse(src).unwrap()
    }

    #[test]
    fn precedence_ternary_lowest() {
        // a || b ? c : d  ==  (a || b) ? c : d
        match p("a || b ? c : d") {
            Expr::Ternary { cond, .. } => {
                assert!(matches!(*cond, Expr::Binary { op: BinOp::Or, .. }))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn multiplicative_binds_tighter_than_additive() {
        match p("1 + 2 * 3") {
            Expr::Binary {
                op: BinOp::Add,
                right,
                ..
            } => assert!(matches!(*right, Expr::Binary { op: BinOp::Mul, .. })),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn in_binds_looser_than_equality() {
        // a in b == c  ==  a in (b == c)
        match p("a in b == c") {
            Expr::Binary {
                op: BinOp::In,
                right,
                ..
            } => assert!(matches!(*right, Expr::Binary { op: BinOp::Eq, .. })),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn postfix_chains() {
        match p("a.b[0].c(1, 2)") {
            Expr::Call { callee, args } => {
                assert_eq!(args.len(), 2);
                assert!(matches!(*callee, Expr::Member { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn list_and_map_literals() {
        assert!(matches!(p("[1, 2, 3]"), Expr::List(v) if v.len() == 3));
        assert!(matches!(p("{'a': 1, 'b': 2}"), Expr::Map(v) if v.len() == 2));
        assert!(matches!(p("[]"), Expr::List(v) if v.is_empty()));
        assert!(matches!(p("{}"), Expr::Map(v) if v.is_empty()));
    }

    #[test]
    fn unary_nesting() {
        assert!(matches!(
            p("!!a"),
            Expr::Unary {
                op: UnOp::Not,
                ..
            }
        ));
        assert!(matches!(p("-5"), Expr::Unary { op: UnOp::Neg, .. }));
    }

    #[test]
    fn rejects_trailing_tokens_and_bad_syntax() {
        assert!(parse("1 2").is_err());
        assert!(parse("a ?").is_err());
        assert!(parse("(a").is_err());
        assert!(parse("a.").is_err());
        assert!(parse("[1,").is_err());
        assert!(parse("").is_err());
    }
}

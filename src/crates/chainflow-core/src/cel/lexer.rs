//! Tokenizer for the CEL expression subset.
//!
//! Positions are byte offsets into the source and are preserved on every
//! token so parse and evaluation errors can point at the offending spot.

use crate::error::{EvalError, EvalErrorKind};

/// A lexical token kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    /// Integer literal (digits only).
    Int(String),
    /// Decimal literal (`digits.digits`).
    Decimal(String),
    /// String literal, escapes already processed.
    Str(String),
    /// Identifier.
    Ident(String),
    /// `true`
    True,
    /// `false`
    False,
    /// `null`
    Null,
    /// `in`
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Question,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
}

/// A token with its source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Token kind.
    pub kind: TokenKind,
    /// Byte offset of the token start.
    pub pos: usize,
}

fn err(expr: &str, pos: usize, message: impl Into<String>) -> EvalError {
    EvalError::cel(expr, format!("{} at position {pos}", message.into()))
}

/// Tokenize a CEL source string.
pub fn tokenize(source: &str) -> Result<Vec<Token>, EvalError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        let b = bytes[i];
        let kind = match b {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'(' => {
                i += 1;
                TokenKind::LParen
            }
            b')' => {
                i += 1;
                TokenKind::RParen
            }
            b'[' => {
                i += 1;
                TokenKind::LBracket
            }
            b']' => {
                i += 1;
                TokenKind::RBracket
            }
            b'{' => {
                i += 1;
                TokenKind::LBrace
            }
            b'}' => {
                i += 1;
                TokenKind::RBrace
            }
            b',' => {
                i += 1;
                TokenKind::Comma
            }
            b':' => {
                i += 1;
                TokenKind::Colon
            }
            b'.' => {
                i += 1;
                TokenKind::Dot
            }
            b'?' => {
                i += 1;
                TokenKind::Question
            }
            b'+' => {
                i += 1;
                TokenKind::Plus
            }
            b'-' => {
                i += 1;
                TokenKind::Minus
            }
            b'*' => {
                i += 1;
                TokenKind::Star
            }
            b'/' => {
                i += 1;
                TokenKind::Slash
            }
            b'%' => {
                i += 1;
                TokenKind::Percent
            }
            b'=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    i += 2;
                    TokenKind::EqEq
                } else {
                    return Err(err(source, i, "expected '==' "));
                }
            }
            b'!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    i += 2;
                    TokenKind::NotEq
                } else {
                    i += 1;
                    TokenKind::Bang
                }
            }
            b'<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    i += 2;
                    TokenKind::Le
                } else {
                    i += 1;
                    TokenKind::Lt
                }
            }
            b'>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    i += 2;
                    TokenKind::Ge
                } else {
                    i += 1;
                    TokenKind::Gt
                }
            }
            b'&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    i += 2;
                    TokenKind::AndAnd
                } else {
                    return Err(err(source, i, "expected '&&'"));
                }
            }
            b'|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    i += 2;
                    TokenKind::OrOr
                } else {
                    return Err(err(source, i, "expected '||'"));
                }
            }
            b'\'' | b'"' => {
                let quote = b;
                i += 1;
                let mut out = String::new();
                loop {
                    match bytes.get(i) {
                        None => return Err(err(source, start, "unterminated string")),
                        Some(&c) if c == quote => {
                            i += 1;
                            break;
                        }
                        Some(b'\\') => {
                            let escaped = match bytes.get(i + 1) {
                                Some(b'n') => '\n',
                                Some(b't') => '\t',
                                Some(b'r') => '\r',
                                Some(b'\\') => '\\',
                                Some(b'"') => '"',
                                Some(b'\'') => '\'',
                                _ => return Err(err(source, i, "unknown escape sequence")),
                            };
                            out.push(escaped);
                            i += 2;
                        }
                        Some(_) => match source[i..].chars().next() {
                            Some(ch) => {
                                out.push(ch);
                                i += ch.len_utf8();
                            }
                            None => return Err(err(source, start, "unterminated string")),
                        },
                    }
                }
                TokenKind::Str(out)
            }
            b'0'..=b'9' => {
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if bytes.get(i) == Some(&b'.')
                    && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)
                {
                    i += 1;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                    TokenKind::Decimal(source[start..i].to_string())
                } else {
                    TokenKind::Int(source[start..i].to_string())
                }
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                match &source[start..i] {
                    "true" => TokenKind::True,
                    "false" => TokenKind::False,
                    "null" => TokenKind::Null,
                    "in" => TokenKind::In,
                    ident => TokenKind::Ident(ident.to_string()),
                }
            }
            other => {
                return Err(err(
                    source,
                    i,
                    format!("unexpected character {:?}", other as char),
                ))
            }
        };
        tokens.push(Token { kind, pos: start });
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn numbers_split_int_and_decimal() {
        assert_eq!(
            kinds("1 2.5 100"),
            vec![
                TokenKind::Int("1".into()),
                TokenKind::Decimal("2.5".into()),
                TokenKind::Int("100".into()),
            ]
        );
    }

    #[test]
    fn member_access_is_dot_not_decimal() {
        assert_eq!(
            kinds("a.1"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Dot,
                TokenKind::Int("1".into()),
            ]
        );
    }

    #[test]
    fn strings_handle_both_quotes_and_escapes() {
        assert_eq!(kinds(r#""a\nb""#), vec![TokenKind::Str("a\nb".into())]);
        assert_eq!(kinds(r#"'it\'s'"#), vec![TokenKind::Str("it's".into())]);
        assert_eq!(kinds(r#""\\\"""#), vec![TokenKind::Str("\\\"".into())]);
    }

    #[test]
    fn two_char_operators() {
        assert_eq!(
            kinds("== != <= >= && ||"),
            vec![
                TokenKind::EqEq,
                TokenKind::NotEq,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::AndAnd,
                TokenKind::OrOr,
            ]
        );
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("true false null in input"),
            vec![
                TokenKind::True,
                TokenKind::False,
                TokenKind::Null,
                TokenKind::In,
                TokenKind::Ident("input".into()),
            ]
        );
    }

    #[test]
    fn positions_are_byte_offsets() {
        let tokens = tokenize("a + b").unwrap();
        assert_eq!(tokens[0].pos, 0);
        assert_eq!(tokens[1].pos, 2);
        assert_eq!(tokens[2].pos, 4);
    }

    #[test]
    fn rejects_unknown_characters_and_bad_escapes() {
        assert!(tokenize("a # b").is_err());
        assert!(tokenize("'abc").is_err());
        assert!(tokenize(r#""\q""#).is_err());
        assert!(tokenize("a = b").is_err());
        assert!(tokenize("a & b").is_err());
    }
}

//! CEL expression subset
//!
//! A small, deterministic expression language evaluated over a snapshot of
//! the runtime tree. Numbers are unbounded integers and terminating
//! decimals - never floats - so the same expression over the same runtime
//! always produces the same value.
//!
//! ```
//! use chainflow_core::cel;
//! use chainflow_core::value_map;
//!
//! let root = value_map! { "inputs" => value_map! { "amount" => "1.5" } };
//! let out = cel::evaluate("to_atomic(inputs.amount, 18)", &root).unwrap();
//! assert_eq!(out.to_string(), "1500000000000000000");
//! ```

pub mod builtins;
pub mod eval;
pub mod lexer;
pub mod parser;

pub use eval::{evaluate, evaluate_expr, value_equals};
pub use parser::{parse, BinOp, Expr, UnOp};

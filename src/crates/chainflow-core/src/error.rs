//! Error types for plan compilation, evaluation, and engine execution
//!
//! The engine never uses panics or catch-all exceptions for control flow:
//! every failure is a typed value. [`EvalError`] covers ValueRef and CEL
//! evaluation and carries a closed [`EvalErrorKind`] plus the offending path
//! or expression, so readiness computation can classify failures (a
//! `MissingRef` becomes a `missing_refs` entry, anything else a readiness
//! error). [`CompileError`] covers the pure plan-node → chain-request
//! transforms and names the offending field (`args.amount`,
//! `accounts.source.pubkey`). [`EngineError`] is the top-level union the
//! scheduler reports through `error` events.

use thiserror::Error;

/// Convenience result type using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Closed classification of evaluation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalErrorKind {
    /// A `ref` path names a segment absent from the runtime tree.
    MissingRef,
    /// An operand or argument has the wrong type.
    TypeMismatch,
    /// CEL syntax or evaluation failure.
    CelError,
    /// A conversion would silently drop fractional digits.
    Truncation,
    /// A decimal literal failed to parse.
    InvalidDecimal,
    /// Division by zero.
    DivisionByZero,
    /// A quotient has no terminating decimal expansion.
    NonTerminating,
    /// A `detect` reference cannot be resolved in this mode.
    DetectUnsupported,
    /// Unknown function in a CEL call.
    UnknownFunction,
    /// An argument is out of the function's domain.
    InvalidArgument,
    /// A patch or reference path is malformed.
    InvalidPath,
}

/// A typed evaluation failure with the offending path or expression.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[error("{message}{}", path.as_ref().map(|p| format!(" (at {p})")).unwrap_or_default())]
pub struct EvalError {
    /// What went wrong.
    pub kind: EvalErrorKind,
    /// Dotted runtime path, field path, or source expression.
    pub path: Option<String>,
    /// Human-readable description.
    pub message: String,
}

impl EvalError {
    /// Create an evaluation error.
    pub fn new(kind: EvalErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: None,
            message: message.into(),
        }
    }

    /// Attach the offending path.
    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// A missing `ref` path.
    pub fn missing_ref(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            kind: EvalErrorKind::MissingRef,
            message: format!("missing runtime reference {path:?}"),
            path: Some(path),
        }
    }

    /// A type mismatch.
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(EvalErrorKind::TypeMismatch, message)
    }

    /// A CEL failure for the given source expression.
    pub fn cel(expr: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: EvalErrorKind::CelError,
            path: Some(expr.into()),
            message: message.into(),
        }
    }
}

impl From<chainflow_decimal::DecimalError> for EvalError {
    fn from(err: chainflow_decimal::DecimalError) -> Self {
        use chainflow_decimal::DecimalError;
        let kind = match &err {
            DecimalError::InvalidDecimal(_) => EvalErrorKind::InvalidDecimal,
            DecimalError::NonTerminating { .. } => EvalErrorKind::NonTerminating,
            DecimalError::DivisionByZero => EvalErrorKind::DivisionByZero,
        };
        Self::new(kind, err.to_string())
    }
}

/// A failure while compiling a plan node into a concrete chain request.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[error("compile error{}: {message}", field.as_ref().map(|f| format!(" at {f}")).unwrap_or_default())]
pub struct CompileError {
    /// The offending spec field (`args.amount`, `accounts.source.pubkey`).
    pub field: Option<String>,
    /// Human-readable description.
    pub message: String,
}

impl CompileError {
    /// Create a compile error without field context.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }

    /// Create a compile error naming the offending field.
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            message: message.into(),
        }
    }
}

impl From<EvalError> for CompileError {
    fn from(err: EvalError) -> Self {
        Self {
            field: err.path.clone(),
            message: err.to_string(),
        }
    }
}

/// Executor failure reported back to the scheduler.
///
/// Executor errors are always classified retryable: retries are owned by the
/// executor itself, and the scheduler merely reports and (under
/// `stop_on_error`) halts.
#[derive(Debug, Clone, Error)]
#[error("executor error: {message}")]
pub struct ExecutorError {
    /// Human-readable description.
    pub message: String,
}

impl ExecutorError {
    /// Create an executor error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Plan structure is invalid (duplicate ids, unknown deps, cycles).
    #[error("plan validation failed: {0}")]
    Validation(String),

    /// ValueRef or CEL evaluation failed.
    #[error(transparent)]
    Eval(#[from] EvalError),

    /// A compiler rejected a node.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// A policy constraint hard-blocked a write.
    #[error("policy violation: {reason}")]
    Policy {
        /// Why the write was blocked.
        reason: String,
    },

    /// An executor failed.
    #[error("node '{node}' failed: {source}")]
    Executor {
        /// The failing node.
        node: String,
        /// The underlying executor error.
        source: ExecutorError,
    },

    /// A node's `assert` evaluated to false.
    #[error("node '{node}' assert failed: {message}")]
    AssertFailed {
        /// The failing node.
        node: String,
        /// The configured assert message or a default.
        message: String,
    },

    /// No runnable node, nothing in flight, nothing paused.
    #[error("deadlock: nodes {pending:?} can never become runnable")]
    Deadlock {
        /// Nodes that remain incomplete.
        pending: Vec<String>,
    },

    /// Checkpoint persistence failed.
    #[error(transparent)]
    Checkpoint(#[from] chainflow_checkpoint::CheckpointError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_error_display_includes_path() {
        let err = EvalError::missing_ref("inputs.to");
        assert_eq!(err.kind, EvalErrorKind::MissingRef);
        assert!(err.to_string().contains("inputs.to"));
    }

    #[test]
    fn compile_error_display_includes_field() {
        let err = CompileError::field("args.amount", "expected integer");
        assert_eq!(
            err.to_string(),
            "compile error at args.amount: expected integer"
        );
    }
}

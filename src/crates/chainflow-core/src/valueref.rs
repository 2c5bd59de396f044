//! Lazy value references
//!
//! A [`ValueRef`] is a tagged, lazily-evaluated expression over the runtime
//! tree: a literal, a dotted reference, a recursively-built object or array,
//! a CEL expression, or a deferred `detect` lookup. Evaluation is pure
//! except for `detect`, which may consult an external [`DetectResolver`]
//! asynchronously; the synchronous path only supports the `choose_one` kind.
//!
//! The effective evaluation root is the runtime's top level with the keys of
//! `root_overrides` shadowing - this is how a node's resolved `params` are
//! injected during compile and calculated-field evaluation.

use crate::error::{EvalError, EvalErrorKind};
use crate::runtime::RuntimeTree;
use crate::value::Value;
use crate::cel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A deferred detection request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectSpec {
    /// Detection kind (`choose_one`, `token_metadata`, `quote`, ...).
    pub kind: String,
    /// Optional provider hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Optional chain scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
    /// Candidate values for `choose_one`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<Value>>,
}

/// A tagged lazy expression resolvable against the runtime tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueRef {
    /// An arbitrary literal, returned as-is.
    Lit(Value),
    /// A dotted path into the runtime tree.
    #[serde(rename = "ref")]
    Ref(String),
    /// Recursively build a map.
    Object(BTreeMap<String, ValueRef>),
    /// Recursively build a list.
    Array(Vec<ValueRef>),
    /// Evaluate a CEL expression against the effective root.
    Cel(String),
    /// Defer to a detect resolver.
    Detect(DetectSpec),
}

impl ValueRef {
    /// A literal reference.
    pub fn lit(value: impl Into<Value>) -> Self {
        ValueRef::Lit(value.into())
    }

    /// A runtime path reference.
    pub fn path(path: impl Into<String>) -> Self {
        ValueRef::Ref(path.into())
    }

    /// A CEL expression reference.
    pub fn cel(expr: impl Into<String>) -> Self {
        ValueRef::Cel(expr.into())
    }

    /// Whether this reference (recursively) contains a `detect` node.
    pub fn contains_detect(&self) -> bool {
        match self {
            ValueRef::Detect(_) => true,
            ValueRef::Object(map) => map.values().any(ValueRef::contains_detect),
            ValueRef::Array(items) => items.iter().any(ValueRef::contains_detect),
            _ => false,
        }
    }
}

/// External resolver for non-`choose_one` detect kinds.
#[async_trait]
pub trait DetectResolver: Send + Sync {
    /// Resolve a detect request against the current runtime.
    async fn resolve(&self, spec: &DetectSpec, runtime: &RuntimeTree)
        -> Result<Value, EvalError>;
}

/// Evaluation context: the runtime plus optional top-level shadowing.
pub struct EvalContext<'a> {
    /// The runtime tree.
    pub runtime: &'a RuntimeTree,
    /// Top-level keys shadowing the runtime root.
    pub root_overrides: Option<&'a BTreeMap<String, Value>>,
}

impl<'a> EvalContext<'a> {
    /// Context without overrides.
    pub fn new(runtime: &'a RuntimeTree) -> Self {
        Self {
            runtime,
            root_overrides: None,
        }
    }

    /// Context with top-level overrides (typically resolved `params`).
    pub fn with_overrides(
        runtime: &'a RuntimeTree,
        overrides: &'a BTreeMap<String, Value>,
    ) -> Self {
        Self {
            runtime,
            root_overrides: Some(overrides),
        }
    }

    /// Look up a top-level key, override-first.
    fn top(&self, key: &str) -> Option<Value> {
        if let Some(overrides) = self.root_overrides {
            if let Some(v) = overrides.get(key) {
                return Some(v.clone());
            }
        }
        self.runtime.top_level().get(key).cloned()
    }

    /// Materialize the effective root as one map value (for CEL).
    pub fn effective_root(&self) -> Value {
        let mut root = self.runtime.top_level().clone();
        if let Some(overrides) = self.root_overrides {
            for (k, v) in overrides {
                root.insert(k.clone(), v.clone());
            }
        }
        Value::Map(root)
    }

    fn resolve_path(&self, path: &str) -> Result<Value, EvalError> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let top = self.top(head).ok_or_else(|| EvalError::missing_ref(path))?;
        match rest {
            None => Ok(top),
            Some(rest) => top
                .get_path(rest)
                .cloned()
                .ok_or_else(|| EvalError::missing_ref(path)),
        }
    }
}

fn choose_one(spec: &DetectSpec) -> Option<Value> {
    if spec.kind != "choose_one" {
        return None;
    }
    spec.candidates.as_ref().and_then(|c| c.first()).cloned()
}

/// Evaluate a reference synchronously. `detect` is only supported for the
/// `choose_one` kind; any other kind requires [`evaluate_value_ref_async`].
pub fn evaluate_value_ref(vref: &ValueRef, ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
    match vref {
        ValueRef::Lit(value) => Ok(value.clone()),
        ValueRef::Ref(path) => ctx.resolve_path(path),
        ValueRef::Object(map) => {
            let mut out = BTreeMap::new();
            for (key, inner) in map {
                out.insert(key.clone(), evaluate_value_ref(inner, ctx)?);
            }
            Ok(Value::Map(out))
        }
        ValueRef::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for inner in items {
                out.push(evaluate_value_ref(inner, ctx)?);
            }
            Ok(Value::List(out))
        }
        ValueRef::Cel(expr) => cel::evaluate(expr, &ctx.effective_root()),
        ValueRef::Detect(spec) => choose_one(spec).ok_or_else(|| {
            EvalError::new(
                EvalErrorKind::DetectUnsupported,
                format!(
                    "detect kind {:?} requires an async detect resolver",
                    spec.kind
                ),
            )
        }),
    }
}

/// Evaluate a reference, awaiting a [`DetectResolver`] for detect kinds
/// beyond `choose_one`. For detect-free references this agrees with
/// [`evaluate_value_ref`] exactly.
pub async fn evaluate_value_ref_async(
    vref: &ValueRef,
    ctx: &EvalContext<'_>,
    detect: Option<&dyn DetectResolver>,
) -> Result<Value, EvalError> {
    match vref {
        ValueRef::Object(map) => {
            let mut out = BTreeMap::new();
            for (key, inner) in map {
                out.insert(
                    key.clone(),
                    Box::pin(evaluate_value_ref_async(inner, ctx, detect)).await?,
                );
            }
            Ok(Value::Map(out))
        }
        ValueRef::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for inner in items {
                out.push(Box::pin(evaluate_value_ref_async(inner, ctx, detect)).await?);
            }
            Ok(Value::List(out))
        }
        ValueRef::Detect(spec) => {
            if let Some(value) = choose_one(spec) {
                return Ok(value);
            }
            match detect {
                Some(resolver) => resolver.resolve(spec, ctx.runtime).await,
                None => Err(EvalError::new(
                    EvalErrorKind::DetectUnsupported,
                    format!("no detect resolver for kind {:?}", spec.kind),
                )),
            }
        }
        other => evaluate_value_ref(other, ctx),
    }
}

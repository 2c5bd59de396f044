//! Node readiness classification
//!
//! Before a node can execute, every ValueRef field of its execution spec
//! must resolve against the runtime. [`compute_readiness`] classifies a node
//! as ready, blocked, or skipped and reports why: missing `ref` paths go to
//! `missing_refs`, evaluation failures to `errors`, and an unresolvable
//! `detect` sets `needs_detect`. A ready node always has empty diagnostics
//! and fully resolved params.
//!
//! Skips come from two places: the node's `condition` evaluating to false,
//! and the cooperative cancellation flag
//! `policy.runner_cancelled_by_node.<id>`.

use crate::error::EvalErrorKind;
use crate::plan::PlanNode;
use crate::runtime::RuntimeTree;
use crate::value::Value;
use crate::valueref::{
    evaluate_value_ref, evaluate_value_ref_async, DetectResolver, EvalContext, ValueRef,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Readiness state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyState {
    /// All inputs resolve; the node can execute.
    Ready,
    /// Some input is missing or failed to evaluate.
    Blocked,
    /// The node's condition ruled it out.
    Skipped,
}

/// Readiness of a node, with diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Readiness {
    /// Classification.
    pub state: ReadyState,
    /// `ref` paths that did not resolve.
    pub missing_refs: Vec<String>,
    /// Evaluation errors other than missing refs.
    pub errors: Vec<String>,
    /// Resolved spec fields, keyed by field path (`to`, `args.amount`).
    /// Partial when blocked; complete when ready.
    pub resolved_params: BTreeMap<String, Value>,
    /// Whether an async detect resolver is needed to make progress.
    pub needs_detect: bool,
    /// Why the node was skipped, when it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl Readiness {
    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            state: ReadyState::Skipped,
            missing_refs: Vec::new(),
            errors: Vec::new(),
            resolved_params: BTreeMap::new(),
            needs_detect: false,
            skip_reason: Some(reason.into()),
        }
    }

    /// True when the node is ready.
    pub fn is_ready(&self) -> bool {
        self.state == ReadyState::Ready
    }

    /// The resolved params re-nested by their dotted field paths, for use
    /// as a `params` root override (`args.amount` becomes
    /// `params.args.amount`).
    pub fn nested_params(&self) -> BTreeMap<String, Value> {
        let mut root: BTreeMap<String, Value> = BTreeMap::new();
        for (path, value) in &self.resolved_params {
            insert_nested(&mut root, path, value.clone());
        }
        root
    }
}

fn insert_nested(root: &mut BTreeMap<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            root.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = root
                .entry(head.to_string())
                .or_insert_with(Value::empty_map);
            if let Value::Map(map) = entry {
                insert_nested(map, rest, value);
            } else {
                // A scalar already claimed the segment; the scalar wins.
            }
        }
    }
}

fn cancelled(node: &PlanNode, runtime: &RuntimeTree) -> bool {
    runtime
        .get(&format!("policy.runner_cancelled_by_node.{}", node.id))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

enum ConditionOutcome {
    Proceed,
    Skip,
    Error(String),
}

fn check_condition(condition: &ValueRef, ctx: &EvalContext<'_>) -> ConditionOutcome {
    match evaluate_value_ref(condition, ctx) {
        Ok(Value::Bool(true)) => ConditionOutcome::Proceed,
        Ok(Value::Bool(false)) => ConditionOutcome::Skip,
        Ok(other) => ConditionOutcome::Error(format!(
            "condition must evaluate to bool, got {}",
            other.type_name()
        )),
        Err(err) => ConditionOutcome::Error(format!("condition failed: {err}")),
    }
}

/// Compute readiness synchronously. A non-`choose_one` detect blocks with
/// `needs_detect` set.
pub fn compute_readiness(node: &PlanNode, runtime: &RuntimeTree) -> Readiness {
    if cancelled(node, runtime) {
        return Readiness::skipped("cancelled");
    }
    let ctx = EvalContext::new(runtime);
    if let Some(condition) = &node.condition {
        match check_condition(condition, &ctx) {
            ConditionOutcome::Proceed => {}
            ConditionOutcome::Skip => return Readiness::skipped("condition is false"),
            ConditionOutcome::Error(message) => {
                return blocked_with(vec![], vec![message]);
            }
        }
    }
    let mut readiness = Readiness {
        state: ReadyState::Ready,
        missing_refs: Vec::new(),
        errors: Vec::new(),
        resolved_params: BTreeMap::new(),
        needs_detect: false,
        skip_reason: None,
    };
    for (field, vref) in node.execution.value_refs() {
        match evaluate_value_ref(vref, &ctx) {
            Ok(value) => {
                readiness.resolved_params.insert(field, value);
            }
            Err(err) => record_failure(&mut readiness, err),
        }
    }
    finish(readiness)
}

/// Compute readiness with an optional async detect resolver.
pub async fn compute_readiness_async(
    node: &PlanNode,
    runtime: &RuntimeTree,
    detect: Option<&dyn DetectResolver>,
) -> Readiness {
    if cancelled(node, runtime) {
        return Readiness::skipped("cancelled");
    }
    let ctx = EvalContext::new(runtime);
    if let Some(condition) = &node.condition {
        match check_condition(condition, &ctx) {
            ConditionOutcome::Proceed => {}
            ConditionOutcome::Skip => return Readiness::skipped("condition is false"),
            ConditionOutcome::Error(message) => {
                return blocked_with(vec![], vec![message]);
            }
        }
    }
    let mut readiness = Readiness {
        state: ReadyState::Ready,
        missing_refs: Vec::new(),
        errors: Vec::new(),
        resolved_params: BTreeMap::new(),
        needs_detect: false,
        skip_reason: None,
    };
    for (field, vref) in node.execution.value_refs() {
        match evaluate_value_ref_async(vref, &ctx, detect).await {
            Ok(value) => {
                readiness.resolved_params.insert(field, value);
            }
            Err(err) => record_failure(&mut readiness, err),
        }
    }
    finish(readiness)
}

fn record_failure(readiness: &mut Readiness, err: crate::error::EvalError) {
    match err.kind {
        EvalErrorKind::MissingRef => {
            if let Some(path) = err.path {
                readiness.missing_refs.push(path);
            } else {
                readiness.errors.push(err.message);
            }
        }
        EvalErrorKind::DetectUnsupported => {
            readiness.needs_detect = true;
            readiness.errors.push(err.to_string());
        }
        _ => readiness.errors.push(err.to_string()),
    }
}

fn blocked_with(missing_refs: Vec<String>, errors: Vec<String>) -> Readiness {
    Readiness {
        state: ReadyState::Blocked,
        missing_refs,
        errors,
        resolved_params: BTreeMap::new(),
        needs_detect: false,
        skip_reason: None,
    }
}

fn finish(mut readiness: Readiness) -> Readiness {
    if !readiness.missing_refs.is_empty() || !readiness.errors.is_empty() {
        readiness.state = ReadyState::Blocked;
    }
    readiness
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{EvmCallTarget, ExecutionSpec, PlanNode};
    use crate::runtime::Patch;
    use crate::valueref::ValueRef;

    fn call_node(id: &str) -> PlanNode {
        PlanNode::new(
            id,
            "eip155:1",
            ExecutionSpec::EvmCall {
                target: EvmCallTarget {
                    to: ValueRef::path("inputs.to"),
                    abi: serde_json::json!([]),
                    function: "transfer".to_string(),
                    args: [("amount".to_string(), ValueRef::path("inputs.amount"))]
                        .into_iter()
                        .collect(),
                },
                value: None,
            },
        )
    }

    #[test]
    fn ready_when_all_inputs_resolve() {
        let mut rt = RuntimeTree::new();
        rt.apply_patches(
            &[
                Patch::set("inputs.to", "0xabc"),
                Patch::set("inputs.amount", 5i64),
            ],
            None,
        );
        let readiness = compute_readiness(&call_node("n1"), &rt);
        assert_eq!(readiness.state, ReadyState::Ready);
        assert!(readiness.missing_refs.is_empty());
        assert!(readiness.errors.is_empty());
        assert_eq!(
            readiness.resolved_params.get("to"),
            Some(&Value::from("0xabc"))
        );
        assert_eq!(
            readiness.resolved_params.get("args.amount"),
            Some(&Value::from(5i64))
        );
    }

    #[test]
    fn blocked_collects_missing_refs_and_keeps_partial_params() {
        let mut rt = RuntimeTree::new();
        rt.apply_patches(&[Patch::set("inputs.amount", 5i64)], None);
        let readiness = compute_readiness(&call_node("n1"), &rt);
        assert_eq!(readiness.state, ReadyState::Blocked);
        assert_eq!(readiness.missing_refs, vec!["inputs.to"]);
        // What did resolve stays available for the solver.
        assert_eq!(
            readiness.resolved_params.get("args.amount"),
            Some(&Value::from(5i64))
        );
    }

    #[test]
    fn false_condition_skips() {
        let mut node = call_node("n1");
        node.condition = Some(ValueRef::cel("1 > 2"));
        let rt = RuntimeTree::new();
        let readiness = compute_readiness(&node, &rt);
        assert_eq!(readiness.state, ReadyState::Skipped);
        assert_eq!(readiness.skip_reason.as_deref(), Some("condition is false"));
    }

    #[test]
    fn cancellation_flag_skips() {
        let node = call_node("n1");
        let mut rt = RuntimeTree::new();
        rt.apply_patch(
            &Patch::set("policy.runner_cancelled_by_node.n1", true),
            None,
        )
        .unwrap();
        let readiness = compute_readiness(&node, &rt);
        assert_eq!(readiness.state, ReadyState::Skipped);
        assert_eq!(readiness.skip_reason.as_deref(), Some("cancelled"));
    }

    #[test]
    fn non_bool_condition_blocks_with_error() {
        let mut node = call_node("n1");
        node.condition = Some(ValueRef::lit(1i64));
        let rt = RuntimeTree::new();
        let readiness = compute_readiness(&node, &rt);
        assert_eq!(readiness.state, ReadyState::Blocked);
        assert_eq!(readiness.errors.len(), 1);
    }

    #[test]
    fn nested_params_unflatten_dotted_fields() {
        let mut rt = RuntimeTree::new();
        rt.apply_patches(
            &[
                Patch::set("inputs.to", "0xabc"),
                Patch::set("inputs.amount", 5i64),
            ],
            None,
        );
        let readiness = compute_readiness(&call_node("n1"), &rt);
        let nested = readiness.nested_params();
        let args = nested.get("args").and_then(Value::as_map).unwrap();
        assert_eq!(args.get("amount"), Some(&Value::from(5i64)));
    }

    #[tokio::test]
    async fn async_matches_sync_for_detect_free_nodes() {
        let mut rt = RuntimeTree::new();
        rt.apply_patches(
            &[
                Patch::set("inputs.to", "0xabc"),
                Patch::set("inputs.amount", 5i64),
            ],
            None,
        );
        let node = call_node("n1");
        let sync = compute_readiness(&node, &rt);
        let async_ = compute_readiness_async(&node, &rt, None).await;
        assert_eq!(sync, async_);
    }
}

//! Solvers: driving blocked nodes toward ready
//!
//! A [`Solver`] is consulted when readiness classifies a node as blocked. It
//! answers with patches (applied by the scheduler), a `need_user_confirm`
//! pause, or `cannot_solve`. [`CalculatedFieldSolver`] wraps any inner
//! solver and additionally computes an action's derived fields whenever a
//! missing reference points under `calculated.`: fields are evaluated in
//! dependency order (declaration order breaks ties) with the node's resolved
//! params shadowing `params`, and the results are merged into both
//! `calculated` and `nodes.<id>.calculated`.
//!
//! A dependency cycle among calculated fields is reported as `cannot_solve`
//! with the cycle members rather than silently computed in declaration
//! order.

use crate::catalog::{ActionCatalog, CalculatedField};
use crate::plan::PlanNode;
use crate::readiness::{compute_readiness, Readiness, ReadyState};
use crate::runtime::{Patch, RuntimeTree};
use crate::value::Value;
use crate::valueref::{DetectResolver, EvalContext, ValueRef, evaluate_value_ref};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A request to pause for user confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeedUserConfirm {
    /// Why confirmation is needed.
    pub reason: String,
    /// Structured context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl NeedUserConfirm {
    /// Create a confirmation request.
    pub fn new(reason: impl Into<String>, details: Option<serde_json::Value>) -> Self {
        Self {
            reason: reason.into(),
            details,
        }
    }
}

/// A definitive "this node cannot be unblocked" answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CannotSolve {
    /// Why solving is impossible.
    pub reason: String,
    /// Structured context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Outcome of a solve attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolveOutcome {
    /// Patches for the scheduler to apply.
    #[serde(default)]
    pub patches: Vec<Patch>,
    /// Pause for user confirmation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub need_user_confirm: Option<NeedUserConfirm>,
    /// Give up on this node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cannot_solve: Option<CannotSolve>,
}

impl SolveOutcome {
    /// An outcome carrying only patches.
    pub fn patches(patches: Vec<Patch>) -> Self {
        Self {
            patches,
            ..Self::default()
        }
    }

    /// An outcome requesting user confirmation.
    pub fn confirm(reason: impl Into<String>, details: Option<serde_json::Value>) -> Self {
        Self {
            need_user_confirm: Some(NeedUserConfirm::new(reason, details)),
            ..Self::default()
        }
    }
}

/// Context handed to solvers.
pub struct SolveContext<'a> {
    /// The current runtime tree (read-only; mutate via patches).
    pub runtime: &'a RuntimeTree,
    /// Action definitions, when the embedder supplies them.
    pub catalog: Option<&'a ActionCatalog>,
    /// Detect resolver, when available.
    pub detect: Option<Arc<dyn DetectResolver>>,
}

/// Strategy for unblocking nodes. Called only when readiness is blocked.
#[async_trait]
pub trait Solver: Send + Sync {
    /// Attempt to unblock a node.
    async fn solve(
        &self,
        node: &PlanNode,
        readiness: &Readiness,
        ctx: &SolveContext<'_>,
    ) -> SolveOutcome;
}

/// Wraps an inner solver with calculated-field computation.
#[derive(Default)]
pub struct CalculatedFieldSolver {
    inner: Option<Arc<dyn Solver>>,
}

impl CalculatedFieldSolver {
    /// A calculated-field solver with no inner solver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an inner solver.
    pub fn wrapping(inner: Arc<dyn Solver>) -> Self {
        Self { inner: Some(inner) }
    }
}

#[async_trait]
impl Solver for CalculatedFieldSolver {
    async fn solve(
        &self,
        node: &PlanNode,
        readiness: &Readiness,
        ctx: &SolveContext<'_>,
    ) -> SolveOutcome {
        let mut inner_outcome = match &self.inner {
            Some(inner) => inner.solve(node, readiness, ctx).await,
            None => SolveOutcome::default(),
        };

        // Work on a private copy; the scheduler owns the real tree and will
        // apply the returned patches itself.
        let mut working = ctx.runtime.snapshot();
        working.apply_patches(&inner_outcome.patches, None);
        let mut patches = std::mem::take(&mut inner_outcome.patches);

        let mut current = compute_readiness(node, &working);
        let wants_calculated = current.state == ReadyState::Blocked
            && current
                .missing_refs
                .iter()
                .any(|path| path.starts_with("calculated."));

        if wants_calculated {
            if let Some(def) = ctx
                .catalog
                .and_then(|catalog| catalog.for_source(node.source.as_ref()))
            {
                if let Some(missing) = missing_queries(&def.requires_queries, &working) {
                    return SolveOutcome {
                        patches,
                        need_user_confirm: Some(NeedUserConfirm::new(
                            "required queries are missing",
                            Some(json!({ "missing_queries": missing })),
                        )),
                        cannot_solve: None,
                    };
                }

                let order = match topo_order(&def.calculated_fields) {
                    Ok(order) => order,
                    Err(cycle) => {
                        return SolveOutcome {
                            patches,
                            need_user_confirm: None,
                            cannot_solve: Some(CannotSolve {
                                reason: "calculated_fields dependency cycle".to_string(),
                                details: Some(json!({ "cycle": cycle })),
                            }),
                        }
                    }
                };

                let params = readiness.nested_params();
                let mut computed: BTreeMap<String, Value> = BTreeMap::new();
                for index in order {
                    let (name, field) = &def.calculated_fields[index];
                    let mut overrides = BTreeMap::new();
                    overrides.insert("params".to_string(), Value::Map(params.clone()));
                    let eval_ctx = EvalContext::with_overrides(&working, &overrides);
                    match evaluate_value_ref(&ValueRef::cel(field.expr.clone()), &eval_ctx) {
                        Ok(value) => {
                            // Make the field visible to later fields.
                            working.apply_patches(
                                &[Patch::merge(
                                    "calculated",
                                    Value::Map(BTreeMap::from([(name.clone(), value.clone())])),
                                )],
                                None,
                            );
                            computed.insert(name.clone(), value);
                        }
                        Err(err) => {
                            tracing::debug!(node = %node.id, field = %name, error = %err,
                                "calculated field evaluation failed");
                            return SolveOutcome {
                                patches,
                                need_user_confirm: Some(NeedUserConfirm::new(
                                    "calculated_fields evaluation failed",
                                    Some(json!({ "field": name, "error": err.to_string() })),
                                )),
                                cannot_solve: None,
                            };
                        }
                    }
                }

                if !computed.is_empty() {
                    let payload = Value::Map(computed);
                    patches.push(Patch::merge("calculated", payload.clone()));
                    patches.push(Patch::merge(
                        format!("nodes.{}.calculated", node.id),
                        payload,
                    ));
                }
                current = compute_readiness(node, &working);
            }
        }

        match current.state {
            ReadyState::Ready | ReadyState::Skipped => SolveOutcome::patches(patches),
            ReadyState::Blocked => {
                if inner_outcome.need_user_confirm.is_some() || inner_outcome.cannot_solve.is_some()
                {
                    return SolveOutcome {
                        patches,
                        need_user_confirm: inner_outcome.need_user_confirm,
                        cannot_solve: inner_outcome.cannot_solve,
                    };
                }
                let reason = if current.missing_refs.is_empty() {
                    "readiness errors remain"
                } else {
                    "missing runtime inputs"
                };
                SolveOutcome {
                    patches,
                    need_user_confirm: Some(NeedUserConfirm::new(
                        reason,
                        Some(json!({
                            "missing_refs": current.missing_refs,
                            "errors": current.errors,
                        })),
                    )),
                    cannot_solve: None,
                }
            }
        }
    }
}

fn missing_queries(required: &[String], runtime: &RuntimeTree) -> Option<Vec<String>> {
    let missing: Vec<String> = required
        .iter()
        .filter(|q| runtime.get(&format!("query.{q}")).is_none())
        .cloned()
        .collect();
    if missing.is_empty() {
        None
    } else {
        Some(missing)
    }
}

/// Topologically order calculated fields by their `calculated.`-prefixed
/// inputs. Ties resolve to declaration order. A cycle returns the names of
/// the fields involved.
fn topo_order(fields: &[(String, CalculatedField)]) -> Result<Vec<usize>, Vec<String>> {
    let index_by_name: BTreeMap<&str, usize> = fields
        .iter()
        .enumerate()
        .map(|(i, (name, _))| (name.as_str(), i))
        .collect();
    // deps[i] = indices of fields that must be computed before field i.
    let deps: Vec<BTreeSet<usize>> = fields
        .iter()
        .map(|(_, field)| {
            field
                .inputs
                .iter()
                .filter_map(|input| input.strip_prefix("calculated."))
                .filter_map(|name| index_by_name.get(name).copied())
                .collect()
        })
        .collect();

    let mut done: BTreeSet<usize> = BTreeSet::new();
    let mut order = Vec::with_capacity(fields.len());
    while done.len() < fields.len() {
        // Lowest declaration index whose deps are satisfied.
        let next = (0..fields.len())
            .find(|i| !done.contains(i) && deps[*i].iter().all(|d| done.contains(d)));
        match next {
            Some(i) => {
                done.insert(i);
                order.push(i);
            }
            None => {
                let cycle: Vec<String> = (0..fields.len())
                    .filter(|i| !done.contains(i))
                    .map(|i| fields[i].0.clone())
                    .collect();
                return Err(cycle);
            }
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ActionDef;
    use crate::plan::{EvmCallTarget, ExecutionSpec, NodeSource, PlanNode};
    use crate::valueref::ValueRef;

    fn field(expr: &str, inputs: &[&str]) -> CalculatedField {
        CalculatedField {
            expr: expr.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn topo_respects_dependencies_and_declaration_order() {
        let fields = vec![
            ("a".to_string(), field("1", &[])),
            ("b".to_string(), field("calculated.a + 1", &["calculated.a"])),
            ("c".to_string(), field("calculated.b + 1", &["calculated.b"])),
        ];
        assert_eq!(topo_order(&fields).unwrap(), vec![0, 1, 2]);

        // Same graph, declared backwards: topological order still wins.
        let fields = vec![
            ("c".to_string(), field("calculated.b + 1", &["calculated.b"])),
            ("b".to_string(), field("calculated.a + 1", &["calculated.a"])),
            ("a".to_string(), field("1", &[])),
        ];
        assert_eq!(topo_order(&fields).unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn topo_reports_cycles() {
        let fields = vec![
            ("a".to_string(), field("calculated.b", &["calculated.b"])),
            ("b".to_string(), field("calculated.a", &["calculated.a"])),
        ];
        let cycle = topo_order(&fields).unwrap_err();
        assert_eq!(cycle, vec!["a", "b"]);
    }

    #[test]
    fn non_calculated_inputs_do_not_order() {
        let fields = vec![
            ("a".to_string(), field("1", &["inputs.x", "query.y"])),
            ("b".to_string(), field("2", &[])),
        ];
        assert_eq!(topo_order(&fields).unwrap(), vec![0, 1]);
    }

    fn calc_node(id: &str) -> PlanNode {
        let mut node = PlanNode::new(
            id,
            "eip155:1",
            ExecutionSpec::EvmCall {
                target: EvmCallTarget {
                    to: ValueRef::lit("0x0000000000000000000000000000000000000001"),
                    abi: serde_json::json!([]),
                    function: "deposit".to_string(),
                    args: [(
                        "amount".to_string(),
                        ValueRef::path("calculated.amount_atomic"),
                    )]
                    .into_iter()
                    .collect(),
                },
                value: None,
            },
        );
        node.source = Some(NodeSource {
            protocol: "vault".to_string(),
            action: Some("deposit".to_string()),
            ..Default::default()
        });
        node
    }

    fn catalog_with(def: ActionDef) -> ActionCatalog {
        let mut catalog = ActionCatalog::new();
        catalog.insert("vault", "deposit", def);
        catalog
    }

    #[tokio::test]
    async fn computes_missing_calculated_fields() {
        use crate::runtime::Patch;
        let mut rt = RuntimeTree::new();
        rt.apply_patch(&Patch::set("inputs.amount", "2.5"), None)
            .unwrap();
        let catalog = catalog_with(ActionDef {
            calculated_fields: vec![(
                "amount_atomic".to_string(),
                field("to_atomic(inputs.amount, 6)", &[]),
            )],
            requires_queries: vec![],
            ..Default::default()
        });
        let node = calc_node("n1");
        let readiness = compute_readiness(&node, &rt);
        assert_eq!(readiness.state, ReadyState::Blocked);

        let solver = CalculatedFieldSolver::new();
        let ctx = SolveContext {
            runtime: &rt,
            catalog: Some(&catalog),
            detect: None,
        };
        let outcome = solver.solve(&node, &readiness, &ctx).await;
        assert!(outcome.need_user_confirm.is_none());
        assert!(outcome.cannot_solve.is_none());
        // Two merges: calculated and nodes.<id>.calculated.
        assert_eq!(outcome.patches.len(), 2);

        rt.apply_patches(&outcome.patches, None);
        assert_eq!(
            rt.get("calculated.amount_atomic"),
            Some(&Value::from(2_500_000i64))
        );
        assert_eq!(
            rt.get("nodes.n1.calculated.amount_atomic"),
            Some(&Value::from(2_500_000i64))
        );
        assert!(compute_readiness(&node, &rt).is_ready());
    }

    #[tokio::test]
    async fn chained_fields_see_earlier_results() {
        use crate::runtime::Patch;
        let mut rt = RuntimeTree::new();
        rt.apply_patch(&Patch::set("inputs.amount", "2"), None)
            .unwrap();
        let catalog = catalog_with(ActionDef {
            calculated_fields: vec![
                (
                    "amount_atomic".to_string(),
                    field("to_atomic(inputs.amount, 6)", &[]),
                ),
                (
                    "half".to_string(),
                    field("calculated.amount_atomic / 2", &["calculated.amount_atomic"]),
                ),
            ],
            requires_queries: vec![],
            ..Default::default()
        });
        let node = calc_node("n1");
        let readiness = compute_readiness(&node, &rt);
        let solver = CalculatedFieldSolver::new();
        let ctx = SolveContext {
            runtime: &rt,
            catalog: Some(&catalog),
            detect: None,
        };
        let outcome = solver.solve(&node, &readiness, &ctx).await;
        rt.apply_patches(&outcome.patches, None);
        assert_eq!(rt.get("calculated.half"), Some(&Value::from(1_000_000i64)));
    }

    #[tokio::test]
    async fn missing_required_queries_pause_first() {
        let rt = RuntimeTree::new();
        let catalog = catalog_with(ActionDef {
            calculated_fields: vec![(
                "amount_atomic".to_string(),
                field("to_atomic(query.balances.raw, 6)", &[]),
            )],
            requires_queries: vec!["balances".to_string()],
            ..Default::default()
        });
        let node = calc_node("n1");
        let readiness = compute_readiness(&node, &rt);
        let solver = CalculatedFieldSolver::new();
        let ctx = SolveContext {
            runtime: &rt,
            catalog: Some(&catalog),
            detect: None,
        };
        let outcome = solver.solve(&node, &readiness, &ctx).await;
        let confirm = outcome.need_user_confirm.unwrap();
        assert_eq!(confirm.reason, "required queries are missing");
        assert_eq!(
            confirm.details.unwrap()["missing_queries"],
            serde_json::json!(["balances"])
        );
    }

    #[tokio::test]
    async fn failed_field_evaluation_pauses_with_field_name() {
        use crate::runtime::Patch;
        let mut rt = RuntimeTree::new();
        rt.apply_patch(&Patch::set("inputs.amount", "1.0000001"), None)
            .unwrap();
        let catalog = catalog_with(ActionDef {
            calculated_fields: vec![(
                "amount_atomic".to_string(),
                field("to_atomic(inputs.amount, 6)", &[]),
            )],
            requires_queries: vec![],
            ..Default::default()
        });
        let node = calc_node("n1");
        let readiness = compute_readiness(&node, &rt);
        let solver = CalculatedFieldSolver::new();
        let ctx = SolveContext {
            runtime: &rt,
            catalog: Some(&catalog),
            detect: None,
        };
        let outcome = solver.solve(&node, &readiness, &ctx).await;
        let confirm = outcome.need_user_confirm.unwrap();
        assert_eq!(confirm.reason, "calculated_fields evaluation failed");
        let details = confirm.details.unwrap();
        assert_eq!(details["field"], serde_json::json!("amount_atomic"));
        assert!(details["error"]
            .as_str()
            .unwrap()
            .contains("disallows truncation"));
    }

    #[tokio::test]
    async fn unresolvable_blocked_node_synthesizes_confirm() {
        let rt = RuntimeTree::new();
        let node = calc_node("n1");
        let readiness = compute_readiness(&node, &rt);
        let solver = CalculatedFieldSolver::new();
        let ctx = SolveContext {
            runtime: &rt,
            catalog: None,
            detect: None,
        };
        let outcome = solver.solve(&node, &readiness, &ctx).await;
        let confirm = outcome.need_user_confirm.unwrap();
        assert_eq!(confirm.reason, "missing runtime inputs");
        let details = confirm.details.unwrap();
        assert_eq!(
            details["missing_refs"],
            serde_json::json!(["calculated.amount_atomic"])
        );
    }

    #[tokio::test]
    async fn cycle_reports_cannot_solve() {
        let rt = RuntimeTree::new();
        let catalog = catalog_with(ActionDef {
            calculated_fields: vec![
                (
                    "amount_atomic".to_string(),
                    field("calculated.other", &["calculated.other"]),
                ),
                (
                    "other".to_string(),
                    field("calculated.amount_atomic", &["calculated.amount_atomic"]),
                ),
            ],
            requires_queries: vec![],
            ..Default::default()
        });
        let node = calc_node("n1");
        let readiness = compute_readiness(&node, &rt);
        let solver = CalculatedFieldSolver::new();
        let ctx = SolveContext {
            runtime: &rt,
            catalog: Some(&catalog),
            detect: None,
        };
        let outcome = solver.solve(&node, &readiness, &ctx).await;
        let cannot = outcome.cannot_solve.unwrap();
        assert_eq!(cannot.reason, "calculated_fields dependency cycle");
    }
}

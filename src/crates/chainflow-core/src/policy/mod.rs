//! Policy gate
//!
//! Classifies a compiled write as allowed, approval-required, or
//! hard-blocked. The pipeline is: compile a [`WritePreview`], extract a
//! typed [`GateInput`] (with per-field source attribution), then enforce the
//! pack's constraints and allowlists. Approval-required outcomes carry a
//! deterministic, hashable [`ConfirmationSummary`].

pub mod gate;
pub mod summary;
pub mod types;

pub use gate::{
    compile_preview, enforce, extract_gate_input, validate_constraints, ConstraintOutcome,
};
pub use summary::{ConfirmationSummary, SummaryKind, SummaryNode, SUMMARY_SCHEMA};
pub use types::{
    AllowlistMode, GateDecision, GateInput, HardConstraints, PolicyConfig, PolicyPack, RiskLevel,
    TokenPolicy, WritePreview,
};

use crate::plan::PlanNode;
use crate::readiness::Readiness;
use crate::runtime::RuntimeTree;

/// Run the full gate over a ready write node: preview, extract, enforce.
/// Returns the decision plus the extracted input for summarization.
pub fn evaluate_gate(
    pack: &PolicyPack,
    node: &PlanNode,
    readiness: &Readiness,
    runtime: &RuntimeTree,
    risk_level: RiskLevel,
    risk_tags: Vec<String>,
) -> (GateDecision, GateInput) {
    let preview = compile_preview(node, readiness, runtime);
    let input = extract_gate_input(node, readiness, preview, runtime, risk_level, risk_tags);
    let decision = enforce(pack, &input);
    (decision, input)
}

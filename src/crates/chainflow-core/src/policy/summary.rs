//! Deterministic confirmation summaries
//!
//! When a run pauses for approval, the engine attaches a
//! [`ConfirmationSummary`]: a compact, hashable record of what is being
//! approved. The hash is keccak256 of the canonical JSON form with volatile
//! fields stripped, so the same pause in another process produces the same
//! hash - callers can cache or sign approvals against it.

use super::types::{GateInput, WritePreview};
use crate::plan::PlanNode;
use chainflow_checkpoint::canonical::spec_hash_keccak256;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};

/// Summary schema version.
pub const SUMMARY_SCHEMA: u32 = 1;

/// Which gate produced the summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryKind {
    /// A write is about to broadcast.
    BroadcastGate,
    /// The token allowlist requires approval.
    PolicyAllowlist,
    /// Policy constraints require approval.
    PolicyGate,
    /// A solver or executor asked for confirmation.
    NeedUserConfirm,
}

impl SummaryKind {
    fn title(self) -> &'static str {
        match self {
            SummaryKind::BroadcastGate => "Broadcast approval required",
            SummaryKind::PolicyAllowlist => "Token allowlist approval required",
            SummaryKind::PolicyGate => "Policy gate approval required",
            SummaryKind::NeedUserConfirm => "User confirmation required",
        }
    }
}

/// The node facts embedded in a summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryNode {
    /// Plan node id.
    pub node_id: String,
    /// Originating workflow node id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_node_id: Option<String>,
    /// `protocol/action` reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_ref: Option<String>,
    /// Chain identifier.
    pub chain: String,
    /// Execution type name.
    pub execution_type: String,
    /// Declared write paths.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writes: Option<Vec<String>>,
}

/// A deterministic, hashable approval record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationSummary {
    /// Summary schema version.
    pub schema: u32,
    /// keccak256 of the canonical content, hex-lowercase.
    pub hash: String,
    /// Human title, chosen by kind.
    pub title: String,
    /// One-line description.
    pub summary: String,
    /// Node facts.
    pub node: SummaryNode,
    /// Policy hit reasons, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit_reasons: Option<Vec<String>>,
    /// Risk facts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<Json>,
    /// The compiled preview.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<Json>,
    /// The gate input, for auditability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<Json>,
}

fn preview_keys(preview: &WritePreview) -> String {
    match preview {
        WritePreview::EvmTx {
            function_name,
            args,
            ..
        } => {
            let keys: Vec<&str> = args.keys().map(String::as_str).collect();
            format!("{function_name}({})", keys.join(","))
        }
        WritePreview::SolanaInstruction {
            program_id,
            instruction,
            ..
        } => format!(
            "{}@{}",
            instruction.as_deref().unwrap_or("instruction"),
            program_id
        ),
        WritePreview::Execution { compile_error, .. } => {
            format!("compile failed: {compile_error}")
        }
    }
}

/// Build a summary from a full gate input.
pub fn from_gate_input(
    kind: SummaryKind,
    node: &PlanNode,
    input: &GateInput,
    hit_reasons: Option<Vec<String>>,
) -> ConfirmationSummary {
    let mut parts = vec![
        format!("chain={}", input.chain),
        format!("exec={}", node.execution.exec_type()),
    ];
    if let Some(action_ref) = &input.action_ref {
        parts.push(format!("action={action_ref}"));
    }
    parts.push(format!("risk={:?}", input.risk_level).to_lowercase());
    if !input.risk_tags.is_empty() {
        parts.push(format!("tags={}", input.risk_tags.join(",")));
    }
    parts.push(format!("preview={}", preview_keys(&input.preview)));
    if let Some(reasons) = &hit_reasons {
        parts.push(format!("hits={}", reasons.join("; ")));
    }

    finalize(ConfirmationSummary {
        schema: SUMMARY_SCHEMA,
        hash: String::new(),
        title: kind.title().to_string(),
        summary: parts.join(" "),
        node: SummaryNode {
            node_id: node.id.clone(),
            workflow_node_id: input.workflow_node_id.clone(),
            action_ref: input.action_ref.clone(),
            chain: node.chain.clone(),
            execution_type: node.execution.exec_type().to_string(),
            writes: (!node.writes.is_empty())
                .then(|| node.writes.iter().map(|w| w.path.clone()).collect()),
        },
        hit_reasons,
        risk: Some(json!({
            "level": input.risk_level,
            "tags": input.risk_tags,
        })),
        preview: serde_json::to_value(&input.preview).ok(),
        gate: serde_json::to_value(input).ok(),
    })
}

/// Build a summary from a bare pause reason (no gate input available).
pub fn from_reason(node: &PlanNode, reason: &str, details: Option<&Json>) -> ConfirmationSummary {
    finalize(ConfirmationSummary {
        schema: SUMMARY_SCHEMA,
        hash: String::new(),
        title: SummaryKind::NeedUserConfirm.title().to_string(),
        summary: format!(
            "chain={} exec={} reason={reason}",
            node.chain,
            node.execution.exec_type()
        ),
        node: SummaryNode {
            node_id: node.id.clone(),
            workflow_node_id: node.source.as_ref().and_then(|s| s.node_id.clone()),
            action_ref: node.source.as_ref().and_then(|s| {
                s.action
                    .as_ref()
                    .map(|a| format!("{}/{}", s.protocol, a))
            }),
            chain: node.chain.clone(),
            execution_type: node.execution.exec_type().to_string(),
            writes: (!node.writes.is_empty())
                .then(|| node.writes.iter().map(|w| w.path.clone()).collect()),
        },
        hit_reasons: Some(vec![reason.to_string()]),
        risk: None,
        preview: None,
        gate: details.cloned(),
    })
}

fn finalize(mut summary: ConfirmationSummary) -> ConfirmationSummary {
    match serde_json::to_value(&summary) {
        Ok(mut content) => {
            if let Some(map) = content.as_object_mut() {
                map.remove("hash");
            }
            summary.hash = spec_hash_keccak256(&content);
        }
        Err(err) => {
            tracing::error!(error = %err, "confirmation summary serialization failed");
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ExecutionSpec, PlanNode};

    fn node() -> PlanNode {
        PlanNode::new(
            "n1",
            "eip155:1",
            ExecutionSpec::EvmRpc {
                method: "eth_sendTransaction".to_string(),
                params: vec![],
            },
        )
    }

    #[test]
    fn same_inputs_same_hash() {
        let a = from_reason(&node(), "assert failed", None);
        let b = from_reason(&node(), "assert failed", None);
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.hash.len(), 64);
    }

    #[test]
    fn different_reasons_different_hashes() {
        let a = from_reason(&node(), "assert failed", None);
        let b = from_reason(&node(), "needs approval", None);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn hash_excludes_itself() {
        let summary = from_reason(&node(), "x", None);
        let mut content = serde_json::to_value(&summary).unwrap();
        content.as_object_mut().unwrap().remove("hash");
        assert_eq!(summary.hash, spec_hash_keccak256(&content));
    }

    #[test]
    fn titles_follow_kind() {
        assert_eq!(SummaryKind::PolicyGate.title(), "Policy gate approval required");
        assert_eq!(
            SummaryKind::PolicyAllowlist.title(),
            "Token allowlist approval required"
        );
    }
}

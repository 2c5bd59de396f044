//! Policy gate data model.

use crate::compile::CompiledAccount;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};

/// Risk classification, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Routine operation.
    #[default]
    Low,
    /// Worth a look.
    Medium,
    /// Significant value or authority at stake.
    High,
    /// Maximum scrutiny.
    Critical,
}

/// What a compiled write looks like, for human review and field harvesting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WritePreview {
    /// A compiled EVM transaction.
    EvmTx {
        /// Chain identifier.
        chain: String,
        /// Numeric chain id.
        chain_id: u64,
        /// Execution type name.
        exec_type: String,
        /// Target contract.
        to: String,
        /// Calldata as 0x-hex.
        data: String,
        /// Function name.
        function_name: String,
        /// Resolved arguments.
        args: BTreeMap<String, Value>,
    },
    /// A compiled Solana instruction.
    SolanaInstruction {
        /// Chain identifier.
        chain: String,
        /// Program id.
        program_id: String,
        /// Instruction name.
        instruction: Option<String>,
        /// Accounts in wire order.
        accounts: Vec<CompiledAccount>,
        /// Resolved data fields.
        data_fields: BTreeMap<String, Value>,
    },
    /// Compilation failed; the raw failure is surfaced instead.
    Execution {
        /// Chain identifier.
        chain: String,
        /// Execution type name.
        exec_type: String,
        /// The compiler error.
        compile_error: String,
    },
}

impl WritePreview {
    /// The compile error, when compilation failed.
    pub fn compile_error(&self) -> Option<&str> {
        match self {
            WritePreview::Execution { compile_error, .. } => Some(compile_error),
            _ => None,
        }
    }
}

/// Typed gate input extracted from a compiled write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateInput {
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
    /// Resolved spec fields, keyed by field path.
    pub params: BTreeMap<String, Value>,
    /// The compiled preview.
    pub preview: WritePreview,
    /// Risk classification.
    pub risk_level: RiskLevel,
    /// Risk tags.
    pub risk_tags: Vec<String>,
    /// Slippage tolerance, basis points.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slippage_bps: Option<u64>,
    /// Approval amount, when the write grants an allowance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_amount: Option<Value>,
    /// Spend amount.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spend_amount: Option<Value>,
    /// Whether the approval is effectively unlimited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlimited_approval: Option<bool>,
    /// EVM token contract.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_address: Option<String>,
    /// Spender / delegate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spender_address: Option<String>,
    /// Owner / authority.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_address: Option<String>,
    /// Solana mint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mint_address: Option<String>,
    /// Required fields that could not be harvested.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<String>,
    /// Fields whose meaning could not be established.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unknown_fields: Vec<String>,
    /// Fields that force a hard block.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hard_block_fields: Vec<String>,
    /// Which source produced each harvested field.
    pub field_sources: BTreeMap<String, Vec<String>>,
}

/// Hard constraints that block a write outright when violated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardConstraints {
    /// Maximum tolerated slippage, basis points.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_slippage_bps: Option<u64>,
    /// Whether unlimited approvals are permitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_unlimited_approval: Option<bool>,
}

/// The policy section of a pack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Hard constraints.
    #[serde(default)]
    pub hard_constraints: HardConstraints,
    /// Risk level at or above which approval is required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_threshold: Option<RiskLevel>,
    /// Risk tags that always require approval.
    #[serde(default)]
    pub approval_required: Vec<String>,
}

/// Token allowlist mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowlistMode {
    /// Violations hard-block.
    Strict,
    /// Violations require approval.
    Permissive,
}

/// Token allowlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPolicy {
    /// Enforcement mode.
    pub mode: AllowlistMode,
    /// Allowed token addresses / mints, compared case-insensitively.
    pub tokens: BTreeSet<String>,
}

impl TokenPolicy {
    /// Whether a token identity is allowlisted.
    pub fn allows(&self, token: &str) -> bool {
        let needle = token.to_lowercase();
        self.tokens.iter().any(|t| t.to_lowercase() == needle)
    }
}

/// A pack's policy surface, as far as the gate needs it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyPack {
    /// Policy configuration.
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Optional token allowlist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_policy: Option<TokenPolicy>,
}

/// Gate verdict for a compiled write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    /// Proceed.
    Allow,
    /// Pause for user confirmation.
    NeedUserConfirm {
        /// Why.
        reason: String,
        /// Structured context.
        details: Json,
    },
    /// Refuse outright.
    HardBlock {
        /// Why.
        reason: String,
        /// Structured context.
        details: Json,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_levels_order() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::High >= RiskLevel::High);
        assert!(RiskLevel::Critical > RiskLevel::High);
    }

    #[test]
    fn token_allowlist_is_case_insensitive() {
        let policy = TokenPolicy {
            mode: AllowlistMode::Strict,
            tokens: ["0xAbC".to_string()].into_iter().collect(),
        };
        assert!(policy.allows("0xabc"));
        assert!(policy.allows("0xABC"));
        assert!(!policy.allows("0xdef"));
    }
}

//! Gate-input extraction and policy enforcement
//!
//! Extraction walks a prioritized source list - resolved params, calculated
//! fields, detect results, then the compiled preview - harvesting the known
//! economic fields (slippage, approval and spend amounts, token identity,
//! counterparties). Every harvested field records its source in
//! `field_sources` so a reviewer can audit which context produced which
//! value.

use super::types::{
    AllowlistMode, GateDecision, GateInput, PolicyConfig, PolicyPack, RiskLevel, TokenPolicy,
    WritePreview,
};
use crate::compile::{self, CompileContext, CompiledRequest};
use crate::plan::PlanNode;
use crate::readiness::Readiness;
use crate::runtime::RuntimeTree;
use crate::value::Value;
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde_json::json;
use std::collections::BTreeMap;

/// Compile a write preview, converting compiler failures into the
/// `execution` preview kind instead of propagating them.
pub fn compile_preview(
    node: &PlanNode,
    readiness: &Readiness,
    runtime: &RuntimeTree,
) -> WritePreview {
    let ctx = CompileContext {
        runtime,
        resolved_params: &readiness.resolved_params,
    };
    match compile::compile(node, &ctx) {
        Ok(CompiledRequest::EvmCall(req)) => WritePreview::EvmTx {
            chain: node.chain.clone(),
            chain_id: req.chain_id,
            exec_type: node.execution.exec_type().to_string(),
            to: req.to,
            data: format!("0x{}", hex::encode(&req.data)),
            function_name: req.function_name,
            args: req.args,
        },
        Ok(CompiledRequest::SolanaInstruction(req)) => WritePreview::SolanaInstruction {
            chain: node.chain.clone(),
            program_id: req.program_id,
            instruction: req.instruction,
            accounts: req.accounts,
            data_fields: req.data_fields,
        },
        Ok(_) => WritePreview::Execution {
            chain: node.chain.clone(),
            exec_type: node.execution.exec_type().to_string(),
            compile_error: "read-only execution has no write preview".to_string(),
        },
        Err(err) => WritePreview::Execution {
            chain: node.chain.clone(),
            exec_type: node.execution.exec_type().to_string(),
            compile_error: err.to_string(),
        },
    }
}

/// One prioritized harvesting source.
struct Source<'a> {
    name: &'static str,
    values: Option<&'a BTreeMap<String, Value>>,
}

struct Harvester<'a> {
    sources: Vec<Source<'a>>,
}

impl<'a> Harvester<'a> {
    /// Find the first source carrying any of the aliased keys. Flat param
    /// keys match both bare (`slippage_bps`) and arg-qualified
    /// (`args.slippage_bps`) forms.
    fn find(&self, aliases: &[&str]) -> Option<(Value, &'static str)> {
        for source in &self.sources {
            let Some(values) = source.values else {
                continue;
            };
            for alias in aliases {
                if let Some(v) = values
                    .get(*alias)
                    .or_else(|| values.get(&format!("args.{alias}")))
                {
                    if !v.is_null() {
                        return Some((v.clone(), source.name));
                    }
                }
            }
        }
        None
    }
}

fn to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Int(i) => i.to_u64(),
        Value::String(s) => s.parse::<u64>().ok(),
        Value::Decimal(d) => d.to_bigint_exact().and_then(|i| i.to_u64()),
        _ => None,
    }
}

fn uint256_max() -> BigInt {
    (BigInt::from(1u8) << 256u32) - 1
}

/// Whether an amount value reads as "unlimited".
fn is_unlimited_amount(value: &Value) -> bool {
    match value {
        Value::String(s) => {
            if s.eq_ignore_ascii_case("max") {
                return true;
            }
            if let Some(hex_digits) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                return !hex_digits.is_empty()
                    && hex_digits.bytes().all(|b| b == b'f' || b == b'F');
            }
            s.parse::<BigInt>()
                .map(|v| v >= uint256_max())
                .unwrap_or(false)
        }
        Value::Int(i) => *i >= uint256_max(),
        _ => false,
    }
}

fn first_arg<'a>(
    args: &'a BTreeMap<String, Value>,
    names: &[&'a str],
) -> Option<(&'a str, &'a Value)> {
    for name in names {
        if let Some(v) = args.get(*name) {
            return Some((*name, v));
        }
    }
    None
}

fn account_pubkey(preview: &WritePreview, role: &str) -> Option<String> {
    match preview {
        WritePreview::SolanaInstruction { accounts, .. } => accounts
            .iter()
            .find(|a| a.name == role)
            .map(|a| a.pubkey.clone()),
        _ => None,
    }
}

/// Extract a typed gate input from a compiled write.
pub fn extract_gate_input(
    node: &PlanNode,
    readiness: &Readiness,
    preview: WritePreview,
    runtime: &RuntimeTree,
    risk_level: RiskLevel,
    risk_tags: Vec<String>,
) -> GateInput {
    let calculated_node = runtime
        .get(&format!("nodes.{}.calculated", node.id))
        .and_then(Value::as_map);
    let calculated_global = runtime.get("calculated").and_then(Value::as_map);
    let detect_result = runtime
        .get(&format!("nodes.{}.detect_result", node.id))
        .and_then(Value::as_map);

    let harvester = Harvester {
        sources: vec![
            Source {
                name: "params",
                values: Some(&readiness.resolved_params),
            },
            Source {
                name: "calculated",
                values: calculated_node,
            },
            Source {
                name: "calculated",
                values: calculated_global,
            },
            Source {
                name: "detect",
                values: detect_result,
            },
        ],
    };

    let mut field_sources: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut record = |field: &str, source: &str| {
        field_sources
            .entry(field.to_string())
            .or_default()
            .push(source.to_string());
    };

    let mut slippage_bps = None;
    if let Some((v, source)) = harvester.find(&["slippage_bps", "max_slippage_bps"]) {
        if let Some(bps) = to_u64(&v) {
            slippage_bps = Some(bps);
            record("slippage_bps", source);
        }
    }

    let mut approval_amount = None;
    if let Some((v, source)) = harvester.find(&["approval_amount", "max_approval"]) {
        approval_amount = Some(v);
        record("approval_amount", source);
    }

    let mut spend_amount = None;
    if let Some((v, source)) = harvester.find(&["spend_amount", "amount_in", "amount"]) {
        spend_amount = Some(v);
        record("spend_amount", source);
    }

    let mut unlimited_approval = None;
    if let Some((v, source)) = harvester.find(&["unlimited_approval"]) {
        if let Some(b) = v.as_bool() {
            unlimited_approval = Some(b);
            record("unlimited_approval", source);
        }
    }

    let mut token_address = None;
    let mut spender_address = None;
    let mut owner_address = None;
    let mut mint_address = None;

    match &preview {
        WritePreview::EvmTx {
            to,
            function_name,
            args,
            ..
        } => {
            let fname = function_name.to_lowercase();
            if fname.contains("approve") {
                token_address = Some(to.clone());
                record("token_address", "preview");
                if let Some((_, v)) = first_arg(args, &["spender", "_spender", "delegate", "guy"])
                {
                    if let Some(s) = v.as_str() {
                        spender_address = Some(s.to_string());
                        record("spender_address", "preview");
                    }
                }
                if approval_amount.is_none() {
                    if let Some((_, v)) = first_arg(args, &["amount", "value", "_value", "wad"]) {
                        approval_amount = Some(v.clone());
                        record("approval_amount", "preview");
                    }
                }
            }
            let swap_like = fname.contains("swap")
                || function_name.starts_with("exactInput")
                || function_name.starts_with("exactOutput");
            if swap_like {
                if spend_amount.is_none() {
                    if let Some((_, v)) = first_arg(args, &["amountIn", "amount_in", "amount"]) {
                        spend_amount = Some(v.clone());
                        record("spend_amount", "preview");
                    }
                }
                if slippage_bps.is_none() {
                    if let Some((_, v)) = first_arg(args, &["slippageBps", "slippage_bps"]) {
                        if let Some(bps) = to_u64(v) {
                            slippage_bps = Some(bps);
                            record("slippage_bps", "preview");
                        }
                    }
                }
            }
        }
        WritePreview::SolanaInstruction {
            instruction,
            data_fields,
            ..
        } => {
            let instruction = instruction.as_deref().unwrap_or("");
            if instruction == "approve" {
                if let Some(delegate) = account_pubkey(&preview, "delegate") {
                    spender_address = Some(delegate);
                    record("spender_address", "preview");
                }
                if approval_amount.is_none() {
                    if let Some(v) = data_fields.get("amount") {
                        approval_amount = Some(v.clone());
                        record("approval_amount", "preview");
                    }
                }
            }
            if instruction == "approve"
                || instruction == "transfer"
                || instruction == "transfer_checked"
            {
                if let Some(owner) = account_pubkey(&preview, "owner") {
                    owner_address = Some(owner);
                    record("owner_address", "preview");
                }
                if let Some(mint) = account_pubkey(&preview, "mint") {
                    mint_address = Some(mint);
                    record("mint_address", "preview");
                }
            }
            if (instruction == "transfer" || instruction == "transfer_checked")
                && spend_amount.is_none()
            {
                if let Some(v) = data_fields.get("amount") {
                    spend_amount = Some(v.clone());
                    record("spend_amount", "preview");
                }
            }
        }
        WritePreview::Execution { .. } => {}
    }

    if unlimited_approval.is_none() {
        if let Some(amount) = &approval_amount {
            if is_unlimited_amount(amount) {
                unlimited_approval = Some(true);
                record("unlimited_approval", "inferred");
            }
        }
    }

    // Classification.
    let mut missing_fields = Vec::new();
    let mut unknown_fields = Vec::new();
    let mut hard_block_fields = Vec::new();

    let approve_like = match &preview {
        WritePreview::EvmTx { function_name, .. } => {
            function_name.to_lowercase().contains("approve")
        }
        WritePreview::SolanaInstruction { instruction, .. } => {
            instruction.as_deref() == Some("approve")
        }
        _ => false,
    };
    let swap_like = matches!(&preview, WritePreview::EvmTx { function_name, .. }
        if function_name.to_lowercase().contains("swap")
            || function_name.starts_with("exactInput")
            || function_name.starts_with("exactOutput"));
    let solana_token_like = matches!(&preview, WritePreview::SolanaInstruction { instruction, .. }
        if matches!(instruction.as_deref(), Some("approve" | "transfer" | "transfer_checked")));

    if approve_like && !solana_token_like {
        if token_address.is_none() {
            missing_fields.push("token_address".to_string());
        }
        if approval_amount.is_none() {
            missing_fields.push("approval_amount".to_string());
        }
        if spender_address.is_none() {
            missing_fields.push("spender_address".to_string());
        }
    }
    if swap_like {
        if spend_amount.is_none() {
            missing_fields.push("spend_amount".to_string());
        }
        if slippage_bps.is_none() {
            missing_fields.push("slippage_bps".to_string());
        }
    }
    if solana_token_like && mint_address.is_none() {
        missing_fields.push("mint_address".to_string());
    }

    if token_address.is_none() && mint_address.is_none() {
        unknown_fields.push("token_identity".to_string());
    }
    if preview.compile_error().is_some() {
        unknown_fields.push("preview".to_string());
        hard_block_fields.push("preview_compile".to_string());
    }

    GateInput {
        node_id: node.id.clone(),
        workflow_node_id: node
            .source
            .as_ref()
            .and_then(|s| s.node_id.clone()),
        action_ref: node.source.as_ref().and_then(|s| {
            s.action
                .as_ref()
                .map(|a| format!("{}/{}", s.protocol, a))
        }),
        chain: node.chain.clone(),
        params: readiness.resolved_params.clone(),
        preview,
        risk_level,
        risk_tags,
        slippage_bps,
        approval_amount,
        spend_amount,
        unlimited_approval,
        token_address,
        spender_address,
        owner_address,
        mint_address,
        missing_fields,
        unknown_fields,
        hard_block_fields,
        field_sources,
    }
}

/// Outcome of constraint validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstraintOutcome {
    /// Hard violations.
    pub violations: Vec<String>,
    /// Approval requirements, deduplicated.
    pub approvals: Vec<String>,
}

/// Validate a gate input against policy constraints and the allowlist.
pub fn validate_constraints(
    policy: &PolicyConfig,
    token_policy: Option<&TokenPolicy>,
    input: &GateInput,
) -> ConstraintOutcome {
    let mut outcome = ConstraintOutcome::default();
    let mut require_approval = |reason: String, outcome: &mut ConstraintOutcome| {
        if !outcome.approvals.contains(&reason) {
            outcome.approvals.push(reason);
        }
    };

    if let Some(token_policy) = token_policy {
        let identity = input
            .token_address
            .as_deref()
            .or(input.mint_address.as_deref());
        if let Some(token) = identity {
            if !token_policy.allows(token) {
                match token_policy.mode {
                    AllowlistMode::Strict => outcome
                        .violations
                        .push(format!("token {token} is not allowlisted")),
                    AllowlistMode::Permissive => require_approval(
                        format!("token {token} is not allowlisted"),
                        &mut outcome,
                    ),
                }
            }
        }
    }

    if let (Some(max), Some(actual)) = (
        policy.hard_constraints.max_slippage_bps,
        input.slippage_bps,
    ) {
        if actual > max {
            outcome
                .violations
                .push(format!("slippage {actual} bps exceeds maximum {max} bps"));
        }
    }

    if policy.hard_constraints.allow_unlimited_approval == Some(false)
        && input.unlimited_approval == Some(true)
    {
        outcome
            .violations
            .push("unlimited approval is not permitted".to_string());
    }

    if let Some(threshold) = policy.risk_threshold {
        if input.risk_level >= threshold {
            require_approval(
                format!("risk level {:?} meets approval threshold", input.risk_level),
                &mut outcome,
            );
        }
    }
    for tag in &input.risk_tags {
        if policy.approval_required.contains(tag) {
            require_approval(format!("risk tag {tag:?} requires approval"), &mut outcome);
        }
    }

    outcome
}

/// Enforce a pack's policy over an extracted gate input.
pub fn enforce(pack: &PolicyPack, input: &GateInput) -> GateDecision {
    if !input.hard_block_fields.is_empty() {
        return GateDecision::HardBlock {
            reason: "policy gate required fields are missing".to_string(),
            details: json!({
                "hard_block_fields": input.hard_block_fields,
                "compile_error": input.preview.compile_error(),
            }),
        };
    }
    if !input.missing_fields.is_empty() {
        return GateDecision::NeedUserConfirm {
            reason: "policy gate input is incomplete".to_string(),
            details: json!({ "missing_fields": input.missing_fields }),
        };
    }
    if !input.unknown_fields.is_empty() {
        return GateDecision::NeedUserConfirm {
            reason: "policy gate input has unknown fields".to_string(),
            details: json!({ "unknown_fields": input.unknown_fields }),
        };
    }
    let outcome = validate_constraints(&pack.policy, pack.token_policy.as_ref(), input);
    if !outcome.violations.is_empty() {
        tracing::warn!(node = %input.node_id, violations = ?outcome.violations,
            "policy hard block");
        return GateDecision::HardBlock {
            reason: outcome.violations.join("; "),
            details: json!({ "violations": outcome.violations }),
        };
    }
    if !outcome.approvals.is_empty() {
        return GateDecision::NeedUserConfirm {
            reason: outcome.approvals.join("; "),
            details: json!({ "hit_reasons": outcome.approvals }),
        };
    }
    GateDecision::Allow
}

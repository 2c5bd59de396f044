//! Execution compilers
//!
//! A compiler is a pure transform from a plan node plus resolved runtime
//! values to a concrete chain request - the only place a wire artifact is
//! produced. Compilers never touch the network and never mutate the
//! runtime; given equal inputs they produce equal requests.

pub mod abi;
pub mod evm;
pub mod solana;

use crate::error::CompileError;
use crate::plan::{ExecutionSpec, PlanNode};
use crate::runtime::RuntimeTree;
use crate::value::Value;
use crate::valueref::{evaluate_value_ref, EvalContext, ValueRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use evm::{EvmCallRequest, EvmRpcRequest};
pub use solana::{
    CompiledAccount, SolanaCompilerRegistry, SolanaInstructionRequest, SolanaReadRequest,
};

/// A concrete chain request produced by a compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompiledRequest {
    /// EVM contract call (read or write).
    EvmCall(EvmCallRequest),
    /// Batched EVM reads.
    EvmMultiread {
        /// Chain id.
        chain_id: u64,
        /// The calls, in order.
        calls: Vec<EvmCallRequest>,
    },
    /// Raw EVM JSON-RPC request.
    EvmRpc(EvmRpcRequest),
    /// Solana account read.
    SolanaRead(SolanaReadRequest),
    /// Solana program instruction.
    SolanaInstruction(SolanaInstructionRequest),
}

/// Inputs to compilation: the runtime and the node's resolved spec fields.
pub struct CompileContext<'a> {
    /// The runtime tree.
    pub runtime: &'a RuntimeTree,
    /// Resolved spec fields keyed by field path, from readiness.
    pub resolved_params: &'a BTreeMap<String, Value>,
}

impl<'a> CompileContext<'a> {
    /// Resolve a spec field: prefer the readiness-resolved value, fall back
    /// to evaluating the reference directly.
    pub fn resolve(&self, field: &str, vref: &ValueRef) -> Result<Value, CompileError> {
        if let Some(value) = self.resolved_params.get(field) {
            return Ok(value.clone());
        }
        evaluate_value_ref(vref, &EvalContext::new(self.runtime)).map_err(|err| {
            CompileError::field(field, err.to_string())
        })
    }
}

/// Compile a plan node into a concrete request.
pub fn compile(node: &PlanNode, ctx: &CompileContext<'_>) -> Result<CompiledRequest, CompileError> {
    match &node.execution {
        ExecutionSpec::EvmRead(target) => Ok(CompiledRequest::EvmCall(evm::compile_call(
            &node.chain,
            target,
            None,
            true,
            "",
            ctx,
        )?)),
        ExecutionSpec::EvmMultiread { reads } => {
            let chain_id = evm::parse_chain_id(&node.chain)?;
            let calls = reads
                .iter()
                .enumerate()
                .map(|(i, target)| {
                    evm::compile_call(
                        &node.chain,
                        target,
                        None,
                        true,
                        &format!("reads.{i}."),
                        ctx,
                    )
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(CompiledRequest::EvmMultiread { chain_id, calls })
        }
        ExecutionSpec::EvmCall { target, value } => Ok(CompiledRequest::EvmCall(
            evm::compile_call(&node.chain, target, value.as_ref(), false, "", ctx)?,
        )),
        ExecutionSpec::EvmRpc { method, params } => Ok(CompiledRequest::EvmRpc(
            evm::compile_rpc(&node.chain, method, params, ctx)?,
        )),
        ExecutionSpec::EvmGetBalance { .. } => {
            // PlanNode::new normalizes this away; reject a spec that
            // bypassed normalization.
            Err(CompileError::new(
                "evm_get_balance must be normalized to evm_rpc before compile",
            ))
        }
        ExecutionSpec::SolanaRead { account } => Ok(CompiledRequest::SolanaRead(
            solana::compile_read(&node.chain, account, ctx)?,
        )),
        ExecutionSpec::SolanaInstruction {
            program,
            instruction,
            accounts,
            data,
            discriminator,
        } => Ok(CompiledRequest::SolanaInstruction(
            solana::compile_instruction(
                &node.chain,
                program,
                instruction.as_deref(),
                accounts,
                data.as_ref(),
                discriminator.as_ref(),
                ctx,
                None,
            )?,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{EvmCallTarget, PlanNode};
    use crate::runtime::Patch;
    use serde_json::json;

    #[test]
    fn compile_is_pure_given_equal_inputs() {
        let mut rt = RuntimeTree::new();
        rt.apply_patches(
            &[
                Patch::set("inputs.to", "0x2222222222222222222222222222222222222222"),
                Patch::set("inputs.amount", 5i64),
            ],
            None,
        );
        let node = PlanNode::new(
            "n1",
            "eip155:1",
            ExecutionSpec::EvmCall {
                target: EvmCallTarget {
                    to: ValueRef::path("inputs.to"),
                    abi: json!([{
                        "name": "transfer",
                        "type": "function",
                        "inputs": [
                            {"name": "to", "type": "address"},
                            {"name": "amount", "type": "uint256"}
                        ],
                        "outputs": []
                    }]),
                    function: "transfer".to_string(),
                    args: [
                        ("to".to_string(), ValueRef::path("inputs.to")),
                        ("amount".to_string(), ValueRef::path("inputs.amount")),
                    ]
                    .into_iter()
                    .collect(),
                },
                value: None,
            },
        );
        let params = BTreeMap::new();
        let ctx = CompileContext {
            runtime: &rt,
            resolved_params: &params,
        };
        let first = compile(&node, &ctx).unwrap();
        let second = compile(&node, &ctx).unwrap();
        assert_eq!(first, second);
    }
}

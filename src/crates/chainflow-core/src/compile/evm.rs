//! EVM request compilation: eip155 chain parsing, address validation,
//! calldata assembly.

use super::abi::{self, AbiFunction};
use super::CompileContext;
use crate::error::CompileError;
use crate::plan::EvmCallTarget;
use crate::value::Value;
use crate::valueref::ValueRef;
use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A compiled EVM contract call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvmCallRequest {
    /// Numeric chain id from `eip155:<N>`.
    pub chain_id: u64,
    /// Target contract, 0x-prefixed lowercase.
    pub to: String,
    /// Calldata: selector plus encoded arguments.
    pub data: Vec<u8>,
    /// Native value attached to the call.
    pub value: BigInt,
    /// Function name, for previews and output decoding.
    pub function_name: String,
    /// The resolved ABI function.
    pub function: AbiFunction,
    /// Resolved argument values by parameter name.
    pub args: BTreeMap<String, Value>,
    /// Whether this call is read-only.
    pub read_only: bool,
}

/// A compiled raw JSON-RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvmRpcRequest {
    /// Numeric chain id from `eip155:<N>`.
    pub chain_id: u64,
    /// RPC method name.
    pub method: String,
    /// Resolved positional parameters.
    pub params: Vec<Value>,
}

/// Parse `eip155:<N>` into the numeric chain id.
pub fn parse_chain_id(chain: &str) -> Result<u64, CompileError> {
    chain
        .strip_prefix("eip155:")
        .and_then(|n| n.parse::<u64>().ok())
        .ok_or_else(|| CompileError::field("chain", format!("not an eip155 chain: {chain:?}")))
}

fn resolve_value(value: Option<&ValueRef>, ctx: &CompileContext<'_>) -> Result<BigInt, CompileError> {
    let Some(vref) = value else {
        return Ok(BigInt::zero());
    };
    let resolved = ctx.resolve("value", vref)?;
    let v = match &resolved {
        Value::Int(i) => i.clone(),
        Value::Decimal(d) => d
            .to_bigint_exact()
            .ok_or_else(|| CompileError::field("value", format!("{d} is not an integer")))?,
        Value::String(s) => chainflow_decimal::BigDecimal::parse(s)
            .ok()
            .and_then(|d| d.to_bigint_exact())
            .ok_or_else(|| {
                CompileError::field("value", format!("{s:?} is not an integral amount"))
            })?,
        other => {
            return Err(CompileError::field(
                "value",
                format!("expected integer, got {}", other.type_name()),
            ))
        }
    };
    if v.is_negative() {
        return Err(CompileError::field("value", "value must be non-negative"));
    }
    Ok(v)
}

/// Compile one contract call target.
pub fn compile_call(
    chain: &str,
    target: &EvmCallTarget,
    value: Option<&ValueRef>,
    read_only: bool,
    field_prefix: &str,
    ctx: &CompileContext<'_>,
) -> Result<EvmCallRequest, CompileError> {
    let chain_id = parse_chain_id(chain)?;

    let to_field = format!("{field_prefix}to");
    let to_value = ctx.resolve(&to_field, &target.to)?;
    let to_bytes = abi::coerce_address(&to_value, &to_field)?;
    let to = format!("0x{}", hex::encode(to_bytes));

    let function = AbiFunction::from_abi_json(&target.abi, &target.function)?;

    let mut args = BTreeMap::new();
    for (name, vref) in &target.args {
        let field = format!("{field_prefix}args.{name}");
        args.insert(name.clone(), ctx.resolve(&field, vref)?);
    }

    let data = abi::encode_call(&function, |name| args.get(name).cloned())?;
    let value = resolve_value(value, ctx)?;

    Ok(EvmCallRequest {
        chain_id,
        to,
        data,
        value,
        function_name: function.name.clone(),
        function,
        args,
        read_only,
    })
}

/// Compile a raw JSON-RPC request.
pub fn compile_rpc(
    chain: &str,
    method: &str,
    params: &[ValueRef],
    ctx: &CompileContext<'_>,
) -> Result<EvmRpcRequest, CompileError> {
    let chain_id = parse_chain_id(chain)?;
    let params = params
        .iter()
        .enumerate()
        .map(|(i, vref)| ctx.resolve(&format!("params.{i}"), vref))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(EvmRpcRequest {
        chain_id,
        method: method.to_string(),
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Patch, RuntimeTree};
    use serde_json::json;

    fn ctx_with<'a>(
        rt: &'a RuntimeTree,
        params: &'a BTreeMap<String, Value>,
    ) -> CompileContext<'a> {
        CompileContext {
            runtime: rt,
            resolved_params: params,
        }
    }

    #[test]
    fn parses_eip155_chains() {
        assert_eq!(parse_chain_id("eip155:1").unwrap(), 1);
        assert_eq!(parse_chain_id("eip155:42161").unwrap(), 42161);
        assert!(parse_chain_id("solana:mainnet").is_err());
        assert!(parse_chain_id("eip155:").is_err());
    }

    #[test]
    fn compiles_a_transfer_call() {
        let mut rt = RuntimeTree::new();
        rt.apply_patches(
            &[Patch::set(
                "inputs.to",
                "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
            )],
            None,
        );
        let params = BTreeMap::new();
        let target = EvmCallTarget {
            to: ValueRef::path("inputs.to"),
            abi: json!([{
                "name": "transfer",
                "type": "function",
                "inputs": [
                    {"name": "to", "type": "address"},
                    {"name": "amount", "type": "uint256"}
                ],
                "outputs": [{"name": "", "type": "bool"}]
            }]),
            function: "transfer".to_string(),
            args: [
                ("to".to_string(), ValueRef::path("inputs.to")),
                ("amount".to_string(), ValueRef::lit(1_000i64)),
            ]
            .into_iter()
            .collect(),
        };
        let req = compile_call(
            "eip155:1",
            &target,
            None,
            false,
            "",
            &ctx_with(&rt, &params),
        )
        .unwrap();
        assert_eq!(req.chain_id, 1);
        assert_eq!(req.to, "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
        assert_eq!(&req.data[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(req.value, BigInt::from(0));
        assert!(!req.read_only);
    }

    #[test]
    fn value_accepts_integer_forms_and_rejects_negative() {
        let rt = RuntimeTree::new();
        let params = BTreeMap::new();
        let ctx = ctx_with(&rt, &params);
        assert_eq!(
            resolve_value(Some(&ValueRef::lit("1000000")), &ctx).unwrap(),
            BigInt::from(1_000_000)
        );
        assert_eq!(resolve_value(None, &ctx).unwrap(), BigInt::from(0));
        assert!(resolve_value(Some(&ValueRef::lit(-1i64)), &ctx).is_err());
    }

    #[test]
    fn errors_carry_field_paths() {
        let rt = RuntimeTree::new();
        let params = BTreeMap::new();
        let target = EvmCallTarget {
            to: ValueRef::lit("0xnot"),
            abi: json!([]),
            function: "f".to_string(),
            args: BTreeMap::new(),
        };
        let err = compile_call(
            "eip155:1",
            &target,
            None,
            true,
            "",
            &ctx_with(&rt, &params),
        )
        .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("to"));
    }
}

//! Solana instruction compilation
//!
//! Public keys arrive as base58 strings and are validated to 32 bytes. A
//! registry maps `(program id, instruction name)` to a program-specific data
//! builder; known entries cover the SPL token program (`transfer`,
//! `transfer_checked`, `approve`) and the associated-token-account program
//! (`create_idempotent`). Anything else goes through the generic compiler,
//! which prefixes the optional `discriminator` to the raw `data` bytes and
//! emits the declared accounts untouched.

use super::CompileContext;
use crate::error::CompileError;
use crate::plan::AccountSpec;
use crate::value::Value;
use crate::valueref::ValueRef;
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

/// SPL token program id.
pub const TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
/// Associated token account program id.
pub const ASSOCIATED_TOKEN_PROGRAM_ID: &str = "ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL";

/// A compiled account reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledAccount {
    /// Role name from the spec.
    pub name: String,
    /// Base58 public key.
    pub pubkey: String,
    /// Whether the account signs.
    pub signer: bool,
    /// Whether the account is writable.
    pub writable: bool,
}

/// A compiled Solana account read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolanaReadRequest {
    /// Chain identifier (`solana:mainnet`).
    pub chain: String,
    /// Base58 account to fetch.
    pub account: String,
}

/// A compiled Solana instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolanaInstructionRequest {
    /// Chain identifier.
    pub chain: String,
    /// Base58 program id.
    pub program_id: String,
    /// Instruction name, when declared.
    pub instruction: Option<String>,
    /// Accounts in wire order.
    pub accounts: Vec<CompiledAccount>,
    /// Serialized instruction data.
    pub data: Vec<u8>,
    /// Resolved data fields, for policy inspection.
    pub data_fields: BTreeMap<String, Value>,
}

/// Validate and normalize a base58 public key.
pub fn parse_pubkey(value: &Value, field: &str) -> Result<String, CompileError> {
    let text = value.as_str().ok_or_else(|| {
        CompileError::field(field, format!("expected base58 string, got {}", value.type_name()))
    })?;
    let bytes = bs58::decode(text)
        .into_vec()
        .map_err(|e| CompileError::field(field, format!("bad base58: {e}")))?;
    if bytes.len() != 32 {
        return Err(CompileError::field(
            field,
            format!("pubkey must decode to 32 bytes, got {}", bytes.len()),
        ));
    }
    Ok(text.to_string())
}

fn value_to_bytes(value: &Value, field: &str) -> Result<Vec<u8>, CompileError> {
    match value {
        Value::Bytes(b) => Ok(b.clone()),
        Value::String(s) => {
            let digits = s
                .strip_prefix("0x")
                .or_else(|| s.strip_prefix("0X"))
                .ok_or_else(|| {
                    CompileError::field(field, format!("byte string {s:?} lacks 0x prefix"))
                })?;
            hex::decode(digits).map_err(|e| CompileError::field(field, format!("bad hex: {e}")))
        }
        Value::List(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                item.as_int()
                    .and_then(BigInt::to_u8)
                    .ok_or_else(|| CompileError::field(format!("{field}.{i}"), "expected a byte"))
            })
            .collect(),
        other => Err(CompileError::field(
            field,
            format!("expected bytes, got {}", other.type_name()),
        )),
    }
}

fn field_u64(fields: &BTreeMap<String, Value>, key: &str) -> Result<u64, CompileError> {
    let field = format!("data.{key}");
    let value = fields
        .get(key)
        .ok_or_else(|| CompileError::field(&field, "data field missing"))?;
    let int = match value {
        Value::Int(i) => i.clone(),
        Value::String(s) => s
            .parse::<BigInt>()
            .map_err(|_| CompileError::field(&field, format!("bad integer {s:?}")))?,
        Value::Decimal(d) => d
            .to_bigint_exact()
            .ok_or_else(|| CompileError::field(&field, format!("{d} is not an integer")))?,
        other => {
            return Err(CompileError::field(
                &field,
                format!("expected integer, got {}", other.type_name()),
            ))
        }
    };
    int.to_u64()
        .ok_or_else(|| CompileError::field(&field, format!("{int} out of u64 range")))
}

fn field_u8(fields: &BTreeMap<String, Value>, key: &str) -> Result<u8, CompileError> {
    let v = field_u64(fields, key)?;
    u8::try_from(v)
        .map_err(|_| CompileError::field(format!("data.{key}"), format!("{v} out of u8 range")))
}

/// Inputs handed to a program-specific data builder.
pub struct InstructionInputs<'a> {
    /// Resolved data fields.
    pub data_fields: &'a BTreeMap<String, Value>,
    /// Compiled accounts, in declaration order.
    pub accounts: &'a [CompiledAccount],
}

type DataBuilder = fn(&InstructionInputs<'_>) -> Result<Vec<u8>, CompileError>;

fn build_token_transfer(inputs: &InstructionInputs<'_>) -> Result<Vec<u8>, CompileError> {
    let mut data = vec![3u8];
    data.extend(field_u64(inputs.data_fields, "amount")?.to_le_bytes());
    Ok(data)
}

fn build_token_approve(inputs: &InstructionInputs<'_>) -> Result<Vec<u8>, CompileError> {
    let mut data = vec![4u8];
    data.extend(field_u64(inputs.data_fields, "amount")?.to_le_bytes());
    Ok(data)
}

fn build_token_transfer_checked(inputs: &InstructionInputs<'_>) -> Result<Vec<u8>, CompileError> {
    let mut data = vec![12u8];
    data.extend(field_u64(inputs.data_fields, "amount")?.to_le_bytes());
    data.push(field_u8(inputs.data_fields, "decimals")?);
    Ok(data)
}

fn build_ata_create_idempotent(_inputs: &InstructionInputs<'_>) -> Result<Vec<u8>, CompileError> {
    Ok(vec![1u8])
}

/// Registry of program-specific instruction compilers.
pub struct SolanaCompilerRegistry {
    entries: HashMap<(String, String), DataBuilder>,
}

impl Default for SolanaCompilerRegistry {
    fn default() -> Self {
        let mut entries: HashMap<(String, String), DataBuilder> = HashMap::new();
        entries.insert(
            (TOKEN_PROGRAM_ID.to_string(), "transfer".to_string()),
            build_token_transfer,
        );
        entries.insert(
            (TOKEN_PROGRAM_ID.to_string(), "approve".to_string()),
            build_token_approve,
        );
        entries.insert(
            (TOKEN_PROGRAM_ID.to_string(), "transfer_checked".to_string()),
            build_token_transfer_checked,
        );
        entries.insert(
            (
                ASSOCIATED_TOKEN_PROGRAM_ID.to_string(),
                "create_idempotent".to_string(),
            ),
            build_ata_create_idempotent,
        );
        Self { entries }
    }
}

impl SolanaCompilerRegistry {
    /// The process-wide default registry.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<SolanaCompilerRegistry> = OnceLock::new();
        GLOBAL.get_or_init(Self::default)
    }

    /// Look up a builder.
    pub fn get(&self, program_id: &str, instruction: &str) -> Option<DataBuilder> {
        self.entries
            .get(&(program_id.to_string(), instruction.to_string()))
            .copied()
    }
}

/// Compile an account read.
pub fn compile_read(
    chain: &str,
    account: &ValueRef,
    ctx: &CompileContext<'_>,
) -> Result<SolanaReadRequest, CompileError> {
    let value = ctx.resolve("account", account)?;
    Ok(SolanaReadRequest {
        chain: chain.to_string(),
        account: parse_pubkey(&value, "account")?,
    })
}

/// Compile an instruction, consulting the registry and falling back to the
/// generic discriminator-plus-data form.
#[allow(clippy::too_many_arguments)]
pub fn compile_instruction(
    chain: &str,
    program: &ValueRef,
    instruction: Option<&str>,
    accounts: &[AccountSpec],
    data: Option<&ValueRef>,
    discriminator: Option<&ValueRef>,
    ctx: &CompileContext<'_>,
    registry: Option<&'static SolanaCompilerRegistry>,
) -> Result<SolanaInstructionRequest, CompileError> {
    let registry = registry.unwrap_or_else(SolanaCompilerRegistry::global);

    let program_value = ctx.resolve("program", program)?;
    let program_id = parse_pubkey(&program_value, "program")?;

    let mut compiled_accounts = Vec::with_capacity(accounts.len());
    for account in accounts {
        let field = format!("accounts.{}.pubkey", account.name);
        let value = ctx.resolve(&field, &account.pubkey)?;
        compiled_accounts.push(CompiledAccount {
            name: account.name.clone(),
            pubkey: parse_pubkey(&value, &field)?,
            signer: account.signer,
            writable: account.writable,
        });
    }

    let data_value = match data {
        Some(vref) => Some(ctx.resolve("data", vref)?),
        None => None,
    };
    let data_fields: BTreeMap<String, Value> = match &data_value {
        Some(Value::Map(map)) => map.clone(),
        _ => BTreeMap::new(),
    };

    let inputs = InstructionInputs {
        data_fields: &data_fields,
        accounts: &compiled_accounts,
    };

    let data_bytes = match instruction.and_then(|name| registry.get(&program_id, name)) {
        Some(builder) => builder(&inputs)?,
        None => {
            let mut bytes = match discriminator {
                Some(vref) => {
                    let value = ctx.resolve("discriminator", vref)?;
                    value_to_bytes(&value, "discriminator")?
                }
                None => Vec::new(),
            };
            if let Some(value) = &data_value {
                match value {
                    Value::Map(_) => {
                        return Err(CompileError::field(
                            "data",
                            format!(
                                "no compiler for ({program_id}, {:?}) and data is not bytes",
                                instruction.unwrap_or("")
                            ),
                        ))
                    }
                    other => bytes.extend(value_to_bytes(other, "data")?),
                }
            }
            bytes
        }
    };

    Ok(SolanaInstructionRequest {
        chain: chain.to_string(),
        program_id,
        instruction: instruction.map(str::to_string),
        accounts: compiled_accounts,
        data: data_bytes,
        data_fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeTree;
    use crate::value_map;

    const OWNER: &str = "11111111111111111111111111111111";
    const SOURCE: &str = "So11111111111111111111111111111111111111112";
    const DEST: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    fn ctx_with<'a>(
        rt: &'a RuntimeTree,
        params: &'a BTreeMap<String, Value>,
    ) -> CompileContext<'a> {
        CompileContext {
            runtime: rt,
            resolved_params: params,
        }
    }

    fn account(name: &str, key: &str, signer: bool, writable: bool) -> AccountSpec {
        AccountSpec {
            name: name.to_string(),
            pubkey: ValueRef::lit(key),
            signer,
            writable,
        }
    }

    #[test]
    fn pubkeys_must_be_32_bytes_of_base58() {
        assert!(parse_pubkey(&Value::from(OWNER), "k").is_ok());
        assert!(parse_pubkey(&Value::from("abc"), "k").is_err());
        assert!(parse_pubkey(&Value::from("0Ol"), "k").is_err());
        assert!(parse_pubkey(&Value::from(42i64), "k").is_err());
    }

    #[test]
    fn token_transfer_builds_tag_and_le_amount() {
        let rt = RuntimeTree::new();
        let params = BTreeMap::new();
        let req = compile_instruction(
            "solana:mainnet",
            &ValueRef::lit(TOKEN_PROGRAM_ID),
            Some("transfer"),
            &[
                account("source", SOURCE, false, true),
                account("destination", DEST, false, true),
                account("owner", OWNER, true, false),
            ],
            Some(&ValueRef::lit(value_map! { "amount" => 1_000_000i64 })),
            None,
            &ctx_with(&rt, &params),
            None,
        )
        .unwrap();
        assert_eq!(req.program_id, TOKEN_PROGRAM_ID);
        assert_eq!(req.data[0], 3);
        assert_eq!(&req.data[1..9], &1_000_000u64.to_le_bytes());
        assert_eq!(req.accounts.len(), 3);
        assert!(req.accounts[2].signer);
    }

    #[test]
    fn transfer_checked_appends_decimals() {
        let rt = RuntimeTree::new();
        let params = BTreeMap::new();
        let req = compile_instruction(
            "solana:mainnet",
            &ValueRef::lit(TOKEN_PROGRAM_ID),
            Some("transfer_checked"),
            &[account("source", SOURCE, false, true)],
            Some(&ValueRef::lit(
                value_map! { "amount" => 500i64, "decimals" => 6i64 },
            )),
            None,
            &ctx_with(&rt, &params),
            None,
        )
        .unwrap();
        assert_eq!(req.data[0], 12);
        assert_eq!(&req.data[1..9], &500u64.to_le_bytes());
        assert_eq!(req.data[9], 6);
    }

    #[test]
    fn approve_uses_tag_four() {
        let rt = RuntimeTree::new();
        let params = BTreeMap::new();
        let req = compile_instruction(
            "solana:mainnet",
            &ValueRef::lit(TOKEN_PROGRAM_ID),
            Some("approve"),
            &[
                account("source", SOURCE, false, true),
                account("delegate", DEST, false, false),
                account("owner", OWNER, true, false),
            ],
            Some(&ValueRef::lit(value_map! { "amount" => 42i64 })),
            None,
            &ctx_with(&rt, &params),
            None,
        )
        .unwrap();
        assert_eq!(req.data[0], 4);
    }

    #[test]
    fn ata_create_idempotent_is_a_single_byte() {
        let rt = RuntimeTree::new();
        let params = BTreeMap::new();
        let req = compile_instruction(
            "solana:mainnet",
            &ValueRef::lit(ASSOCIATED_TOKEN_PROGRAM_ID),
            Some("create_idempotent"),
            &[account("payer", OWNER, true, true)],
            None,
            None,
            &ctx_with(&rt, &params),
            None,
        )
        .unwrap();
        assert_eq!(req.data, vec![1]);
    }

    #[test]
    fn generic_compiler_prefixes_discriminator() {
        let rt = RuntimeTree::new();
        let params = BTreeMap::new();
        let req = compile_instruction(
            "solana:mainnet",
            &ValueRef::lit(OWNER),
            Some("initialize"),
            &[account("state", SOURCE, false, true)],
            Some(&ValueRef::lit("0xdeadbeef")),
            Some(&ValueRef::lit(Value::bytes(vec![0xafu8, 0xaf, 0x6d, 0x1f, 0x0d, 0x98, 0x9b, 0xed]))),
            &ctx_with(&rt, &params),
            None,
        )
        .unwrap();
        assert_eq!(
            req.data,
            vec![0xaf, 0xaf, 0x6d, 0x1f, 0x0d, 0x98, 0x9b, 0xed, 0xde, 0xad, 0xbe, 0xef]
        );
        assert_eq!(req.instruction.as_deref(), Some("initialize"));
    }

    #[test]
    fn missing_amount_names_the_data_field() {
        let rt = RuntimeTree::new();
        let params = BTreeMap::new();
        let err = compile_instruction(
            "solana:mainnet",
            &ValueRef::lit(TOKEN_PROGRAM_ID),
            Some("transfer"),
            &[account("source", SOURCE, false, true)],
            Some(&ValueRef::lit(Value::empty_map())),
            None,
            &ctx_with(&rt, &params),
            None,
        )
        .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("data.amount"));
    }

    #[test]
    fn bad_account_pubkey_names_the_account_field() {
        let rt = RuntimeTree::new();
        let params = BTreeMap::new();
        let err = compile_instruction(
            "solana:mainnet",
            &ValueRef::lit(TOKEN_PROGRAM_ID),
            Some("transfer"),
            &[account("source", "bogus", false, true)],
            Some(&ValueRef::lit(value_map! { "amount" => 1i64 })),
            None,
            &ctx_with(&rt, &params),
            None,
        )
        .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("accounts.source.pubkey"));
    }
}

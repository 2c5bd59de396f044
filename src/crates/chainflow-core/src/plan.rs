//! Execution plan data model
//!
//! A plan is an ordered list of [`PlanNode`]s whose `deps` form a DAG. Each
//! node targets exactly one chain and carries an [`ExecutionSpec`] - the
//! lazy, ValueRef-typed description a compiler later turns into a concrete
//! chain request. Nodes reference protocols and actions by id through
//! [`NodeSource`]; nothing in a plan is linked by pointer, so the same plan
//! round-trips through a checkpoint unchanged.

use crate::valueref::ValueRef;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};

/// Node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanNodeKind {
    /// Inline execution.
    Execution,
    /// Expanded from a protocol action.
    ActionRef,
    /// Expanded from a protocol query.
    QueryRef,
}

/// Where a node came from in the workflow document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSource {
    /// Protocol id.
    pub protocol: String,
    /// Action id, for action-derived nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Query id, for query-derived nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Originating workflow node id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Step id inside a composite action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

/// Write mode for a declared runtime write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Replace the sub-tree.
    Set,
    /// Shallow-merge into the sub-tree.
    Merge,
}

/// A declared runtime write: the node's outputs land at `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSpec {
    /// Destination path in the runtime tree.
    pub path: String,
    /// How outputs are written.
    pub mode: WriteMode,
}

/// Retry policy for `until`-polling nodes. Intervals are fixed, not
/// jittered: polling cadence must be reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySpec {
    /// Milliseconds between attempts.
    pub interval_ms: u64,
    /// Attempt cap; unbounded when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

/// A named Solana account reference. Declaration order is wire order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSpec {
    /// Role name (`source`, `destination`, `owner`, `delegate`, `mint`, ...).
    pub name: String,
    /// The account public key.
    pub pubkey: ValueRef,
    /// Whether the account signs.
    #[serde(default)]
    pub signer: bool,
    /// Whether the account is writable.
    #[serde(default)]
    pub writable: bool,
}

/// A single EVM contract call target, shared by reads and multireads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvmCallTarget {
    /// Contract address.
    pub to: ValueRef,
    /// The JSON ABI: a function object or an array to search by name.
    pub abi: Json,
    /// Function name.
    pub function: String,
    /// Arguments by parameter name.
    #[serde(default)]
    pub args: BTreeMap<String, ValueRef>,
}

/// Chain-specific execution description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionSpec {
    /// Read-only EVM contract call.
    EvmRead(EvmCallTarget),

    /// Batched read-only EVM contract calls.
    EvmMultiread {
        /// The calls, in order.
        reads: Vec<EvmCallTarget>,
    },

    /// State-changing EVM contract call.
    EvmCall {
        /// The call target.
        #[serde(flatten)]
        target: EvmCallTarget,
        /// Native value to attach; defaults to zero.
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<ValueRef>,
    },

    /// Generic read-only JSON-RPC request.
    EvmRpc {
        /// RPC method name.
        method: String,
        /// Positional parameters.
        #[serde(default)]
        params: Vec<ValueRef>,
    },

    /// Native balance read. Normalized onto `evm_rpc` at construction.
    EvmGetBalance {
        /// Account to read.
        address: ValueRef,
    },

    /// Solana account read.
    SolanaRead {
        /// Account to fetch.
        account: ValueRef,
    },

    /// Solana program instruction.
    SolanaInstruction {
        /// Program id (base58).
        program: ValueRef,
        /// Instruction name, for registry lookup.
        #[serde(skip_serializing_if = "Option::is_none")]
        instruction: Option<String>,
        /// Accounts in wire order.
        #[serde(default)]
        accounts: Vec<AccountSpec>,
        /// Instruction data: a field map for known instructions, or bytes /
        /// 0x-hex for the generic compiler.
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<ValueRef>,
        /// Discriminator prefixed to generic instruction data.
        #[serde(skip_serializing_if = "Option::is_none")]
        discriminator: Option<ValueRef>,
    },
}

impl ExecutionSpec {
    /// The wire name of this execution type.
    pub fn exec_type(&self) -> &'static str {
        match self {
            ExecutionSpec::EvmRead(_) => "evm_read",
            ExecutionSpec::EvmMultiread { .. } => "evm_multiread",
            ExecutionSpec::EvmCall { .. } => "evm_call",
            ExecutionSpec::EvmRpc { .. } => "evm_rpc",
            ExecutionSpec::EvmGetBalance { .. } => "evm_get_balance",
            ExecutionSpec::SolanaRead { .. } => "solana_read",
            ExecutionSpec::SolanaInstruction { .. } => "solana_instruction",
        }
    }

    /// Read/write classification for concurrency caps and event shaping.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            ExecutionSpec::EvmRead(_)
                | ExecutionSpec::EvmMultiread { .. }
                | ExecutionSpec::EvmRpc { .. }
                | ExecutionSpec::EvmGetBalance { .. }
                | ExecutionSpec::SolanaRead { .. }
        )
    }

    /// Normalize legacy representations: `evm_get_balance` becomes an
    /// `evm_rpc` `eth_getBalance` request.
    pub fn normalize(self) -> Self {
        match self {
            ExecutionSpec::EvmGetBalance { address } => ExecutionSpec::EvmRpc {
                method: "eth_getBalance".to_string(),
                params: vec![address, ValueRef::lit("latest")],
            },
            other => other,
        }
    }

    /// Enumerate the spec's ValueRef fields as `(field path, reference)`.
    /// These are the node's inputs for readiness purposes.
    pub fn value_refs(&self) -> Vec<(String, &ValueRef)> {
        let mut out = Vec::new();
        match self {
            ExecutionSpec::EvmRead(target) => collect_target("", target, &mut out),
            ExecutionSpec::EvmMultiread { reads } => {
                for (i, target) in reads.iter().enumerate() {
                    collect_target(&format!("reads.{i}."), target, &mut out);
                }
            }
            ExecutionSpec::EvmCall { target, value } => {
                collect_target("", target, &mut out);
                if let Some(value) = value {
                    out.push(("value".to_string(), value));
                }
            }
            ExecutionSpec::EvmRpc { params, .. } => {
                for (i, param) in params.iter().enumerate() {
                    out.push((format!("params.{i}"), param));
                }
            }
            ExecutionSpec::EvmGetBalance { address } => {
                out.push(("address".to_string(), address));
            }
            ExecutionSpec::SolanaRead { account } => {
                out.push(("account".to_string(), account));
            }
            ExecutionSpec::SolanaInstruction {
                program,
                accounts,
                data,
                discriminator,
                ..
            } => {
                out.push(("program".to_string(), program));
                for account in accounts {
                    out.push((format!("accounts.{}.pubkey", account.name), &account.pubkey));
                }
                if let Some(data) = data {
                    out.push(("data".to_string(), data));
                }
                if let Some(discriminator) = discriminator {
                    out.push(("discriminator".to_string(), discriminator));
                }
            }
        }
        out
    }
}

fn collect_target<'a>(
    prefix: &str,
    target: &'a EvmCallTarget,
    out: &mut Vec<(String, &'a ValueRef)>,
) {
    out.push((format!("{prefix}to"), &target.to));
    for (name, arg) in &target.args {
        out.push((format!("{prefix}args.{name}"), arg));
    }
}

/// A compiled unit of work targeting one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    /// Unique node id.
    pub id: String,
    /// Target chain (`eip155:1`, `solana:mainnet`).
    pub chain: String,
    /// Node kind.
    pub kind: PlanNodeKind,
    /// Execution description.
    pub execution: ExecutionSpec,
    /// Provenance ids.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<NodeSource>,
    /// Ids of nodes that must complete first.
    #[serde(default)]
    pub deps: BTreeSet<String>,
    /// Declared runtime writes for the node's outputs.
    #[serde(default)]
    pub writes: Vec<WriteSpec>,
    /// Skip condition: evaluated as a CEL boolean; false skips the node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<ValueRef>,
    /// Post-settlement assertion.
    #[serde(rename = "assert", skip_serializing_if = "Option::is_none")]
    pub assertion: Option<ValueRef>,
    /// Message reported when the assertion fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assert_message: Option<String>,
    /// Poll-until condition for read nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<ValueRef>,
    /// Poll retry policy; required alongside `until`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    /// Overall deadline for the `until` loop, from the first attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl PlanNode {
    /// A minimal node with the given id, chain, and execution.
    pub fn new(id: impl Into<String>, chain: impl Into<String>, execution: ExecutionSpec) -> Self {
        Self {
            id: id.into(),
            chain: chain.into(),
            kind: PlanNodeKind::Execution,
            execution: execution.normalize(),
            source: None,
            deps: BTreeSet::new(),
            writes: Vec::new(),
            condition: None,
            assertion: None,
            assert_message: None,
            until: None,
            retry: None,
            timeout_ms: None,
        }
    }

    /// Add a dependency.
    pub fn with_dep(mut self, dep: impl Into<String>) -> Self {
        self.deps.insert(dep.into());
        self
    }

    /// Declare a write.
    pub fn with_write(mut self, path: impl Into<String>, mode: WriteMode) -> Self {
        self.writes.push(WriteSpec {
            path: path.into(),
            mode,
        });
        self
    }

    /// Expand a composite action into chained step nodes: prior steps are
    /// `<parent>__<step>`, the last carries the parent id, and each step
    /// depends on the one before it.
    pub fn composite(parent_id: &str, mut steps: Vec<(String, PlanNode)>) -> Vec<PlanNode> {
        let count = steps.len();
        let mut out = Vec::with_capacity(count);
        let mut previous: Option<String> = None;
        for (index, (step_id, mut node)) in steps.drain(..).enumerate() {
            node.id = if index + 1 == count {
                parent_id.to_string()
            } else {
                format!("{parent_id}__{step_id}")
            };
            if let Some(prev) = &previous {
                node.deps.insert(prev.clone());
            }
            if let Some(source) = &mut node.source {
                source.node_id = Some(parent_id.to_string());
                source.step_id = Some(step_id);
            }
            previous = Some(node.id.clone());
            out.push(node);
        }
        out
    }
}

/// An ordered, validated list of plan nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Nodes in declaration order.
    pub nodes: Vec<PlanNode>,
}

impl ExecutionPlan {
    /// Build a plan from nodes.
    pub fn new(nodes: Vec<PlanNode>) -> Self {
        Self { nodes }
    }

    /// Node ids in declaration order.
    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    /// Find a node by id.
    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Validate structure: unique ids, known deps, acyclic, `until` nodes
    /// are reads with a retry policy.
    pub fn validate(&self) -> Result<(), String> {
        let mut ids = BTreeSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(format!("duplicate node id {:?}", node.id));
            }
        }
        for node in &self.nodes {
            for dep in &node.deps {
                if !ids.contains(dep.as_str()) {
                    return Err(format!(
                        "node {:?} depends on unknown node {:?}",
                        node.id, dep
                    ));
                }
            }
            if node.until.is_some() {
                if !node.execution.is_read() {
                    return Err(format!(
                        "node {:?} has 'until' but is not a read",
                        node.id
                    ));
                }
                if node.retry.is_none() {
                    return Err(format!(
                        "node {:?} has 'until' without a retry policy",
                        node.id
                    ));
                }
            }
        }
        // Kahn's algorithm over the dependency edges.
        let mut in_degree: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n.deps.len()))
            .collect();
        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = queue.pop() {
            visited += 1;
            for node in &self.nodes {
                if node.deps.contains(id) {
                    if let Some(degree) = in_degree.get_mut(node.id.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push(node.id.as_str());
                        }
                    }
                }
            }
        }
        if visited != self.nodes.len() {
            let stuck: Vec<&str> = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(id, _)| *id)
                .collect();
            return Err(format!("dependency cycle involving {stuck:?}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_node(id: &str) -> PlanNode {
        PlanNode::new(
            id,
            "eip155:1",
            ExecutionSpec::EvmRpc {
                method: "eth_blockNumber".to_string(),
                params: vec![],
            },
        )
    }

    #[test]
    fn validate_accepts_a_dag() {
        let plan = ExecutionPlan::new(vec![
            read_node("a"),
            read_node("b").with_dep("a"),
            read_node("c").with_dep("a"),
        ]);
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicates_unknown_deps_and_cycles() {
        let plan = ExecutionPlan::new(vec![read_node("a"), read_node("a")]);
        assert!(plan.validate().unwrap_err().contains("duplicate"));

        let plan = ExecutionPlan::new(vec![read_node("a").with_dep("ghost")]);
        assert!(plan.validate().unwrap_err().contains("unknown"));

        let plan = ExecutionPlan::new(vec![
            read_node("a").with_dep("b"),
            read_node("b").with_dep("a"),
        ]);
        assert!(plan.validate().unwrap_err().contains("cycle"));
    }

    #[test]
    fn validate_requires_retry_for_until_reads() {
        let mut node = read_node("poll");
        node.until = Some(ValueRef::cel("outputs.done == true"));
        let plan = ExecutionPlan::new(vec![node.clone()]);
        assert!(plan.validate().unwrap_err().contains("retry"));

        node.retry = Some(RetrySpec {
            interval_ms: 500,
            max_attempts: Some(3),
        });
        assert!(ExecutionPlan::new(vec![node]).validate().is_ok());
    }

    #[test]
    fn get_balance_normalizes_to_rpc() {
        let node = PlanNode::new(
            "bal",
            "eip155:1",
            ExecutionSpec::EvmGetBalance {
                address: ValueRef::path("inputs.owner"),
            },
        );
        match &node.execution {
            ExecutionSpec::EvmRpc { method, params } => {
                assert_eq!(method, "eth_getBalance");
                assert_eq!(params.len(), 2);
            }
            other => panic!("not normalized: {other:?}"),
        }
        assert!(node.execution.is_read());
    }

    #[test]
    fn composite_expansion_chains_steps() {
        let steps = vec![
            ("approve".to_string(), read_node("x")),
            ("swap".to_string(), read_node("y")),
        ];
        let nodes = PlanNode::composite("swap_usdc", steps);
        assert_eq!(nodes[0].id, "swap_usdc__approve");
        assert_eq!(nodes[1].id, "swap_usdc");
        assert!(nodes[1].deps.contains("swap_usdc__approve"));
        assert!(nodes[0].deps.is_empty());
    }

    #[test]
    fn value_refs_enumerate_spec_fields() {
        let spec = ExecutionSpec::EvmCall {
            target: EvmCallTarget {
                to: ValueRef::path("inputs.token"),
                abi: serde_json::json!([]),
                function: "approve".to_string(),
                args: [
                    ("spender".to_string(), ValueRef::path("inputs.spender")),
                    ("amount".to_string(), ValueRef::lit(1i64)),
                ]
                .into_iter()
                .collect(),
            },
            value: None,
        };
        let fields: Vec<String> = spec.value_refs().into_iter().map(|(f, _)| f).collect();
        assert_eq!(fields, vec!["to", "args.amount", "args.spender"]);
    }
}

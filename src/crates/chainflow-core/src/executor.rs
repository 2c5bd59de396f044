//! Executor interface
//!
//! Executors do the actual chain work - or simulate it. They never touch the
//! runtime tree directly: they receive a snapshot plus the node's resolved
//! params, and hand back outputs and patches for the scheduler to apply
//! serially. An executor failure is always classified retryable from the
//! engine's perspective; retries themselves are the executor's business.

use crate::error::ExecutorError;
use crate::plan::PlanNode;
use crate::runtime::{Patch, RuntimeTree};
use crate::solver::NeedUserConfirm;
use crate::value::Value;
use crate::valueref::DetectResolver;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What an executor receives: a runtime snapshot plus resolved params.
#[derive(Clone)]
pub struct ExecutorContext {
    /// Snapshot of the runtime at dispatch time.
    pub runtime: RuntimeTree,
    /// The node's resolved spec fields, keyed by field path.
    pub resolved_params: BTreeMap<String, Value>,
    /// Detect resolver, when the engine has one.
    pub detect: Option<Arc<dyn DetectResolver>>,
}

/// What an executor returns on success.
#[derive(Debug, Clone, Default)]
pub struct ExecutorOutcome {
    /// Output values. Well-known keys shape events: `tx_hash` / `receipt`
    /// for EVM writes, `signature` / `confirmation` for Solana writes.
    pub outputs: Option<BTreeMap<String, Value>>,
    /// Runtime patches to apply.
    pub patches: Vec<Patch>,
    /// Ask the user before proceeding; the node pauses.
    pub need_user_confirm: Option<NeedUserConfirm>,
}

impl ExecutorOutcome {
    /// An outcome carrying only outputs.
    pub fn outputs(outputs: BTreeMap<String, Value>) -> Self {
        Self {
            outputs: Some(outputs),
            ..Self::default()
        }
    }
}

/// A chain-specific execution backend.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Whether this executor can run the given node.
    fn supports(&self, node: &PlanNode) -> bool;

    /// Execute a node. The node and context are owned so implementations
    /// can move them into spawned work.
    async fn execute(
        &self,
        node: PlanNode,
        ctx: ExecutorContext,
    ) -> Result<ExecutorOutcome, ExecutorError>;

    /// Best-effort teardown.
    async fn destroy(&self) {}
}

//! Engine event stream
//!
//! The engine's public surface is an ordered stream of [`EngineEvent`]s.
//! Emission order reflects the causal order of scheduler transitions: within
//! one node, `node_ready` precedes `tx_sent` precedes `tx_confirmed` (or
//! `query_result`), and two nodes' settlements are serialized in the order
//! they return.

use crate::readiness::Readiness;
use crate::runtime::Patch;
use crate::value::Value;
use chainflow_checkpoint::EngineCheckpoint;
use serde::Serialize;
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// A paused node, as reported by `engine_paused`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PausedNode {
    /// Node id.
    pub node: String,
    /// Pause reason.
    pub reason: String,
    /// Structured details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Json>,
}

/// One engine event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The plan validated and the run is starting.
    PlanReady,
    /// A node's inputs all resolve; it is being dispatched.
    NodeReady {
        /// Node id.
        node: String,
    },
    /// A node is blocked; readiness diagnostics attached.
    NodeBlocked {
        /// Node id.
        node: String,
        /// Readiness diagnostics.
        readiness: Readiness,
    },
    /// A solver produced patches which the engine applied.
    SolverApplied {
        /// Node id.
        node: String,
        /// The applied patches.
        patches: Vec<Patch>,
    },
    /// A read settled with outputs.
    QueryResult {
        /// Node id.
        node: String,
        /// Output values.
        outputs: BTreeMap<String, Value>,
    },
    /// A write was sent; hash or signature attached.
    TxSent {
        /// Node id.
        node: String,
        /// Transaction hash or signature.
        tx_hash: String,
    },
    /// A write confirmed; receipt or confirmation attached.
    TxConfirmed {
        /// Node id.
        node: String,
        /// Receipt or confirmation payload.
        receipt: Value,
    },
    /// The run needs user confirmation to continue this node.
    NeedUserConfirm {
        /// Node id.
        node: String,
        /// Why.
        reason: String,
        /// Details, including a confirmation summary.
        details: Option<Json>,
    },
    /// An `until` poll is scheduled to retry.
    NodeWaiting {
        /// Node id.
        node: String,
        /// Attempts so far.
        attempts: u32,
        /// Wall-clock milliseconds of the next attempt.
        next_attempt_at_ms: u64,
    },
    /// A node paused without completing.
    NodePaused {
        /// Node id.
        node: String,
        /// Why.
        reason: String,
        /// Structured details.
        details: Option<Json>,
    },
    /// A node was skipped.
    Skipped {
        /// Node id.
        node: String,
        /// Why.
        reason: String,
    },
    /// The run unwound with paused nodes outstanding.
    EnginePaused {
        /// The paused nodes.
        paused: Vec<PausedNode>,
    },
    /// An error occurred.
    Error {
        /// Node id, when node-scoped.
        node: Option<String>,
        /// Human-readable error.
        error: String,
        /// Whether retrying the run may help.
        retryable: bool,
    },
    /// A checkpoint was persisted.
    CheckpointSaved {
        /// The checkpoint.
        checkpoint: EngineCheckpoint,
    },
}

impl EngineEvent {
    /// The event's wire name.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::PlanReady => "plan_ready",
            EngineEvent::NodeReady { .. } => "node_ready",
            EngineEvent::NodeBlocked { .. } => "node_blocked",
            EngineEvent::SolverApplied { .. } => "solver_applied",
            EngineEvent::QueryResult { .. } => "query_result",
            EngineEvent::TxSent { .. } => "tx_sent",
            EngineEvent::TxConfirmed { .. } => "tx_confirmed",
            EngineEvent::NeedUserConfirm { .. } => "need_user_confirm",
            EngineEvent::NodeWaiting { .. } => "node_waiting",
            EngineEvent::NodePaused { .. } => "node_paused",
            EngineEvent::Skipped { .. } => "skipped",
            EngineEvent::EnginePaused { .. } => "engine_paused",
            EngineEvent::Error { .. } => "error",
            EngineEvent::CheckpointSaved { .. } => "checkpoint_saved",
        }
    }

    /// The node this event concerns, when node-scoped.
    pub fn node(&self) -> Option<&str> {
        match self {
            EngineEvent::NodeReady { node }
            | EngineEvent::NodeBlocked { node, .. }
            | EngineEvent::SolverApplied { node, .. }
            | EngineEvent::QueryResult { node, .. }
            | EngineEvent::TxSent { node, .. }
            | EngineEvent::TxConfirmed { node, .. }
            | EngineEvent::NeedUserConfirm { node, .. }
            | EngineEvent::NodeWaiting { node, .. }
            | EngineEvent::NodePaused { node, .. }
            | EngineEvent::Skipped { node, .. } => Some(node),
            EngineEvent::Error { node, .. } => node.as_deref(),
            _ => None,
        }
    }
}

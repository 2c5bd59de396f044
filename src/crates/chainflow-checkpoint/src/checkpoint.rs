//! Engine checkpoint data model
//!
//! An [`EngineCheckpoint`] is a complete snapshot of a run: the compiled plan,
//! the runtime tree, which nodes have completed, poll-timer state for
//! `until`-style nodes, and pause records for nodes awaiting user input. The
//! scheduler saves one on every state-changing event; on resume, a stored
//! checkpoint is only honored when [`EngineCheckpoint::is_compatible_with`]
//! accepts it — the schema version and the plan's node id sequence must both
//! match. An incompatible checkpoint is silently ignored and the run starts
//! fresh.
//!
//! Payloads (`plan`, `runtime_snapshot`, event records) are carried as
//! [`serde_json::Value`] already passed through the tagged codec, so this
//! crate stays independent of the engine's typed value model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::HashMap;

/// Poll-timer state for one `until`-polling node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollState {
    /// Attempts made so far.
    pub attempts: u32,
    /// Wall-clock milliseconds of the earliest next attempt.
    pub next_attempt_at_ms: u64,
    /// Wall-clock milliseconds of the first attempt, for timeout accounting.
    pub first_attempt_at_ms: u64,
}

/// Why a node is paused, and with what context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PauseRecord {
    /// Human-readable pause reason.
    pub reason: String,
    /// Structured details (confirmation summary, readiness diagnostics).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Json>,
}

impl PauseRecord {
    /// Create a pause record.
    pub fn new(reason: impl Into<String>, details: Option<Json>) -> Self {
        Self {
            reason: reason.into(),
            details,
        }
    }
}

/// Complete, resumable snapshot of an engine run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineCheckpoint {
    /// Checkpoint format version.
    pub schema: u32,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// The compiled plan, serialized (`{"nodes": [...]}`).
    pub plan: Json,

    /// Deep snapshot of the runtime tree, tagged-codec encoded.
    pub runtime_snapshot: Json,

    /// Ids of nodes that have completed.
    pub completed_node_ids: Vec<String>,

    /// Poll-timer state per polling node.
    #[serde(default)]
    pub poll_state_by_node_id: HashMap<String, PollState>,

    /// Pause records per paused node. Not restored as active pauses on
    /// resume: resuming means the caller has addressed them.
    #[serde(default)]
    pub paused_by_node_id: HashMap<String, PauseRecord>,

    /// Optional event history.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<Json>>,

    /// Optional extension data for embedders.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<serde_json::Map<String, Json>>,
}

impl EngineCheckpoint {
    /// Current checkpoint schema version.
    pub const SCHEMA_VERSION: u32 = 1;

    /// Create a checkpoint for the given plan and runtime snapshot.
    pub fn new(plan: Json, runtime_snapshot: Json) -> Self {
        Self {
            schema: Self::SCHEMA_VERSION,
            created_at: Utc::now(),
            plan,
            runtime_snapshot,
            completed_node_ids: Vec::new(),
            poll_state_by_node_id: HashMap::new(),
            paused_by_node_id: HashMap::new(),
            events: None,
            extensions: None,
        }
    }

    /// The plan's node id sequence, in declaration order.
    pub fn plan_node_ids(&self) -> Vec<String> {
        self.plan
            .get("nodes")
            .and_then(Json::as_array)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|n| n.get("id").and_then(Json::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether this checkpoint can seed a run over a plan with the given
    /// node id sequence.
    pub fn is_compatible_with(&self, node_ids: &[String]) -> bool {
        self.schema == Self::SCHEMA_VERSION && self.plan_node_ids() == node_ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan(ids: &[&str]) -> Json {
        json!({
            "nodes": ids.iter().map(|id| json!({"id": id})).collect::<Vec<_>>()
        })
    }

    #[test]
    fn node_ids_follow_plan_order() {
        let cp = EngineCheckpoint::new(plan(&["a", "b", "c"]), json!({}));
        assert_eq!(cp.plan_node_ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn compatibility_requires_matching_id_sequence() {
        let cp = EngineCheckpoint::new(plan(&["a", "b"]), json!({}));
        assert!(cp.is_compatible_with(&["a".into(), "b".into()]));
        assert!(!cp.is_compatible_with(&["b".into(), "a".into()]));
        assert!(!cp.is_compatible_with(&["a".into()]));
    }

    #[test]
    fn compatibility_requires_matching_schema() {
        let mut cp = EngineCheckpoint::new(plan(&["a"]), json!({}));
        cp.schema = EngineCheckpoint::SCHEMA_VERSION + 1;
        assert!(!cp.is_compatible_with(&["a".into()]));
    }

    #[test]
    fn serde_round_trip() {
        let mut cp = EngineCheckpoint::new(plan(&["a"]), json!({"inputs": {"x": 1}}));
        cp.completed_node_ids.push("a".into());
        cp.poll_state_by_node_id.insert(
            "a".into(),
            PollState {
                attempts: 2,
                next_attempt_at_ms: 1000,
                first_attempt_at_ms: 0,
            },
        );
        cp.paused_by_node_id
            .insert("a".into(), PauseRecord::new("assert failed", None));
        let text = serde_json::to_string(&cp).unwrap();
        let back: EngineCheckpoint = serde_json::from_str(&text).unwrap();
        assert_eq!(back.completed_node_ids, cp.completed_node_ids);
        assert_eq!(back.poll_state_by_node_id, cp.poll_state_by_node_id);
        assert_eq!(back.paused_by_node_id, cp.paused_by_node_id);
    }
}

//! Mutable runtime tree and guarded patches
//!
//! The runtime tree is the only mutable shared state in a run. It is owned
//! exclusively by the scheduler; solvers and executors describe mutations as
//! [`Patch`] values which the scheduler applies serially. A [`PatchGuard`]
//! confines patches to the reserved roots (and, under `nodes.*`, to the
//! per-node sub-trees); a violating patch is skipped and recorded, never
//! applied.
//!
//! `merge` is shallow by contract: object keys are overridden at the top
//! level only. Deep updates are expressed as `set` with a pre-composed
//! value.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Reserved top-level sub-trees of the runtime.
pub const RESERVED_ROOTS: &[&str] = &[
    "inputs",
    "ctx",
    "params",
    "calculated",
    "query",
    "nodes",
    "policy",
];

/// Patch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOp {
    /// Replace the sub-tree at `path`.
    Set,
    /// Shallow-merge object keys at `path`; absent left side acts like set.
    Merge,
    /// Remove the key at `path`; missing is a no-op.
    Delete,
}

/// A declarative mutation of the runtime tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// Operation.
    pub op: PatchOp,
    /// Dotted path; numeric segments index lists.
    pub path: String,
    /// Payload for `set` / `merge`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Patch {
    /// A `set` patch.
    pub fn set(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            op: PatchOp::Set,
            path: path.into(),
            value: Some(value.into()),
        }
    }

    /// A `merge` patch.
    pub fn merge(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            op: PatchOp::Merge,
            path: path.into(),
            value: Some(value.into()),
        }
    }

    /// A `delete` patch.
    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Delete,
            path: path.into(),
            value: None,
        }
    }
}

/// Path policy applied when patches come from solvers or executors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchGuard {
    /// Allowed first segments.
    pub allow_roots: BTreeSet<String>,
    /// For `nodes.<id>.<suffix>` paths, allowed suffix heads.
    pub allow_nodes_paths: BTreeSet<String>,
}

impl Default for PatchGuard {
    fn default() -> Self {
        Self {
            allow_roots: RESERVED_ROOTS.iter().map(|s| s.to_string()).collect(),
            allow_nodes_paths: ["outputs", "calculated", "state"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl PatchGuard {
    /// Check a path against the policy, returning the violation if any.
    pub fn check(&self, path: &str) -> Result<(), String> {
        let mut segments = path.split('.');
        let root = segments.next().unwrap_or_default();
        if !self.allow_roots.contains(root) {
            return Err(format!("path root {root:?} is not allowed"));
        }
        if root == "nodes" {
            // nodes.<id>.<suffix...>: the suffix head must be allowlisted.
            let _id = segments.next();
            if let Some(suffix_head) = segments.next() {
                if !self.allow_nodes_paths.contains(suffix_head) {
                    return Err(format!(
                        "nodes sub-path {suffix_head:?} is not allowed"
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A patch skipped by the guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedPatch {
    /// The patch that was skipped.
    pub patch: Patch,
    /// Why it was skipped.
    pub reason: String,
}

/// Result of applying a patch list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchOutcome {
    /// Number of patches applied.
    pub applied: usize,
    /// Patches skipped by the guard or malformed.
    pub rejected: Vec<RejectedPatch>,
}

/// The mutable runtime state tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeTree {
    root: BTreeMap<String, Value>,
}

impl Default for RuntimeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeTree {
    /// An empty runtime with every reserved root present as an empty map.
    pub fn new() -> Self {
        let mut root = BTreeMap::new();
        for key in RESERVED_ROOTS {
            root.insert(key.to_string(), Value::empty_map());
        }
        Self { root }
    }

    /// Build a runtime seeded with workflow inputs and ambient context.
    pub fn with_inputs(inputs: BTreeMap<String, Value>, ctx: BTreeMap<String, Value>) -> Self {
        let mut tree = Self::new();
        tree.root.insert("inputs".to_string(), Value::Map(inputs));
        tree.root.insert("ctx".to_string(), Value::Map(ctx));
        tree
    }

    /// The top-level map.
    pub fn top_level(&self) -> &BTreeMap<String, Value> {
        &self.root
    }

    /// The whole tree as a single map value. This clones; use [`Self::get`]
    /// for lookups.
    pub fn as_value(&self) -> Value {
        Value::Map(self.root.clone())
    }

    /// Look up a dotted path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let top = self.root.get(head)?;
        match rest {
            Some(rest) => top.get_path(rest),
            None => Some(top),
        }
    }

    /// Deep snapshot for checkpoints: independent of later mutations.
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    /// Tagged-JSON form of the whole tree, for checkpoint payloads.
    pub fn to_json(&self) -> serde_json::Value {
        Value::Map(self.root.clone()).to_json()
    }

    /// Restore a runtime from a checkpoint payload.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, crate::error::EvalError> {
        match Value::from_json(json)? {
            Value::Map(root) => Ok(Self { root }),
            other => Err(crate::error::EvalError::type_mismatch(format!(
                "runtime snapshot must be a map, got {}",
                other.type_name()
            ))),
        }
    }

    /// Apply one patch under an optional guard. Returns whether the patch
    /// was applied, or the rejection reason.
    pub fn apply_patch(
        &mut self,
        patch: &Patch,
        guard: Option<&PatchGuard>,
    ) -> Result<(), String> {
        if let Some(guard) = guard {
            guard.check(&patch.path)?;
        }
        let segments: Vec<&str> = patch.path.split('.').collect();
        if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(format!("malformed patch path {:?}", patch.path));
        }
        match patch.op {
            PatchOp::Set => {
                let value = patch
                    .value
                    .clone()
                    .ok_or_else(|| "set patch has no value".to_string())?;
                set_at(&mut self.root, &segments, value)
            }
            PatchOp::Merge => {
                let value = patch
                    .value
                    .clone()
                    .ok_or_else(|| "merge patch has no value".to_string())?;
                merge_at(&mut self.root, &segments, value)
            }
            PatchOp::Delete => {
                delete_at(&mut self.root, &segments);
                Ok(())
            }
        }
    }

    /// Apply a patch list left to right, skipping and recording violations.
    pub fn apply_patches(
        &mut self,
        patches: &[Patch],
        guard: Option<&PatchGuard>,
    ) -> PatchOutcome {
        let mut outcome = PatchOutcome::default();
        for patch in patches {
            match self.apply_patch(patch, guard) {
                Ok(()) => outcome.applied += 1,
                Err(reason) => {
                    tracing::warn!(path = %patch.path, %reason, "patch rejected");
                    outcome.rejected.push(RejectedPatch {
                        patch: patch.clone(),
                        reason,
                    });
                }
            }
        }
        outcome
    }
}

/// Descend to the container holding the final segment, creating intermediate
/// maps lazily. Requires at least two segments.
fn descend_create<'a>(
    root: &'a mut BTreeMap<String, Value>,
    segments: &[&str],
) -> Result<&'a mut Value, String> {
    debug_assert!(segments.len() >= 2);
    let head = segments[0];
    if !root.contains_key(head) {
        root.insert(head.to_string(), Value::empty_map());
    }
    let mut current: &mut Value = root
        .get_mut(head)
        .ok_or_else(|| "entry vanished during descent".to_string())?;
    for segment in &segments[1..segments.len() - 1] {
        current = match current {
            Value::Map(map) => {
                if !map.contains_key(*segment) {
                    map.insert(segment.to_string(), Value::empty_map());
                }
                map.get_mut(*segment)
                    .ok_or_else(|| "entry vanished during descent".to_string())?
            }
            Value::List(items) => {
                let index: usize = segment
                    .parse()
                    .map_err(|_| format!("segment {segment:?} is not a list index"))?;
                items
                    .get_mut(index)
                    .ok_or_else(|| format!("list index {index} out of bounds"))?
            }
            other => {
                return Err(format!(
                    "cannot descend into {} at segment {segment:?}",
                    other.type_name()
                ))
            }
        };
    }
    Ok(current)
}

/// Descend without creating anything; `None` when a segment is missing.
fn descend_existing<'a>(
    root: &'a mut BTreeMap<String, Value>,
    segments: &[&str],
) -> Option<&'a mut Value> {
    debug_assert!(segments.len() >= 2);
    let mut current: &mut Value = root.get_mut(segments[0])?;
    for segment in &segments[1..segments.len() - 1] {
        current = match current {
            Value::Map(map) => map.get_mut(*segment)?,
            Value::List(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn set_at(
    root: &mut BTreeMap<String, Value>,
    segments: &[&str],
    value: Value,
) -> Result<(), String> {
    if segments.len() == 1 {
        root.insert(segments[0].to_string(), value);
        return Ok(());
    }
    let container = descend_create(root, segments)?;
    let key = segments[segments.len() - 1];
    match container {
        Value::Map(map) => {
            map.insert(key.to_string(), value);
            Ok(())
        }
        Value::List(items) => {
            let index: usize = key
                .parse()
                .map_err(|_| format!("segment {key:?} is not a list index"))?;
            if index < items.len() {
                items[index] = value;
                Ok(())
            } else if index == items.len() {
                items.push(value);
                Ok(())
            } else {
                Err(format!("list index {index} out of bounds"))
            }
        }
        other => Err(format!(
            "cannot set key {key:?} inside {}",
            other.type_name()
        )),
    }
}

fn merge_at(
    root: &mut BTreeMap<String, Value>,
    segments: &[&str],
    value: Value,
) -> Result<(), String> {
    let incoming = match value {
        Value::Map(map) => map,
        other => {
            return Err(format!(
                "merge value must be a map, got {}",
                other.type_name()
            ))
        }
    };
    let target: &mut Value = if segments.len() == 1 {
        root.entry(segments[0].to_string())
            .or_insert_with(Value::empty_map)
    } else {
        let container = descend_create(root, segments)?;
        let key = segments[segments.len() - 1];
        match container {
            Value::Map(map) => map
                .entry(key.to_string())
                .or_insert_with(Value::empty_map),
            other => {
                return Err(format!(
                    "cannot merge into key {key:?} inside {}",
                    other.type_name()
                ))
            }
        }
    };
    match target {
        Value::Map(existing) => {
            for (k, v) in incoming {
                existing.insert(k, v);
            }
            Ok(())
        }
        other => Err(format!(
            "merge target is {} (expected map)",
            other.type_name()
        )),
    }
}

fn delete_at(root: &mut BTreeMap<String, Value>, segments: &[&str]) {
    if segments.len() == 1 {
        root.remove(segments[0]);
        return;
    }
    let Some(container) = descend_existing(root, segments) else {
        return;
    };
    let key = segments[segments.len() - 1];
    match container {
        Value::Map(map) => {
            map.remove(key);
        }
        Value::List(items) => {
            if let Ok(index) = key.parse::<usize>() {
                if index < items.len() {
                    items.remove(index);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_map;

    #[test]
    fn set_creates_intermediate_maps() {
        let mut rt = RuntimeTree::new();
        let outcome = rt.apply_patches(&[Patch::set("inputs.a.b.c", 7i64)], None);
        assert_eq!(outcome.applied, 1);
        assert_eq!(rt.get("inputs.a.b.c"), Some(&Value::from(7i64)));
    }

    #[test]
    fn guard_rejects_foreign_roots() {
        let mut rt = RuntimeTree::new();
        let guard = PatchGuard::default();
        let outcome = rt.apply_patches(
            &[
                Patch::set("inputs.x", 7i64),
                Patch::set("runtime.evil", 1i64),
            ],
            Some(&guard),
        );
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].patch.path, "runtime.evil");
        assert_eq!(rt.get("runtime.evil"), None);
        assert_eq!(rt.get("inputs.x"), Some(&Value::from(7i64)));
    }

    #[test]
    fn guard_restricts_nodes_subpaths() {
        let mut rt = RuntimeTree::new();
        let guard = PatchGuard::default();
        let ok = rt.apply_patch(&Patch::set("nodes.n1.outputs.x", 1i64), Some(&guard));
        assert!(ok.is_ok());
        let bad = rt.apply_patch(&Patch::set("nodes.n1.secrets.x", 1i64), Some(&guard));
        assert!(bad.is_err());
    }

    #[test]
    fn merge_is_shallow() {
        let mut rt = RuntimeTree::new();
        rt.apply_patch(
            &Patch::set("calculated", value_map! { "a" => value_map! { "x" => 1i64 }, "b" => 2i64 }),
            None,
        )
        .unwrap();
        rt.apply_patch(
            &Patch::merge("calculated", value_map! { "a" => value_map! { "y" => 3i64 } }),
            None,
        )
        .unwrap();
        // The nested map is replaced wholesale, not merged.
        assert_eq!(rt.get("calculated.a.x"), None);
        assert_eq!(rt.get("calculated.a.y"), Some(&Value::from(3i64)));
        assert_eq!(rt.get("calculated.b"), Some(&Value::from(2i64)));
    }

    #[test]
    fn merge_into_absent_acts_like_set() {
        let mut rt = RuntimeTree::new();
        rt.apply_patch(&Patch::merge("query.q1", value_map! { "v" => 1i64 }), None)
            .unwrap();
        assert_eq!(rt.get("query.q1.v"), Some(&Value::from(1i64)));
    }

    #[test]
    fn merge_into_non_map_is_rejected() {
        let mut rt = RuntimeTree::new();
        rt.apply_patch(&Patch::set("inputs.x", 1i64), None).unwrap();
        let err = rt.apply_patch(&Patch::merge("inputs.x", value_map! { "a" => 1i64 }), None);
        assert!(err.is_err());
    }

    #[test]
    fn delete_is_noop_when_missing() {
        let mut rt = RuntimeTree::new();
        rt.apply_patch(&Patch::set("inputs.x", 1i64), None).unwrap();
        assert!(rt.apply_patch(&Patch::delete("inputs.x"), None).is_ok());
        assert_eq!(rt.get("inputs.x"), None);
        // Deleting again (and deeper missing paths) stays fine and creates
        // nothing.
        assert!(rt.apply_patch(&Patch::delete("inputs.x"), None).is_ok());
        assert!(rt.apply_patch(&Patch::delete("inputs.a.b.c"), None).is_ok());
        assert_eq!(rt.get("inputs.a"), None);
    }

    #[test]
    fn list_index_segments() {
        let mut rt = RuntimeTree::new();
        rt.apply_patch(
            &Patch::set("inputs.items", Value::List(vec![Value::from(1i64), Value::from(2i64)])),
            None,
        )
        .unwrap();
        rt.apply_patch(&Patch::set("inputs.items.1", 20i64), None)
            .unwrap();
        assert_eq!(rt.get("inputs.items.1"), Some(&Value::from(20i64)));
        rt.apply_patch(&Patch::set("inputs.items.2", 30i64), None)
            .unwrap();
        assert_eq!(rt.get("inputs.items.2"), Some(&Value::from(30i64)));
        assert!(rt
            .apply_patch(&Patch::set("inputs.items.9", 90i64), None)
            .is_err());
    }

    #[test]
    fn set_only_patch_lists_are_idempotent() {
        let mut rt = RuntimeTree::new();
        let patches = vec![
            Patch::set("inputs.a", 1i64),
            Patch::set("inputs.b.c", "x"),
        ];
        rt.apply_patches(&patches, None);
        let first = rt.snapshot();
        rt.apply_patches(&patches, None);
        assert_eq!(rt, first);
    }

    #[test]
    fn snapshot_is_independent() {
        let mut rt = RuntimeTree::new();
        rt.apply_patch(&Patch::set("inputs.x", 1i64), None).unwrap();
        let snap = rt.snapshot();
        rt.apply_patch(&Patch::set("inputs.x", 2i64), None).unwrap();
        assert_eq!(snap.get("inputs.x"), Some(&Value::from(1i64)));
        assert_eq!(rt.get("inputs.x"), Some(&Value::from(2i64)));
    }

    #[test]
    fn json_round_trip() {
        let mut rt = RuntimeTree::new();
        rt.apply_patch(&Patch::set("inputs.bytes", Value::bytes(vec![1u8, 2])), None)
            .unwrap();
        let json = rt.to_json();
        let back = RuntimeTree::from_json(&json).unwrap();
        assert_eq!(back, rt);
    }
}

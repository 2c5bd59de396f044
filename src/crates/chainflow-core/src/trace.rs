//! Out-of-band trace recording
//!
//! A [`TraceSink`] receives a flat record stream describing the run: one
//! root record, then one record per emitted event. Sinks are strictly
//! observational - their absence (or failure) never changes engine
//! semantics, so append errors are logged and dropped.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as Json;

/// Trace record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    /// Run root.
    Root,
    /// Per-node span.
    NodeSpan,
    /// An emitted event.
    Event,
}

/// One trace record.
#[derive(Debug, Clone, Serialize)]
pub struct TraceRecord {
    /// Record kind.
    pub kind: TraceKind,
    /// Record id.
    pub id: String,
    /// Parent record id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Run id.
    pub run_id: String,
    /// Monotonic sequence number within the run.
    pub seq: u64,
    /// Wall-clock milliseconds.
    pub ts: u64,
    /// Node id, for node-scoped records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Record payload.
    pub data: Json,
}

/// Receives trace records.
#[async_trait]
pub trait TraceSink: Send + Sync {
    /// Append one record.
    async fn append(&self, record: TraceRecord);
}

/// A sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTraceSink;

#[async_trait]
impl TraceSink for NoopTraceSink {
    async fn append(&self, _record: TraceRecord) {}
}

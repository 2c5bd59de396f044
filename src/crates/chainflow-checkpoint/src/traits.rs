//! Checkpoint storage trait
//!
//! [`CheckpointStore`] is the seam between the engine and persistence.
//! Implementations back it with whatever they like — the filesystem, a
//! database, object storage — as long as they accept tagged-codec JSON
//! payloads. The engine never overlaps `save` invocations, so stores only
//! need to serialize calls against themselves.

use crate::checkpoint::EngineCheckpoint;
use crate::error::Result;
use async_trait::async_trait;

/// Persistence backend for engine checkpoints.
///
/// `load` returns the most recent checkpoint, or `None` when nothing has
/// been stored. `save` replaces it. Compatibility is the engine's concern:
/// an incompatible stored checkpoint is ignored at resume, not an error.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the latest checkpoint, if any.
    async fn load(&self) -> Result<Option<EngineCheckpoint>>;

    /// Persist a checkpoint, replacing any previous one.
    async fn save(&self, checkpoint: &EngineCheckpoint) -> Result<()>;
}

//! In-memory checkpoint store
//!
//! Reference [`CheckpointStore`] implementation used by tests and ephemeral
//! runs. Keeps the latest checkpoint plus the full save history so tests can
//! assert on checkpoint cadence.

use crate::checkpoint::EngineCheckpoint;
use crate::error::Result;
use crate::traits::CheckpointStore;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Checkpoint store backed by process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    inner: Arc<RwLock<Vec<EngineCheckpoint>>>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with an existing checkpoint (e.g. for resume tests).
    pub fn with_checkpoint(checkpoint: EngineCheckpoint) -> Self {
        Self {
            inner: Arc::new(RwLock::new(vec![checkpoint])),
        }
    }

    /// Number of checkpoints saved so far.
    pub async fn saved_count(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Full save history, oldest first.
    pub async fn history(&self) -> Vec<EngineCheckpoint> {
        self.inner.read().await.clone()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self) -> Result<Option<EngineCheckpoint>> {
        Ok(self.inner.read().await.last().cloned())
    }

    async fn save(&self, checkpoint: &EngineCheckpoint) -> Result<()> {
        self.inner.write().await.push(checkpoint.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn save_then_load_returns_latest() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.load().await.unwrap().is_none());

        let mut first = EngineCheckpoint::new(json!({"nodes": []}), json!({}));
        first.completed_node_ids.push("a".into());
        store.save(&first).await.unwrap();

        let mut second = first.clone();
        second.completed_node_ids.push("b".into());
        store.save(&second).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.completed_node_ids, vec!["a", "b"]);
        assert_eq!(store.saved_count().await, 2);
    }
}

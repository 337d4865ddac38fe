//! In-memory checkpoint store
//!
//! Reference implementation of [`CheckpointStore`] backed by an async
//! `RwLock`. Suitable for tests and single-process deployments; durable
//! backends implement the same trait against their own storage.

use crate::checkpoint::{Checkpoint, CheckpointSummary};
use crate::error::Result;
use crate::traits::CheckpointStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredEntry {
    checkpoint: Checkpoint,
    saved_at: chrono::DateTime<chrono::Utc>,
    // Monotone per-store frame counter; preserves the (step_index, id)
    // ordering even if a backend swap changes id comparison.
    frame: u64,
}

/// Thread-keyed in-memory checkpoint store
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    storage: RwLock<HashMap<String, Vec<StoredEntry>>>,
    next_frame: RwLock<u64>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared handle
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Total number of stored checkpoints across all threads
    pub async fn len(&self) -> usize {
        self.storage.read().await.values().map(Vec::len).sum()
    }

    /// Whether the store holds no checkpoints
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn latest_index(entries: &[StoredEntry]) -> Option<usize> {
    entries
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            (a.checkpoint.step_index, a.checkpoint.id.as_bytes(), a.frame)
                .cmp(&(b.checkpoint.step_index, b.checkpoint.id.as_bytes(), b.frame))
        })
        .map(|(i, _)| i)
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
        let frame = {
            let mut next = self.next_frame.write().await;
            *next += 1;
            *next
        };
        let mut storage = self.storage.write().await;
        let entries = storage.entry(checkpoint.thread_id.clone()).or_default();
        tracing::debug!(
            thread_id = %checkpoint.thread_id,
            step_index = checkpoint.step_index,
            id = %checkpoint.id,
            "checkpoint saved"
        );
        entries.push(StoredEntry {
            checkpoint,
            saved_at: chrono::Utc::now(),
            frame,
        });
        Ok(())
    }

    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let storage = self.storage.read().await;
        Ok(storage.get(thread_id).and_then(|entries| {
            latest_index(entries).map(|i| entries[i].checkpoint.clone())
        }))
    }

    async fn list_checkpoints(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointSummary>> {
        let storage = self.storage.read().await;
        let mut entries: Vec<&StoredEntry> = storage
            .get(thread_id)
            .map(|v| v.iter().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| {
            (b.checkpoint.step_index, b.checkpoint.id.as_bytes(), b.frame)
                .cmp(&(a.checkpoint.step_index, a.checkpoint.id.as_bytes(), a.frame))
        });
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries
            .into_iter()
            .map(|e| CheckpointSummary {
                id: e.checkpoint.id.clone(),
                thread_id: e.checkpoint.thread_id.clone(),
                step_index: e.checkpoint.step_index,
                interrupted: e.checkpoint.interruption.is_some(),
                saved_at: e.saved_at,
            })
            .collect())
    }

    async fn load_checkpoint(&self, thread_id: &str, id: &str) -> Result<Option<Checkpoint>> {
        let storage = self.storage.read().await;
        Ok(storage.get(thread_id).and_then(|entries| {
            entries
                .iter()
                .find(|e| e.checkpoint.id == id)
                .map(|e| e.checkpoint.clone())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::checkpoint_id;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn make_checkpoint(thread: &str, run: u128, step: u32) -> Checkpoint {
        let run_id = Uuid::from_u128(run);
        Checkpoint {
            id: checkpoint_id(&run_id, step),
            thread_id: thread.to_string(),
            run_id,
            step_index: step,
            schema_version: "s".repeat(64),
            graph_version: "g".repeat(64),
            global_data: BTreeMap::new(),
            frontier: Vec::new(),
            join_barriers: BTreeMap::new(),
            interruption: None,
            channel_versions: BTreeMap::new(),
            versions_seen: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_load_latest_empty() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.load_latest("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_is_max_step_index() {
        let store = InMemoryCheckpointStore::new();
        store.save(make_checkpoint("t", 1, 0)).await.unwrap();
        store.save(make_checkpoint("t", 1, 2)).await.unwrap();
        store.save(make_checkpoint("t", 1, 1)).await.unwrap();

        let latest = store.load_latest("t").await.unwrap().unwrap();
        assert_eq!(latest.step_index, 2);
    }

    #[tokio::test]
    async fn test_latest_ties_break_by_id_bytes() {
        let store = InMemoryCheckpointStore::new();
        let a = make_checkpoint("t", 1, 3);
        let b = make_checkpoint("t", 2, 3);
        let expected = if a.id.as_bytes() > b.id.as_bytes() {
            a.id.clone()
        } else {
            b.id.clone()
        };
        store.save(a).await.unwrap();
        store.save(b).await.unwrap();

        let latest = store.load_latest("t").await.unwrap().unwrap();
        assert_eq!(latest.id, expected);
    }

    #[tokio::test]
    async fn test_threads_are_isolated() {
        let store = InMemoryCheckpointStore::new();
        store.save(make_checkpoint("t1", 1, 0)).await.unwrap();
        store.save(make_checkpoint("t2", 2, 5)).await.unwrap();

        assert_eq!(store.load_latest("t1").await.unwrap().unwrap().step_index, 0);
        assert_eq!(store.load_latest("t2").await.unwrap().unwrap().step_index, 5);
    }

    #[tokio::test]
    async fn test_list_newest_first_with_limit() {
        let store = InMemoryCheckpointStore::new();
        for step in 0..4 {
            store.save(make_checkpoint("t", 1, step)).await.unwrap();
        }
        let summaries = store.list_checkpoints("t", Some(2)).await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].step_index, 3);
        assert_eq!(summaries[1].step_index, 2);
    }

    #[tokio::test]
    async fn test_load_checkpoint_by_id() {
        let store = InMemoryCheckpointStore::new();
        let cp = make_checkpoint("t", 1, 1);
        let id = cp.id.clone();
        store.save(cp).await.unwrap();

        assert!(store.load_checkpoint("t", &id).await.unwrap().is_some());
        assert!(store.load_checkpoint("t", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_visible_to_concurrent_reader() {
        // save is atomic w.r.t. load_latest: a reader sees the old latest or
        // the new one, never a torn entry
        let store = InMemoryCheckpointStore::shared();
        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for step in 0..50 {
                    store.save(make_checkpoint("t", 1, step)).await.unwrap();
                }
            })
        };
        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut last_seen = None;
                for _ in 0..50 {
                    if let Some(cp) = store.load_latest("t").await.unwrap() {
                        if let Some(prev) = last_seen {
                            assert!(cp.step_index >= prev);
                        }
                        last_seen = Some(cp.step_index);
                    }
                    tokio::task::yield_now().await;
                }
            })
        };
        writer.await.unwrap();
        reader.await.unwrap();
    }
}

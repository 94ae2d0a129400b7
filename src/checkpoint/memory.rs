//! 内存断点存储（测试与一次性运行）

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, CheckpointSummary};

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    entries: RwLock<BTreeMap<String, (Checkpoint, chrono::DateTime<Utc>)>>,
    closed: AtomicBool,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn contains(&self, fingerprint: &str) -> bool {
        self.entries.read().await.contains_key(fingerprint)
    }

    fn ensure_open(&self) -> Result<(), CheckpointError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CheckpointError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, fingerprint: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.ensure_open()?;
        self.entries
            .write()
            .await
            .insert(fingerprint.to_string(), (checkpoint.clone(), Utc::now()));
        Ok(())
    }

    async fn load(&self, fingerprint: &str) -> Result<Checkpoint, CheckpointError> {
        self.ensure_open()?;
        self.entries
            .read()
            .await
            .get(fingerprint)
            .map(|(c, _)| c.clone())
            .ok_or_else(|| CheckpointError::NotFound(fingerprint.to_string()))
    }

    async fn clear(&self, fingerprint: &str) -> Result<(), CheckpointError> {
        self.ensure_open()?;
        self.entries.write().await.remove(fingerprint);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        self.ensure_open()?;
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .map(|(fp, (c, at))| CheckpointSummary {
                fingerprint: fp.clone(),
                agent: c.state.agent.clone(),
                turn: c.state.turn,
                updated_at: *at,
            })
            .collect())
    }

    async fn close(&self) -> Result<(), CheckpointError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::RunState;

    #[tokio::test]
    async fn test_save_overwrites_and_clear_is_idempotent() {
        let store = InMemoryCheckpointStore::new();
        let mut state = RunState::new("a", "t");
        let fp = state.fingerprint.clone();
        assert!(matches!(store.load(&fp).await, Err(CheckpointError::NotFound(_))));

        state.turn = 1;
        let cp = Checkpoint {
            state: state.clone(),
            snapshot: None,
            manifest: None,
        };
        store.save(&fp, &cp).await.unwrap();
        state.turn = 2;
        store
            .save(&fp, &Checkpoint { state, ..cp })
            .await
            .unwrap();
        assert_eq!(store.load(&fp).await.unwrap().state.turn, 2);
        assert_eq!(store.list().await.unwrap()[0].turn, 2);

        store.clear(&fp).await.unwrap();
        store.clear(&fp).await.unwrap();
        assert!(!store.contains(&fp).await);

        store.close().await.unwrap();
        assert_eq!(store.list().await, Err(CheckpointError::Closed));
    }
}

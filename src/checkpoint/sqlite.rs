//! SQLite 断点存储（需要启用 `async-sqlite` feature）
//!
//! 单表，每个 fingerprint 一行；state / manifest / snapshot 以 JSON 存储，save 为 INSERT OR REPLACE。

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointManifest, CheckpointStore, CheckpointSummary, RunState};
use crate::sandbox::SandboxSnapshot;

fn db_err(e: sqlx::Error) -> CheckpointError {
    CheckpointError::Io(e.to_string())
}

pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .map_err(db_err)?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn init_tables(&self) -> Result<(), CheckpointError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                fingerprint TEXT PRIMARY KEY,
                agent TEXT NOT NULL,
                turn INTEGER NOT NULL,
                state TEXT NOT NULL,
                manifest TEXT,
                snapshot TEXT,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

fn corrupt(fingerprint: &str, e: impl std::fmt::Display) -> CheckpointError {
    CheckpointError::Corrupt {
        fingerprint: fingerprint.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, fingerprint: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let state = serde_json::to_string(&checkpoint.state).map_err(|e| CheckpointError::Io(e.to_string()))?;
        let manifest = checkpoint
            .manifest
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| CheckpointError::Io(e.to_string()))?;
        let snapshot = checkpoint
            .snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| CheckpointError::Io(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints (fingerprint, agent, turn, state, manifest, snapshot, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(fingerprint)
        .bind(&checkpoint.state.agent)
        .bind(checkpoint.state.turn as i64)
        .bind(&state)
        .bind(manifest)
        .bind(snapshot)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        tracing::info!(fingerprint = %fingerprint, turn = checkpoint.state.turn, "checkpoint saved");
        Ok(())
    }

    async fn load(&self, fingerprint: &str) -> Result<Checkpoint, CheckpointError> {
        let row = sqlx::query("SELECT state, manifest, snapshot FROM checkpoints WHERE fingerprint = ?")
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| CheckpointError::NotFound(fingerprint.to_string()))?;

        let state: String = row.get("state");
        let state: RunState = serde_json::from_str(&state).map_err(|e| corrupt(fingerprint, e))?;
        let snapshot: Option<String> = row.get("snapshot");
        let snapshot = snapshot
            .map(|s| serde_json::from_str::<SandboxSnapshot>(&s))
            .transpose()
            .map_err(|e| corrupt(fingerprint, e))?;
        let manifest: Option<String> = row.get("manifest");
        let manifest = manifest.and_then(|m| match serde_json::from_str::<CheckpointManifest>(&m) {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::debug!(fingerprint = %fingerprint, error = %e, "checkpoint manifest corrupt, ignored");
                None
            }
        });
        Ok(Checkpoint {
            state,
            snapshot,
            manifest,
        })
    }

    async fn clear(&self, fingerprint: &str) -> Result<(), CheckpointError> {
        sqlx::query("DELETE FROM checkpoints WHERE fingerprint = ?")
            .bind(fingerprint)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        let rows = sqlx::query("SELECT fingerprint, agent, turn, updated_at FROM checkpoints ORDER BY fingerprint")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let updated_at: String = row.get("updated_at");
                let turn: i64 = row.get("turn");
                CheckpointSummary {
                    fingerprint: row.get("fingerprint"),
                    agent: row.get("agent"),
                    turn: turn.max(0) as usize,
                    updated_at: DateTime::parse_from_rfc3339(&updated_at)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                }
            })
            .collect())
    }

    async fn close(&self) -> Result<(), CheckpointError> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = SqliteCheckpointStore::open(dir.path().join("cp.db")).await.unwrap();
        let mut state = RunState::new("a", "t");
        state.turn = 4;
        let fp = state.fingerprint.clone();
        let mut snap = SandboxSnapshot::default();
        snap.files.insert("x.txt".into(), b"hello".to_vec());
        let cp = Checkpoint {
            state,
            snapshot: Some(snap),
            manifest: None,
        };
        store.save(&fp, &cp).await.unwrap();
        assert_eq!(store.load(&fp).await.unwrap(), cp);
        assert_eq!(store.list().await.unwrap()[0].turn, 4);
        store.clear(&fp).await.unwrap();
        assert!(matches!(store.load(&fp).await, Err(CheckpointError::NotFound(_))));
    }
}

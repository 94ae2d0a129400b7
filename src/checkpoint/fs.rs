//! 文件系统断点存储
//!
//! 目录布局（每个 fingerprint 一个目录）：
//! ```text
//! <root>/<fingerprint>/state.json     RunState
//! <root>/<fingerprint>/manifest.json  CheckpointManifest
//! <root>/<fingerprint>/files/         沙箱快照（原样文件树）
//! ```
//! json 文件先写临时文件再 rename；files/ 先写到临时目录再整体替换，
//! 沙箱中已删除的文件不会残留在快照里。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointManifest, CheckpointStore, CheckpointSummary, RunState};
use crate::sandbox::{LocalSandbox, Sandbox, SandboxError};

const STATE_FILE: &str = "state.json";
const MANIFEST_FILE: &str = "manifest.json";
const FILES_DIR: &str = "files";

/// 目录型断点存储
#[derive(Debug)]
pub struct FileCheckpointStore {
    root: PathBuf,
    closed: AtomicBool,
}

fn io_err(context: &Path, e: std::io::Error) -> CheckpointError {
    CheckpointError::Io(format!("{}: {}", context.display(), e))
}

fn sandbox_err(e: SandboxError) -> CheckpointError {
    CheckpointError::Io(e.to_string())
}

/// 先写 `<path>.tmp` 再 rename
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), CheckpointError> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, data).await.map_err(|e| io_err(&tmp, e))?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| io_err(path, e))
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), CheckpointError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path, e)),
    }
}

impl FileCheckpointStore {
    /// 打开（必要时创建）根目录
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| io_err(&root, e))?;
        tracing::debug!(root = %root.display(), "checkpoint store opened");
        Ok(Self {
            root,
            closed: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_open(&self) -> Result<(), CheckpointError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CheckpointError::Closed);
        }
        Ok(())
    }

    /// fingerprint 直接作为目录名，只允许安全字符
    fn entry_dir(&self, fingerprint: &str) -> Result<PathBuf, CheckpointError> {
        let valid = !fingerprint.is_empty()
            && fingerprint
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(CheckpointError::Io(format!("invalid fingerprint '{}'", fingerprint)));
        }
        Ok(self.root.join(fingerprint))
    }

    async fn read_manifest(dir: &Path, fingerprint: &str) -> Option<CheckpointManifest> {
        let path = dir.join(MANIFEST_FILE);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(_) => {
                tracing::debug!(fingerprint = %fingerprint, "checkpoint manifest missing");
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::debug!(fingerprint = %fingerprint, error = %e, "checkpoint manifest corrupt, ignored");
                None
            }
        }
    }

    async fn replace_files(&self, dir: &Path, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let files = dir.join(FILES_DIR);
        let Some(snapshot) = &checkpoint.snapshot else {
            return remove_dir_if_exists(&files).await;
        };

        let staging = dir.join(format!("{}.tmp-{}", FILES_DIR, uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| io_err(&staging, e))?;
        LocalSandbox::new(&staging)
            .restore(snapshot)
            .await
            .map_err(sandbox_err)?;

        let old = dir.join(format!("{}.old-{}", FILES_DIR, uuid::Uuid::new_v4()));
        let had_old = tokio::fs::try_exists(&files).await.unwrap_or(false);
        if had_old {
            tokio::fs::rename(&files, &old).await.map_err(|e| io_err(&files, e))?;
        }
        tokio::fs::rename(&staging, &files)
            .await
            .map_err(|e| io_err(&files, e))?;
        if had_old {
            remove_dir_if_exists(&old).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, fingerprint: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.ensure_open()?;
        let dir = self.entry_dir(fingerprint)?;
        tokio::fs::create_dir_all(&dir).await.map_err(|e| io_err(&dir, e))?;

        self.replace_files(&dir, checkpoint).await?;

        let state = serde_json::to_vec_pretty(&checkpoint.state)
            .map_err(|e| CheckpointError::Io(e.to_string()))?;
        write_atomic(&dir.join(STATE_FILE), &state).await?;

        if let Some(manifest) = &checkpoint.manifest {
            let raw = serde_json::to_vec_pretty(manifest).map_err(|e| CheckpointError::Io(e.to_string()))?;
            write_atomic(&dir.join(MANIFEST_FILE), &raw).await?;
        }

        tracing::info!(
            fingerprint = %fingerprint,
            turn = checkpoint.state.turn,
            files = checkpoint.snapshot.as_ref().map(|s| s.len()).unwrap_or(0),
            "checkpoint saved"
        );
        Ok(())
    }

    async fn load(&self, fingerprint: &str) -> Result<Checkpoint, CheckpointError> {
        self.ensure_open()?;
        let dir = self.entry_dir(fingerprint)?;
        let state_path = dir.join(STATE_FILE);
        let raw = match tokio::fs::read(&state_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound(fingerprint.to_string()))
            }
            Err(e) => return Err(io_err(&state_path, e)),
        };
        let state: RunState = serde_json::from_slice(&raw).map_err(|e| CheckpointError::Corrupt {
            fingerprint: fingerprint.to_string(),
            reason: e.to_string(),
        })?;

        let files = dir.join(FILES_DIR);
        let snapshot = if tokio::fs::try_exists(&files).await.unwrap_or(false) {
            Some(LocalSandbox::new(&files).snapshot().await.map_err(sandbox_err)?)
        } else {
            None
        };

        let manifest = Self::read_manifest(&dir, fingerprint).await;
        Ok(Checkpoint {
            state,
            snapshot,
            manifest,
        })
    }

    async fn clear(&self, fingerprint: &str) -> Result<(), CheckpointError> {
        self.ensure_open()?;
        let dir = self.entry_dir(fingerprint)?;
        remove_dir_if_exists(&dir).await?;
        tracing::info!(fingerprint = %fingerprint, "checkpoint cleared");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        self.ensure_open()?;
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| io_err(&self.root, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&self.root, e))? {
            let dir = entry.path();
            let state_path = dir.join(STATE_FILE);
            let Ok(raw) = tokio::fs::read(&state_path).await else {
                continue;
            };
            let fingerprint = entry.file_name().to_string_lossy().to_string();
            let state: RunState = match serde_json::from_slice(&raw) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(fingerprint = %fingerprint, error = %e, "skipping corrupt checkpoint");
                    continue;
                }
            };
            let updated_at = match Self::read_manifest(&dir, &fingerprint).await {
                Some(m) => m.updated_at,
                None => tokio::fs::metadata(&state_path)
                    .await
                    .and_then(|m| m.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now()),
            };
            out.push(CheckpointSummary {
                fingerprint,
                agent: state.agent,
                turn: state.turn,
                updated_at,
            });
        }
        out.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        Ok(out)
    }

    async fn close(&self) -> Result<(), CheckpointError> {
        self.closed.store(true, Ordering::SeqCst);
        tracing::debug!(root = %self.root.display(), "checkpoint store closed");
        Ok(())
    }
}

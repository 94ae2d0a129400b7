//! 断点存储
//!
//! 以 fingerprint 为键保存 RunState 与沙箱快照：save 覆盖旧值，load 不存在时返回 NotFound，
//! clear 幂等，list 返回每个断点的回合数与更新时间。
//! 存储是显式注入的依赖（根目录由构造参数指定，open/close 显式生命周期），测试可替换为内存实现。
//! 同一 fingerprint 同时只允许一个活跃运行，存储本身不做跨进程加锁。

pub mod fs;
pub mod memory;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::AgentError;
use crate::memory::Message;
use crate::sandbox::SandboxSnapshot;
use crate::tools::RunMetadata;

pub use fs::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteCheckpointStore;

/// 断点格式版本
pub const CHECKPOINT_VERSION: u32 = 1;

/// 断点存储错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("No checkpoint for fingerprint {0}")]
    NotFound(String),

    #[error("Checkpoint I/O error: {0}")]
    Io(String),

    #[error("Corrupt checkpoint {fingerprint}: {reason}")]
    Corrupt { fingerprint: String, reason: String },

    #[error("Checkpoint store closed")]
    Closed,
}

impl From<CheckpointError> for AgentError {
    fn from(e: CheckpointError) -> Self {
        AgentError::Checkpoint(e.to_string())
    }
}

/// 由智能体名与任务描述计算的断点键（sha256 十六进制）
pub fn fingerprint(agent: &str, task: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(agent.as_bytes());
    hasher.update([0u8]);
    hasher.update(task.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 断点单元：一次运行在某个回合边界上的完整状态
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub fingerprint: String,
    pub agent: String,
    pub task: String,
    pub messages: Vec<Message>,
    /// 已完成的回合数
    pub turn: usize,
    #[serde(default)]
    pub metadata: RunMetadata,
}

impl RunState {
    pub fn new(agent: impl Into<String>, task: impl Into<String>) -> Self {
        let agent = agent.into();
        let task = task.into();
        Self {
            fingerprint: fingerprint(&agent, &task),
            agent,
            task,
            messages: Vec::new(),
            turn: 0,
            metadata: RunMetadata::default(),
        }
    }
}

/// 断点附带的运行环境描述，用于恢复时检测模型或工具集变化
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub fingerprint: String,
    pub agent: String,
    pub task: String,
    pub model: String,
    /// 排序后的工具名
    pub tool_names: Vec<String>,
    pub version: u32,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointManifest {
    pub fn new(state: &RunState, model: &str, tool_names: &[String]) -> Self {
        let mut tool_names = tool_names.to_vec();
        tool_names.sort();
        tool_names.dedup();
        Self {
            fingerprint: state.fingerprint.clone(),
            agent: state.agent.clone(),
            task: state.task.clone(),
            model: model.to_string(),
            tool_names,
            version: CHECKPOINT_VERSION,
            updated_at: Utc::now(),
        }
    }

    /// 与当前环境的差异描述；为空表示一致
    pub fn drift(&self, model: &str, tool_names: &[String]) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.model != model {
            warnings.push(format!("model changed: {} -> {}", self.model, model));
        }
        let saved: BTreeSet<&str> = self.tool_names.iter().map(String::as_str).collect();
        let current: BTreeSet<&str> = tool_names.iter().map(String::as_str).collect();
        if saved != current {
            let added: Vec<&str> = current.difference(&saved).copied().collect();
            let removed: Vec<&str> = saved.difference(&current).copied().collect();
            warnings.push(format!(
                "tools changed: added [{}], removed [{}]",
                added.join(", "),
                removed.join(", ")
            ));
        }
        if self.version != CHECKPOINT_VERSION {
            warnings.push(format!(
                "checkpoint version {} differs from {}",
                self.version, CHECKPOINT_VERSION
            ));
        }
        warnings
    }
}

/// 完整断点记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub state: RunState,
    /// 无沙箱的运行为 None
    #[serde(default)]
    pub snapshot: Option<SandboxSnapshot>,
    /// 缺失或损坏时为 None，不影响恢复
    #[serde(default)]
    pub manifest: Option<CheckpointManifest>,
}

/// list() 的条目
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub fingerprint: String,
    pub agent: String,
    pub turn: usize,
    pub updated_at: DateTime<Utc>,
}

/// 断点存储
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 覆盖该 fingerprint 下已有的断点
    async fn save(&self, fingerprint: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    async fn load(&self, fingerprint: &str) -> Result<Checkpoint, CheckpointError>;

    /// 幂等
    async fn clear(&self, fingerprint: &str) -> Result<(), CheckpointError>;

    /// 按 fingerprint 排序
    async fn list(&self) -> Result<Vec<CheckpointSummary>, CheckpointError>;

    async fn close(&self) -> Result<(), CheckpointError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic_and_agent_scoped() {
        let a = fingerprint("analyst", "summarise sales.csv");
        assert_eq!(a, fingerprint("analyst", "summarise sales.csv"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, fingerprint("writer", "summarise sales.csv"));
        assert_ne!(a, fingerprint("analyst", "summarise sales.csv "));
        // 分隔符保证拼接不产生碰撞
        assert_ne!(fingerprint("ab", "c"), fingerprint("a", "bc"));
    }

    #[test]
    fn test_manifest_drift() {
        let state = RunState::new("agent", "task");
        let tools = vec!["finish".to_string(), "code_exec".to_string()];
        let manifest = CheckpointManifest::new(&state, "model-a", &tools);
        assert_eq!(manifest.tool_names, vec!["code_exec", "finish"]);
        assert!(manifest.drift("model-a", &tools).is_empty());

        let warnings = manifest.drift("model-b", &["finish".to_string(), "web".to_string()]);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("model changed"));
        assert!(warnings[1].contains("added [web]"));
        assert!(warnings[1].contains("removed [code_exec]"));
    }
}

//! 运行状态：循环阶段与对外的运行报告

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::{AgentError, ErrorKind};
use crate::memory::{Message, TokenUsage};
use crate::tools::{FinishSignal, RunMetadata};

/// 回合循环阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Idle,
    Running,
    Completed,
    Failed,
    Suspended,
}

impl AgentPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Suspended)
    }
}

/// 运行结局
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed { finish: FinishSignal },
    Failed { kind: ErrorKind, message: String },
    /// 已保存断点，可用 fingerprint 续跑
    Suspended { fingerprint: String },
}

impl RunStatus {
    pub fn failed(err: &AgentError) -> Self {
        Self::Failed {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn phase(&self) -> AgentPhase {
        match self {
            Self::Completed { .. } => AgentPhase::Completed,
            Self::Failed { .. } => AgentPhase::Failed,
            Self::Suspended { .. } => AgentPhase::Suspended,
        }
    }
}

/// 一次运行的完整结果
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub agent: String,
    pub status: RunStatus,
    pub messages: Vec<Message>,
    pub metadata: RunMetadata,
    /// 已完成的回合数
    pub turns: usize,
    pub fingerprint: String,
    /// 落到 output_dir 的文件
    #[serde(default)]
    pub output_files: Vec<PathBuf>,
}

impl RunReport {
    pub fn token_usage(&self) -> TokenUsage {
        self.metadata.token_usage
    }

    pub fn finish(&self) -> Option<&FinishSignal> {
        match &self.status {
            RunStatus::Completed { finish } => Some(finish),
            _ => None,
        }
    }

    /// 最后一条助手文本
    pub fn final_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .filter(|m| matches!(m, Message::Assistant { .. }))
            .map(|m| m.text())
            .find(|t| !t.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_phase() {
        let done = RunStatus::Completed {
            finish: FinishSignal {
                reason: "ok".into(),
                paths: vec![],
            },
        };
        assert!(done.is_completed());
        assert_eq!(done.phase(), AgentPhase::Completed);
        let failed = RunStatus::failed(&AgentError::TurnLimitExceeded { max_turns: 3 });
        assert_eq!(
            failed,
            RunStatus::Failed {
                kind: ErrorKind::TurnLimitExceeded,
                message: "Turn limit exceeded: 3 turns without finish".into()
            }
        );
        assert!(AgentPhase::Suspended.is_terminal());
        assert!(!AgentPhase::Running.is_terminal());
    }
}

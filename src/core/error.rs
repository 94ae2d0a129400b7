//! 错误类型与恢复动作
//!
//! 两层错误：ToolError 是可恢复的，作为工具结果回给模型，循环继续；
//! AgentError 是运行级的，终止运行（Failed）或触发挂起（Interrupted）。
//! 与 RecoveryEngine 配合决定 ReportToModel / Nudge / Suspend / Fail。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;
use crate::sandbox::SandboxError;

/// 工具调用错误：除 Fatal 外都作为 tool-result 回给模型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Command not allowed: {0}")]
    CommandNotAllowed(String),

    #[error("Tool timeout: {0}")]
    Timeout(String),

    /// 智能体装配问题（如子智能体产出文件但父级无沙箱），对调试可见
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Tool execution failed: {0}")]
    Failed(String),

    /// 工具声明的致命错误，循环转 Failed
    #[error("Fatal tool error: {0}")]
    Fatal(String),
}

impl ToolError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn invalid_arguments(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            tool: tool.into(),
            reason: reason.into(),
        }
    }
}

/// 运行级错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Turn limit exceeded: {max_turns} turns without finish")]
    TurnLimitExceeded { max_turns: usize },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Provider '{provider}' setup failed: {reason}")]
    ProviderSetup { provider: String, reason: String },

    #[error("Fatal error from tool {tool}: {reason}")]
    FatalTool { tool: String, reason: String },

    /// 外部中断：已写入断点，fingerprint 用于续跑
    #[error("Run interrupted, resume with fingerprint {fingerprint}")]
    Interrupted { fingerprint: String },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Output staging failed: {0}")]
    OutputStaging(String),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Sub-agent depth {depth} exceeds limit {max_depth}")]
    DepthExceeded { depth: usize, max_depth: usize },
}

/// 扁平的错误类别，随 RunStatus::Failed 返回给调用方
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TurnLimitExceeded,
    ModelError,
    ProviderSetup,
    FatalTool,
    Interrupted,
    Checkpoint,
    Configuration,
    OutputStaging,
    Sandbox,
    DepthExceeded,
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TurnLimitExceeded { .. } => ErrorKind::TurnLimitExceeded,
            Self::Llm(_) => ErrorKind::ModelError,
            Self::ProviderSetup { .. } => ErrorKind::ProviderSetup,
            Self::FatalTool { .. } => ErrorKind::FatalTool,
            Self::Interrupted { .. } => ErrorKind::Interrupted,
            Self::Checkpoint(_) => ErrorKind::Checkpoint,
            Self::Config(_) => ErrorKind::Configuration,
            Self::OutputStaging(_) => ErrorKind::OutputStaging,
            Self::Sandbox(_) => ErrorKind::Sandbox,
            Self::DepthExceeded { .. } => ErrorKind::DepthExceeded,
        }
    }
}

/// 恢复引擎根据错误给出的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 作为 tool-result 错误回给模型，循环继续
    ReportToModel(String),
    /// 追加一条 user 提示后进入下一回合（模型没有调用任何工具）
    Nudge(String),
    /// 写断点后挂起
    Suspend,
    /// 终止运行
    Fail,
}

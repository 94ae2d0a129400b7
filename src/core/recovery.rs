//! 错误恢复引擎
//!
//! 把工具错误与运行级错误映射为 RecoveryAction，供回合循环决定是回报模型、提示模型、挂起还是终止。

use crate::core::{AgentError, RecoveryAction, ToolError};

/// 模型一回合内没有任何工具调用时追加的提示
pub const NUDGE_PROMPT: &str = "You did not call any tool. Continue working on the task using the available tools, \
     and call the `finish` tool when the task is complete.";

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default, Clone)]
pub struct RecoveryEngine {
    nudge: Option<String>,
}

impl RecoveryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 自定义 nudge 文案
    pub fn with_nudge(mut self, nudge: impl Into<String>) -> Self {
        self.nudge = Some(nudge.into());
        self
    }

    /// 工具错误：Fatal 终止运行，其余作为错误结果回给模型
    pub fn on_tool_error(&self, err: &ToolError) -> RecoveryAction {
        match err {
            ToolError::Fatal(_) => RecoveryAction::Fail,
            ToolError::NotFound(name) => RecoveryAction::ReportToModel(format!(
                "Tool '{name}' does not exist. Use one of the tools listed in the request."
            )),
            ToolError::InvalidArguments { tool, reason } => RecoveryAction::ReportToModel(format!(
                "Invalid arguments for '{tool}': {reason}. Check the parameter schema and call it again."
            )),
            other => RecoveryAction::ReportToModel(other.to_string()),
        }
    }

    /// 助手回复没有工具调用
    pub fn on_no_tool_calls(&self) -> RecoveryAction {
        RecoveryAction::Nudge(self.nudge.clone().unwrap_or_else(|| NUDGE_PROMPT.to_string()))
    }

    /// 运行级错误：中断挂起，其余终止
    pub fn on_run_error(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::Interrupted { .. } => RecoveryAction::Suspend,
            _ => RecoveryAction::Fail,
        }
    }
}

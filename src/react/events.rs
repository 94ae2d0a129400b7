//! 回合循环过程事件：供 CLI / 聊天前端展示进度

use serde::Serialize;

use crate::core::ErrorKind;
use crate::memory::TokenUsage;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// 新回合开始（turn 从 1 计）
    TurnStarted {
        agent: String,
        turn: usize,
        max_turns: usize,
    },
    /// 模型回复
    AssistantReply {
        agent: String,
        turn: usize,
        text: String,
        tool_calls: Vec<String>,
        usage: TokenUsage,
    },
    /// 工具返回（预览，避免过长）
    ToolResult {
        agent: String,
        call_id: String,
        tool: String,
        is_error: bool,
        preview: String,
    },
    /// 模型未调用工具，追加提示
    Nudge { agent: String, turn: usize },
    Completed {
        agent: String,
        reason: String,
        paths: Vec<String>,
    },
    Failed {
        agent: String,
        kind: ErrorKind,
        message: String,
    },
    Suspended {
        agent: String,
        fingerprint: String,
        turn: usize,
    },
}

//! 对话模型：消息、内容块、工具调用与 token 用量

pub mod conversation;

pub use conversation::{ContentBlock, Message, Role, TokenUsage, ToolCall};

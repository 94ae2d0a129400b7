//! 外部集成：聊天前端桥接

pub mod chat;

pub use chat::{parse_message, ChatBridge, ParsedMessage, RunRequest, RunSummary};

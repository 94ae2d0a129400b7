//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）与重试包装

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::ScriptedLlmClient;
pub use openai::OpenAiCompatClient;
pub use traits::{AssistantReply, LlmClient, LlmError, RetryConfig, RetryingLlmClient};

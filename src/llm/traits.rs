//! LLM 客户端抽象
//!
//! 核心只依赖 generate(history, tool_schemas) -> AssistantReply 这一契约；
//! 具体后端（OpenAI 兼容 / Mock）实现 LlmClient，重试由 RetryingLlmClient 包装。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::{Message, TokenUsage, ToolCall};
use crate::tools::ToolSchema;

/// 模型调用错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Context window exceeded")]
    ContextWindowExceeded,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl LlmError {
    /// 网络抖动、限流与 5xx 可重试；其余直接上抛
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::RateLimited { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// 一次生成的结果：文本、工具调用与 token 用量
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantReply {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
}

impl AssistantReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn into_message(self) -> Message {
        Message::assistant(self.content, self.tool_calls, self.usage)
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 模型标识（写入断点 manifest，用于漂移告警）
    fn model(&self) -> &str;

    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<AssistantReply, LlmError>;
}

/// 重试配置：指数退避
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    fn backoff(&self, attempt: u32, err: &LlmError) -> Duration {
        if let LlmError::RateLimited { retry_after_ms } = err {
            return Duration::from_millis(*retry_after_ms).min(self.max_backoff);
        }
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// 带重试的客户端包装：可重试错误按退避重试，耗尽后返回 RetriesExhausted
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<AssistantReply, LlmError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.generate(messages, tools).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let wait = self.config.backoff(attempt, &e);
                    tracing::warn!(
                        model = %self.inner.model(),
                        attempt = attempt + 1,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "retrying model call"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    return Err(LlmError::RetriesExhausted {
                        attempts: attempt + 1,
                        last: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

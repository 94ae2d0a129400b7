//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本依次返回预设回复；脚本耗尽后若设置了 repeat 则一直返回该回复，否则报 InvalidResponse。
//! 记录每次调用看到的对话历史，便于断言续跑前后的历史前缀。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{AssistantReply, LlmClient, LlmError};
use crate::memory::Message;
use crate::tools::ToolSchema;

/// 脚本化客户端
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    model: String,
    script: Mutex<VecDeque<Result<AssistantReply, LlmError>>>,
    repeat: Option<AssistantReply>,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new(script: Vec<Result<AssistantReply, LlmError>>) -> Self {
        Self {
            model: "mock".to_string(),
            script: Mutex::new(script.into()),
            repeat: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// 每次都返回同一回复
    pub fn repeating(reply: AssistantReply) -> Self {
        Self::new(Vec::new()).with_repeat(reply)
    }

    pub fn with_repeat(mut self, reply: AssistantReply) -> Self {
        self.repeat = Some(reply);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn call_count(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// 每次调用时传入的完整历史
    pub fn seen_histories(&self) -> Vec<Vec<Message>> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        messages: &[Message],
        _tools: &[ToolSchema],
    ) -> Result<AssistantReply, LlmError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(messages.to_vec());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match (next, &self.repeat) {
            (Some(step), _) => step,
            (None, Some(reply)) => Ok(reply.clone()),
            (None, None) => Err(LlmError::InvalidResponse("script exhausted".to_string())),
        }
    }
}

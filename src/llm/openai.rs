//! OpenAI 兼容 API 客户端
//!
//! 通过 reqwest 调用任意 OpenAI 兼容端点的 /chat/completions（可配置 base_url），
//! 以 function tools 方式传入工具 schema，解析 tool_calls 与 usage。

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::llm::{AssistantReply, LlmClient, LlmError};
use crate::memory::{ContentBlock, Message, TokenUsage, ToolCall};
use crate::tools::ToolSchema;

/// OpenAI 兼容客户端
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_tokens: Option<u32>,
}

impl OpenAiCompatClient {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            max_tokens: None,
        })
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// 复制客户端并替换模型名（保留 base_url 与 key），用于按请求覆盖模型
    pub fn with_model(&self, model: &str) -> Self {
        Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            model: model.to_string(),
            api_key: self.api_key.clone(),
            max_tokens: self.max_tokens,
        }
    }

    fn request_body(&self, messages: &[Message], tools: &[ToolSchema]) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages.iter().map(to_api_message).collect::<Vec<_>>(),
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        if let Some(max) = self.max_tokens {
            body["max_tokens"] = json!(max);
        }
        body
    }
}

fn content_parts(blocks: &[ContentBlock]) -> Value {
    if blocks.iter().all(|b| matches!(b, ContentBlock::Text { .. })) {
        return Value::String(crate::memory::conversation::blocks_text(blocks));
    }
    Value::Array(
        blocks
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                ContentBlock::Image { media_type, data } => json!({
                    "type": "image_url",
                    "image_url": {"url": format!("data:{};base64,{}", media_type, data)}
                }),
            })
            .collect(),
    )
}

fn to_api_message(msg: &Message) -> Value {
    match msg {
        Message::System { content } => json!({"role": "system", "content": content}),
        Message::User { content } => json!({"role": "user", "content": content_parts(content)}),
        Message::Assistant {
            content, tool_calls, ..
        } => {
            let mut m = json!({"role": "assistant", "content": content});
            if !tool_calls.is_empty() {
                m["tool_calls"] = Value::Array(
                    tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.call_id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.arguments.to_string(),
                                }
                            })
                        })
                        .collect(),
                );
            }
            m
        }
        // tool 消息只接受文本
        Message::Tool {
            call_id, content, ..
        } => json!({
            "role": "tool",
            "tool_call_id": call_id,
            "content": crate::memory::conversation::blocks_text(content),
        }),
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ApiMessage,
}

#[derive(Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ApiToolCall>,
}

#[derive(Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    completion_tokens_details: Option<CompletionDetails>,
}

#[derive(Deserialize)]
struct CompletionDetails {
    #[serde(default)]
    reasoning_tokens: u64,
}

fn parse_response(resp: ChatResponse) -> Result<AssistantReply, LlmError> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse("no choices".to_string()))?;
    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|tc| {
            // 参数不是合法 JSON 时原样保留为字符串，交给工具 schema 校验报 InvalidArguments
            let arguments = if tc.function.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(Value::String(tc.function.arguments))
            };
            ToolCall::new(tc.id, tc.function.name, arguments)
        })
        .collect();
    let usage = resp
        .usage
        .map(|u| {
            let reasoning = u
                .completion_tokens_details
                .map(|d| d.reasoning_tokens)
                .unwrap_or(0);
            TokenUsage {
                input: u.prompt_tokens,
                output: u.completion_tokens.saturating_sub(reasoning),
                reasoning,
            }
        })
        .unwrap_or_default();
    Ok(AssistantReply {
        content: choice.message.content.unwrap_or_default(),
        tool_calls,
        usage,
    })
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<AssistantReply, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.http.post(&url).json(&self.request_body(messages, tools));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(|e| LlmError::Network(e.to_string()))?;
        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after_ms = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(1000);
            return Err(LlmError::RateLimited { retry_after_ms });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            if text.contains("context_length") || text.contains("maximum context") {
                return Err(LlmError::ContextWindowExceeded);
            }
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: text,
            });
        }
        let body: ChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        parse_response(body)
    }
}

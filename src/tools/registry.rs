//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），
//! 由 ToolRegistry 按声明名注册与查找（显式注册表分发，不做反射）。
//! 带类型参数的工具实现 TypedTool：参数先按 schema 反序列化，失败即 InvalidArguments。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{RunScheduler, ToolError};
use crate::memory::ContentBlock;
use crate::sandbox::Sandbox;
use crate::tools::finish::FinishSignal;
use crate::tools::schema::params_schema;
use crate::tools::RunMetadata;

/// 工具调用时可见的运行上下文
#[derive(Clone, Default)]
pub struct ToolContext {
    /// 当前会话拥有的沙箱（若有）
    pub sandbox: Option<Arc<dyn Sandbox>>,
    pub cancel: CancellationToken,
    /// 当前嵌套深度，顶层为 0
    pub depth: usize,
    pub max_depth: usize,
    pub scheduler: Option<RunScheduler>,
    /// 正在执行的调用 id
    pub call_id: String,
}

impl ToolContext {
    pub fn for_call(&self, call_id: &str) -> Self {
        let mut ctx = self.clone();
        ctx.call_id = call_id.to_string();
        ctx
    }
}

/// 工具结果：内容块 + 可合并元数据
#[derive(Clone, Debug, Default)]
pub struct ToolOutput {
    pub content: Vec<ContentBlock>,
    pub metadata: RunMetadata,
    /// 部分成功等非致命问题，作为 tool-result 错误标记
    pub is_error: bool,
    /// 合法的 finish 调用
    pub finish: Option<FinishSignal>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            ..Self::default()
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::text(text)
        }
    }

    pub fn with_metadata(mut self, metadata: RunMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// 提供给模型的工具描述
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 工具 trait
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（模型 tool call 中的 name）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;
}

/// 带类型参数的工具：参数由 schemars 生成 schema，serde 负责校验
#[async_trait]
pub trait TypedTool: Send + Sync {
    type Params: DeserializeOwned + JsonSchema + Send;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn call(&self, params: Self::Params, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;
}

#[async_trait]
impl<T: TypedTool> Tool for T {
    fn name(&self) -> &str {
        TypedTool::name(self)
    }

    fn description(&self) -> &str {
        TypedTool::description(self)
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<T::Params>()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let params: T::Params = serde_json::from_value(args)
            .map_err(|e| ToolError::invalid_arguments(TypedTool::name(self), e.to_string()))?;
        self.call(params, ctx).await
    }
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    /// 同名工具后注册者覆盖前者
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool registered twice, keeping the latest");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// 按名称排序
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .values()
            .map(|tool| ToolSchema {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }
}

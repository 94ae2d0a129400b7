//! 智能体定义
//!
//! Agent 是不可变的配置：名称、模型客户端、系统提示、直接持有的工具、提供者工厂、回合上限。
//! 每次运行通过 session() 打开新的会话（提供者每次新建，不跨会话共享）；
//! to_tool() 把智能体包装成可供父智能体调用的子智能体工具。

use std::sync::Arc;
use std::time::Duration;

use crate::core::{run_session, AgentError, RunReport, Session, SessionOptions};
use crate::llm::LlmClient;
use crate::tools::{ProviderFactory, SubAgentTool, Tool, ToolProvider};

/// 默认回合上限
pub const DEFAULT_MAX_TURNS: usize = 50;
/// 默认单次工具调用超时
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(600);

const DEFAULT_SYSTEM_PROMPT: &str = "You are an autonomous agent. Work on the task step by step using the available tools. \
     When the task is complete, call the `finish` tool with a short reason and the paths of every file you produced.";

/// 智能体
#[derive(Clone)]
pub struct Agent {
    name: String,
    client: Arc<dyn LlmClient>,
    system_prompt: String,
    tools: Vec<Arc<dyn Tool>>,
    providers: Vec<ProviderFactory>,
    max_turns: usize,
    tool_timeout: Duration,
}

impl Agent {
    pub fn new(name: impl Into<String>, client: Arc<dyn LlmClient>) -> Self {
        Self {
            name: name.into(),
            client,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            tools: Vec::new(),
            providers: Vec::new(),
            max_turns: DEFAULT_MAX_TURNS,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn with_tool_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// 提供者按添加顺序进入、逆序退出
    pub fn with_provider<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ToolProvider> + Send + Sync + 'static,
    {
        self.providers.push(Arc::new(factory));
        self
    }

    /// 挂载子智能体，工具名为子智能体名
    pub fn with_sub_agent(self, agent: Agent, description: impl Into<String>) -> Self {
        let tool = Arc::new(agent).to_tool(description);
        self.with_tool(tool)
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// 替换模型客户端（如聊天前端按消息指定模型）
    pub fn with_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.client = client;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Arc<dyn LlmClient> {
        &self.client
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn providers(&self) -> &[ProviderFactory] {
        &self.providers
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub fn tool_timeout(&self) -> Duration {
        self.tool_timeout
    }

    /// 打开会话（调用方负责 run 与 close）
    pub async fn session(self: &Arc<Self>, options: SessionOptions) -> Result<Session, AgentError> {
        Session::open(self.clone(), options).await
    }

    /// 打开会话、运行任务并关闭
    pub async fn run(self: &Arc<Self>, task: &str, options: SessionOptions) -> Result<RunReport, AgentError> {
        run_session(self.clone(), task, options).await
    }

    pub fn to_tool(self: Arc<Self>, description: impl Into<String>) -> SubAgentTool {
        SubAgentTool::new(self, description)
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("model", &self.client.model())
            .field("tools", &self.tools.iter().map(|t| t.name().to_string()).collect::<Vec<_>>())
            .field("providers", &self.providers.len())
            .field("max_turns", &self.max_turns)
            .finish()
    }
}

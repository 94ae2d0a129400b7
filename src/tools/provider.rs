//! 工具提供者生命周期
//!
//! ToolProvider 以作用域方式持有资源（沙箱、连接），enter() 建立资源并产出工具，
//! exit() 清理资源，必须幂等，且 enter() 半途失败后也能安全调用。
//! ProviderStack 按声明顺序 enter，按严格逆序 exit；无论运行成功、失败还是中断。

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::sandbox::Sandbox;
use crate::tools::Tool;

/// 提供者错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("setup failed: {0}")]
    Setup(String),

    #[error("teardown failed: {0}")]
    Teardown(String),
}

/// enter 时可见的会话信息
#[derive(Clone, Debug, Default)]
pub struct ProviderContext {
    pub agent: String,
    pub cancel: CancellationToken,
}

/// 一个提供者产出的工具与（可选）沙箱
#[derive(Clone, Default)]
pub struct ProvidedTools {
    pub tools: Vec<Arc<dyn Tool>>,
    pub sandbox: Option<Arc<dyn Sandbox>>,
}

impl ProvidedTools {
    pub fn tools(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            tools,
            sandbox: None,
        }
    }
}

/// 工具提供者
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn enter(&mut self, ctx: &ProviderContext) -> Result<ProvidedTools, ProviderError>;

    /// 幂等；enter 部分失败后同样会被调用
    async fn exit(&mut self) -> Result<(), ProviderError>;
}

/// 每次运行新建提供者实例（提供者有生命周期状态，不能跨会话共享）
pub type ProviderFactory = Arc<dyn Fn() -> Box<dyn ToolProvider> + Send + Sync>;

/// 已进入的提供者栈，记录获取顺序
#[derive(Default)]
pub struct ProviderStack {
    entered: Vec<Box<dyn ToolProvider>>,
}

impl ProviderStack {
    /// 依次 enter；任一失败则先 exit 失败者，再逆序 exit 已进入者，返回 ProviderSetup
    pub async fn enter_all(
        providers: Vec<Box<dyn ToolProvider>>,
        ctx: &ProviderContext,
    ) -> Result<(Self, Vec<ProvidedTools>), AgentError> {
        let mut stack = Self::default();
        let mut provided = Vec::with_capacity(providers.len());
        for mut provider in providers {
            match provider.enter(ctx).await {
                Ok(p) => {
                    tracing::debug!(agent = %ctx.agent, provider = %provider.name(), "provider entered");
                    stack.entered.push(provider);
                    provided.push(p);
                }
                Err(e) => {
                    let name = provider.name().to_string();
                    tracing::error!(agent = %ctx.agent, provider = %name, error = %e, "provider setup failed");
                    if let Err(te) = provider.exit().await {
                        tracing::warn!(provider = %name, error = %te, "teardown after failed setup failed");
                    }
                    stack.exit_all().await;
                    return Err(AgentError::ProviderSetup {
                        provider: name,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok((stack, provided))
    }

    pub fn len(&self) -> usize {
        self.entered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entered.is_empty()
    }

    /// 严格逆序 exit；清理错误只记日志，不影响运行结果
    pub async fn exit_all(&mut self) {
        while let Some(mut provider) = self.entered.pop() {
            match provider.exit().await {
                Ok(()) => tracing::debug!(provider = %provider.name(), "provider exited"),
                Err(e) => tracing::warn!(provider = %provider.name(), error = %e, "provider teardown failed"),
            }
        }
    }
}

impl Drop for ProviderStack {
    /// 会话 future 被丢弃（如外层 select 取消）时仍在运行时上逆序清理
    fn drop(&mut self) {
        if self.entered.is_empty() {
            return;
        }
        let mut entered = std::mem::take(&mut self.entered);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    while let Some(mut provider) = entered.pop() {
                        if let Err(e) = provider.exit().await {
                            tracing::warn!(provider = %provider.name(), error = %e, "provider teardown failed");
                        }
                    }
                });
            }
            Err(_) => {
                tracing::warn!(count = entered.len(), "provider stack dropped outside a runtime, teardown skipped");
            }
        }
    }
}

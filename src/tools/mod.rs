//! 工具层：工具契约、注册表、执行器、提供者生命周期、内置工具（finish / code_exec / 子智能体）

pub mod code_exec;
pub mod executor;
pub mod finish;
pub mod metadata;
pub mod provider;
pub mod registry;
pub mod schema;
pub mod subagent;

pub use code_exec::{CodeExecParams, CodeExecTool};
pub use executor::{CallResult, ToolExecutor};
pub use finish::{FinishParams, FinishSignal, FinishTool, FINISH_TOOL_NAME};
pub use metadata::{aggregate, Merge, RunMetadata, SubAgentTrace};
pub use provider::{ProvidedTools, ProviderContext, ProviderError, ProviderFactory, ProviderStack, ToolProvider};
pub use registry::{Tool, ToolContext, ToolOutput, ToolRegistry, ToolSchema, TypedTool};
pub use schema::params_schema;
pub use subagent::{SubAgentParams, SubAgentTool};

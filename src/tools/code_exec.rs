//! 代码执行工具：在沙箱内执行 shell 命令
//!
//! 只依赖 Sandbox::run_command；超时与白名单拒绝映射为 ToolError，非零退出码作为普通结果返回给模型。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;

use crate::core::ToolError;
use crate::sandbox::{CommandErrorKind, Sandbox};
use crate::tools::{RunMetadata, ToolContext, ToolOutput, TypedTool};

/// 输出截断上限（字符）
const MAX_OUTPUT_CHARS: usize = 20_000;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CodeExecParams {
    /// Shell command to run inside the sandbox working directory.
    pub cmd: String,
    /// Optional timeout in seconds, capped by the sandbox default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

pub struct CodeExecTool {
    sandbox: Arc<dyn Sandbox>,
    timeout: Duration,
}

impl CodeExecTool {
    pub fn new(sandbox: Arc<dyn Sandbox>, timeout: Duration) -> Self {
        Self { sandbox, timeout }
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() > MAX_OUTPUT_CHARS {
        format!(
            "{}\n... [truncated]",
            s.chars().take(MAX_OUTPUT_CHARS).collect::<String>()
        )
    } else {
        s.to_string()
    }
}

#[async_trait]
impl TypedTool for CodeExecTool {
    type Params = CodeExecParams;

    fn name(&self) -> &str {
        "code_exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the sandbox. Files written under the working directory persist for later turns. \
         Returns the exit code, stdout and stderr."
    }

    async fn call(&self, params: CodeExecParams, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let timeout = params
            .timeout_secs
            .map(Duration::from_secs)
            .map(|t| t.min(self.timeout))
            .unwrap_or(self.timeout);

        let out = self.sandbox.run_command(&params.cmd, timeout).await;
        match out.error_kind {
            Some(CommandErrorKind::CommandNotAllowed) => {
                return Err(ToolError::CommandNotAllowed(out.stderr));
            }
            Some(CommandErrorKind::Timeout) => {
                return Err(ToolError::Timeout(format!("{}: {}", params.cmd, out.stderr)));
            }
            Some(CommandErrorKind::Interrupted) => {
                return Err(ToolError::Failed(format!("{}: interrupted", params.cmd)));
            }
            Some(CommandErrorKind::SpawnFailed) => {
                return Err(ToolError::Failed(out.stderr));
            }
            None => {}
        }

        let text = format!(
            "exit_code: {}\nstdout:\n{}\nstderr:\n{}",
            out.exit_code,
            truncate(&out.stdout),
            truncate(&out.stderr)
        );
        Ok(ToolOutput::text(text).with_metadata(RunMetadata::counter("commands", 1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{CommandPolicy, LocalSandbox};
    use crate::tools::Tool;
    use tempfile::TempDir;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_code_exec_reports_exit_code() {
        let dir = TempDir::new().unwrap();
        let sb: Arc<dyn Sandbox> = Arc::new(LocalSandbox::new(dir.path()));
        let tool = CodeExecTool::new(sb, Duration::from_secs(10));
        let out = tool
            .execute(serde_json::json!({"cmd": "echo out; echo err >&2; exit 3"}), &ToolContext::default())
            .await
            .unwrap();
        let text = crate::memory::conversation::blocks_text(&out.content);
        assert!(text.starts_with("exit_code: 3"));
        assert!(text.contains("out"));
        assert!(text.contains("err"));
        assert_eq!(out.metadata.counters.get("commands"), Some(&1));
    }

    #[tokio::test]
    async fn test_code_exec_not_allowed() {
        let dir = TempDir::new().unwrap();
        let policy = CommandPolicy::new(&["^ls".to_string()]).unwrap();
        let sb: Arc<dyn Sandbox> = Arc::new(LocalSandbox::new(dir.path()).with_policy(policy));
        let tool = CodeExecTool::new(sb, Duration::from_secs(10));
        let err = tool
            .execute(serde_json::json!({"cmd": "rm -rf ."}), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::CommandNotAllowed(_)));
    }

    #[tokio::test]
    async fn test_code_exec_missing_cmd_is_invalid() {
        let dir = TempDir::new().unwrap();
        let sb: Arc<dyn Sandbox> = Arc::new(LocalSandbox::new(dir.path()));
        let tool = CodeExecTool::new(sb, Duration::from_secs(10));
        let err = tool
            .execute(serde_json::json!({"command": "ls"}), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }
}

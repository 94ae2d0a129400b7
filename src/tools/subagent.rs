//! 子智能体工具：把 Agent 包装成父回合中的一次工具调用
//!
//! 调用时打开嵌套会话（深度 +1，共享取消令牌与调度器），同步跑完子循环；
//! 父子都有沙箱时，把子智能体 finish 声明的文件复制进父沙箱，这是两个沙箱之间唯一的共享途径。
//! 父级无沙箱而子智能体产出了文件是装配错误：以 Configuration 错误文本回给父回合，子智能体的留档与用量照常汇总。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;

use crate::agent::Agent;
use crate::core::{AgentError, RunStatus, Session, SessionOptions, ToolError};
use crate::sandbox::Sandbox;
use crate::tools::{Merge, RunMetadata, SubAgentTrace, ToolContext, ToolOutput, TypedTool};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SubAgentParams {
    /// Task description for the sub-agent.
    pub task: String,
    /// Paths of files in your sandbox to copy into the sub-agent's sandbox.
    #[serde(default, alias = "input_file_references")]
    pub input_files: Vec<String>,
}

pub struct SubAgentTool {
    agent: Arc<Agent>,
    description: String,
}

impl SubAgentTool {
    pub fn new(agent: Arc<Agent>, description: impl Into<String>) -> Self {
        Self {
            agent,
            description: description.into(),
        }
    }
}

/// 逐个复制；返回 (成功, 失败及原因)
async fn copy_files(from: &dyn Sandbox, to: &dyn Sandbox, paths: &[String]) -> (Vec<String>, Vec<(String, String)>) {
    let mut copied = Vec::new();
    let mut failed = Vec::new();
    for path in paths {
        let result = match from.read_file(path).await {
            Ok(data) => to.write_file(path, &data).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => copied.push(path.clone()),
            Err(e) => failed.push((path.clone(), e.to_string())),
        }
    }
    (copied, failed)
}

fn open_error(agent: &str, e: AgentError) -> ToolError {
    match e {
        AgentError::DepthExceeded { .. } | AgentError::Config(_) => ToolError::Configuration(format!("{}: {}", agent, e)),
        other => ToolError::Failed(format!("sub-agent '{}' could not start: {}", agent, other)),
    }
}

impl SubAgentTool {
    async fn run_child(
        &self,
        session: &mut Session,
        params: &SubAgentParams,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let name = self.agent.name();
        if !params.input_files.is_empty() {
            let (Some(parent), Some(child)) = (&ctx.sandbox, session.sandbox()) else {
                return Err(ToolError::Configuration(format!(
                    "input files for sub-agent '{}' need a sandbox on both the caller and the sub-agent",
                    name
                )));
            };
            let (_, failed) = copy_files(parent.as_ref(), child.as_ref(), &params.input_files).await;
            if !failed.is_empty() {
                let list: Vec<String> = failed.iter().map(|(p, e)| format!("{} ({})", p, e)).collect();
                return Err(ToolError::Failed(format!("could not pass input files: {}", list.join(", "))));
            }
        }

        let report = session.run(&params.task).await;

        let mut metadata = report.metadata.clone();
        metadata.merge(RunMetadata {
            sub_agents: [(
                ctx.call_id.clone(),
                SubAgentTrace {
                    agent: name.to_string(),
                    messages: report.messages.clone(),
                    metadata: report.metadata.clone(),
                },
            )]
            .into_iter()
            .collect(),
            ..RunMetadata::default()
        });

        let finish = match &report.status {
            RunStatus::Completed { finish } => finish.clone(),
            RunStatus::Failed { kind, message } => {
                return Ok(ToolOutput::error(format!(
                    "Sub-agent '{}' failed after {} turns ({:?}): {}",
                    name, report.turns, kind, message
                ))
                .with_metadata(metadata));
            }
            RunStatus::Suspended { .. } => {
                return Ok(ToolOutput::error(format!(
                    "Sub-agent '{}' was interrupted after {} turns",
                    name, report.turns
                ))
                .with_metadata(metadata));
            }
        };

        let (transferred, failed) = if finish.paths.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            match (&ctx.sandbox, session.sandbox()) {
                (None, _) => {
                    tracing::error!(agent = %name, files = ?finish.paths, "sub-agent produced files but the caller has no sandbox");
                    let err = ToolError::Configuration(format!(
                        "sub-agent '{}' produced files [{}] but the calling agent has no sandbox to receive them",
                        name,
                        finish.paths.join(", ")
                    ));
                    return Ok(ToolOutput::error(err.to_string()).with_metadata(metadata));
                }
                (Some(parent), Some(child)) => copy_files(child.as_ref(), parent.as_ref(), &finish.paths).await,
                (Some(_), None) => (
                    Vec::new(),
                    finish
                        .paths
                        .iter()
                        .map(|p| (p.clone(), "sub-agent has no sandbox".to_string()))
                        .collect(),
                ),
            }
        };
        metadata.files_transferred.extend(transferred.iter().cloned());
        if !failed.is_empty() {
            tracing::warn!(agent = %name, transferred = transferred.len(), failed = failed.len(), "partial file transfer from sub-agent");
        }

        let body = serde_json::json!({
            "reason": finish.reason,
            "output_paths": transferred,
            "failed_paths": failed
                .iter()
                .map(|(p, e)| serde_json::json!({"path": p, "error": e}))
                .collect::<Vec<_>>(),
            "turns": report.turns,
        });
        let text = serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string());
        let mut out = ToolOutput::text(text).with_metadata(metadata);
        out.is_error = transferred.is_empty() && !failed.is_empty();
        Ok(out)
    }
}

#[async_trait]
impl TypedTool for SubAgentTool {
    type Params = SubAgentParams;

    fn name(&self) -> &str {
        self.agent.name()
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn call(&self, params: SubAgentParams, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let name = self.agent.name();
        let depth = ctx.depth + 1;
        if depth > ctx.max_depth {
            return Err(ToolError::Configuration(format!(
                "sub-agent '{}' would run at depth {} but the limit is {}",
                name, depth, ctx.max_depth
            )));
        }

        let mut options = SessionOptions::default()
            .with_depth(depth)
            .with_max_depth(ctx.max_depth)
            .with_cancel(ctx.cancel.clone())
            .with_resume(false);
        if let Some(s) = &ctx.scheduler {
            options = options.with_scheduler(s.clone());
        }

        tracing::info!(agent = %name, depth, call_id = %ctx.call_id, "sub-agent started");
        let mut session = Session::open(self.agent.clone(), options)
            .await
            .map_err(|e| open_error(name, e))?;
        let result = self.run_child(&mut session, &params, ctx).await;
        session.close().await;
        result
    }
}

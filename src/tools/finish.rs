//! Finish 工具：运行正常结束的唯一信号
//!
//! 参数 {reason, paths}。paths 在调用时对照当前沙箱校验：缺失文件或无沙箱时
//! 本次 finish 无效，作为错误结果回给模型，循环继续。

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::core::ToolError;
use crate::tools::{ToolContext, ToolOutput, TypedTool};

pub const FINISH_TOOL_NAME: &str = "finish";

/// 完成原因与产出文件
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FinishParams {
    /// Reason for finishing.
    pub reason: String,
    /// List of file paths created or modified. Do not include directories, only files.
    #[serde(default, alias = "output_paths")]
    pub paths: Vec<String>,
}

/// 终止信号
pub type FinishSignal = FinishParams;

/// Finish 工具
#[derive(Debug, Default, Clone, Copy)]
pub struct FinishTool;

#[async_trait]
impl TypedTool for FinishTool {
    type Params = FinishParams;

    fn name(&self) -> &str {
        FINISH_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Signal task completion with a reason. Use when the task is finished or cannot proceed further. \
         List every output file in paths. Note that you will need a separate turn to finish."
    }

    async fn call(&self, params: FinishParams, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        if !params.paths.is_empty() {
            let Some(sandbox) = &ctx.sandbox else {
                return Ok(ToolOutput::error(
                    "Invalid finish: output paths were given but this agent has no sandbox to read them from.",
                ));
            };
            let mut missing = Vec::new();
            for path in &params.paths {
                if !sandbox.exists(path).await {
                    missing.push(path.as_str());
                }
            }
            if !missing.is_empty() {
                return Ok(ToolOutput::error(format!(
                    "Invalid finish: these paths do not exist in the sandbox: {}. Create them or fix the paths, then call finish again.",
                    missing.join(", ")
                )));
            }
        }
        let mut out = ToolOutput::text(params.reason.clone());
        out.finish = Some(params);
        Ok(out)
    }
}

//! 工具执行器
//!
//! 持有 ToolRegistry 与单次调用超时。execute_all 并发执行同一回合的全部调用，
//! 结果按调用顺序返回（与完成顺序无关）；每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::time::timeout;

use crate::core::ToolError;
use crate::memory::ToolCall;
use crate::tools::{Merge, RunMetadata, ToolContext, ToolOutput, ToolRegistry};

/// 一次调用的结果，保留 call_id 与工具名
#[derive(Debug, Clone)]
pub struct CallResult {
    pub call_id: String,
    pub name: String,
    pub result: Result<ToolOutput, ToolError>,
    /// 执行器自身的记账（调用次数、错误、超时、拒绝），成功与失败都有
    pub metadata: RunMetadata,
}

/// 本次调用的记账：已注册工具计入 tool_use，失败按类别计数
fn accounting(name: &str, known: bool, result: &Result<ToolOutput, ToolError>) -> RunMetadata {
    let mut m = if known {
        RunMetadata::tool_used(name)
    } else {
        RunMetadata::counter("unknown_tool_calls", 1)
    };
    if let Err(e) = result {
        m.merge(RunMetadata::counter("tool_errors", 1));
        match e {
            ToolError::Timeout(_) => m.merge(RunMetadata::counter("timeouts", 1)),
            ToolError::CommandNotAllowed(_) => m.merge(RunMetadata::counter("commands_rejected", 1)),
            _ => {}
        }
    }
    m
}

/// 工具执行器：对每次调用施加超时
#[derive(Clone)]
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    /// 执行单个调用；未知工具返回 NotFound，超时返回 Timeout
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> CallResult {
        let start = Instant::now();
        let ctx = ctx.for_call(&call.call_id);

        let known = self.registry.get(&call.name).is_some();
        let result = match self.registry.get(&call.name) {
            None => Err(ToolError::NotFound(call.name.clone())),
            Some(tool) => match timeout(self.timeout, tool.execute(call.arguments.clone(), &ctx)).await {
                Ok(r) => r,
                Err(_) => Err(ToolError::Timeout(format!(
                    "{} exceeded {}s",
                    call.name,
                    self.timeout.as_secs()
                ))),
            },
        };

        let outcome = match &result {
            Ok(out) if out.is_error => "reported_error",
            Ok(_) => "ok",
            Err(ToolError::Timeout(_)) => "timeout",
            Err(e) if e.is_fatal() => "fatal",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.name,
            "call_id": call.call_id,
            "ok": matches!(outcome, "ok"),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&call.arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        CallResult {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            metadata: accounting(&call.name, known, &result),
            result,
        }
    }

    /// 并发执行本回合全部调用；返回顺序与 calls 一致
    pub async fn execute_all(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<CallResult> {
        join_all(calls.iter().map(|call| self.execute(call, ctx))).await
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

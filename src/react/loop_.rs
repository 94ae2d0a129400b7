//! 回合主循环
//!
//! Idle -> Running -> {Completed, Failed, Suspended}。每回合：检查取消与回合上限 -> 调用模型 ->
//! 并发执行全部工具调用 -> 按调用顺序追加 tool 结果。合法的 finish 是唯一的正常结束条件。
//! 状态只在回合边界上推进，取消在回合之间生效，进行中的模型调用被放弃，不会留下半个回合。

use tokio::sync::mpsc::UnboundedSender;

use crate::checkpoint::RunState;
use crate::core::{AgentError, AgentPhase, RecoveryAction, RecoveryEngine};
use crate::llm::LlmClient;
use crate::memory::{ContentBlock, Message};
use crate::react::LoopEvent;
use crate::tools::{FinishSignal, Merge, RunMetadata, ToolContext, ToolExecutor};

/// 工具结果预览最大字符数
const RESULT_PREVIEW_CHARS: usize = 200;

/// 一次 run 的结局；Failed 时错误由调用方决定如何落盘与上报
#[derive(Debug)]
pub enum LoopOutcome {
    Completed(FinishSignal),
    Suspended,
    Failed(AgentError),
}

/// 回合循环
pub struct AgentLoop<'a> {
    agent: &'a str,
    client: &'a dyn LlmClient,
    executor: &'a ToolExecutor,
    recovery: &'a RecoveryEngine,
    ctx: ToolContext,
    max_turns: usize,
    event_tx: Option<&'a UnboundedSender<LoopEvent>>,
    phase: AgentPhase,
}

fn preview(s: &str) -> String {
    if s.chars().count() > RESULT_PREVIEW_CHARS {
        format!("{}...", s.chars().take(RESULT_PREVIEW_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}

impl<'a> AgentLoop<'a> {
    pub fn new(
        agent: &'a str,
        client: &'a dyn LlmClient,
        executor: &'a ToolExecutor,
        recovery: &'a RecoveryEngine,
        ctx: ToolContext,
        max_turns: usize,
    ) -> Self {
        Self {
            agent,
            client,
            executor,
            recovery,
            ctx,
            max_turns,
            event_tx: None,
            phase: AgentPhase::Idle,
        }
    }

    /// 设置事件推送通道
    pub fn with_event_tx(mut self, tx: Option<&'a UnboundedSender<LoopEvent>>) -> Self {
        self.event_tx = tx;
        self
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    fn send_event(&self, ev: LoopEvent) {
        if let Some(t) = self.event_tx {
            let _ = t.send(ev);
        }
    }

    fn finish(&mut self, outcome: LoopOutcome) -> LoopOutcome {
        self.phase = match &outcome {
            LoopOutcome::Completed(_) => AgentPhase::Completed,
            LoopOutcome::Suspended => AgentPhase::Suspended,
            LoopOutcome::Failed(_) => AgentPhase::Failed,
        };
        outcome
    }

    /// 从 state 当前回合继续执行，直到结束；state 始终停在最后一个完整回合
    pub async fn run(&mut self, state: &mut RunState) -> LoopOutcome {
        self.phase = AgentPhase::Running;
        let cancel = self.ctx.cancel.clone();
        let schemas = self.executor.registry().schemas();

        loop {
            if cancel.is_cancelled() {
                tracing::info!(agent = %self.agent, turn = state.turn, "cancellation observed at turn boundary");
                return self.finish(LoopOutcome::Suspended);
            }
            if state.turn >= self.max_turns {
                tracing::warn!(agent = %self.agent, max_turns = self.max_turns, "turn limit reached without finish");
                return self.finish(LoopOutcome::Failed(AgentError::TurnLimitExceeded {
                    max_turns: self.max_turns,
                }));
            }

            let turn = state.turn + 1;
            self.send_event(LoopEvent::TurnStarted {
                agent: self.agent.to_string(),
                turn,
                max_turns: self.max_turns,
            });
            tracing::debug!(agent = %self.agent, turn, "generating");

            let generated = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(agent = %self.agent, turn, "model call abandoned on cancellation");
                    return self.finish(LoopOutcome::Suspended);
                }
                r = self.client.generate(&state.messages, &schemas) => r,
            };
            let mut reply = match generated {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(agent = %self.agent, turn, error = %e, "model call failed");
                    return self.finish(LoopOutcome::Failed(AgentError::Llm(e)));
                }
            };

            for (i, call) in reply.tool_calls.iter_mut().enumerate() {
                if call.call_id.is_empty() {
                    call.call_id = format!("call_{}_{}", turn, i);
                }
            }
            let calls = reply.tool_calls.clone();
            self.send_event(LoopEvent::AssistantReply {
                agent: self.agent.to_string(),
                turn,
                text: reply.content.clone(),
                tool_calls: calls.iter().map(|c| c.name.clone()).collect(),
                usage: reply.usage,
            });
            state.metadata.merge(RunMetadata::usage(reply.usage));
            state.messages.push(reply.into_message());

            if calls.is_empty() {
                if let RecoveryAction::Nudge(prompt) = self.recovery.on_no_tool_calls() {
                    state.messages.push(Message::user(prompt));
                }
                self.send_event(LoopEvent::Nudge {
                    agent: self.agent.to_string(),
                    turn,
                });
                state.turn = turn;
                continue;
            }

            let results = self.executor.execute_all(&calls, &self.ctx).await;
            let mut finish: Option<FinishSignal> = None;
            let mut fatal: Option<AgentError> = None;
            for r in results {
                state.metadata.merge(r.metadata);
                let (content, is_error) = match r.result {
                    Ok(out) => {
                        state.metadata.merge(out.metadata);
                        if finish.is_none() {
                            finish = out.finish;
                        }
                        (out.content, out.is_error)
                    }
                    Err(e) => match self.recovery.on_tool_error(&e) {
                        RecoveryAction::ReportToModel(text) => {
                            tracing::debug!(agent = %self.agent, tool = %r.name, error = %e, "tool error reported to model");
                            (vec![ContentBlock::text(text)], true)
                        }
                        _ => {
                            tracing::error!(agent = %self.agent, tool = %r.name, error = %e, "fatal tool error");
                            if fatal.is_none() {
                                fatal = Some(AgentError::FatalTool {
                                    tool: r.name.clone(),
                                    reason: e.to_string(),
                                });
                            }
                            (vec![ContentBlock::text(e.to_string())], true)
                        }
                    },
                };
                self.send_event(LoopEvent::ToolResult {
                    agent: self.agent.to_string(),
                    call_id: r.call_id.clone(),
                    tool: r.name.clone(),
                    is_error,
                    preview: preview(&crate::memory::conversation::blocks_text(&content)),
                });
                state
                    .messages
                    .push(Message::tool_result(r.call_id, r.name, content, is_error));
            }
            state.turn = turn;

            if let Some(err) = fatal {
                return self.finish(LoopOutcome::Failed(err));
            }
            if let Some(signal) = finish {
                tracing::info!(agent = %self.agent, turn, reason = %signal.reason, "finish called");
                return self.finish(LoopOutcome::Completed(signal));
            }
        }
    }
}

//! 执行引擎集成测试：回合上限、结果顺序、提供者清理顺序、断点续跑、调度上限、子智能体

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rein::checkpoint::{fingerprint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
use rein::core::{ErrorKind, RunScheduler, RunStatus, SessionOptions, ToolError};
use rein::llm::{AssistantReply, ScriptedLlmClient};
use rein::memory::{Message, ToolCall};
use rein::sandbox::LocalSandboxProvider;
use rein::tools::{ProvidedTools, ProviderContext, ProviderError, ToolContext, ToolOutput, ToolProvider, TypedTool};
use rein::Agent;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use tempfile::TempDir;

fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
    ToolCall::new(id, name, args)
}

fn reply(calls: Vec<ToolCall>) -> Result<AssistantReply, rein::llm::LlmError> {
    let mut r = AssistantReply::text("");
    for c in calls {
        r = r.with_call(c);
    }
    Ok(r)
}

fn finish(id: &str, reason: &str, paths: &[&str]) -> ToolCall {
    call(id, "finish", json!({"reason": reason, "paths": paths}))
}

fn tool_results(messages: &[Message]) -> Vec<(String, String, bool)> {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::Tool {
                call_id, is_error, ..
            } => Some((call_id.clone(), m.text(), *is_error)),
            _ => None,
        })
        .collect()
}

fn sandbox_provider(base: &TempDir) -> impl Fn() -> Box<dyn ToolProvider> + Send + Sync + 'static {
    let base = base.path().to_path_buf();
    move || Box::new(LocalSandboxProvider::new().with_base_dir(base.clone())) as Box<dyn ToolProvider>
}

// ---- 测试工具 ----

#[derive(Debug, Deserialize, JsonSchema)]
struct SleepParams {
    ms: u64,
    label: String,
}

/// 睡眠后返回 label；记录同时在跑的最大数量
#[derive(Default)]
struct SleepTool {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl TypedTool for SleepTool {
    type Params = SleepParams;

    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleep then echo the label."
    }

    async fn call(&self, params: SleepParams, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(params.ms)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(ToolOutput::text(params.label))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct WriteParams {
    path: String,
    content: String,
}

struct WriteFileTool;

#[async_trait]
impl TypedTool for WriteFileTool {
    type Params = WriteParams;

    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a text file into the sandbox."
    }

    async fn call(&self, params: WriteParams, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let sandbox = ctx
            .sandbox
            .as_ref()
            .ok_or_else(|| ToolError::Configuration("no sandbox".into()))?;
        sandbox
            .write_file(&params.path, params.content.as_bytes())
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        Ok(ToolOutput::text(format!("wrote {}", params.path)))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct NoParams {}

/// 触发外部中断（模拟 Ctrl+C）
struct InterruptTool;

#[async_trait]
impl TypedTool for InterruptTool {
    type Params = NoParams;

    fn name(&self) -> &str {
        "interrupt"
    }

    fn description(&self) -> &str {
        "Cancel the run."
    }

    async fn call(&self, _params: NoParams, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        ctx.cancel.cancel();
        Ok(ToolOutput::text("interrupt requested"))
    }
}

struct FatalTool;

#[async_trait]
impl TypedTool for FatalTool {
    type Params = NoParams;

    fn name(&self) -> &str {
        "explode"
    }

    fn description(&self) -> &str {
        "Always fails fatally."
    }

    async fn call(&self, _params: NoParams, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        Err(ToolError::Fatal("disk on fire".into()))
    }
}

/// 记录 enter / exit 顺序的提供者
struct RecordingProvider {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
    entered: bool,
}

#[async_trait]
impl ToolProvider for RecordingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enter(&mut self, _ctx: &ProviderContext) -> Result<ProvidedTools, ProviderError> {
        self.entered = true;
        self.log.lock().unwrap().push(format!("enter {}", self.name));
        Ok(ProvidedTools::default())
    }

    async fn exit(&mut self) -> Result<(), ProviderError> {
        if std::mem::take(&mut self.entered) {
            self.log.lock().unwrap().push(format!("exit {}", self.name));
        }
        Ok(())
    }
}

fn with_recording(agent: Agent, log: &Arc<Mutex<Vec<String>>>) -> Agent {
    ["a", "b", "c"].iter().fold(agent, |agent, name| {
        let log = log.clone();
        let name = name.to_string();
        agent.with_provider(move || {
            Box::new(RecordingProvider {
                name: name.clone(),
                log: log.clone(),
                entered: false,
            }) as Box<dyn ToolProvider>
        })
    })
}

const EXPECTED_ORDER: [&str; 6] = ["enter a", "enter b", "enter c", "exit c", "exit b", "exit a"];

// ---- 回合循环 ----

#[tokio::test]
async fn test_turn_limit_without_finish() {
    let client = Arc::new(ScriptedLlmClient::repeating(
        AssistantReply::text("still working").with_call(call("", "sleep", json!({"ms": 1, "label": "x"}))),
    ));
    let agent = Arc::new(
        Agent::new("looper", client.clone())
            .with_tool(SleepTool::default())
            .with_max_turns(3),
    );

    let report = agent.run("never finishes", SessionOptions::default()).await.unwrap();
    assert!(matches!(
        report.status,
        RunStatus::Failed {
            kind: ErrorKind::TurnLimitExceeded,
            ..
        }
    ));
    assert_eq!(report.turns, 3);
    assert_eq!(client.call_count(), 3);
    assert_eq!(report.metadata.tool_use.get("sleep"), Some(&3));
}

#[tokio::test]
async fn test_concurrent_results_keep_call_order() {
    let sleep = Arc::new(SleepTool::default());
    let client = Arc::new(ScriptedLlmClient::new(vec![
        reply(vec![
            call("slow", "sleep", json!({"ms": 120, "label": "first"})),
            call("fast", "sleep", json!({"ms": 5, "label": "second"})),
            call("mid", "sleep", json!({"ms": 60, "label": "third"})),
        ]),
        reply(vec![finish("f", "done", &[])]),
    ]));
    let agent = Arc::new(Agent::new("orderly", client).with_tool_arc(sleep.clone()));

    let report = agent.run("order", SessionOptions::default()).await.unwrap();
    assert!(report.status.is_completed());
    let results = tool_results(&report.messages);
    let ids: Vec<&str> = results.iter().map(|(id, _, _)| id.as_str()).collect();
    assert_eq!(ids, ["slow", "fast", "mid", "f"]);
    assert_eq!(results[0].1, "first");
    assert_eq!(results[1].1, "second");
    // 三个调用并发执行
    assert_eq!(sleep.peak.load(Ordering::SeqCst), 3);
}

// ---- 提供者生命周期 ----

#[tokio::test]
async fn test_provider_teardown_reverse_on_success() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let client = Arc::new(ScriptedLlmClient::new(vec![reply(vec![finish("f", "ok", &[])])]));
    let agent = Arc::new(with_recording(Agent::new("lifecycle", client), &log));

    let report = agent.run("succeed", SessionOptions::default()).await.unwrap();
    assert!(report.status.is_completed());
    assert_eq!(*log.lock().unwrap(), EXPECTED_ORDER);
}

#[tokio::test]
async fn test_provider_teardown_reverse_on_fatal_error() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let client = Arc::new(ScriptedLlmClient::new(vec![reply(vec![call("x", "explode", json!({}))])]));
    let agent = Arc::new(with_recording(Agent::new("lifecycle", client).with_tool(FatalTool), &log));

    let report = agent.run("explode", SessionOptions::default()).await.unwrap();
    assert!(matches!(
        report.status,
        RunStatus::Failed {
            kind: ErrorKind::FatalTool,
            ..
        }
    ));
    assert_eq!(*log.lock().unwrap(), EXPECTED_ORDER);
}

#[tokio::test]
async fn test_provider_teardown_reverse_on_interrupt() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let client = Arc::new(ScriptedLlmClient::new(vec![reply(vec![call("i", "interrupt", json!({}))])]));
    let agent = Arc::new(with_recording(Agent::new("lifecycle", client).with_tool(InterruptTool), &log));

    let report = agent.run("stop", SessionOptions::default()).await.unwrap();
    assert!(matches!(report.status, RunStatus::Suspended { .. }));
    assert_eq!(*log.lock().unwrap(), EXPECTED_ORDER);
}

// ---- 断点 ----

#[tokio::test]
async fn test_suspend_then_resume_restores_history_and_files() {
    let base = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::open(base.path().join("cp")).await.unwrap());
    let task = "write notes then publish";

    let first = Arc::new(ScriptedLlmClient::new(vec![reply(vec![
        call("w", "write_file", json!({"path": "notes.txt", "content": "draft"})),
        call("i", "interrupt", json!({})),
    ])]));
    let agent = Arc::new(
        Agent::new("writer", first)
            .with_tool(WriteFileTool)
            .with_tool(InterruptTool)
            .with_provider(sandbox_provider(&base)),
    );
    let suspended = agent
        .run(task, SessionOptions::default().with_store(store.clone()))
        .await
        .unwrap();
    let fp = fingerprint("writer", task);
    assert_eq!(suspended.status, RunStatus::Suspended { fingerprint: fp.clone() });
    assert_eq!(suspended.turns, 1);
    assert_eq!(store.list().await.unwrap().len(), 1);

    // 新进程：新的客户端、新的沙箱目录
    let second = Arc::new(ScriptedLlmClient::new(vec![reply(vec![finish("f", "published", &["notes.txt"])])]));
    let agent = Arc::new(
        Agent::new("writer", second.clone())
            .with_tool(WriteFileTool)
            .with_tool(InterruptTool)
            .with_provider(sandbox_provider(&base)),
    );
    let report = agent
        .run(
            task,
            SessionOptions::default()
                .with_store(store.clone())
                .with_output_dir(out.path()),
        )
        .await
        .unwrap();

    assert!(report.status.is_completed());
    assert_eq!(second.seen_histories()[0], suspended.messages);
    assert_eq!(&report.messages[..suspended.messages.len()], &suspended.messages[..]);
    assert_eq!(std::fs::read_to_string(out.path().join("notes.txt")).unwrap(), "draft");
    assert!(matches!(store.load(&fp).await, Err(rein::checkpoint::CheckpointError::NotFound(_))));
}

#[tokio::test]
async fn test_checkpoint_retained_on_failure() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let client = Arc::new(ScriptedLlmClient::repeating(AssistantReply::text("thinking...")));
    let agent = Arc::new(Agent::new("stuck", client).with_max_turns(2));

    let report = agent
        .run("impossible", SessionOptions::default().with_store(store.clone()))
        .await
        .unwrap();
    assert!(matches!(
        report.status,
        RunStatus::Failed {
            kind: ErrorKind::TurnLimitExceeded,
            ..
        }
    ));
    assert!(store.contains(&fingerprint("stuck", "impossible")).await);
}

#[tokio::test]
async fn test_resume_with_different_model_still_runs() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let first = Arc::new(ScriptedLlmClient::new(vec![reply(vec![call("i", "interrupt", json!({}))])]).with_model("m1"));
    let agent = Arc::new(Agent::new("drifty", first).with_tool(InterruptTool));
    let report = agent
        .run("drift", SessionOptions::default().with_store(store.clone()))
        .await
        .unwrap();
    assert!(matches!(report.status, RunStatus::Suspended { .. }));

    let second = Arc::new(ScriptedLlmClient::new(vec![reply(vec![finish("f", "ok", &[])])]).with_model("m2"));
    let agent = Arc::new(Agent::new("drifty", second));
    let report = agent
        .run("drift", SessionOptions::default().with_store(store.clone()))
        .await
        .unwrap();
    assert!(report.status.is_completed());
    assert!(!store.contains(&fingerprint("drifty", "drift")).await);
}

// ---- 调度 ----

#[tokio::test]
async fn test_scheduler_caps_concurrent_runs() {
    let scheduler = RunScheduler::new(2);
    let sleep = Arc::new(SleepTool::default());

    let runs = (0..5).map(|i| {
        let client = Arc::new(ScriptedLlmClient::new(vec![
            reply(vec![call("s", "sleep", json!({"ms": 40, "label": i.to_string()}))]),
            reply(vec![finish("f", "ok", &[])]),
        ]));
        let agent = Arc::new(Agent::new(format!("worker-{}", i), client).with_tool_arc(sleep.clone()));
        let options = SessionOptions::default().with_scheduler(scheduler.clone());
        async move { agent.run("work", options).await }
    });
    let reports = futures_util::future::join_all(runs).await;

    assert!(reports.iter().all(|r| r.as_ref().map(|r| r.status.is_completed()).unwrap_or(false)));
    assert!(sleep.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(scheduler.in_flight(), 0);
}

// ---- 子智能体 ----

fn report_child() -> Agent {
    let client = Arc::new(ScriptedLlmClient::new(vec![
        reply(vec![call("w", "write_file", json!({"path": "report.csv", "content": "a,b\n1,2\n"}))]),
        reply(vec![finish("f", "report ready", &["report.csv"])]),
    ]));
    Agent::new("reporter", client).with_tool(WriteFileTool)
}

#[tokio::test]
async fn test_sub_agent_files_reach_parent_output() {
    let base = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let child = report_child().with_provider(sandbox_provider(&base));

    let parent_client = Arc::new(ScriptedLlmClient::new(vec![
        reply(vec![call("delegate", "reporter", json!({"task": "build the csv"}))]),
        reply(vec![finish("f", "delivered", &["report.csv"])]),
    ]));
    let parent = Arc::new(
        Agent::new("lead", parent_client)
            .with_sub_agent(child, "Produces report.csv")
            .with_provider(sandbox_provider(&base)),
    );

    let report = parent
        .run("make a report", SessionOptions::default().with_output_dir(out.path()))
        .await
        .unwrap();
    assert!(report.status.is_completed(), "{:?}", report.status);
    assert_eq!(
        std::fs::read_to_string(out.path().join("report.csv")).unwrap(),
        "a,b\n1,2\n"
    );
    assert!(report.metadata.files_transferred.contains("report.csv"));
    let trace = report.metadata.sub_agents.get("delegate").unwrap();
    assert_eq!(trace.agent, "reporter");
    assert!(!trace.messages.is_empty());
    // 父子 write_file / finish 都计入同一份汇总
    assert_eq!(report.metadata.tool_use.get("write_file"), Some(&1));
}

#[tokio::test]
async fn test_sub_agent_files_without_parent_sandbox_is_reported() {
    let base = TempDir::new().unwrap();
    let child = report_child().with_provider(sandbox_provider(&base));

    let parent_client = Arc::new(ScriptedLlmClient::new(vec![
        reply(vec![call("delegate", "reporter", json!({"task": "build the csv"}))]),
        reply(vec![finish("f", "gave up", &[])]),
    ]));
    let parent = Arc::new(Agent::new("lead", parent_client).with_sub_agent(child, "Produces report.csv"));

    let report = parent.run("make a report", SessionOptions::default()).await.unwrap();
    assert!(report.status.is_completed());
    let results = tool_results(&report.messages);
    let (id, text, is_error) = &results[0];
    assert_eq!(id, "delegate");
    assert!(*is_error);
    assert!(text.contains("no sandbox"), "{}", text);

    // 子运行的留档与用量仍计入父运行
    let trace = report.metadata.sub_agents.get("delegate").unwrap();
    assert_eq!(trace.agent, "reporter");
    assert!(!trace.messages.is_empty());
    assert_eq!(report.metadata.tool_use.get("reporter"), Some(&1));
    assert_eq!(report.metadata.tool_use.get("write_file"), Some(&1));
}

#[tokio::test]
async fn test_sub_agent_depth_limit() {
    let inner = Agent::new(
        "inner",
        Arc::new(ScriptedLlmClient::new(vec![reply(vec![finish("f", "ok", &[])])])),
    );
    let middle = Agent::new(
        "middle",
        Arc::new(ScriptedLlmClient::new(vec![
            reply(vec![call("c2", "inner", json!({"task": "go deeper"}))]),
            reply(vec![finish("f", "ok", &[])]),
        ])),
    )
    .with_sub_agent(inner, "inner");
    let outer = Arc::new(
        Agent::new(
            "outer",
            Arc::new(ScriptedLlmClient::new(vec![
                reply(vec![call("c1", "middle", json!({"task": "go"}))]),
                reply(vec![finish("f", "ok", &[])]),
            ])),
        )
        .with_sub_agent(middle, "middle"),
    );

    let report = outer
        .run("nest", SessionOptions::default().with_max_depth(1))
        .await
        .unwrap();
    assert!(report.status.is_completed());
    let middle_trace = report.metadata.sub_agents.get("c1").unwrap();
    let inner_result = tool_results(&middle_trace.messages)
        .into_iter()
        .find(|(id, _, _)| id == "c2")
        .unwrap();
    assert!(inner_result.2);
    assert!(inner_result.1.contains("depth"), "{}", inner_result.1);
}

// ---- 输入暂存 ----

#[tokio::test]
async fn test_input_files_are_staged_and_listed() {
    let base = TempDir::new().unwrap();
    let inputs = TempDir::new().unwrap();
    std::fs::write(inputs.path().join("data.csv"), "x\n1\n").unwrap();

    let client = Arc::new(ScriptedLlmClient::new(vec![reply(vec![finish("f", "ok", &["data.csv"])])]));
    let agent = Arc::new(Agent::new("reader", client.clone()).with_provider(sandbox_provider(&base)));
    let report = agent
        .run(
            "summarise",
            SessionOptions::default().with_input_files(vec![inputs.path().join("data.csv").display().to_string()]),
        )
        .await
        .unwrap();

    assert!(report.status.is_completed(), "{:?}", report.status);
    let first_prompt = client.seen_histories()[0]
        .iter()
        .find(|m| matches!(m, Message::User { .. }))
        .map(|m| m.text())
        .unwrap();
    assert!(first_prompt.contains("- data.csv"), "{}", first_prompt);
}

#[tokio::test]
async fn test_input_files_without_sandbox_fail_to_open() {
    let client = Arc::new(ScriptedLlmClient::new(Vec::new()));
    let agent = Arc::new(Agent::new("bare", client));
    let err = agent
        .run("x", SessionOptions::default().with_input_files(vec!["whatever.txt".into()]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

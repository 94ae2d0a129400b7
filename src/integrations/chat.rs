//! 聊天前端桥接
//!
//! 把一条 @提及 消息变成一次受调度的运行：去掉 `<@USER>` 提及，解析 `agent:<name>` / `model:<id>` 前缀，
//! 路由到具名智能体（找不到则用默认），在 RunScheduler 限流下运行，输出写到每个会话线程独立的目录，
//! 最后把 finish 原因、输出文件与 token 用量格式化成一条（截断后的）回复。
//! 消息附件作为输入文件暂存进沙箱；只有附件没有文字时使用默认任务描述。
//! 聊天请求不续跑，也不在中断时写断点。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::core::{AgentError, RunReport, RunScheduler, RunStatus, SessionOptions};
use crate::llm::{LlmClient, LlmError};

/// 单条回复字符上限
pub const DEFAULT_MESSAGE_LIMIT: usize = 40_000;
const TRUNCATION_SUFFIX: &str = "\n\n_...message truncated (exceeded message limit)..._";
/// 只有附件没有文字时的任务描述
const ATTACHMENT_ONLY_PROMPT: &str = "Process the attached files.";
/// 错误详情最大字符数
const ERROR_DETAIL_CHARS: usize = 1000;

static MENTION_RE: OnceLock<Option<Regex>> = OnceLock::new();
static PREFIX_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// 每次请求新建智能体
pub type AgentFactory = Arc<dyn Fn() -> Agent + Send + Sync>;
/// 按 `model:<id>` 构建客户端
pub type ModelFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn LlmClient>, LlmError> + Send + Sync>;

/// 解析后的消息
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedMessage {
    pub agent: Option<String>,
    pub model: Option<String>,
    pub prompt: String,
}

/// 去掉提及并提取 agent: / model: 前缀；同一前缀出现多次时以最后一次为准
pub fn parse_message(text: &str) -> ParsedMessage {
    let mention = MENTION_RE.get_or_init(|| Regex::new(r"<@\w+>\s*").ok());
    let prefix = PREFIX_RE.get_or_init(|| Regex::new(r"\b(agent|model):(\S+)").ok());

    let cleaned = match mention {
        Some(re) => re.replace_all(text, "").trim().to_string(),
        None => text.trim().to_string(),
    };
    let Some(prefix) = prefix else {
        return ParsedMessage {
            prompt: cleaned,
            ..ParsedMessage::default()
        };
    };

    let mut parsed = ParsedMessage::default();
    for cap in prefix.captures_iter(&cleaned) {
        let value = cap[2].to_string();
        match &cap[1] {
            "agent" => parsed.agent = Some(value),
            _ => parsed.model = Some(value),
        }
    }
    parsed.prompt = prefix
        .replace_all(&cleaned, "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    parsed
}

/// 按字符截断并追加提示
pub fn truncate_message(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let keep = limit.saturating_sub(TRUNCATION_SUFFIX.chars().count());
    format!("{}{}", text.chars().take(keep).collect::<String>(), TRUNCATION_SUFFIX)
}

/// 一次请求
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// 会话线程标识，决定输出目录
    pub thread_id: String,
    pub text: String,
    /// 消息附件的本地路径，运行前暂存进沙箱
    pub attached_files: Vec<String>,
}

/// 一次请求的结果
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub agent: String,
    pub model: String,
    pub status: RunStatus,
    pub output_dir: PathBuf,
    pub output_files: Vec<PathBuf>,
    /// 可直接发回聊天的文本
    pub reply: String,
}

/// 格式化成功 / 失败回复
pub fn format_report(report: &RunReport, model: &str, limit: usize) -> String {
    let mut parts = Vec::new();
    match &report.status {
        RunStatus::Completed { finish } => {
            parts.push(if finish.reason.is_empty() {
                "Task completed.".to_string()
            } else {
                finish.reason.clone()
            });
            if !finish.paths.is_empty() {
                parts.push("\n*Output Files:*".to_string());
                parts.extend(finish.paths.iter().map(|p| format!("  • `{}`", p)));
            }
        }
        RunStatus::Failed { kind, message } => {
            parts.push(format_error(&format!("{:?}", kind), message));
        }
        RunStatus::Suspended { .. } => {
            parts.push("Run was interrupted before it finished.".to_string());
        }
    }

    let usage = report.token_usage();
    if usage.total() > 0 {
        parts.push("\n*Run Metadata*".to_string());
        parts.push(format!(
            "  Tokens: {} total ({} in, {} out)",
            usage.total(),
            usage.input,
            usage.output
        ));
        if usage.reasoning > 0 {
            parts.push(format!("  Reasoning tokens: {}", usage.reasoning));
        }
        parts.push(format!("  Turns: {}", report.turns));
        parts.push(format!("  Model: `{}`", model));
    }
    truncate_message(&parts.join("\n"), limit)
}

fn format_error(kind: &str, message: &str) -> String {
    let detail = if message.chars().count() > ERROR_DETAIL_CHARS {
        format!("{}...", message.chars().take(ERROR_DETAIL_CHARS).collect::<String>())
    } else {
        message.to_string()
    };
    format!(
        "*Agent Error*\n```\n{}: {}\n```\n_Please try again or contact an administrator._",
        kind, detail
    )
}

fn sanitize_thread_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// 聊天桥接
pub struct ChatBridge {
    default_agent: AgentFactory,
    named_agents: BTreeMap<String, AgentFactory>,
    model_factory: Option<ModelFactory>,
    scheduler: RunScheduler,
    output_dir: PathBuf,
    message_limit: usize,
    cancel: CancellationToken,
}

impl ChatBridge {
    pub fn new(default_agent: AgentFactory, scheduler: RunScheduler, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            default_agent,
            named_agents: BTreeMap::new(),
            model_factory: None,
            scheduler,
            output_dir: output_dir.into(),
            message_limit: DEFAULT_MESSAGE_LIMIT,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_agent(mut self, name: impl Into<String>, factory: AgentFactory) -> Self {
        self.named_agents.insert(name.into(), factory);
        self
    }

    pub fn with_model_factory(mut self, factory: ModelFactory) -> Self {
        self.model_factory = Some(factory);
        self
    }

    pub fn with_message_limit(mut self, limit: usize) -> Self {
        self.message_limit = limit;
        self
    }

    /// 进程级取消令牌；每个请求派生子令牌
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn scheduler(&self) -> &RunScheduler {
        &self.scheduler
    }

    /// 解析结果对应的智能体（含模型覆盖）
    pub fn resolve(&self, parsed: &ParsedMessage) -> Agent {
        let factory = parsed
            .agent
            .as_ref()
            .and_then(|name| self.named_agents.get(name))
            .unwrap_or(&self.default_agent);
        let agent = factory();
        match (&parsed.model, &self.model_factory) {
            (Some(model), Some(make)) => match make(model) {
                Ok(client) => agent.with_client(client),
                Err(e) => {
                    tracing::warn!(model = %model, error = %e, "model override rejected, using agent default");
                    agent
                }
            },
            _ => agent,
        }
    }

    pub fn output_dir_for(&self, thread_id: &str) -> PathBuf {
        self.output_dir.join(format!("thread_{}", sanitize_thread_id(thread_id)))
    }

    /// 处理一条消息：调度、运行、格式化
    pub async fn handle(&self, request: RunRequest) -> RunSummary {
        let parsed = parse_message(&request.text);
        let agent = Arc::new(self.resolve(&parsed));
        let model = agent.client().model().to_string();
        let output_dir = self.output_dir_for(&request.thread_id);
        tracing::info!(
            agent = %agent.name(),
            model = %model,
            thread = %request.thread_id,
            in_flight = self.scheduler.in_flight(),
            "chat request accepted"
        );

        let has_attachments = !request.attached_files.is_empty();
        if parsed.prompt.is_empty() && !has_attachments {
            return RunSummary {
                agent: agent.name().to_string(),
                model,
                status: RunStatus::failed(&AgentError::Config("empty prompt".into())),
                output_dir,
                output_files: Vec::new(),
                reply: "Please include a task after the mention.".to_string(),
            };
        }

        let options = SessionOptions::default()
            .with_output_dir(output_dir.clone())
            .with_resume(false)
            .with_cancel(self.cancel.child_token())
            .with_scheduler(self.scheduler.clone());
        let options = if has_attachments {
            options.with_input_files(request.attached_files.clone())
        } else {
            options
        };
        let prompt = if parsed.prompt.is_empty() {
            ATTACHMENT_ONLY_PROMPT
        } else {
            parsed.prompt.as_str()
        };

        match agent.run(prompt, options).await {
            Ok(report) => RunSummary {
                agent: agent.name().to_string(),
                reply: format_report(&report, &model, self.message_limit),
                model,
                status: report.status,
                output_dir,
                output_files: report.output_files,
            },
            Err(e) => {
                tracing::error!(agent = %agent.name(), error = %e, "chat run could not start");
                RunSummary {
                    agent: agent.name().to_string(),
                    model,
                    status: RunStatus::failed(&e),
                    output_dir,
                    output_files: Vec::new(),
                    reply: truncate_message(&format_error(&format!("{:?}", e.kind()), &e.to_string()), self.message_limit),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{AssistantReply, ScriptedLlmClient};
    use crate::memory::ToolCall;

    #[test]
    fn test_parse_message() {
        let p = parse_message("<@U123> agent:analyst model:gpt-x summarise <@U999> the data");
        assert_eq!(p.agent.as_deref(), Some("analyst"));
        assert_eq!(p.model.as_deref(), Some("gpt-x"));
        assert_eq!(p.prompt, "summarise the data");

        let plain = parse_message("<@UBOT>   hello world ");
        assert_eq!(plain, ParsedMessage {
            agent: None,
            model: None,
            prompt: "hello world".into()
        });
    }

    #[test]
    fn test_truncate_message() {
        assert_eq!(truncate_message("short", 100), "short");
        let long = "x".repeat(200);
        let t = truncate_message(&long, 100);
        assert_eq!(t.chars().count(), 100);
        assert!(t.ends_with(TRUNCATION_SUFFIX));
    }

    fn finishing_agent(name: &str) -> AgentFactory {
        let name = name.to_string();
        Arc::new(move || {
            let client = ScriptedLlmClient::repeating(
                AssistantReply::text("")
                    .with_call(ToolCall::new("f1", "finish", serde_json::json!({"reason": "all done"})))
                    .with_usage(crate::memory::TokenUsage::new(10, 5)),
            );
            Agent::new(name.clone(), Arc::new(client))
        })
    }

    #[tokio::test]
    async fn test_bridge_routes_named_agent() {
        let dir = tempfile::TempDir::new().unwrap();
        let bridge = ChatBridge::new(finishing_agent("default"), RunScheduler::new(2), dir.path())
            .with_agent("analyst", finishing_agent("analyst"));

        let summary = bridge
            .handle(RunRequest {
                thread_id: "1700.42".into(),
                text: "<@UBOT> agent:analyst count things".into(),
                attached_files: Vec::new(),
            })
            .await;
        assert_eq!(summary.agent, "analyst");
        assert!(summary.status.is_completed());
        assert!(summary.reply.starts_with("all done"));
        assert!(summary.reply.contains("Tokens: 15 total"));
        assert_eq!(summary.output_dir, dir.path().join("thread_1700_42"));

        let fallback = bridge
            .handle(RunRequest {
                thread_id: "t".into(),
                text: "agent:unknown go".into(),
                attached_files: Vec::new(),
            })
            .await;
        assert_eq!(fallback.agent, "default");
        assert_eq!(bridge.scheduler().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_attachments_are_staged_into_sandbox() {
        let out = tempfile::TempDir::new().unwrap();
        let sandboxes = tempfile::TempDir::new().unwrap();
        let uploads = tempfile::TempDir::new().unwrap();
        let upload = uploads.path().join("report.csv");
        std::fs::write(&upload, "a,b\n1,2\n").unwrap();

        let base = sandboxes.path().to_path_buf();
        let factory: AgentFactory = Arc::new(move || {
            let client = ScriptedLlmClient::repeating(AssistantReply::text("").with_call(ToolCall::new(
                "f1",
                "finish",
                serde_json::json!({"reason": "echoed", "paths": ["report.csv"]}),
            )));
            let base = base.clone();
            Agent::new("default", Arc::new(client)).with_provider(move || {
                Box::new(crate::sandbox::LocalSandboxProvider::new().with_base_dir(base.clone()))
                    as Box<dyn crate::tools::ToolProvider>
            })
        });
        let bridge = ChatBridge::new(factory, RunScheduler::new(1), out.path());

        let summary = bridge
            .handle(RunRequest {
                thread_id: "9".into(),
                text: "<@UBOT>".into(),
                attached_files: vec![upload.to_string_lossy().into_owned()],
            })
            .await;
        assert!(summary.status.is_completed(), "{}", summary.reply);
        let staged = summary.output_dir.join("report.csv");
        assert_eq!(summary.output_files, vec![staged.clone()]);
        assert_eq!(std::fs::read_to_string(staged).unwrap(), "a,b\n1,2\n");
    }

    #[tokio::test]
    async fn test_empty_message_without_attachments_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let bridge = ChatBridge::new(finishing_agent("default"), RunScheduler::new(1), dir.path());
        let summary = bridge
            .handle(RunRequest {
                thread_id: "t".into(),
                text: "<@UBOT>   ".into(),
                attached_files: Vec::new(),
            })
            .await;
        assert!(!summary.status.is_completed());
        assert!(summary.reply.contains("include a task"));
    }
}

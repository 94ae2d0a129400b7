//! Rein - 命令行入口
//!
//! `rein run --task ...` 跑一次任务（Ctrl+C 在回合边界挂起并写断点，再次运行同一任务即续跑）；
//! `rein checkpoints list|clear` 管理断点。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rein::checkpoint::{CheckpointStore, FileCheckpointStore};
use rein::config::{load_config, AppConfig};
use rein::core::{RunScheduler, RunStatus, SessionOptions, ShutdownManager};
use rein::llm::{LlmClient, OpenAiCompatClient, RetryingLlmClient};
use rein::react::LoopEvent;
use rein::sandbox::LocalSandboxProvider;
use rein::tools::ToolProvider;
use rein::Agent;

#[derive(Parser, Debug)]
#[command(name = "rein", version, about = "Agent execution engine with resumable runs")]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 运行一个任务
    Run {
        /// 任务描述
        #[arg(short, long)]
        task: String,
        /// 复制进沙箱的输入文件（支持 glob 与目录）
        #[arg(short, long = "input")]
        inputs: Vec<String>,
        /// finish 声明的文件复制到此目录
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// 忽略已有断点，从头开始
        #[arg(long)]
        fresh: bool,
        /// 智能体名（参与任务指纹）
        #[arg(long, default_value = "rein")]
        agent: String,
    },
    /// 管理断点
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointCommand,
    },
}

#[derive(Subcommand, Debug)]
enum CheckpointCommand {
    /// 列出所有断点
    List,
    /// 删除指定指纹的断点
    Clear { fingerprint: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rein::observability::init();
    let cli = Cli::parse();
    let cfg = load_config(cli.config.clone()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Run {
            task,
            inputs,
            output_dir,
            fresh,
            agent,
        } => run_task(&cfg, &agent, &task, inputs, output_dir, fresh).await,
        Commands::Checkpoints { action } => manage_checkpoints(&cfg, action).await,
    }
}

fn build_agent(cfg: &AppConfig, name: &str) -> anyhow::Result<Agent> {
    let api_key = cfg.llm.api_key();
    if api_key.is_none() {
        tracing::warn!(env = %cfg.llm.api_key_env, "API key not set, requests will be unauthenticated");
    }
    let client = OpenAiCompatClient::new(
        &cfg.llm.base_url,
        &cfg.llm.model,
        api_key,
        Duration::from_secs(cfg.llm.request_timeout_secs),
    )
    .context("Failed to build LLM client")?;
    let client: Arc<dyn LlmClient> = Arc::new(RetryingLlmClient::new(Arc::new(client), cfg.llm.retry_config()));

    let sandbox_cfg = cfg.tools.sandbox.clone();
    let policy = sandbox_cfg.policy().context("Invalid tools.sandbox.allowed_commands pattern")?;

    Ok(Agent::new(name, client)
        .with_max_turns(cfg.run.max_turns)
        .with_tool_timeout(Duration::from_secs(cfg.tools.tool_timeout_secs))
        .with_provider(move || {
            let mut provider = LocalSandboxProvider::new()
                .with_policy(policy.clone())
                .with_command_timeout(Duration::from_secs(sandbox_cfg.command_timeout_secs));
            if let Some(dir) = &sandbox_cfg.base_dir {
                provider = provider.with_base_dir(dir.clone());
            }
            Box::new(provider) as Box<dyn ToolProvider>
        }))
}

async fn run_task(
    cfg: &AppConfig,
    agent_name: &str,
    task: &str,
    inputs: Vec<String>,
    output_dir: Option<PathBuf>,
    fresh: bool,
) -> anyhow::Result<()> {
    let agent = Arc::new(build_agent(cfg, agent_name)?);
    let store = FileCheckpointStore::open(&cfg.checkpoint.dir)
        .await
        .context("Failed to open checkpoint directory")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(&event);
        }
    });

    let options = SessionOptions::default()
        .with_output_dir(output_dir.unwrap_or_else(|| cfg.run.output_dir.clone()))
        .with_input_files(inputs)
        .with_resume(cfg.run.resume && !fresh)
        .with_clear_on_success(cfg.run.clear_on_success)
        .with_store(Arc::new(store))
        .with_cancel(shutdown.token())
        .with_max_depth(cfg.run.max_depth)
        .with_scheduler(RunScheduler::new(cfg.run.max_concurrent_runs))
        .with_event_tx(event_tx);

    let report = agent.run(task, options).await.context("Run could not start")?;
    let _ = printer.await;

    let usage = report.token_usage();
    println!();
    println!("fingerprint: {}", report.fingerprint);
    println!("turns: {}", report.turns);
    println!("tokens: {} ({} in, {} out)", usage.total(), usage.input, usage.output);
    for file in &report.output_files {
        println!("output: {}", file.display());
    }
    match &report.status {
        RunStatus::Completed { finish } => {
            println!("completed: {}", finish.reason);
            Ok(())
        }
        RunStatus::Suspended { fingerprint } => {
            let why = shutdown.reason().map(|r| format!("{:?}", r)).unwrap_or_else(|| "cancelled".into());
            println!("suspended ({}); run the same task again to resume ({})", why, fingerprint);
            Ok(())
        }
        RunStatus::Failed { kind, message } => anyhow::bail!("run failed ({:?}): {}", kind, message),
    }
}

fn print_event(event: &LoopEvent) {
    match event {
        LoopEvent::TurnStarted { agent, turn, max_turns } => println!("[{}] turn {}/{}", agent, turn, max_turns),
        LoopEvent::AssistantReply { text, tool_calls, .. } => {
            if !text.trim().is_empty() {
                println!("{}", text.trim());
            }
            if !tool_calls.is_empty() {
                println!("  -> {}", tool_calls.join(", "));
            }
        }
        LoopEvent::ToolResult { tool, is_error, preview, .. } => {
            let mark = if *is_error { "error" } else { "ok" };
            println!("  <- {} [{}] {}", tool, mark, preview);
        }
        LoopEvent::Nudge { turn, .. } => println!("  (no tool call on turn {}, nudging)", turn),
        LoopEvent::Completed { .. } | LoopEvent::Failed { .. } | LoopEvent::Suspended { .. } => {}
    }
}

async fn manage_checkpoints(cfg: &AppConfig, action: CheckpointCommand) -> anyhow::Result<()> {
    let store = FileCheckpointStore::open(&cfg.checkpoint.dir)
        .await
        .context("Failed to open checkpoint directory")?;
    match action {
        CheckpointCommand::List => {
            let list = store.list().await?;
            if list.is_empty() {
                println!("no checkpoints in {}", cfg.checkpoint.dir.display());
            }
            for cp in list {
                println!(
                    "{}  agent={}  turn={}  updated={}",
                    cp.fingerprint,
                    cp.agent,
                    cp.turn,
                    cp.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        CheckpointCommand::Clear { fingerprint } => {
            store.clear(&fingerprint).await?;
            println!("cleared {}", fingerprint);
        }
    }
    store.close().await?;
    Ok(())
}

//! 会话：一次回合循环执行的资源作用域
//!
//! open() 按声明顺序进入提供者，汇总工具与沙箱（始终包含 finish），暂存输入文件；
//! run() 计算 fingerprint，按需从断点恢复（恢复沙箱快照），驱动 AgentLoop，
//! 在挂起 / 失败时写断点，成功时清除断点并把 finish 声明的文件落到 output_dir；
//! close() 逆序退出提供者。清理错误只记日志，不覆盖运行结果。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::checkpoint::{
    fingerprint, Checkpoint, CheckpointError, CheckpointManifest, CheckpointStore, RunState,
};
use crate::core::{AgentError, RecoveryEngine, RunPermit, RunReport, RunScheduler, RunStatus};
use crate::memory::Message;
use crate::react::{AgentLoop, LoopEvent, LoopOutcome};
use crate::sandbox::{normalize_path, Sandbox};
use crate::tools::{FinishTool, ProviderContext, ProviderStack, ToolContext, ToolExecutor, ToolRegistry};

/// 默认子智能体嵌套深度上限
pub const DEFAULT_MAX_DEPTH: usize = 3;

/// 会话选项
#[derive(Clone)]
pub struct SessionOptions {
    /// finish 声明的文件落盘目录；None 表示不落盘
    pub output_dir: Option<PathBuf>,
    /// 输入文件（路径或 glob），运行前复制进沙箱根目录
    pub input_files: Vec<String>,
    /// 存在同 fingerprint 断点时是否续跑
    pub resume: bool,
    /// 成功完成后是否清除断点
    pub clear_on_success: bool,
    pub store: Option<Arc<dyn CheckpointStore>>,
    pub cancel: CancellationToken,
    /// 嵌套深度，顶层为 0
    pub depth: usize,
    pub max_depth: usize,
    pub scheduler: Option<RunScheduler>,
    pub event_tx: Option<UnboundedSender<LoopEvent>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            output_dir: None,
            input_files: Vec::new(),
            resume: true,
            clear_on_success: true,
            store: None,
            cancel: CancellationToken::new(),
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
            scheduler: None,
            event_tx: None,
        }
    }
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_input_files(mut self, files: Vec<String>) -> Self {
        self.input_files = files;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_clear_on_success(mut self, clear: bool) -> Self {
        self.clear_on_success = clear;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_scheduler(mut self, scheduler: RunScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<LoopEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }
}

/// 已打开的会话
pub struct Session {
    agent: Arc<Agent>,
    options: SessionOptions,
    stack: ProviderStack,
    executor: ToolExecutor,
    sandbox: Option<Arc<dyn Sandbox>>,
    recovery: RecoveryEngine,
    staged_inputs: Vec<String>,
    _permit: Option<RunPermit>,
}

impl Session {
    /// 获取调度槽位，进入全部提供者并暂存输入文件；任一步失败都会逆序退出已进入的提供者
    pub async fn open(agent: Arc<Agent>, options: SessionOptions) -> Result<Self, AgentError> {
        if options.depth > options.max_depth {
            return Err(AgentError::DepthExceeded {
                depth: options.depth,
                max_depth: options.max_depth,
            });
        }

        let permit = match &options.scheduler {
            Some(s) if options.depth == 0 => Some(s.acquire().await?),
            Some(s) => Some(s.acquire_nested()),
            None => None,
        };

        let providers = agent.providers().iter().map(|factory| factory()).collect();
        let provider_ctx = ProviderContext {
            agent: agent.name().to_string(),
            cancel: options.cancel.clone(),
        };
        let (mut stack, provided) = ProviderStack::enter_all(providers, &provider_ctx).await?;

        let mut registry = ToolRegistry::new();
        for tool in agent.tools() {
            registry.register_arc(tool.clone());
        }
        let mut sandbox: Option<Arc<dyn Sandbox>> = None;
        for p in provided {
            for tool in p.tools {
                registry.register_arc(tool);
            }
            if let Some(sb) = p.sandbox {
                if sandbox.is_some() {
                    tracing::warn!(agent = %agent.name(), extra = %sb.id(), "more than one provider yields a sandbox, keeping the first");
                } else {
                    sandbox = Some(sb);
                }
            }
        }
        registry.register(FinishTool);

        let staged_inputs = if options.input_files.is_empty() {
            Vec::new()
        } else {
            let staged = match &sandbox {
                Some(sb) => stage_inputs(sb.as_ref(), &options.input_files).await,
                None => Err(AgentError::Config(format!(
                    "agent '{}' has input files but no sandbox provider",
                    agent.name()
                ))),
            };
            match staged {
                Ok(files) => files,
                Err(e) => {
                    stack.exit_all().await;
                    return Err(e);
                }
            }
        };

        tracing::info!(
            agent = %agent.name(),
            depth = options.depth,
            tools = registry.len(),
            sandbox = sandbox.as_ref().map(|s| s.id().to_string()).unwrap_or_default(),
            "session opened"
        );

        Ok(Self {
            executor: ToolExecutor::new(registry, agent.tool_timeout()),
            agent,
            options,
            stack,
            sandbox,
            recovery: RecoveryEngine::new(),
            staged_inputs,
            _permit: permit,
        })
    }

    pub fn sandbox(&self) -> Option<&Arc<dyn Sandbox>> {
        self.sandbox.as_ref()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.executor.tool_names()
    }

    /// 暂存进沙箱的输入文件（沙箱内相对路径）
    pub fn staged_inputs(&self) -> &[String] {
        &self.staged_inputs
    }

    fn send_event(&self, ev: LoopEvent) {
        if let Some(tx) = &self.options.event_tx {
            let _ = tx.send(ev);
        }
    }

    fn fresh_state(&self, task: &str) -> RunState {
        let mut state = RunState::new(self.agent.name(), task);
        if !self.agent.system_prompt().is_empty() {
            state.messages.push(Message::system(self.agent.system_prompt()));
        }
        let mut prompt = task.to_string();
        if !self.staged_inputs.is_empty() {
            prompt.push_str("\n\nInput files are available in your working directory:\n");
            for f in &self.staged_inputs {
                prompt.push_str(&format!("- {}\n", f));
            }
        }
        state.messages.push(Message::user(prompt));
        state
    }

    /// 读取断点；同 fingerprint 下任务不一致视为错误，绝不静默合并两次运行
    async fn restore(&self, store: &Arc<dyn CheckpointStore>, fp: &str, task: &str) -> Result<Option<RunState>, AgentError> {
        let cp = match store.load(fp).await {
            Ok(cp) => cp,
            Err(CheckpointError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if cp.state.task != task || cp.state.agent != self.agent.name() {
            return Err(AgentError::Checkpoint(format!(
                "checkpoint {} belongs to a different run (agent '{}')",
                fp, cp.state.agent
            )));
        }
        if let Some(manifest) = &cp.manifest {
            for warning in manifest.drift(self.agent.client().model(), &self.executor.tool_names()) {
                tracing::warn!(fingerprint = %fp, "{}", warning);
            }
        }
        match (&cp.snapshot, &self.sandbox) {
            (Some(snap), Some(sb)) => {
                sb.restore(snap).await?;
                tracing::debug!(fingerprint = %fp, files = snap.len(), "sandbox snapshot restored");
            }
            (Some(snap), None) if !snap.is_empty() => {
                tracing::warn!(fingerprint = %fp, files = snap.len(), "checkpoint has sandbox files but session has no sandbox");
            }
            _ => {}
        }
        tracing::info!(agent = %self.agent.name(), fingerprint = %fp, turn = cp.state.turn, "resuming from checkpoint");
        Ok(Some(cp.state))
    }

    async fn save_checkpoint(&self, store: &Arc<dyn CheckpointStore>, state: &RunState) -> Result<(), AgentError> {
        let snapshot = match &self.sandbox {
            Some(sb) => Some(sb.snapshot().await?),
            None => None,
        };
        let manifest = CheckpointManifest::new(state, self.agent.client().model(), &self.executor.tool_names());
        store
            .save(
                &state.fingerprint,
                &Checkpoint {
                    state: state.clone(),
                    snapshot,
                    manifest: Some(manifest),
                },
            )
            .await?;
        Ok(())
    }

    fn report(&self, state: RunState, status: RunStatus, output_files: Vec<PathBuf>) -> RunReport {
        RunReport {
            agent: self.agent.name().to_string(),
            status,
            turns: state.turn,
            fingerprint: state.fingerprint,
            messages: state.messages,
            metadata: state.metadata,
            output_files,
        }
    }

    fn failed(&self, fp: &str, task: &str, err: AgentError) -> RunReport {
        tracing::error!(agent = %self.agent.name(), fingerprint = %fp, error = %err, "run failed before the first turn");
        self.send_event(LoopEvent::Failed {
            agent: self.agent.name().to_string(),
            kind: err.kind(),
            message: err.to_string(),
        });
        let mut state = RunState::new(self.agent.name(), task);
        state.fingerprint = fp.to_string();
        self.report(state, RunStatus::failed(&err), Vec::new())
    }

    /// 执行任务直到 Completed / Failed / Suspended；错误折叠进 RunStatus
    pub async fn run(&mut self, task: &str) -> RunReport {
        let fp = fingerprint(self.agent.name(), task);
        let store = self.options.store.clone();

        let mut state = match (&store, self.options.resume) {
            (Some(store), true) => match self.restore(store, &fp, task).await {
                Ok(Some(state)) => state,
                Ok(None) => self.fresh_state(task),
                Err(e) => return self.failed(&fp, task, e),
            },
            _ => self.fresh_state(task),
        };

        let ctx = ToolContext {
            sandbox: self.sandbox.clone(),
            cancel: self.options.cancel.clone(),
            depth: self.options.depth,
            max_depth: self.options.max_depth,
            scheduler: self.options.scheduler.clone(),
            call_id: String::new(),
        };
        let client = self.agent.client().clone();
        let outcome = {
            let mut lp = AgentLoop::new(
                self.agent.name(),
                client.as_ref(),
                &self.executor,
                &self.recovery,
                ctx,
                self.agent.max_turns(),
            )
            .with_event_tx(self.options.event_tx.as_ref());
            lp.run(&mut state).await
        };

        let agent = self.agent.name().to_string();
        let (status, output_files) = match outcome {
            LoopOutcome::Completed(finish) => {
                let staged = match &self.options.output_dir {
                    Some(dir) => stage_outputs(self.sandbox.as_ref(), &finish.paths, dir).await,
                    None => Ok(Vec::new()),
                };
                match staged {
                    Ok(files) => {
                        if let Some(store) = &store {
                            let result = if self.options.clear_on_success {
                                store.clear(&fp).await.map_err(AgentError::from)
                            } else {
                                self.save_checkpoint(store, &state).await
                            };
                            if let Err(e) = result {
                                tracing::warn!(fingerprint = %fp, error = %e, "checkpoint update after success failed");
                            }
                        }
                        self.send_event(LoopEvent::Completed {
                            agent: agent.clone(),
                            reason: finish.reason.clone(),
                            paths: finish.paths.clone(),
                        });
                        (RunStatus::Completed { finish }, files)
                    }
                    Err(e) => (self.fail_and_retain(store.as_ref(), &state, e).await, Vec::new()),
                }
            }
            LoopOutcome::Suspended => match &store {
                Some(store) => match self.save_checkpoint(store, &state).await {
                    Ok(()) => {
                        self.send_event(LoopEvent::Suspended {
                            agent: agent.clone(),
                            fingerprint: fp.clone(),
                            turn: state.turn,
                        });
                        (RunStatus::Suspended { fingerprint: fp.clone() }, Vec::new())
                    }
                    Err(e) => {
                        tracing::error!(fingerprint = %fp, error = %e, "checkpoint on suspension failed");
                        self.send_event(LoopEvent::Failed {
                            agent: agent.clone(),
                            kind: e.kind(),
                            message: e.to_string(),
                        });
                        (RunStatus::failed(&e), Vec::new())
                    }
                },
                None => {
                    tracing::warn!(agent = %agent, fingerprint = %fp, "run suspended without a checkpoint store, it cannot be resumed");
                    self.send_event(LoopEvent::Suspended {
                        agent: agent.clone(),
                        fingerprint: fp.clone(),
                        turn: state.turn,
                    });
                    (RunStatus::Suspended { fingerprint: fp.clone() }, Vec::new())
                }
            },
            LoopOutcome::Failed(err) => (self.fail_and_retain(store.as_ref(), &state, err).await, Vec::new()),
        };

        tracing::info!(
            agent = %agent,
            fingerprint = %fp,
            turns = state.turn,
            status = ?status.phase(),
            total_tokens = state.metadata.token_usage.total(),
            "run finished"
        );
        self.report(state, status, output_files)
    }

    /// 失败时保留断点
    async fn fail_and_retain(
        &self,
        store: Option<&Arc<dyn CheckpointStore>>,
        state: &RunState,
        err: AgentError,
    ) -> RunStatus {
        if let Some(store) = store {
            if let Err(e) = self.save_checkpoint(store, state).await {
                tracing::warn!(fingerprint = %state.fingerprint, error = %e, "checkpoint on failure failed");
            }
        }
        self.send_event(LoopEvent::Failed {
            agent: self.agent.name().to_string(),
            kind: err.kind(),
            message: err.to_string(),
        });
        RunStatus::failed(&err)
    }

    /// 逆序退出提供者并归还调度槽位
    pub async fn close(mut self) {
        self.stack.exit_all().await;
        tracing::debug!(agent = %self.agent.name(), "session closed");
    }
}

/// open + run + close
pub async fn run_session(agent: Arc<Agent>, task: &str, options: SessionOptions) -> Result<RunReport, AgentError> {
    let mut session = Session::open(agent, options).await?;
    let report = session.run(task).await;
    session.close().await;
    Ok(report)
}

fn has_glob_meta(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

fn sandbox_rel(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// 把主机上的输入文件 / 目录复制进沙箱根目录，返回沙箱内路径
pub(crate) async fn stage_inputs(sandbox: &dyn Sandbox, patterns: &[String]) -> Result<Vec<String>, AgentError> {
    let mut staged = Vec::new();
    for pattern in patterns {
        let paths: Vec<PathBuf> = if has_glob_meta(pattern) {
            let matched: Vec<PathBuf> = glob::glob(pattern)
                .map_err(|e| AgentError::Config(format!("invalid input pattern '{}': {}", pattern, e)))?
                .filter_map(Result::ok)
                .collect();
            if matched.is_empty() {
                return Err(AgentError::Config(format!("input pattern '{}' matched no files", pattern)));
            }
            matched
        } else {
            let p = PathBuf::from(pattern);
            if !p.exists() {
                return Err(AgentError::Config(format!("input file '{}' does not exist", pattern)));
            }
            vec![p]
        };

        for path in paths {
            let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
            let files: Vec<PathBuf> = if path.is_dir() {
                walkdir::WalkDir::new(&path)
                    .into_iter()
                    .filter_map(Result::ok)
                    .filter(|e| e.file_type().is_file())
                    .map(|e| e.path().to_path_buf())
                    .collect()
            } else {
                vec![path.clone()]
            };
            for file in files {
                let rel = file.strip_prefix(&base).unwrap_or(&file);
                let rel = sandbox_rel(rel);
                let data = tokio::fs::read(&file)
                    .await
                    .map_err(|e| AgentError::Config(format!("read input {}: {}", file.display(), e)))?;
                sandbox.write_file(&rel, &data).await?;
                tracing::debug!(file = %rel, bytes = data.len(), "input file staged");
                staged.push(rel);
            }
        }
    }
    Ok(staged)
}

/// 把 finish 声明的文件从沙箱复制到 output_dir/<path>
pub(crate) async fn stage_outputs(
    sandbox: Option<&Arc<dyn Sandbox>>,
    paths: &[String],
    output_dir: &Path,
) -> Result<Vec<PathBuf>, AgentError> {
    if paths.is_empty() {
        return Ok(Vec::new());
    }
    let sandbox = sandbox.ok_or_else(|| AgentError::OutputStaging("finish listed files but there is no sandbox".to_string()))?;
    let mut written = Vec::with_capacity(paths.len());
    for path in paths {
        let rel = normalize_path(path)?;
        let data = sandbox
            .read_file(path)
            .await
            .map_err(|e| AgentError::OutputStaging(format!("{}: {}", path, e)))?;
        let dest = output_dir.join(rel);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::OutputStaging(format!("{}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(&dest, &data)
            .await
            .map_err(|e| AgentError::OutputStaging(format!("{}: {}", dest.display(), e)))?;
        written.push(dest);
    }
    tracing::info!(count = written.len(), dir = %output_dir.display(), "output files staged");
    Ok(written)
}

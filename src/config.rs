//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `REIN__*` 覆盖（双下划线表示嵌套，如 `REIN__RUN__MAX_TURNS=20`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::llm::RetryConfig;
use crate::sandbox::CommandPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub run: RunSection,
    pub checkpoint: CheckpointSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
}

/// [run] 段：回合上限、并发上限、续跑策略、输出目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunSection {
    pub max_turns: usize,
    pub max_concurrent_runs: usize,
    /// 子智能体最大嵌套深度
    pub max_depth: usize,
    pub resume: bool,
    pub clear_on_success: bool,
    pub output_dir: PathBuf,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            max_turns: 50,
            max_concurrent_runs: 5,
            max_depth: 3,
            resume: true,
            clear_on_success: true,
            output_dir: PathBuf::from("./output"),
        }
    }
}

/// [checkpoint] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    pub dir: PathBuf,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./.rein/checkpoints"),
        }
    }
}

/// [llm] 段：OpenAI 兼容端点、模型、重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: String,
    pub model: String,
    /// 存放 API Key 的环境变量名
    pub api_key_env: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            model: "anthropic/claude-sonnet-4.5".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            request_timeout_secs: 120,
            max_retries: 3,
            initial_backoff_ms: 500,
        }
    }
}

impl LlmSection {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.trim().is_empty())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            ..RetryConfig::default()
        }
    }
}

/// [tools] 段：单次工具调用超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub tool_timeout_secs: u64,
    pub sandbox: SandboxSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 600,
            sandbox: SandboxSection::default(),
        }
    }
}

/// [tools.sandbox] 段：沙箱位置、命令超时、命令白名单（正则，空表示不限制）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub base_dir: Option<PathBuf>,
    pub command_timeout_secs: u64,
    pub allowed_commands: Vec<String>,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            base_dir: None,
            command_timeout_secs: 300,
            allowed_commands: Vec::new(),
        }
    }
}

impl SandboxSection {
    pub fn policy(&self) -> Result<CommandPolicy, regex::Error> {
        CommandPolicy::new(&self.allowed_commands)
    }
}

/// 从 config 目录加载配置，环境变量 REIN__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 REIN__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("REIN")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

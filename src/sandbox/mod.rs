//! 执行沙箱契约
//!
//! 代码执行工具与跨沙箱文件传输只依赖 Sandbox trait：run_command / read_file / write_file / list_files。
//! 路径一律相对隔离根目录解释，具体后端必须拒绝逃逸根目录的路径；
//! run_command 自行执行超时并返回结构化的超时标记，循环本身没有看门狗。

pub mod local;

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use local::{LocalSandbox, LocalSandboxProvider};

/// 沙箱错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Sandbox I/O error: {0}")]
    Io(String),

    #[error("Sandbox closed")]
    Closed,
}

/// 命令失败类别（进程正常退出但非 0 不算失败类别，看 exit_code）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandErrorKind {
    Timeout,
    CommandNotAllowed,
    SpawnFailed,
    /// 取消令牌触发，命令被提前终止
    Interrupted,
}

/// 命令执行结果
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub error_kind: Option<CommandErrorKind>,
}

impl CommandOutput {
    pub fn failed(kind: CommandErrorKind, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: stderr.into(),
            error_kind: Some(kind),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.error_kind.is_none()
    }
}

/// 沙箱完整文件树快照（相对路径 -> 内容）
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSnapshot {
    pub files: BTreeMap<String, Vec<u8>>,
}

impl SandboxSnapshot {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// 命令白名单：配置后命令必须至少匹配一个正则，否则执行前即拒绝
#[derive(Clone, Debug, Default)]
pub struct CommandPolicy {
    patterns: Vec<Regex>,
}

impl CommandPolicy {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn new(patterns: &[String]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_restricted(&self) -> bool {
        !self.patterns.is_empty()
    }

    pub fn check(&self, command: &str) -> Result<(), String> {
        let command = command.trim();
        if command.is_empty() {
            return Err("Empty command".to_string());
        }
        if !self.is_restricted() || self.patterns.iter().any(|p| p.is_match(command)) {
            return Ok(());
        }
        Err(format!("Command '{}' does not match the allow-list", command))
    }
}

/// 沙箱能力集
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// 后端标识（日志用）
    fn id(&self) -> &str;

    async fn run_command(&self, command: &str, timeout: Duration) -> CommandOutput;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError>;

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), SandboxError>;

    /// 根目录下全部文件的相对路径（按字典序）
    async fn list_files(&self) -> Result<Vec<String>, SandboxError>;

    async fn exists(&self, path: &str) -> bool {
        self.read_file(path).await.is_ok()
    }

    async fn snapshot(&self) -> Result<SandboxSnapshot, SandboxError> {
        let mut snap = SandboxSnapshot::default();
        for path in self.list_files().await? {
            let data = self.read_file(&path).await?;
            snap.files.insert(path, data);
        }
        Ok(snap)
    }

    async fn restore(&self, snapshot: &SandboxSnapshot) -> Result<(), SandboxError> {
        for (path, data) in &snapshot.files {
            self.write_file(path, data).await?;
        }
        Ok(())
    }
}

/// 把沙箱内路径规范化为相对路径：允许以 `/` 开头（视为沙箱根），拒绝 `..` 越界
pub fn normalize_path(path: &str) -> Result<PathBuf, SandboxError> {
    let trimmed = path.trim();
    let trimmed = trimmed.trim_start_matches("./");
    let mut out = PathBuf::new();
    for comp in Path::new(trimmed).components() {
        match comp {
            Component::Normal(c) => out.push(c),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return Err(SandboxError::PathEscape(path.to_string()));
                }
            }
            Component::Prefix(_) => return Err(SandboxError::PathEscape(path.to_string())),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(SandboxError::NotFound(path.to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_rejects_escape() {
        assert!(matches!(
            normalize_path("../../etc/passwd"),
            Err(SandboxError::PathEscape(_))
        ));
        assert!(matches!(
            normalize_path("a/../../b"),
            Err(SandboxError::PathEscape(_))
        ));
    }

    #[test]
    fn test_normalize_roots_absolute_paths() {
        assert_eq!(normalize_path("/out/report.csv").unwrap(), PathBuf::from("out/report.csv"));
        assert_eq!(normalize_path("./a/./b.txt").unwrap(), PathBuf::from("a/b.txt"));
        assert_eq!(normalize_path("a/x/../b.txt").unwrap(), PathBuf::from("a/b.txt"));
    }

    #[test]
    fn test_policy() {
        let open = CommandPolicy::allow_all();
        assert!(open.check("rm -rf /").is_ok());
        assert!(open.check("  ").is_err());

        let policy = CommandPolicy::new(&["^echo".to_string(), "^python".to_string()]).unwrap();
        assert!(policy.check("echo hi").is_ok());
        assert!(policy.check("python3 run.py").is_ok());
        assert!(policy.check("rm -rf /").is_err());
    }
}

//! 本地临时目录沙箱
//!
//! LocalSandbox 绑定 root 目录，所有路径经 resolve 校验必须在 root 下（禁止 ../ 与符号链接逃逸）；
//! 命令通过 sh -c / cmd /C 在 root 下执行，带超时、白名单与取消。
//! LocalSandboxProvider 在 enter 时创建 `<base>/rein-<uuid>`，exit 时删除。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::sandbox::{normalize_path, CommandErrorKind, CommandOutput, CommandPolicy, Sandbox, SandboxError};
use crate::tools::{CodeExecTool, ProvidedTools, ProviderContext, ProviderError, ToolProvider};

/// 本地沙箱
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    id: String,
    root: PathBuf,
    policy: CommandPolicy,
    cancel: CancellationToken,
}

impl LocalSandbox {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let root = root.canonicalize().unwrap_or(root);
        Self {
            id: format!("local:{}", root.display()),
            root,
            policy: CommandPolicy::allow_all(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: CommandPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 命令执行期间监听的取消令牌
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 解析沙箱内路径
    ///
    /// 从目标向上找到最近一个已存在的组件（符号链接本身也算存在），canonicalize 后必须仍在 root 下，
    /// 再拼回尚不存在的部分；悬空的符号链接无法确认去向，一律拒绝。
    pub fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let full = self.root.join(normalize_path(path)?);
        let mut existing = full.as_path();
        let mut missing = Vec::new();
        while existing.symlink_metadata().is_err() {
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    missing.push(name.to_os_string());
                    existing = parent;
                }
                _ => break,
            }
        }
        let canonical = existing
            .canonicalize()
            .map_err(|_| SandboxError::PathEscape(path.to_string()))?;
        if !canonical.starts_with(&self.root) {
            tracing::warn!(sandbox = %self.id, path = %path, target = %canonical.display(), "path escapes sandbox root");
            return Err(SandboxError::PathEscape(path.to_string()));
        }
        Ok(missing.into_iter().rev().fold(canonical, |acc, name| acc.join(name)))
    }
}

fn io_err(path: &str, e: std::io::Error) -> SandboxError {
    if e.kind() == std::io::ErrorKind::NotFound {
        SandboxError::NotFound(path.to_string())
    } else {
        SandboxError::Io(format!("{}: {}", path, e))
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run_command(&self, command: &str, timeout: Duration) -> CommandOutput {
        if let Err(reason) = self.policy.check(command) {
            tracing::warn!(sandbox = %self.id, command = %command, "command rejected by allow-list");
            return CommandOutput::failed(CommandErrorKind::CommandNotAllowed, reason);
        }

        tracing::info!(sandbox = %self.id, command = %command, "sandbox run_command");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(&self.root)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return CommandOutput::failed(CommandErrorKind::SpawnFailed, format!("Execution failed: {}", e))
            }
        };

        // 超时或取消时 future 被丢弃，kill_on_drop 负责结束子进程
        tokio::select! {
            res = tokio::time::timeout(timeout, child.wait_with_output()) => match res {
                Ok(Ok(output)) => CommandOutput {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    error_kind: None,
                },
                Ok(Err(e)) => CommandOutput::failed(CommandErrorKind::SpawnFailed, format!("Execution failed: {}", e)),
                Err(_) => CommandOutput::failed(
                    CommandErrorKind::Timeout,
                    format!("Command timed out after {}s", timeout.as_secs_f64()),
                ),
            },
            _ = self.cancel.cancelled() => {
                CommandOutput::failed(CommandErrorKind::Interrupted, "Command interrupted")
            }
        }
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        let resolved = self.resolve(path)?;
        if resolved.is_dir() {
            return Err(SandboxError::NotFound(path.to_string()));
        }
        tokio::fs::read(&resolved).await.map_err(|e| io_err(path, e))
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), SandboxError> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(path, e))?;
        }
        tokio::fs::write(&resolved, data)
            .await
            .map_err(|e| io_err(path, e))
    }

    async fn list_files(&self) -> Result<Vec<String>, SandboxError> {
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(|e| SandboxError::Io(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push(rel);
            }
        }
        files.sort();
        Ok(files)
    }
}

/// 本地沙箱提供者：产出 code_exec 工具与沙箱本身
pub struct LocalSandboxProvider {
    base_dir: PathBuf,
    policy: CommandPolicy,
    command_timeout: Duration,
    root: Option<PathBuf>,
}

impl LocalSandboxProvider {
    pub fn new() -> Self {
        Self {
            base_dir: std::env::temp_dir(),
            policy: CommandPolicy::allow_all(),
            command_timeout: Duration::from_secs(300),
            root: None,
        }
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn with_policy(mut self, policy: CommandPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// 当前沙箱根目录（enter 之后、exit 之前有值）
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }
}

impl Default for LocalSandboxProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolProvider for LocalSandboxProvider {
    fn name(&self) -> &str {
        "local_sandbox"
    }

    async fn enter(&mut self, ctx: &ProviderContext) -> Result<ProvidedTools, ProviderError> {
        let root = self.base_dir.join(format!("rein-{}", uuid::Uuid::new_v4()));
        // 先记录 root，create 半途失败时 exit 也能清理
        self.root = Some(root.clone());
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| ProviderError::Setup(format!("create {}: {}", root.display(), e)))?;

        let sandbox = Arc::new(
            LocalSandbox::new(&root)
                .with_policy(self.policy.clone())
                .with_cancel(ctx.cancel.clone()),
        );
        tracing::info!(agent = %ctx.agent, root = %root.display(), "local sandbox created");

        Ok(ProvidedTools {
            tools: vec![Arc::new(CodeExecTool::new(sandbox.clone(), self.command_timeout))],
            sandbox: Some(sandbox),
        })
    }

    async fn exit(&mut self) -> Result<(), ProviderError> {
        let Some(root) = self.root.take() else {
            return Ok(());
        };
        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => {
                tracing::info!(root = %root.display(), "local sandbox removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProviderError::Teardown(format!("remove {}: {}", root.display(), e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_read_list() {
        let dir = TempDir::new().unwrap();
        let sb = LocalSandbox::new(dir.path());
        sb.write_file("out/report.csv", b"a,b\n1,2\n").await.unwrap();
        sb.write_file("/notes.txt", b"hi").await.unwrap();
        assert_eq!(sb.read_file("./out/report.csv").await.unwrap(), b"a,b\n1,2\n");
        assert_eq!(
            sb.list_files().await.unwrap(),
            vec!["notes.txt".to_string(), "out/report.csv".to_string()]
        );
        assert!(matches!(sb.read_file("missing.txt").await, Err(SandboxError::NotFound(_))));
        assert!(matches!(sb.read_file("../x").await, Err(SandboxError::PathEscape(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_dir_cannot_escape_root() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("gone.txt"), dir.path().join("dangling")).unwrap();
        let sb = LocalSandbox::new(dir.path());

        assert!(matches!(
            sb.write_file("link/escaped.txt", b"x").await,
            Err(SandboxError::PathEscape(_))
        ));
        assert!(matches!(
            sb.write_file("link/deep/er/escaped.txt", b"x").await,
            Err(SandboxError::PathEscape(_))
        ));
        assert!(matches!(sb.write_file("dangling", b"x").await, Err(SandboxError::PathEscape(_))));
        assert!(!outside.path().join("escaped.txt").exists());
        assert!(!outside.path().join("deep").exists());
        assert!(!outside.path().join("gone.txt").exists());

        // 根内的新目录照常可写
        sb.write_file("fresh/sub/ok.txt", b"ok").await.unwrap();
        assert_eq!(sb.read_file("fresh/sub/ok.txt").await.unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_snapshot_restore_into_fresh_sandbox() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let src = LocalSandbox::new(a.path());
        src.write_file("x/y.txt", b"nested").await.unwrap();
        src.write_file("z.bin", &[0u8, 1, 2]).await.unwrap();
        let snap = src.snapshot().await.unwrap();
        assert_eq!(snap.len(), 2);

        let dst = LocalSandbox::new(b.path());
        dst.restore(&snap).await.unwrap();
        assert_eq!(dst.read_file("x/y.txt").await.unwrap(), b"nested");
        assert_eq!(dst.snapshot().await.unwrap(), snap);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_in_root() {
        let dir = TempDir::new().unwrap();
        let sb = LocalSandbox::new(dir.path());
        let out = sb
            .run_command("echo hello > greeting.txt && cat greeting.txt", Duration::from_secs(10))
            .await;
        assert!(out.success(), "{:?}", out);
        assert_eq!(out.stdout.trim(), "hello");
        assert!(sb.exists("greeting.txt").await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_timeout() {
        let dir = TempDir::new().unwrap();
        let sb = LocalSandbox::new(dir.path());
        let out = sb.run_command("sleep 5", Duration::from_millis(100)).await;
        assert_eq!(out.error_kind, Some(CommandErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_allow_list_rejects_before_spawn() {
        let dir = TempDir::new().unwrap();
        let policy = CommandPolicy::new(&["^echo".to_string()]).unwrap();
        let sb = LocalSandbox::new(dir.path()).with_policy(policy);
        let out = sb.run_command("touch created.txt", Duration::from_secs(5)).await;
        assert_eq!(out.error_kind, Some(CommandErrorKind::CommandNotAllowed));
        assert!(!sb.exists("created.txt").await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_interrupted() {
        let dir = TempDir::new().unwrap();
        let token = CancellationToken::new();
        let sb = LocalSandbox::new(dir.path()).with_cancel(token.clone());
        let handle = tokio::spawn(async move { sb.run_command("sleep 5", Duration::from_secs(10)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let out = handle.await.unwrap();
        assert_eq!(out.error_kind, Some(CommandErrorKind::Interrupted));
    }

    #[tokio::test]
    async fn test_provider_enter_exit_idempotent() {
        let base = TempDir::new().unwrap();
        let mut provider = LocalSandboxProvider::new().with_base_dir(base.path());
        let provided = provider.enter(&ProviderContext::default()).await.unwrap();
        let root = provider.root().unwrap().to_path_buf();
        assert!(root.exists());
        assert!(provided.sandbox.is_some());
        assert_eq!(provided.tools[0].name(), "code_exec");

        provider.exit().await.unwrap();
        provider.exit().await.unwrap();
        assert!(!root.exists());
    }
}

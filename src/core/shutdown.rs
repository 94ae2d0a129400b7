//! 中断处理
//!
//! 第一次 Ctrl+C / SIGTERM 取消运行令牌：回合循环在下一个边界写断点并挂起，
//! 正在执行的命令通过同一令牌提前结束。再次按 Ctrl+C 则不等断点，直接以 130 退出。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// 第二次中断的退出码（128 + SIGINT）
const FORCED_EXIT_CODE: i32 = 130;

/// 中断原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// 代码内主动请求（如前端停止服务）
    Requested,
}

/// 把进程信号转换为运行取消令牌
pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: watch::Sender<Option<ShutdownReason>>,
    interrupts: AtomicUsize,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = watch::channel(None);
        Self {
            token: CancellationToken::new(),
            reason_tx,
            interrupts: AtomicUsize::new(0),
        }
    }

    /// 传给 SessionOptions::with_cancel 的令牌
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 记录原因并取消；只有第一次调用的原因会保留
    pub fn shutdown(&self, reason: ShutdownReason) {
        self.reason_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ShutdownReason>> {
        self.reason_tx.subscribe()
    }

    /// 返回本次是否为重复中断
    fn record_interrupt(&self, reason: ShutdownReason) -> bool {
        let seen = self.interrupts.fetch_add(1, Ordering::SeqCst);
        if seen == 0 {
            tracing::info!(?reason, "interrupt received, suspending at the next turn boundary (press Ctrl+C again to abort)");
            self.shutdown(reason);
            false
        } else {
            true
        }
    }

    /// 安装 Ctrl+C 与 SIGTERM 处理
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if manager.record_interrupt(ShutdownReason::Interrupt) {
                    tracing::warn!("second interrupt, exiting without checkpoint");
                    std::process::exit(FORCED_EXIT_CODE);
                }
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        if sigterm.recv().await.is_some() {
                            manager.record_interrupt(ShutdownReason::Terminate);
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "SIGTERM handler not installed"),
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(manager.reason().is_none());

        manager.shutdown(ShutdownReason::Requested);
        manager.shutdown(ShutdownReason::Terminate);
        assert!(token.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::Requested));
    }

    #[test]
    fn test_repeated_interrupt_detected() {
        let manager = ShutdownManager::new();
        assert!(!manager.record_interrupt(ShutdownReason::Interrupt));
        assert!(manager.is_shutdown());
        assert!(manager.record_interrupt(ShutdownReason::Interrupt));
    }

    #[tokio::test]
    async fn test_subscriber_sees_reason() {
        let manager = ShutdownManager::new();
        let mut rx = manager.subscribe();
        manager.shutdown(ShutdownReason::Interrupt);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Some(ShutdownReason::Interrupt));
    }
}

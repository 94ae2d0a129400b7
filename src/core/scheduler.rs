//! 运行调度：限制同时在跑的智能体运行数
//!
//! 基于 tokio Semaphore（公平，按 FIFO 授予许可）。许可为 RAII，运行结束或被丢弃即归还。
//! 嵌套运行（子智能体）只做 try_acquire，拿不到就沿用父运行的槽位，保证不会因为父子互等而死锁。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::core::AgentError;

/// 运行调度器（可克隆，共享同一个信号量）
#[derive(Clone, Debug)]
pub struct RunScheduler {
    semaphore: Arc<Semaphore>,
    max: usize,
    /// 沿用父槽位的嵌套运行数
    riding: Arc<AtomicUsize>,
}

/// 运行许可；drop 即释放
#[derive(Debug)]
pub struct RunPermit {
    permit: Option<OwnedSemaphorePermit>,
    riding: Option<Arc<AtomicUsize>>,
}

impl RunPermit {
    /// 是否占用了独立槽位（否则沿用父运行的槽位）
    pub fn owns_slot(&self) -> bool {
        self.permit.is_some()
    }

    /// 显式释放
    pub fn release(self) {}
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        if let Some(riding) = self.riding.take() {
            riding.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl RunScheduler {
    pub fn new(max_concurrent_runs: usize) -> Self {
        let max = max_concurrent_runs.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
            riding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 等待槽位；等待者按到达顺序获得许可
    pub async fn acquire(&self) -> Result<RunPermit, AgentError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::Config("run scheduler closed".to_string()))?;
        tracing::debug!(in_flight = self.in_flight(), max = self.max, "run slot acquired");
        Ok(RunPermit {
            permit: Some(permit),
            riding: None,
        })
    }

    /// 嵌套运行：有空槽就占用，否则沿用父运行的槽位，从不阻塞
    pub fn acquire_nested(&self) -> RunPermit {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => RunPermit {
                permit: Some(permit),
                riding: None,
            },
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                self.riding.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(max = self.max, "no free slot, nested run rides on parent slot");
                RunPermit {
                    permit: None,
                    riding: Some(self.riding.clone()),
                }
            }
        }
    }

    /// 占用独立槽位的运行数
    pub fn in_flight(&self) -> usize {
        self.max - self.semaphore.available_permits()
    }

    /// 沿用父槽位的嵌套运行数
    pub fn nested_riding(&self) -> usize {
        self.riding.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

impl Default for RunScheduler {
    fn default() -> Self {
        Self::new(5)
    }
}

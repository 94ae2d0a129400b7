//! 核心编排层：错误与恢复、运行状态、会话、运行调度、信号处理

pub mod error;
pub mod recovery;
pub mod scheduler;
pub mod session;
pub mod shutdown;
pub mod state;

pub use error::{AgentError, ErrorKind, RecoveryAction, ToolError};
pub use recovery::RecoveryEngine;
pub use scheduler::{RunPermit, RunScheduler};
pub use session::{run_session, Session, SessionOptions, DEFAULT_MAX_DEPTH};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{AgentPhase, RunReport, RunStatus};

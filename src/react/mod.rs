//! 回合循环：AgentLoop 状态机与过程事件

pub mod events;
pub mod loop_;

pub use events::LoopEvent;
pub use loop_::{AgentLoop, LoopOutcome};

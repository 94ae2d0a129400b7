//! Rein - Rust 智能体执行引擎
//!
//! 模块划分：
//! - **agent**: 智能体定义（模型、工具、提供者、回合上限）
//! - **checkpoint**: 断点存储（内存 / 文件系统 / SQLite）与任务指纹
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、恢复策略、会话、运行调度、信号处理
//! - **integrations**: 聊天前端桥接
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / 脚本化 Mock / 重试包装）
//! - **memory**: 对话消息与 token 用量
//! - **react**: 回合循环与运行事件
//! - **sandbox**: 沙箱契约与本地目录实现
//! - **tools**: 工具契约、注册表、执行器、提供者、finish 与子智能体工具

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod integrations;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod sandbox;
pub mod tools;

pub use agent::Agent;
pub use core::{run_session, AgentError, RunReport, RunScheduler, RunStatus, Session, SessionOptions};

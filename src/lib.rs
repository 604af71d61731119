//! Mnemo - Rust 记忆型智能体运行时
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、持久实体、任务、用量统计、agent 缓存与执行中断
//! - **llm**: 模型后端与嵌入抽象（OpenAI 兼容 / Mock / Scripted）
//! - **memory**: 核心记忆（块）、recall 消息日志、archival 向量段落、上下文预算
//! - **observability**: tracing 初始化
//! - **runtime**: 链式状态机、Agent 执行体、事件接口
//! - **server**: AgentServer，面向调用方的全部操作
//! - **store**: 用户 / agent / 工具 / 数据源 / 任务的实体存储
//! - **tools**: 内置记忆工具、注册表、调用器与用户工具沙箱

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod runtime;
pub mod server;
pub mod store;
pub mod tools;

pub use core::AgentError;
pub use server::{AgentServer, CreateAgentRequest, MessageResponse, SendMessageResult};

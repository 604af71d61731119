//! 运行时：链式状态机、Agent 执行体、事件接口与输入打包

pub mod agent;
pub mod chain;
pub mod events;
pub mod system;

pub use agent::{Agent, AgentDeps, ChainResult, StepOutcome, DEFAULT_POP_COUNT};
pub use chain::{transition, ChainPolicy, ChainState, NextInput, StepSignals};
pub use events::{AgentEvent, AgentInterface, ChannelInterface, NoopInterface, YieldGuard};
pub use system::{validate_input, DEFAULT_SYSTEM_PROMPT};

//! 核心层：错误分类、持久实体、任务生命周期、用量统计、agent 缓存与执行中断

pub mod cache;
pub mod error;
pub mod job;
pub mod session_supervisor;
pub mod state;
pub mod usage;

pub use cache::{AgentCache, AgentHandle};
pub use error::{AgentError, ErrorKind};
pub use job::{Job, JobStatus};
pub use session_supervisor::SessionSupervisor;
pub use state::{AgentState, EmbeddingConfig, LlmConfig, Source, ToolDescriptor, User};
pub use usage::UsageStatistics;

//! Agent 错误类型与稳定分类
//!
//! 库内所有操作返回 `Result<_, AgentError>`；调用方通过 `kind()` 得到稳定分类，
//! 决定是作为客户端错误直接返回，还是作为后端故障上报。

use thiserror::Error;

/// 运行时可能出现的错误（实体不存在、输入非法、记忆编辑、工具、模型后端、存储等）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid range: start={start}, count={count}")]
    InvalidRange { start: i64, count: i64 },

    #[error("Unknown memory block: {0}")]
    UnknownBlock(String),

    #[error("Block '{name}' exceeds limit: {len} > {limit}")]
    BlockLimitExceeded {
        name: String,
        len: usize,
        limit: usize,
    },

    #[error("Context window exceeded: {used} > {limit} tokens")]
    ContextWindowExceeded { used: usize, limit: usize },

    /// 参数不符合工具 schema；工具体不会被执行
    #[error("Tool argument error for '{tool}': {reason}")]
    ToolArgument { tool: String, reason: String },

    #[error("Hallucinated tool: {0}")]
    HallucinatedTool(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Network timeout")]
    NetworkTimeout,

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    ConfigError(String),
}

/// 稳定的错误分类（供 CLI / REST 层映射状态码）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    ToolFailure,
    Backend,
    Storage,
    Cancelled,
    Config,
}

impl AgentError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        AgentError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::NotFound { .. } => ErrorKind::NotFound,
            AgentError::Validation(_)
            | AgentError::InvalidRange { .. }
            | AgentError::UnknownBlock(_)
            | AgentError::BlockLimitExceeded { .. }
            | AgentError::ContextWindowExceeded { .. } => ErrorKind::Validation,
            AgentError::ToolArgument { .. }
            | AgentError::HallucinatedTool(_)
            | AgentError::ToolExecutionFailed(_)
            | AgentError::ToolTimeout(_) => ErrorKind::ToolFailure,
            AgentError::Embedding(_)
            | AgentError::LlmError(_)
            | AgentError::NetworkTimeout
            | AgentError::JsonParseError(_) => ErrorKind::Backend,
            AgentError::Storage(_) => ErrorKind::Storage,
            AgentError::Cancelled => ErrorKind::Cancelled,
            AgentError::ConfigError(_) => ErrorKind::Config,
        }
    }

    /// 调用方输入导致的错误，重试无意义
    pub fn is_client_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound | ErrorKind::Validation)
    }

    /// 工具层失败：在链式循环内被转换为 function_failed，而非向上抛出
    pub fn is_recoverable_tool_failure(&self) -> bool {
        matches!(
            self,
            AgentError::ToolArgument { .. }
                | AgentError::HallucinatedTool(_)
                | AgentError::ToolExecutionFailed(_)
        )
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::Storage(e.to_string())
    }
}

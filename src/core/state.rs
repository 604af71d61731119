//! 持久实体：User / AgentState / Source 及其配置
//!
//! AgentState 是某个 agent 的 Memory 与上下文窗口（message_ids）的唯一根；
//! recall / archival 只按 agent id 引用，不按值内嵌。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{EmbeddingSection, LlmSection};
use crate::memory::Memory;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    pub context_window: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self::from(&LlmSection::default())
    }
}

impl From<&LlmSection> for LlmConfig {
    fn from(s: &LlmSection) -> Self {
        Self {
            model: s.model.clone(),
            context_window: s.context_window,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model: String,
    pub dim: usize,
    pub chunk_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self::from(&EmbeddingSection::default())
    }
}

impl From<&EmbeddingSection> for EmbeddingConfig {
    fn from(s: &EmbeddingSection) -> Self {
        Self {
            model: s.model.clone(),
            dim: s.dim,
            chunk_size: s.chunk_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// agent 的持久状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub id: Uuid,
    pub name: String,
    pub user_id: Uuid,
    pub llm_config: LlmConfig,
    pub embedding_config: EmbeddingConfig,
    /// system prompt 模板（核心记忆在 rebuild 时拼接其后）
    pub system: String,
    pub memory: Memory,
    /// 有序工具名
    pub tools: Vec<String>,
    /// 当前上下文窗口，首条为 system 消息
    pub message_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// 数据源：可被多个 agent 挂载的文档集合
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub embedding_config: EmbeddingConfig,
    pub created_at: DateTime<Utc>,
}

impl Source {
    pub fn new(user_id: Uuid, name: impl Into<String>, embedding_config: EmbeddingConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            embedding_config,
            created_at: Utc::now(),
        }
    }
}

/// 用户自定义工具的持久描述；执行只经沙箱，不在进程内运行源码
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub description: String,
    /// 源码语言 / 执行方式，由沙箱解释
    pub source_type: String,
    pub source_code: String,
    /// {"name", "description", "parameters"}
    pub json_schema: serde_json::Value,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ToolDescriptor {
    /// 参数 schema（json_schema.parameters）
    pub fn parameters(&self) -> serde_json::Value {
        self.json_schema
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}}))
    }
}

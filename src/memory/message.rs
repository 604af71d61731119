//! 消息：recall 记忆中的一条记录
//!
//! 角色与 LLM API 一致（user / system / assistant / tool）。持久化后不可变，
//! 仅 rethink / rewrite 命令可改写最近一条 assistant 消息的文本或参数。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::AgentError;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    System,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::System => "system",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "system" => Some(Role::System),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// assistant 消息上携带的工具调用（arguments 为原始 JSON 字符串）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    /// tool 消息对应的 ToolCall.id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(agent_id: Uuid, role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            role,
            text: text.into(),
            tool_call: None,
            tool_call_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn user(agent_id: Uuid, text: impl Into<String>) -> Self {
        Self::new(agent_id, Role::User, text)
    }

    pub fn system(agent_id: Uuid, text: impl Into<String>) -> Self {
        Self::new(agent_id, Role::System, text)
    }

    pub fn assistant(agent_id: Uuid, text: impl Into<String>) -> Self {
        Self::new(agent_id, Role::Assistant, text)
    }

    pub fn tool(agent_id: Uuid, tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut m = Self::new(agent_id, Role::Tool, text);
        m.tool_call_id = Some(tool_call_id.into());
        m
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_call = Some(call);
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// 写入 recall 前的校验：文本为空且不携带工具调用的消息不可持久化
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.text.trim().is_empty() && self.tool_call.is_none() {
            return Err(AgentError::Validation(format!(
                "message {} has empty text",
                self.id
            )));
        }
        Ok(())
    }
}

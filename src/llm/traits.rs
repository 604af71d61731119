//! 模型后端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock / Scripted）实现 ModelBackend：complete（非流式）与 complete_stream（流式文本块 + 终止结构）。
//! 模型对运行时是不透明的请求/响应服务，返回内心独白、可选工具调用及 heartbeat / token_warning 标志。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::core::{AgentError, LlmConfig};
use crate::memory::{Message, ToolCall};

/// 提供给模型的工具描述
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 单次请求
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub llm_config: &'a LlmConfig,
    /// 完整上下文（首条为 system 消息）
    pub messages: &'a [Message],
    pub tools: &'a [ToolSchema],
    /// prompt token 超过该值时后端应标记 token_warning
    pub warning_threshold: usize,
}

/// 单次调用的 token 统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModelUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// 结构化的模型输出
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    /// 内心独白（不直接展示给用户）
    pub text: String,
    pub tool_call: Option<ToolCall>,
    pub heartbeat_requested: bool,
    pub token_warning: bool,
    pub usage: ModelUsage,
}

impl ModelResponse {
    pub fn thought(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_tool_call(mut self, name: impl Into<String>, args: Value) -> Self {
        self.tool_call = Some(ToolCall {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            arguments: args.to_string(),
        });
        self
    }

    /// 参数为原始字符串（可用于模拟非法 JSON）
    pub fn with_raw_tool_call(mut self, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        self.tool_call = Some(ToolCall {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            arguments: arguments.into(),
        });
        self
    }

    pub fn with_heartbeat(mut self) -> Self {
        self.heartbeat_requested = true;
        self
    }

    pub fn with_token_warning(mut self) -> Self {
        self.token_warning = true;
        self
    }

    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.usage = ModelUsage {
            prompt_tokens,
            completion_tokens,
        };
        self
    }
}

/// 流式输出：若干文本块，最后一个 Done 携带完整结构
#[derive(Debug, Clone)]
pub enum ModelChunk {
    Text(String),
    Done(ModelResponse),
}

pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelChunk, AgentError>> + Send>>;

/// 模型后端 trait：非流式完成与流式完成
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// 非流式完成
    async fn complete(&self, request: ModelRequest<'_>) -> Result<ModelResponse, AgentError>;

    /// 流式完成；默认实现把非流式结果拆成一个文本块加终止结构
    async fn complete_stream(&self, request: ModelRequest<'_>) -> Result<ModelStream, AgentError> {
        let response = self.complete(request).await?;
        let mut chunks = Vec::with_capacity(2);
        if !response.text.is_empty() {
            chunks.push(Ok(ModelChunk::Text(response.text.clone())));
        }
        chunks.push(Ok(ModelChunk::Done(response)));
        Ok(Box::pin(stream::iter(chunks)))
    }

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

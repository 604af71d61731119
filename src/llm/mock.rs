//! Mock 模型后端（用于测试与本地运行，无需 API）
//!
//! - MockModel：取最后一条用户输入，经 send_message 回显
//! - ScriptedModel：按预设脚本逐次返回响应（可注入失败与延迟），脚本耗尽后重复 fallback

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::core::AgentError;
use crate::llm::{ModelBackend, ModelRequest, ModelResponse};
use crate::memory::{Message, Role};

/// Mock 后端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockModel;

#[async_trait]
impl ModelBackend for MockModel {
    async fn complete(&self, request: ModelRequest<'_>) -> Result<ModelResponse, AgentError> {
        let last = request.messages.last();
        let envelope = last
            .filter(|m| m.role == Role::User)
            .and_then(|m| serde_json::from_str::<serde_json::Value>(&m.text).ok());
        let kind = envelope
            .as_ref()
            .and_then(|v| v.get("type"))
            .and_then(|t| t.as_str())
            .unwrap_or("");

        if kind != "user_message" {
            // heartbeat / 系统提醒 / 工具返回：结束本轮
            return Ok(ModelResponse::thought("Nothing more to do."));
        }
        let text = envelope
            .as_ref()
            .and_then(|v| v.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or("(no input)");
        Ok(ModelResponse::thought("Echoing the user.")
            .with_tool_call("send_message", json!({ "message": format!("Echo from Mock: {}", text) })))
    }
}

/// 脚本中的一步
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(ModelResponse),
    Fail(String),
}

/// 按脚本返回的后端
pub struct ScriptedModel {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Option<ModelResponse>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    /// 每次调用时上下文的最后一条消息
    inputs: Mutex<Vec<Message>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            delay: None,
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn replies(replies: Vec<ModelResponse>) -> Self {
        Self::new(replies.into_iter().map(Scripted::Reply).collect())
    }

    /// 每次都返回同一个响应
    pub fn repeating(response: ModelResponse) -> Self {
        Self::new(Vec::new()).with_fallback(response)
    }

    pub fn with_fallback(mut self, response: ModelResponse) -> Self {
        self.fallback = Some(response);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<Message> {
        self.inputs.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ModelBackend for ScriptedModel {
    async fn complete(&self, request: ModelRequest<'_>) -> Result<ModelResponse, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let (Some(last), Ok(mut inputs)) = (request.messages.last(), self.inputs.lock()) {
            inputs.push(last.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self
            .script
            .lock()
            .map_err(|_| AgentError::LlmError("script poisoned".into()))?
            .pop_front();
        match next {
            Some(Scripted::Reply(r)) => Ok(fresh_call_id(r)),
            Some(Scripted::Fail(e)) => Err(AgentError::LlmError(e)),
            None => self
                .fallback
                .clone()
                .map(fresh_call_id)
                .ok_or_else(|| AgentError::LlmError("script exhausted".into())),
        }
    }
}

/// 重复使用的响应需要新的 tool call id
fn fresh_call_id(mut r: ModelResponse) -> ModelResponse {
    if let Some(call) = r.tool_call.as_mut() {
        call.id = uuid::Uuid::new_v4().to_string();
    }
    r
}

//! OpenAI 兼容 API 后端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。工具协议走 JSON 约定而非原生 function calling：
//! 工具清单与回复格式拼入首条 system 消息，回复由 `parse_reply` 解析。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use uuid::Uuid;

use crate::config::LlmSection;
use crate::core::AgentError;
use crate::llm::parse::parse_reply;
use crate::llm::{MockModel, ModelBackend, ModelRequest, ModelResponse, ModelUsage, ToolSchema};
use crate::memory::{Message, Role, ToolCall};
use crate::tools::schema::tool_call_schema_json;

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容后端：持有 Client、请求超时与累计用量
pub struct OpenAiBackend {
    client: Client<OpenAIConfig>,
    timeout: Duration,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiBackend {
    pub fn new(base_url: Option<&str>, api_key: Option<&str>, timeout_secs: u64) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            timeout: Duration::from_secs(timeout_secs),
            usage: TokenUsage::new(),
        }
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<Vec<ChatCompletionRequestMessage>, AgentError> {
        let build_err = |e: async_openai::error::OpenAIError| AgentError::LlmError(e.to_string());
        let mut out = Vec::with_capacity(messages.len());
        for (i, m) in messages.iter().enumerate() {
            let msg = match m.role {
                Role::System => {
                    let content = if i == 0 {
                        format!("{}\n\n{}", m.text, tool_instructions(tools))
                    } else {
                        m.text.clone()
                    };
                    ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(content)
                            .build()
                            .map_err(build_err)?,
                    )
                }
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.text.clone())
                        .build()
                        .map_err(build_err)?,
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(render_assistant(m))
                        .build()
                        .map_err(build_err)?,
                ),
                // 工具结果以 user 消息回灌
                Role::Tool => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(format!("FUNCTION RETURN: {}", m.text))
                        .build()
                        .map_err(build_err)?,
                ),
            };
            out.push(msg);
        }
        Ok(out)
    }
}

/// 还原 assistant 消息为约定 JSON，便于模型保持格式
fn render_assistant(m: &Message) -> String {
    match &m.tool_call {
        Some(ToolCall {
            name, arguments, ..
        }) => {
            let args: serde_json::Value =
                serde_json::from_str(arguments).unwrap_or(serde_json::Value::String(arguments.clone()));
            serde_json::json!({ "thought": m.text, "tool": name, "args": args }).to_string()
        }
        None => serde_json::json!({ "thought": m.text }).to_string(),
    }
}

fn tool_instructions(tools: &[ToolSchema]) -> String {
    let listing = serde_json::to_string_pretty(tools).unwrap_or_else(|_| "[]".to_string());
    format!(
        "Available tools:\n{}\n\nReply with a single JSON object matching this schema:\n{}",
        listing,
        tool_call_schema_json()
    )
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, request: ModelRequest<'_>) -> Result<ModelResponse, AgentError> {
        let req = CreateChatCompletionRequestArgs::default()
            .model(&request.llm_config.model)
            .messages(self.to_openai_messages(request.messages, request.tools)?)
            .build()
            .map_err(|e| AgentError::LlmError(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(req))
            .await
            .map_err(|_| AgentError::NetworkTimeout)?
            .map_err(|e| AgentError::LlmError(e.to_string()))?;

        let mut usage = ModelUsage::default();
        if let Some(u) = &response.usage {
            usage.prompt_tokens = u.prompt_tokens as u64;
            usage.completion_tokens = u.completion_tokens as u64;
            self.usage.add(usage.prompt_tokens, usage.completion_tokens);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        let parsed = parse_reply(&content)?;

        Ok(ModelResponse {
            text: parsed.thought,
            tool_call: parsed.tool.map(|(name, args)| ToolCall {
                id: Uuid::new_v4().to_string(),
                name,
                arguments: args.to_string(),
            }),
            heartbeat_requested: parsed.request_heartbeat,
            token_warning: usage.prompt_tokens as usize > request.warning_threshold,
            usage,
        })
    }
}

/// 按 [llm] 段创建模型后端；provider 为 mock 时使用本地回显模型
pub fn create_model_from_config(section: &LlmSection) -> Arc<dyn ModelBackend> {
    match section.provider.as_str() {
        "openai" => Arc::new(OpenAiBackend::new(
            section.base_url.as_deref(),
            None,
            section.timeouts.request,
        )),
        "mock" => Arc::new(MockModel),
        other => {
            tracing::warn!(provider = other, "unknown llm provider, using mock");
            Arc::new(MockModel)
        }
    }
}

//! 内置工具：send_message 与核心 / 归档 / 对话记忆操作
//!
//! 参数结构体由 schemars 派生 JSON Schema，调用前经 ToolInvoker 校验。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::AgentError;
use crate::memory::PassageScope;
use crate::tools::{schema_value, Tool, ToolContext, ToolRegistry};

/// 搜索类工具每页条数
pub const SEARCH_PAGE_SIZE: usize = 5;

/// 新建 agent 默认挂载的工具
pub const BASE_TOOLS: &[&str] = &[
    "send_message",
    "core_memory_append",
    "core_memory_replace",
    "archival_memory_insert",
    "archival_memory_search",
    "conversation_search",
];

fn parse_args<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("invalid arguments: {}", e))
}

fn err_text(e: AgentError) -> String {
    e.to_string()
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SendMessageArgs {
    /// 发给用户的消息内容
    pub message: String,
}

/// 向用户发送消息并结束本轮
pub struct SendMessageTool;

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message"
    }

    fn description(&self) -> &str {
        "Sends a message to the human user. This is the only way the user sees your reply."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<SendMessageArgs>()
    }

    fn ends_turn(&self) -> bool {
        true
    }

    async fn execute(&self, _ctx: &mut ToolContext<'_>, args: Value) -> Result<String, String> {
        let args: SendMessageArgs = parse_args(args)?;
        Ok(args.message)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CoreMemoryAppendArgs {
    /// 块名（如 persona / human）
    pub label: String,
    /// 追加的内容，另起一行
    pub content: String,
}

pub struct CoreMemoryAppendTool;

#[async_trait]
impl Tool for CoreMemoryAppendTool {
    fn name(&self) -> &str {
        "core_memory_append"
    }

    fn description(&self) -> &str {
        "Append a line to one of your core memory blocks."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<CoreMemoryAppendArgs>()
    }

    async fn execute(&self, ctx: &mut ToolContext<'_>, args: Value) -> Result<String, String> {
        let args: CoreMemoryAppendArgs = parse_args(args)?;
        ctx.memory
            .append_block(&args.label, &args.content)
            .map_err(err_text)?;
        Ok(format!("Appended to core memory block '{}'.", args.label))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CoreMemoryReplaceArgs {
    pub label: String,
    /// 需被替换的原文（须完全匹配）
    pub old_content: String,
    /// 新内容；为空即删除原文
    pub new_content: String,
}

pub struct CoreMemoryReplaceTool;

#[async_trait]
impl Tool for CoreMemoryReplaceTool {
    fn name(&self) -> &str {
        "core_memory_replace"
    }

    fn description(&self) -> &str {
        "Replace text in one of your core memory blocks. old_content must match exactly."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<CoreMemoryReplaceArgs>()
    }

    async fn execute(&self, ctx: &mut ToolContext<'_>, args: Value) -> Result<String, String> {
        let args: CoreMemoryReplaceArgs = parse_args(args)?;
        ctx.memory
            .replace_in_block(&args.label, &args.old_content, &args.new_content)
            .map_err(err_text)?;
        Ok(format!("Updated core memory block '{}'.", args.label))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ArchivalInsertArgs {
    /// 写入长期记忆的内容
    pub content: String,
}

pub struct ArchivalMemoryInsertTool;

#[async_trait]
impl Tool for ArchivalMemoryInsertTool {
    fn name(&self) -> &str {
        "archival_memory_insert"
    }

    fn description(&self) -> &str {
        "Add to archival memory. Use it for anything worth remembering beyond the current conversation."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<ArchivalInsertArgs>()
    }

    async fn execute(&self, ctx: &mut ToolContext<'_>, args: Value) -> Result<String, String> {
        let args: ArchivalInsertArgs = parse_args(args)?;
        let ids = ctx
            .archival
            .insert(PassageScope::agent(ctx.agent_id), &args.content)
            .await
            .map_err(err_text)?;
        ctx.archival_inserted += ids.len();
        Ok(format!("Inserted {} passage(s) into archival memory.", ids.len()))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchArgs {
    /// 查询文本
    pub query: String,
    /// 页码，从 0 开始
    pub page: Option<u32>,
}

pub struct ArchivalMemorySearchTool;

#[async_trait]
impl Tool for ArchivalMemorySearchTool {
    fn name(&self) -> &str {
        "archival_memory_search"
    }

    fn description(&self) -> &str {
        "Search archival memory by semantic similarity. Results are paged."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<SearchArgs>()
    }

    async fn execute(&self, ctx: &mut ToolContext<'_>, args: Value) -> Result<String, String> {
        let args: SearchArgs = parse_args(args)?;
        let page = args.page.unwrap_or(0) as usize;
        let skip = page * SEARCH_PAGE_SIZE;
        let hits = ctx
            .archival
            .search(ctx.agent_id, &args.query, skip + SEARCH_PAGE_SIZE)
            .await
            .map_err(err_text)?;
        let results: Vec<Value> = hits
            .into_iter()
            .skip(skip)
            .map(|h| {
                serde_json::json!({
                    "timestamp": h.passage.created_at.to_rfc3339(),
                    "content": h.passage.text,
                })
            })
            .collect();
        if results.is_empty() {
            return Ok("No results found.".into());
        }
        Ok(format!(
            "Showing {} results (page {}):\n{}",
            results.len(),
            page,
            Value::Array(results)
        ))
    }
}

pub struct ConversationSearchTool;

#[async_trait]
impl Tool for ConversationSearchTool {
    fn name(&self) -> &str {
        "conversation_search"
    }

    fn description(&self) -> &str {
        "Search prior conversation history by text match. Results are paged, newest first."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<SearchArgs>()
    }

    async fn execute(&self, ctx: &mut ToolContext<'_>, args: Value) -> Result<String, String> {
        let args: SearchArgs = parse_args(args)?;
        let page = args.page.unwrap_or(0) as usize;
        let hits = ctx
            .recall
            .search_text(ctx.agent_id, &args.query, page * SEARCH_PAGE_SIZE, SEARCH_PAGE_SIZE)
            .await
            .map_err(err_text)?;
        if hits.is_empty() {
            return Ok("No results found.".into());
        }
        let results: Vec<Value> = hits
            .into_iter()
            .map(|m| {
                serde_json::json!({
                    "timestamp": m.created_at.to_rfc3339(),
                    "role": m.role.as_str(),
                    "text": m.text,
                })
            })
            .collect();
        Ok(format!(
            "Showing {} results (page {}):\n{}",
            results.len(),
            page,
            Value::Array(results)
        ))
    }
}

/// 注册全部内置工具
pub fn register_base_tools(registry: &mut ToolRegistry) -> Result<(), AgentError> {
    registry.register(Arc::new(SendMessageTool))?;
    registry.register(Arc::new(CoreMemoryAppendTool))?;
    registry.register(Arc::new(CoreMemoryReplaceTool))?;
    registry.register(Arc::new(ArchivalMemoryInsertTool))?;
    registry.register(Arc::new(ArchivalMemorySearchTool))?;
    registry.register(Arc::new(ConversationSearchTool))?;
    Ok(())
}

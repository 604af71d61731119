//! 输入打包：用户消息、系统提醒与 heartbeat 的 JSON 信封
//!
//! 模型看到的每条 user 角色输入都是一个带 type 字段的 JSON 对象，便于区分真人输入与运行时注入。

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::core::AgentError;

/// 命令前缀；以此开头的输入不作为消息处理
pub const COMMAND_PREFIX: char = '/';

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a persistent conversational agent with a long-term memory.\n\
Your core memory is shown below and is always in context; edit it with the core_memory_* functions \
when you learn something important about the user or yourself.\n\
Older conversation lives in recall memory (conversation_search) and long-term notes in archival \
memory (archival_memory_insert / archival_memory_search).\n\
The user only sees what you pass to send_message. Set request_heartbeat to true when you need \
another step after a function returns.";

pub const REASON_FUNCTION_FAILED: &str = "[This is an automated system message hidden from the user] Function call failed, returning control";
pub const REASON_HEARTBEAT: &str = "[This is an automated system message hidden from the user] Function called using request_heartbeat=true, returning control";
pub const REASON_MANUAL_HEARTBEAT: &str = "[This is an automated system message hidden from the user] Heartbeat requested by the user";
pub const TOKEN_WARNING_TEXT: &str = "[This is an automated system message hidden from the user] Warning: the conversation history will soon reach its maximum length and be trimmed. Save any important information from the conversation to your memory now.";

fn timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d %I:%M:%S %p %Z").to_string()
}

/// 校验调用方输入：非空且不是命令
pub fn validate_input(text: &str) -> Result<(), AgentError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(AgentError::Validation("message is empty".into()));
    }
    if trimmed.starts_with(COMMAND_PREFIX) {
        return Err(AgentError::Validation(
            "messages starting with '/' are commands; use run_command".into(),
        ));
    }
    Ok(())
}

pub fn package_user_message(text: &str, now: DateTime<Utc>) -> String {
    json!({
        "type": "user_message",
        "message": text,
        "time": timestamp(now),
    })
    .to_string()
}

pub fn package_system_message(text: &str, now: DateTime<Utc>) -> String {
    json!({
        "type": "system_alert",
        "message": text,
        "time": timestamp(now),
    })
    .to_string()
}

pub fn package_heartbeat(reason: &str, now: DateTime<Utc>) -> String {
    json!({
        "type": "heartbeat",
        "reason": reason,
        "time": timestamp(now),
    })
    .to_string()
}

pub fn package_token_warning(now: DateTime<Utc>) -> String {
    package_system_message(TOKEN_WARNING_TEXT, now)
}

/// 工具返回消息
pub fn package_function_response(ok: bool, output: &str, now: DateTime<Utc>) -> String {
    json!({
        "status": if ok { "OK" } else { "Failed" },
        "message": output,
        "time": timestamp(now),
    })
    .to_string()
}

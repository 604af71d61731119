//! 结构化输出解析
//!
//! 模型按约定输出 `{"thought": "...", "tool": "...", "args": {...}, "request_heartbeat": bool}`；
//! 从文本中提取 JSON（```json 代码块或首尾花括号之间），无 JSON 时整段视为内心独白。

use serde::Deserialize;
use serde_json::Value;

use crate::core::AgentError;

/// 解析后的回复
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReply {
    pub thought: String,
    /// (工具名, 参数)
    pub tool: Option<(String, Value)>,
    pub request_heartbeat: bool,
}

#[derive(Deserialize)]
struct RawReply {
    #[serde(default)]
    thought: String,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    args: Option<Value>,
    #[serde(default)]
    request_heartbeat: bool,
}

/// 解析 LLM 输出；JSON 存在但格式错误时返回 JsonParseError
pub fn parse_reply(output: &str) -> Result<ParsedReply, AgentError> {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            &trimmed[start..=end]
        } else {
            return Ok(plain(trimmed));
        }
    } else {
        return Ok(plain(trimmed));
    };

    let raw: RawReply = serde_json::from_str(json_str)
        .map_err(|e| AgentError::JsonParseError(format!("{}: {}", e, json_str)))?;

    let tool = raw
        .tool
        .filter(|t| !t.trim().is_empty())
        .map(|t| (t, raw.args.unwrap_or_else(|| Value::Object(Default::default()))));
    Ok(ParsedReply {
        thought: raw.thought,
        tool,
        request_heartbeat: raw.request_heartbeat,
    })
}

fn plain(text: &str) -> ParsedReply {
    ParsedReply {
        thought: text.to_string(),
        tool: None,
        request_heartbeat: false,
    }
}

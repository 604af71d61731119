//! JSON Schema 生成（schemars）
//!
//! - 内置工具的参数 schema 由参数结构体派生
//! - 回复格式 schema 拼入 system prompt，减少模型输出格式错误

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 模型回复格式：与 `parse_reply` 解析的结构一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ReplyFormat {
    /// 内心独白，用户不可见
    pub thought: String,
    /// 要调用的工具名；不调用工具时省略
    pub tool: Option<String>,
    /// 工具参数，须符合该工具的 parameters schema
    pub args: Option<Value>,
    /// 为 true 时工具返回后立即再获得一轮
    pub request_heartbeat: Option<bool>,
}

/// 返回回复格式的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ReplyFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}

/// 参数结构体 → JSON Schema（对象）
pub fn schema_value<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| {
        serde_json::json!({ "type": "object", "properties": {} })
    })
}

//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），注册时编译参数 schema 为校验器。
//! 运行时只按名字解析已注册的工具；用户自定义工具以 SandboxedTool 的形式注册，源码永不在进程内执行。
//! 内置工具全局共享；用户工具按 (owner, name) 存放，解析时先查 owner 自己的命名空间再查共享表。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use jsonschema::Validator;
use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

use crate::core::AgentError;
use crate::llm::ToolSchema;
use crate::memory::{ArchivalMemory, MemoryManager, RecallStore};

/// 工具执行时可访问的 agent 状态
pub struct ToolContext<'a> {
    pub agent_id: Uuid,
    pub memory: &'a mut MemoryManager,
    pub recall: &'a dyn RecallStore,
    pub archival: &'a ArchivalMemory,
    /// 本次执行新写入的归档段落数
    pub archival_inserted: usize,
}

impl<'a> ToolContext<'a> {
    pub fn new(
        agent_id: Uuid,
        memory: &'a mut MemoryManager,
        recall: &'a dyn RecallStore,
        archival: &'a ArchivalMemory,
    ) -> Self {
        Self {
            agent_id,
            memory,
            recall,
            archival,
            archival_inserted: 0,
        }
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 成功执行后是否结束本轮（如 send_message）
    fn ends_turn(&self) -> bool {
        false
    }

    /// 执行工具；Err 表示工具自身失败，由运行时转为 function_failed
    async fn execute(&self, ctx: &mut ToolContext<'_>, args: Value) -> Result<String, String>;
}

/// 已注册的工具：实现 + 参数 schema + 编译后的校验器
pub struct RegisteredTool {
    pub tool: Arc<dyn Tool>,
    pub schema: Value,
    validator: Validator,
}

impl RegisteredTool {
    pub fn name(&self) -> &str {
        self.tool.name()
    }

    /// 按 schema 校验参数，返回全部错误描述
    pub fn validate(&self, args: &Value) -> Result<(), Vec<String>> {
        let issues = self
            .validator
            .iter_errors(args)
            .map(|e| e.to_string())
            .collect::<Vec<_>>();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }

    pub fn to_schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.tool.name().to_string(),
            description: self.tool.description().to_string(),
            parameters: self.schema.clone(),
        }
    }
}

/// 工具名：字母或下划线开头，仅含字母数字下划线，最长 64
pub fn validate_tool_name(name: &str) -> Result<(), AgentError> {
    let re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$")
        .map_err(|e| AgentError::ConfigError(e.to_string()))?;
    if !re.is_match(name) {
        return Err(AgentError::Validation(format!("invalid tool name: {:?}", name)));
    }
    Ok(())
}

/// 工具注册表：共享工具按名称存储，用户工具按 (owner, name) 存储
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<RegisteredTool>>,
    owned: HashMap<(Uuid, String), Arc<RegisteredTool>>,
}

fn compile(tool: Arc<dyn Tool>) -> Result<RegisteredTool, AgentError> {
    let name = tool.name().to_string();
    validate_tool_name(&name)?;
    let schema = tool.parameters_schema();
    let validator = jsonschema::validator_for(&schema).map_err(|e| {
        AgentError::Validation(format!("invalid schema for tool '{}': {}", name, e))
    })?;
    Ok(RegisteredTool {
        tool,
        schema,
        validator,
    })
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册或替换同名共享工具；名字或 schema 非法时报错
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        let registered = compile(tool)?;
        self.tools
            .insert(registered.name().to_string(), Arc::new(registered));
        Ok(())
    }

    /// 在 owner 的命名空间内注册或替换工具，不影响其他用户的同名工具
    pub fn register_for(&mut self, owner: Uuid, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        let registered = compile(tool)?;
        self.owned
            .insert((owner, registered.name().to_string()), Arc::new(registered));
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn unregister_for(&mut self, owner: Uuid, name: &str) -> bool {
        self.owned.remove(&(owner, name.to_string())).is_some()
    }

    /// 移除 owner 的全部工具，返回移除数量
    pub fn unregister_owner(&mut self, owner: Uuid) -> usize {
        let before = self.owned.len();
        self.owned.retain(|(o, _), _| *o != owner);
        before - self.owned.len()
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredTool>> {
        self.tools.get(name).cloned()
    }

    /// 按 owner 解析：先查用户自己的工具，再查共享工具
    pub fn resolve(&self, owner: Uuid, name: &str) -> Option<Arc<RegisteredTool>> {
        self.owned
            .get(&(owner, name.to_string()))
            .or_else(|| self.tools.get(name))
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn contains_for(&self, owner: Uuid, name: &str) -> bool {
        self.resolve(owner, name).is_some()
    }

    /// 共享工具名（已排序）
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 按给定顺序生成模型可见的共享工具清单，跳过未注册的名字
    pub fn schemas(&self, names: &[String]) -> Vec<ToolSchema> {
        names
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| t.to_schema())
            .collect()
    }

    /// 同 schemas，但按 owner 的命名空间解析
    pub fn schemas_for(&self, owner: Uuid, names: &[String]) -> Vec<ToolSchema> {
        names
            .iter()
            .filter_map(|n| self.resolve(owner, n))
            .map(|t| t.to_schema())
            .collect()
    }
}

//! 用户自定义工具沙箱
//!
//! 用户工具的源码从不在本进程内执行：SandboxedTool 把调用转交给 ToolSandbox。
//! ProcessSandbox 按 source_type 选择解释器，以子进程运行源码（参数 JSON 经 stdin 传入），无 shell、带超时。
//! 未提供参数 schema 时，由沙箱从源码签名推导。

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::SandboxSection;
use crate::core::{AgentError, ToolDescriptor};
use crate::tools::{Tool, ToolContext};

/// 沙箱执行结果：error 为 Some 时表示工具失败
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxOutput {
    pub output: String,
    pub error: Option<String>,
}

#[async_trait]
pub trait ToolSandbox: Send + Sync {
    async fn run(
        &self,
        tool: &ToolDescriptor,
        args: &Value,
        timeout: Duration,
    ) -> Result<SandboxOutput, AgentError>;

    /// 从源码推导 {"name", "description", "parameters"}
    fn derive_schema(&self, source_code: &str) -> Result<Value, AgentError> {
        derive_schema_from_signature(source_code)
    }
}

/// 关闭状态的沙箱：所有用户工具调用都返回失败
#[derive(Debug, Default)]
pub struct DisabledSandbox;

#[async_trait]
impl ToolSandbox for DisabledSandbox {
    async fn run(
        &self,
        tool: &ToolDescriptor,
        _args: &Value,
        _timeout: Duration,
    ) -> Result<SandboxOutput, AgentError> {
        Ok(SandboxOutput {
            output: String::new(),
            error: Some(format!("tool sandbox is disabled; cannot run '{}'", tool.name)),
        })
    }
}

/// 子进程沙箱：`<interpreter> -c <source>`，stdin 为参数 JSON，stdout 为输出
#[derive(Debug, Clone, Default)]
pub struct ProcessSandbox {
    interpreters: HashMap<String, String>,
}

impl ProcessSandbox {
    pub fn new(interpreters: HashMap<String, String>) -> Self {
        Self { interpreters }
    }
}

#[async_trait]
impl ToolSandbox for ProcessSandbox {
    async fn run(
        &self,
        tool: &ToolDescriptor,
        args: &Value,
        timeout: Duration,
    ) -> Result<SandboxOutput, AgentError> {
        let Some(program) = self.interpreters.get(&tool.source_type) else {
            return Ok(SandboxOutput {
                output: String::new(),
                error: Some(format!("no interpreter for source type '{}'", tool.source_type)),
            });
        };
        tracing::info!(tool = %tool.name, program = %program, "sandbox tool invoke");

        let mut child = Command::new(program)
            .arg("-c")
            .arg(&tool.source_code)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::ToolExecutionFailed(format!("sandbox spawn failed: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // 子进程可能不读 stdin 就退出
            if let Err(e) = stdin.write_all(args.to_string().as_bytes()).await {
                tracing::debug!(tool = %tool.name, error = %e, "sandbox stdin closed early");
            }
        }

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| AgentError::ToolTimeout(tool.name.clone()))?
            .map_err(|e| AgentError::ToolExecutionFailed(format!("sandbox wait failed: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(SandboxOutput {
                output: stdout,
                error: Some(format!("exit {:?}: {}", output.status.code(), stderr.trim())),
            });
        }
        Ok(SandboxOutput {
            output: stdout,
            error: None,
        })
    }
}

/// 按配置构建沙箱
pub fn create_sandbox_from_config(section: &SandboxSection) -> Arc<dyn ToolSandbox> {
    if section.enabled {
        Arc::new(ProcessSandbox::new(section.interpreters.clone()))
    } else {
        Arc::new(DisabledSandbox)
    }
}

/// 由描述符构造的可注册工具；执行全部委托给沙箱
pub struct SandboxedTool {
    descriptor: ToolDescriptor,
    sandbox: Arc<dyn ToolSandbox>,
    timeout: Duration,
}

impl SandboxedTool {
    pub fn new(descriptor: ToolDescriptor, sandbox: Arc<dyn ToolSandbox>, timeout: Duration) -> Self {
        Self {
            descriptor,
            sandbox,
            timeout,
        }
    }
}

#[async_trait]
impl Tool for SandboxedTool {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn description(&self) -> &str {
        &self.descriptor.description
    }

    fn parameters_schema(&self) -> Value {
        self.descriptor.parameters()
    }

    async fn execute(&self, _ctx: &mut ToolContext<'_>, args: Value) -> Result<String, String> {
        let out = self
            .sandbox
            .run(&self.descriptor, &args, self.timeout)
            .await
            .map_err(|e| e.to_string())?;
        match out.error {
            Some(e) => Err(e),
            None => Ok(out.output),
        }
    }
}

fn json_type(annotation: &str) -> &'static str {
    match annotation.trim().trim_start_matches('&').to_ascii_lowercase().as_str() {
        "int" | "integer" | "i32" | "i64" | "u32" | "u64" | "usize" => "integer",
        "float" | "number" | "f32" | "f64" => "number",
        "bool" | "boolean" => "boolean",
        "list" | "array" => "array",
        "dict" | "object" => "object",
        _ => "string",
    }
}

/// 解析 `def|fn|function name(params)` 形式的首个签名
pub fn derive_schema_from_signature(source: &str) -> Result<Value, AgentError> {
    let re = Regex::new(r"(?:def|fn|function)\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(([^)]*)\)")
        .map_err(|e| AgentError::ConfigError(e.to_string()))?;
    let caps = re
        .captures(source)
        .ok_or_else(|| AgentError::Validation("no function signature found in source".into()))?;
    let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    let params = caps.get(2).map(|m| m.as_str()).unwrap_or_default();

    let mut properties = Map::new();
    let mut required = Vec::new();
    for raw in params.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (decl, has_default) = match raw.split_once('=') {
            Some((d, _)) => (d.trim(), true),
            None => (raw, false),
        };
        let (pname, ty) = match decl.split_once(':') {
            Some((n, t)) => (n.trim(), json_type(t)),
            None => (decl.trim(), "string"),
        };
        let pname = pname.trim_start_matches("mut ").trim();
        if pname == "self" || pname == "&self" || pname.starts_with('*') {
            continue;
        }
        properties.insert(pname.to_string(), json!({ "type": ty }));
        if !has_default {
            required.push(Value::String(pname.to_string()));
        }
    }

    Ok(json!({
        "name": name,
        "description": "",
        "parameters": {
            "type": "object",
            "properties": properties,
            "required": required,
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn descriptor(source_type: &str, source: &str) -> ToolDescriptor {
        ToolDescriptor {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "user_tool".into(),
            description: "a user tool".into(),
            source_type: source_type.into(),
            source_code: source.into(),
            json_schema: json!({"name": "user_tool", "parameters": {"type": "object", "properties": {}}}),
            tags: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_derive_python_signature() {
        let v = derive_schema_from_signature("def roll(sides: int, label: str = 'd'):\n    pass").unwrap();
        assert_eq!(v["name"], "roll");
        assert_eq!(v["parameters"]["properties"]["sides"]["type"], "integer");
        assert_eq!(v["parameters"]["properties"]["label"]["type"], "string");
        assert_eq!(v["parameters"]["required"], json!(["sides"]));
    }

    #[test]
    fn test_derive_skips_self_and_rejects_missing_signature() {
        let v = derive_schema_from_signature("def f(self, ok: bool): pass").unwrap();
        assert!(v["parameters"]["properties"].get("self").is_none());
        assert_eq!(v["parameters"]["properties"]["ok"]["type"], "boolean");
        assert!(matches!(
            derive_schema_from_signature("print('hi')"),
            Err(AgentError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_sandbox_reports_error() {
        let out = DisabledSandbox
            .run(&descriptor("python", "def f(): pass"), &json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(out.error.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_sandbox_passes_args_on_stdin() {
        let sandbox = ProcessSandbox::new(HashMap::from([("sh".to_string(), "sh".to_string())]));
        let out = sandbox
            .run(&descriptor("sh", "cat"), &json!({"x": 1}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.error, None);
        assert_eq!(out.output, r#"{"x":1}"#);

        let failed = sandbox
            .run(&descriptor("sh", "exit 3"), &json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(failed.error.unwrap().contains("exit Some(3)"));

        let unknown = sandbox
            .run(&descriptor("ruby", "puts 1"), &json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(unknown.error.is_some());
    }
}

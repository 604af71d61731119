//! 工具调用器
//!
//! invoke(tool, args)：先按 schema 校验参数（不合法直接返回 ToolArgument，工具体不执行），
//! 再在超时内执行。工具自身失败作为 Failure 结果返回而非错误；超时返回 ToolTimeout。
//! 每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::tools::{RegisteredTool, ToolContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Success,
    Failure,
}

/// 执行结果分类；ends_turn 为工具请求结束本轮的专用标志
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolOutcome {
    pub status: ToolStatus,
    pub ends_turn: bool,
}

#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub output: String,
    pub outcome: ToolOutcome,
}

impl ToolInvocation {
    pub fn succeeded(&self) -> bool {
        self.outcome.status == ToolStatus::Success
    }
}

/// 工具调用器：对每次调用施加超时
#[derive(Debug, Clone)]
pub struct ToolInvoker {
    timeout: Duration,
}

impl ToolInvoker {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn invoke(
        &self,
        tool: &RegisteredTool,
        ctx: &mut ToolContext<'_>,
        args: Value,
    ) -> Result<ToolInvocation, AgentError> {
        let start = Instant::now();
        let preview = args_preview(&args);

        if let Err(issues) = tool.validate(&args) {
            audit(tool.name(), "invalid_args", start, &preview);
            return Err(AgentError::ToolArgument {
                tool: tool.name().to_string(),
                reason: issues.join("; "),
            });
        }

        let result = timeout(self.timeout, tool.tool.execute(ctx, args)).await;
        let outcome = match &result {
            Ok(Ok(_)) => "ok",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };
        audit(tool.name(), outcome, start, &preview);

        match result {
            Ok(Ok(output)) => Ok(ToolInvocation {
                output,
                outcome: ToolOutcome {
                    status: ToolStatus::Success,
                    ends_turn: tool.tool.ends_turn(),
                },
            }),
            Ok(Err(e)) => Ok(ToolInvocation {
                output: e,
                outcome: ToolOutcome {
                    status: ToolStatus::Failure,
                    ends_turn: false,
                },
            }),
            Err(_) => Err(AgentError::ToolTimeout(tool.name().to_string())),
        }
    }
}

/// 解析模型给出的参数字符串；必须是 JSON 对象
pub fn parse_arguments(tool: &str, raw: &str) -> Result<Value, AgentError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ Value::Object(_)) => Ok(v),
        Ok(_) => Err(AgentError::ToolArgument {
            tool: tool.to_string(),
            reason: "arguments must be a JSON object".into(),
        }),
        Err(e) => Err(AgentError::ToolArgument {
            tool: tool.to_string(),
            reason: format!("invalid JSON: {}", e),
        }),
    }
}

/// 取出并移除 request_heartbeat 参数
pub fn take_heartbeat(args: &mut Value) -> bool {
    args.as_object_mut()
        .and_then(|m| m.remove("request_heartbeat"))
        .map(|v| match v {
            Value::Bool(b) => b,
            Value::String(s) => s.eq_ignore_ascii_case("true"),
            _ => false,
        })
        .unwrap_or(false)
}

fn audit(tool: &str, outcome: &str, start: Instant, args_preview: &str) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": tool,
        "ok": outcome == "ok",
        "outcome": outcome,
        "duration_ms": start.elapsed().as_millis() as u64,
        "args_preview": args_preview,
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    use crate::llm::HashEmbedder;
    use crate::memory::{
        ArchivalMemory, Chunker, InMemoryPassageStore, InMemoryRecallStore, Memory, MemoryManager,
        TokenBudget,
    };
    use crate::tools::{Tool, ToolRegistry};

    struct Counting {
        runs: Arc<AtomicUsize>,
        fail: bool,
        sleep: Option<Duration>,
    }

    #[async_trait]
    impl Tool for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        fn description(&self) -> &str {
            "counts runs"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "n": { "type": "integer" } },
                "required": ["n"]
            })
        }
        async fn execute(&self, _ctx: &mut ToolContext<'_>, _args: Value) -> Result<String, String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.sleep {
                tokio::time::sleep(d).await;
            }
            if self.fail {
                Err("it broke".into())
            } else {
                Ok("done".into())
            }
        }
    }

    struct Fixture {
        memory: MemoryManager,
        recall: InMemoryRecallStore,
        archival: ArchivalMemory,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                memory: MemoryManager::new("sys", Memory::new(), TokenBudget::default()),
                recall: InMemoryRecallStore::new(),
                archival: ArchivalMemory::new(
                    Arc::new(InMemoryPassageStore::new()),
                    Arc::new(HashEmbedder::new(16)),
                    Chunker::default(),
                ),
            }
        }

        fn ctx(&mut self) -> ToolContext<'_> {
            ToolContext::new(Uuid::new_v4(), &mut self.memory, &self.recall, &self.archival)
        }
    }

    fn registered(tool: Counting) -> Arc<RegisteredTool> {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(tool)).unwrap();
        reg.get("counting").unwrap()
    }

    #[tokio::test]
    async fn test_schema_violation_never_runs_body() {
        let runs = Arc::new(AtomicUsize::new(0));
        let tool = registered(Counting { runs: runs.clone(), fail: false, sleep: None });
        let mut fx = Fixture::new();
        let err = ToolInvoker::new(5)
            .invoke(&tool, &mut fx.ctx(), json!({"n": "not a number"}))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolArgument { .. }));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_is_returned_not_raised() {
        let runs = Arc::new(AtomicUsize::new(0));
        let tool = registered(Counting { runs: runs.clone(), fail: true, sleep: None });
        let mut fx = Fixture::new();
        let inv = ToolInvoker::new(5)
            .invoke(&tool, &mut fx.ctx(), json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(inv.outcome.status, ToolStatus::Failure);
        assert_eq!(inv.output, "it broke");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_propagates() {
        let runs = Arc::new(AtomicUsize::new(0));
        let tool = registered(Counting {
            runs,
            fail: false,
            sleep: Some(Duration::from_millis(200)),
        });
        let mut fx = Fixture::new();
        let err = ToolInvoker::with_timeout(Duration::from_millis(20))
            .invoke(&tool, &mut fx.ctx(), json!({"n": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolTimeout(_)));
    }

    #[test]
    fn test_parse_arguments() {
        assert!(parse_arguments("t", r#"{"a": 1}"#).is_ok());
        assert!(parse_arguments("t", "").unwrap().is_object());
        assert!(matches!(
            parse_arguments("t", "[1, 2]"),
            Err(AgentError::ToolArgument { .. })
        ));
        assert!(matches!(
            parse_arguments("t", "{oops"),
            Err(AgentError::ToolArgument { .. })
        ));
    }

    #[test]
    fn test_take_heartbeat_strips_flag() {
        let mut args = json!({"message": "hi", "request_heartbeat": true});
        assert!(take_heartbeat(&mut args));
        assert!(args.get("request_heartbeat").is_none());
        let mut args = json!({"message": "hi"});
        assert!(!take_heartbeat(&mut args));
    }
}

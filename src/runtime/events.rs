//! 执行事件与回调接口
//!
//! AgentInterface 是运行时向调用方推送进度的唯一出口：每条新消息、每轮结束（step_complete）、
//! 整次链式执行结束（step_yield）。step_yield 由 YieldGuard 在 Drop 时触发，无论正常返回还是出错都恰好一次。

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::core::UsageStatistics;
use crate::memory::{Message, Role};
use crate::runtime::{ChainState, NextInput};

/// 可序列化为 JSON 的执行事件（流式调用方逐条接收）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 第几轮开始，以及本轮输入的来源
    StepStart { step: u32, input: NextInput },
    /// 模型内心独白
    InternalMonologue { message_id: Uuid, text: String },
    /// 流式文本片段
    TextChunk { text: String },
    FunctionCall {
        message_id: Uuid,
        name: String,
        arguments: String,
    },
    FunctionReturn {
        message_id: Uuid,
        ok: bool,
        output: String,
    },
    /// 其它新消息（用户输入、heartbeat、系统提醒）
    Message { message: Message },
    /// 下一轮由 heartbeat 驱动
    Heartbeat { reason: NextInput },
    StepComplete { step: u32, state: ChainState },
    Usage { usage: UsageStatistics },
    Error { kind: String, text: String },
    /// 整次执行结束
    Done,
}

impl AgentEvent {
    /// 把一条持久化的消息转换为事件
    pub fn from_message(message: &Message) -> Self {
        match (message.role, &message.tool_call) {
            (Role::Assistant, Some(call)) => AgentEvent::FunctionCall {
                message_id: message.id,
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
            (Role::Assistant, None) => AgentEvent::InternalMonologue {
                message_id: message.id,
                text: message.text.clone(),
            },
            (Role::Tool, _) => {
                let ok = serde_json::from_str::<serde_json::Value>(&message.text)
                    .ok()
                    .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(|s| s == "OK"))
                    .unwrap_or(true);
                AgentEvent::FunctionReturn {
                    message_id: message.id,
                    ok,
                    output: message.text.clone(),
                }
            }
            _ => AgentEvent::Message {
                message: message.clone(),
            },
        }
    }
}

/// 运行时回调接口（同步，不得阻塞）
pub trait AgentInterface: Send + Sync {
    fn on_event(&self, event: AgentEvent);

    /// 每轮成功结束后调用
    fn step_complete(&self, step: u32, state: ChainState) {
        self.on_event(AgentEvent::StepComplete { step, state });
    }

    /// 整次执行结束时调用，恰好一次
    fn step_yield(&self) {
        self.on_event(AgentEvent::Done);
    }
}

/// 丢弃所有事件
#[derive(Debug, Default)]
pub struct NoopInterface;

impl AgentInterface for NoopInterface {
    fn on_event(&self, _event: AgentEvent) {}
}

/// 通过 mpsc 推送事件；接收端关闭后静默丢弃
#[derive(Debug, Clone)]
pub struct ChannelInterface {
    tx: UnboundedSender<AgentEvent>,
}

impl ChannelInterface {
    pub fn new(tx: UnboundedSender<AgentEvent>) -> Self {
        Self { tx }
    }
}

impl AgentInterface for ChannelInterface {
    fn on_event(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }
}

/// Drop 时调用 step_yield
pub struct YieldGuard<'a> {
    interface: &'a dyn AgentInterface,
}

impl<'a> YieldGuard<'a> {
    pub fn new(interface: &'a dyn AgentInterface) -> Self {
        Self { interface }
    }
}

impl Drop for YieldGuard<'_> {
    fn drop(&mut self) {
        self.interface.step_yield();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<AgentEvent>>);

    impl AgentInterface for Recorder {
        fn on_event(&self, event: AgentEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn test_yield_guard_fires_once_on_early_return() {
        fn fallible(interface: &dyn AgentInterface) -> Result<(), String> {
            let _guard = YieldGuard::new(interface);
            Err("boom".into())
        }
        let rec = Recorder::default();
        assert!(fallible(&rec).is_err());
        let events = rec.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], AgentEvent::Done));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let ev = AgentEvent::StepComplete {
            step: 2,
            state: ChainState::Running(NextInput::Heartbeat),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "step_complete");
        assert_eq!(v["state"]["state"], "running");
        assert_eq!(v["state"]["next"], "heartbeat");
    }

    #[test]
    fn test_from_message_classifies_roles() {
        let agent = Uuid::new_v4();
        let call = crate::memory::ToolCall {
            id: "c1".into(),
            name: "send_message".into(),
            arguments: "{}".into(),
        };
        let m = Message::assistant(agent, "thinking").with_tool_call(call);
        assert!(matches!(AgentEvent::from_message(&m), AgentEvent::FunctionCall { .. }));
        let t = Message::tool(agent, "c1", r#"{"status":"Failed","message":"x"}"#);
        assert!(matches!(
            AgentEvent::from_message(&t),
            AgentEvent::FunctionReturn { ok: false, .. }
        ));
        let u = Message::user(agent, "hi");
        assert!(matches!(AgentEvent::from_message(&u), AgentEvent::Message { .. }));
    }

    #[tokio::test]
    async fn test_channel_interface_survives_closed_receiver() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        ChannelInterface::new(tx).on_event(AgentEvent::Done);
    }
}

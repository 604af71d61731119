//! 链式执行状态机（纯函数，无 I/O）
//!
//! 每轮结束后由 `transition` 根据本轮信号决定：继续（并给出下一轮输入的种类）、YIELDED 或 EXHAUSTED。
//! 判定顺序：关闭链式 → 步数上限 → token_warning → function_failed → heartbeat → YIELDED。

use serde::Serialize;

use crate::config::RuntimeSection;

/// 链式策略：是否允许多轮、可选的步数上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainPolicy {
    pub chaining: bool,
    pub max_steps: Option<u32>,
}

impl Default for ChainPolicy {
    fn default() -> Self {
        Self::from(&RuntimeSection::default())
    }
}

impl From<&RuntimeSection> for ChainPolicy {
    fn from(s: &RuntimeSection) -> Self {
        Self {
            chaining: s.chaining,
            max_steps: s.max_chaining_steps,
        }
    }
}

/// 单轮产生的信号
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepSignals {
    pub heartbeat_requested: bool,
    pub function_failed: bool,
    pub token_warning: bool,
}

/// 下一轮的输入来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NextInput {
    /// 调用方消息（仅首轮）
    Caller,
    TokenWarning,
    FunctionFailed,
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "next", rename_all = "snake_case")]
pub enum ChainState {
    Running(NextInput),
    /// 正常结束
    Yielded,
    /// 触及步数上限
    Exhausted,
}

impl ChainState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChainState::Running(_))
    }
}

/// `steps` 为已完成的轮数（含刚结束的这一轮）
pub fn transition(policy: &ChainPolicy, steps: u32, signals: StepSignals) -> ChainState {
    if !policy.chaining {
        return ChainState::Yielded;
    }
    if let Some(max) = policy.max_steps {
        if steps > max {
            return ChainState::Exhausted;
        }
    }
    if signals.token_warning {
        ChainState::Running(NextInput::TokenWarning)
    } else if signals.function_failed {
        ChainState::Running(NextInput::FunctionFailed)
    } else if signals.heartbeat_requested {
        ChainState::Running(NextInput::Heartbeat)
    } else {
        ChainState::Yielded
    }
}

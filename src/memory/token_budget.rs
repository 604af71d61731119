//! Token 预算控制
//!
//! 上下文窗口由 system prompt（核心记忆）与对话历史共享：
//! system prompt 不得超过 `system_prompt_budget`，整体估算超过 `warning_threshold` 时触发 token_warning。

use crate::core::AgentError;
use crate::memory::Message;

/// 每条消息的固定开销（角色、分隔符等）
const PER_MESSAGE_OVERHEAD: usize = 4;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    /// 使用简单的启发式规则：英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// 估算整段上下文（含工具调用参数）
    pub fn estimate_messages(messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| {
                let call = m
                    .tool_call
                    .as_ref()
                    .map(|c| Self::estimate(&c.name) + Self::estimate(&c.arguments))
                    .unwrap_or(0);
                Self::estimate(&m.text) + call + PER_MESSAGE_OVERHEAD
            })
            .sum()
    }
}

/// Token 预算管理器
#[derive(Debug, Clone)]
pub struct TokenBudget {
    /// 模型上下文窗口
    total_budget: usize,
    /// 对话历史预留 token 数
    conversation_reserve: usize,
    /// 超过 total_budget 的该比例即告警
    warning_fraction: f64,
}

impl TokenBudget {
    pub fn new(total_budget: usize) -> Self {
        Self {
            total_budget,
            conversation_reserve: total_budget / 3, // 预留 1/3 给对话历史
            warning_fraction: 0.75,
        }
    }

    pub fn with_conversation_reserve(mut self, reserve: usize) -> Self {
        self.conversation_reserve = reserve;
        self
    }

    pub fn with_warning_fraction(mut self, fraction: f64) -> Self {
        self.warning_fraction = fraction;
        self
    }

    /// 系统提示词的可用预算（总预算减去对话预留）
    pub fn system_prompt_budget(&self) -> usize {
        self.total_budget.saturating_sub(self.conversation_reserve)
    }

    pub fn warning_threshold(&self) -> usize {
        (self.total_budget as f64 * self.warning_fraction) as usize
    }

    pub fn is_warning(&self, used_tokens: usize) -> bool {
        used_tokens > self.warning_threshold()
    }

    /// 校验编译后的 system prompt；超出预算返回 ContextWindowExceeded
    pub fn check_system_prompt(&self, prompt: &str) -> Result<usize, AgentError> {
        let used = TokenEstimator::estimate(prompt);
        let limit = self.system_prompt_budget();
        if used > limit {
            return Err(AgentError::ContextWindowExceeded { used, limit });
        }
        Ok(used)
    }

    pub fn total_budget(&self) -> usize {
        self.total_budget
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::new(8192)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_token_estimator_english() {
        let text = "Hello, world! This is a test.";
        let tokens = TokenEstimator::estimate(text);
        assert!(tokens > 0);
        assert!(tokens < text.len()); // 应该少于字符数
    }

    #[test]
    fn test_token_estimator_chinese() {
        let text = "你好世界，这是一个测试。";
        let tokens = TokenEstimator::estimate(text);
        assert!(tokens > 0);
    }

    #[test]
    fn test_estimate_messages_adds_overhead() {
        let agent = Uuid::new_v4();
        let msgs = vec![Message::user(agent, "abcd"), Message::assistant(agent, "abcd")];
        assert_eq!(TokenEstimator::estimate_messages(&msgs), 2 * (1 + PER_MESSAGE_OVERHEAD));
    }

    #[test]
    fn test_system_prompt_budget() {
        let budget = TokenBudget::new(90).with_conversation_reserve(30);
        assert_eq!(budget.system_prompt_budget(), 60);
        assert!(budget.check_system_prompt("short").is_ok());
        let long = "x".repeat(4 * 61);
        assert!(matches!(
            budget.check_system_prompt(&long),
            Err(AgentError::ContextWindowExceeded { used: 61, limit: 60 })
        ));
    }

    #[test]
    fn test_warning_threshold() {
        let budget = TokenBudget::new(1000).with_warning_fraction(0.75);
        assert!(!budget.is_warning(750));
        assert!(budget.is_warning(751));
    }
}

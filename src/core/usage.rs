//! 用量统计：一次链式执行内跨轮次累加

use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

use crate::llm::ModelUsage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStatistics {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub step_count: u32,
}

impl UsageStatistics {
    /// 记入一轮模型调用
    pub fn record_step(&mut self, usage: ModelUsage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.total_tokens += usage.prompt_tokens + usage.completion_tokens;
        self.step_count += 1;
    }
}

impl AddAssign for UsageStatistics {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
        self.total_tokens += rhs.total_tokens;
        self.step_count += rhs.step_count;
    }
}

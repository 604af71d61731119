//! 核心记忆：有序的命名记忆块（persona / human 等），每块带字符数上限
//!
//! 不变式：任一块 value 的字符数 ≤ limit。Memory 只经 MemoryManager 修改。

use serde::{Deserialize, Serialize};

use crate::core::AgentError;

/// 单个记忆块
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    pub value: String,
    /// 字符数上限
    pub limit: usize,
}

impl Block {
    pub fn new(name: impl Into<String>, value: impl Into<String>, limit: usize) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.value.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// 按插入顺序保存的记忆块集合
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    blocks: Vec<Block>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新增记忆块；重名或初始值超限时报错
    pub fn with_block(mut self, block: Block) -> Result<Self, AgentError> {
        if self.get(&block.name).is_some() {
            return Err(AgentError::Validation(format!(
                "duplicate memory block: {}",
                block.name
            )));
        }
        check_limit(&block.name, &block.value, block.limit)?;
        self.blocks.push(block);
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.name == name)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn names(&self) -> Vec<String> {
        self.blocks.iter().map(|b| b.name.clone()).collect()
    }

    /// 检查更新是否合法，不修改任何状态
    pub fn check_update(&self, name: &str, value: &str) -> Result<(), AgentError> {
        let block = self
            .get(name)
            .ok_or_else(|| AgentError::UnknownBlock(name.to_string()))?;
        check_limit(name, value, block.limit)
    }

    /// 写入新值并返回旧值；失败时块保持不变
    pub(crate) fn set(&mut self, name: &str, value: String) -> Result<String, AgentError> {
        self.check_update(name, &value)?;
        let block = self
            .blocks
            .iter_mut()
            .find(|b| b.name == name)
            .ok_or_else(|| AgentError::UnknownBlock(name.to_string()))?;
        Ok(std::mem::replace(&mut block.value, value))
    }
}

fn check_limit(name: &str, value: &str, limit: usize) -> Result<(), AgentError> {
    let len = value.chars().count();
    if len > limit {
        return Err(AgentError::BlockLimitExceeded {
            name: name.to_string(),
            len,
            limit,
        });
    }
    Ok(())
}

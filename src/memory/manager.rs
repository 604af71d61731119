//! MemoryManager：核心记忆的唯一修改入口，负责重建上下文中的 system prompt
//!
//! 任一块发生实际变化都会自动触发 rebuild；值未变化时视为幂等，不重建。
//! rebuild 产出的新 prompt 通过 `take_pending_system` 交给 Agent，由其改写窗口首条 system 消息并持久化。

use chrono::Utc;

use crate::core::AgentError;
use crate::memory::{Memory, TokenBudget};

/// 分层记忆管理：Memory + system 模板 + recall/archival 规模摘要
#[derive(Debug, Clone)]
pub struct MemoryManager {
    memory: Memory,
    system_template: String,
    budget: TokenBudget,
    compiled: String,
    /// 自上次 rebuild 以来块是否有变化
    dirty: bool,
    /// rebuild 后尚未同步到 system 消息的 prompt
    pending_system: Option<String>,
    rebuild_count: u64,
    recall_size: usize,
    archival_size: usize,
}

impl MemoryManager {
    pub fn new(system_template: impl Into<String>, memory: Memory, budget: TokenBudget) -> Self {
        Self {
            memory,
            system_template: system_template.into(),
            budget,
            compiled: String::new(),
            dirty: true,
            pending_system: None,
            rebuild_count: 0,
            recall_size: 0,
            archival_size: 0,
        }
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn system_template(&self) -> &str {
        &self.system_template
    }

    pub fn get_block(&self, name: &str) -> Option<&str> {
        self.memory.get(name).map(|b| b.value.as_str())
    }

    /// 覆盖写入块；返回是否发生变化。变化时自动 rebuild，rebuild 失败则回滚该块
    pub fn update_block(&mut self, name: &str, value: impl Into<String>) -> Result<bool, AgentError> {
        let value = value.into();
        self.memory.check_update(name, &value)?;
        if self.get_block(name) == Some(value.as_str()) {
            tracing::debug!(block = name, "core memory unchanged, rebuild skipped");
            return Ok(false);
        }

        let was_dirty = self.dirty;
        let previous = self.memory.set(name, value)?;
        self.dirty = true;
        if let Err(e) = self.rebuild(false) {
            // 回滚：恢复旧值后块仍满足上限
            self.memory.set(name, previous)?;
            self.dirty = was_dirty;
            return Err(e);
        }
        Ok(true)
    }

    /// 批量覆盖写入：全部校验通过后统一 rebuild 一次；任何一步失败都整体恢复到调用前
    pub fn update_blocks<'a, I>(&mut self, updates: I) -> Result<bool, AgentError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let snapshot = self.clone();
        let result = self.apply_blocks(updates.into_iter().collect());
        if result.is_err() {
            *self = snapshot;
        }
        result
    }

    fn apply_blocks(&mut self, updates: Vec<(&str, &str)>) -> Result<bool, AgentError> {
        for (name, value) in &updates {
            self.memory.check_update(name, value)?;
        }
        let mut changed = false;
        for (name, value) in updates {
            if self.get_block(name) != Some(value) {
                self.memory.set(name, value.to_string())?;
                changed = true;
            }
        }
        if !changed {
            tracing::debug!("core memory batch unchanged, rebuild skipped");
            return Ok(false);
        }
        self.dirty = true;
        self.rebuild(false)?;
        Ok(true)
    }

    /// 在块末尾追加一行
    pub fn append_block(&mut self, name: &str, content: &str) -> Result<bool, AgentError> {
        let current = self
            .get_block(name)
            .ok_or_else(|| AgentError::UnknownBlock(name.to_string()))?;
        let next = if current.is_empty() {
            content.to_string()
        } else {
            format!("{}\n{}", current, content)
        };
        self.update_block(name, next)
    }

    /// 将块中 old 的首次出现替换为 new；old 不存在时报 Validation
    pub fn replace_in_block(&mut self, name: &str, old: &str, new: &str) -> Result<bool, AgentError> {
        let current = self
            .get_block(name)
            .ok_or_else(|| AgentError::UnknownBlock(name.to_string()))?;
        if old.is_empty() || !current.contains(old) {
            return Err(AgentError::Validation(format!(
                "content not found in block '{}'",
                name
            )));
        }
        let next = current.replacen(old, new, 1);
        self.update_block(name, next)
    }

    /// 更新 system 模板（强制 rebuild）
    pub fn set_system_template(&mut self, template: impl Into<String>) -> Result<(), AgentError> {
        let previous = std::mem::replace(&mut self.system_template, template.into());
        if let Err(e) = self.rebuild(true) {
            self.system_template = previous;
            return Err(e);
        }
        Ok(())
    }

    /// 记录 recall / archival 规模，在下一次 rebuild 时写入摘要
    pub fn set_store_sizes(&mut self, recall_size: usize, archival_size: usize) {
        self.recall_size = recall_size;
        self.archival_size = archival_size;
    }

    /// 重新编译 system prompt；未变化且非 force 时为 no-op，返回是否实际重建
    pub fn rebuild(&mut self, force: bool) -> Result<bool, AgentError> {
        if !self.dirty && !force {
            return Ok(false);
        }
        let compiled = self.compile();
        self.budget.check_system_prompt(&compiled)?;

        self.compiled = compiled.clone();
        self.pending_system = Some(compiled);
        self.dirty = false;
        self.rebuild_count += 1;
        tracing::debug!(rebuild_count = self.rebuild_count, "system prompt rebuilt");
        Ok(true)
    }

    /// 取走待同步的 system prompt（每次 rebuild 至多取一次）
    pub fn take_pending_system(&mut self) -> Option<String> {
        self.pending_system.take()
    }

    pub fn compiled(&self) -> &str {
        &self.compiled
    }

    pub fn rebuild_count(&self) -> u64 {
        self.rebuild_count
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    fn compile(&self) -> String {
        let mut out = String::with_capacity(self.system_template.len() + 512);
        out.push_str(self.system_template.trim_end());
        out.push_str("\n\n");
        out.push_str(&format!(
            "### Memory [last modified: {}]\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S %Z")
        ));
        out.push_str(&format!(
            "{} previous messages between you and the user are stored in recall memory (use functions to access them)\n",
            self.recall_size
        ));
        out.push_str(&format!(
            "{} total memories you created are stored in archival memory (use functions to access them)\n",
            self.archival_size
        ));
        out.push_str("\nCore memory shown below (limited in size, additional information stored in archival / recall memory):\n");
        for block in self.memory.blocks() {
            out.push_str(&format!(
                "<{name} characters=\"{len}/{limit}\">\n{value}\n</{name}>\n",
                name = block.name,
                len = block.len(),
                limit = block.limit,
                value = block.value
            ));
        }
        out
    }
}

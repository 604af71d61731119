//! Agent：一个活动 agent 的执行体
//!
//! 持有 AgentState、MemoryManager 与上下文窗口（首条为 system 消息，其余为 recall 日志的严格后缀）。
//! - `step`：一轮模型调用 + 可选工具调用，本轮新消息作为一个提交单元写入 recall
//! - `run_chain`：按 `transition` 驱动多轮，轮与轮之间检查取消；结束时 step_yield 恰好触发一次
//! - `page`：倒序分页，窗口能覆盖时直接切片，否则走 recall 存储，两条路径结果一致
//! - rethink / rewrite / pop / retry 等命令与核心记忆编辑
//!
//! 消息时间戳来自 per-agent 单调时钟（微秒精度，与 SQLite 存储一致），保证窗口顺序与存储顺序不分叉。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RuntimeSection;
use crate::core::{AgentError, AgentState, UsageStatistics};
use crate::llm::{ModelBackend, ModelChunk, ModelRequest, ModelResponse, ModelUsage};
use crate::memory::{
    ArchivalMemory, Memory, MemoryManager, Message, Passage, PassageScope, RecallStore, Role,
    TokenBudget, TokenEstimator, ToolCall,
};
use crate::runtime::system::{
    package_function_response, package_heartbeat, package_token_warning, package_user_message,
    REASON_FUNCTION_FAILED, REASON_HEARTBEAT, REASON_MANUAL_HEARTBEAT,
};
use crate::runtime::{
    transition, AgentEvent, AgentInterface, ChainPolicy, ChainState, NextInput, StepSignals,
    YieldGuard,
};
use crate::tools::{parse_arguments, take_heartbeat, ToolContext, ToolInvoker, ToolRegistry};

/// /pop 默认弹出条数
pub const DEFAULT_POP_COUNT: usize = 3;
/// pop 之后窗口至少保留的消息数（system + 1）
const MIN_IN_CONTEXT: usize = 2;

/// 执行一轮所需的共享依赖
#[derive(Clone)]
pub struct AgentDeps {
    pub model: Arc<dyn ModelBackend>,
    pub tools: Arc<RwLock<ToolRegistry>>,
    pub invoker: ToolInvoker,
    pub policy: ChainPolicy,
    /// 使用 complete_stream 并推送 TextChunk
    pub stream: bool,
}

/// 单轮结果
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub messages: Vec<Message>,
    pub signals: StepSignals,
    pub usage: ModelUsage,
}

/// 一次链式执行的结果
#[derive(Debug, Clone)]
pub struct ChainResult {
    pub messages: Vec<Message>,
    pub usage: UsageStatistics,
    pub final_state: ChainState,
}

pub struct Agent {
    state: AgentState,
    manager: MemoryManager,
    window: Vec<Message>,
    recall: Arc<dyn RecallStore>,
    archival: ArchivalMemory,
    recall_len: usize,
    archival_len: usize,
    last_stamp: DateTime<Utc>,
    max_in_context: usize,
}

fn budget_for(state: &AgentState, runtime: &RuntimeSection) -> TokenBudget {
    TokenBudget::new(state.llm_config.context_window)
        .with_warning_fraction(runtime.token_warning_fraction)
}

fn truncate_micros(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(t.timestamp_micros()).unwrap_or(t)
}

impl Agent {
    /// 新建 agent：强制 rebuild，并把首条 system 消息写入 recall
    pub async fn create(
        mut state: AgentState,
        recall: Arc<dyn RecallStore>,
        archival: ArchivalMemory,
        runtime: &RuntimeSection,
    ) -> Result<Self, AgentError> {
        state.message_ids.clear();
        let mut manager =
            MemoryManager::new(state.system.clone(), state.memory.clone(), budget_for(&state, runtime));
        let archival_len = archival.store().size(state.id).await?;
        manager.set_store_sizes(0, archival_len);
        manager.rebuild(true)?;
        let prompt = manager.take_pending_system().unwrap_or_default();

        let mut agent = Self {
            window: Vec::new(),
            recall,
            archival,
            recall_len: 0,
            archival_len,
            last_stamp: DateTime::<Utc>::MIN_UTC,
            max_in_context: runtime.max_in_context_messages.max(MIN_IN_CONTEXT),
            manager,
            state,
        };
        let system = agent.stamped(Message::system(agent.state.id, prompt));
        agent.persist(vec![system]).await?;
        tracing::info!(agent_id = %agent.state.id, name = %agent.state.name, "agent created");
        Ok(agent)
    }

    /// 从持久状态恢复：按 message_ids 取回窗口，重建 system prompt
    pub async fn load(
        state: AgentState,
        recall: Arc<dyn RecallStore>,
        archival: ArchivalMemory,
        runtime: &RuntimeSection,
    ) -> Result<Self, AgentError> {
        let window = recall.get_many(state.id, &state.message_ids).await?;
        if window.first().map(|m| m.role) != Some(Role::System) {
            return Err(AgentError::Storage(format!(
                "agent {} has no system message in context",
                state.id
            )));
        }
        if window.len() != state.message_ids.len() {
            tracing::warn!(
                agent_id = %state.id,
                expected = state.message_ids.len(),
                found = window.len(),
                "in-context messages missing from recall"
            );
        }
        let recall_len = recall.size(state.id).await?;
        let archival_len = archival.store().size(state.id).await?;
        let newest = recall
            .page_desc(state.id, 0, 1)
            .await?
            .first()
            .map(|m| m.created_at)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let manager =
            MemoryManager::new(state.system.clone(), state.memory.clone(), budget_for(&state, runtime));
        let mut agent = Self {
            window,
            recall,
            archival,
            recall_len,
            archival_len,
            last_stamp: newest,
            max_in_context: runtime.max_in_context_messages.max(MIN_IN_CONTEXT),
            manager,
            state,
        };
        agent.state.message_ids = agent.window.iter().map(|m| m.id).collect();
        agent.refresh_system(true).await?;
        Ok(agent)
    }

    pub fn id(&self) -> Uuid {
        self.state.id
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn in_context_messages(&self) -> &[Message] {
        &self.window
    }

    pub fn memory(&self) -> &Memory {
        self.manager.memory()
    }

    pub fn memory_manager(&self) -> &MemoryManager {
        &self.manager
    }

    pub fn get_block(&self, name: &str) -> Result<&str, AgentError> {
        self.manager
            .get_block(name)
            .ok_or_else(|| AgentError::UnknownBlock(name.to_string()))
    }

    pub fn recall_size(&self) -> usize {
        self.recall_len
    }

    pub fn archival_size(&self) -> usize {
        self.archival_len
    }

    pub fn recall(&self) -> &Arc<dyn RecallStore> {
        &self.recall
    }

    pub fn archival(&self) -> &ArchivalMemory {
        &self.archival
    }

    fn stamp(&mut self) -> DateTime<Utc> {
        let now = truncate_micros(Utc::now());
        let next = if now > self.last_stamp {
            now
        } else {
            self.last_stamp + Duration::microseconds(1)
        };
        self.last_stamp = next;
        next
    }

    fn stamped(&mut self, message: Message) -> Message {
        let at = self.stamp();
        message.with_created_at(at)
    }

    /// 同步 AgentState 中的核心记忆
    fn commit_memory(&mut self) {
        self.state.memory = self.manager.memory().clone();
    }

    /// 把待同步的 system prompt 写回窗口首条并持久化
    async fn sync_system_message(&mut self) -> Result<(), AgentError> {
        let Some(prompt) = self.manager.take_pending_system() else {
            return Ok(());
        };
        let system = self
            .window
            .first_mut()
            .ok_or_else(|| AgentError::Storage("context window is empty".into()))?;
        system.text = prompt;
        let system = system.clone();
        self.recall.update(&system).await?;
        self.commit_memory();
        Ok(())
    }

    /// 更新 recall / archival 规模后重建 system prompt
    async fn refresh_system(&mut self, force: bool) -> Result<(), AgentError> {
        self.manager.set_store_sizes(self.recall_len, self.archival_len);
        self.manager.rebuild(force)?;
        self.sync_system_message().await
    }

    /// 追加到 recall 并扩展窗口；超出上限时淘汰最旧的非 system 消息
    async fn persist(&mut self, messages: Vec<Message>) -> Result<(), AgentError> {
        if messages.is_empty() {
            return Ok(());
        }
        self.recall.append(&messages).await?;
        self.recall_len += messages.len();
        self.state.message_ids.extend(messages.iter().map(|m| m.id));
        self.window.extend(messages);

        if self.window.len() > self.max_in_context {
            let excess = self.window.len() - self.max_in_context;
            self.window.drain(1..1 + excess);
            self.state.message_ids = self.window.iter().map(|m| m.id).collect();
            tracing::info!(agent_id = %self.state.id, evicted = excess, "context window trimmed");
            self.refresh_system(true).await?;
        }
        Ok(())
    }

    /// 窗口中与 recall 日志尾部连续一致的消息数
    fn contiguous_buffer_len(&self) -> usize {
        if self.window.len() == self.recall_len {
            self.window.len()
        } else {
            self.window.len().saturating_sub(1)
        }
    }

    /// 倒序分页：start 为距最新一条的偏移，count 为页大小
    pub async fn page(&self, start: i64, count: i64) -> Result<Vec<Message>, AgentError> {
        if start < 0 || count < 0 {
            return Err(AgentError::InvalidRange { start, count });
        }
        let (start, count) = (start as usize, count as usize);
        if start + count <= self.contiguous_buffer_len() {
            return Ok(self
                .window
                .iter()
                .rev()
                .skip(start)
                .take(count)
                .cloned()
                .collect());
        }
        let mut messages = self.recall.page_desc(self.state.id, start, count).await?;
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(messages)
    }

    async fn call_model(
        &self,
        request: ModelRequest<'_>,
        deps: &AgentDeps,
        interface: &dyn AgentInterface,
    ) -> Result<ModelResponse, AgentError> {
        if !deps.stream {
            return deps.model.complete(request).await;
        }
        let mut stream = deps.model.complete_stream(request).await?;
        while let Some(chunk) = stream.next().await {
            match chunk? {
                ModelChunk::Text(text) => interface.on_event(AgentEvent::TextChunk { text }),
                ModelChunk::Done(response) => return Ok(response),
            }
        }
        Err(AgentError::LlmError("stream ended without a final response".into()))
    }

    /// 执行一个工具调用；返回 (tool 消息文本, 是否成功, 是否结束本轮, heartbeat 请求)
    async fn run_tool(
        &mut self,
        call: &ToolCall,
        deps: &AgentDeps,
    ) -> Result<(String, bool, bool, bool), AgentError> {
        let registered = {
            let registry = deps
                .tools
                .read()
                .map_err(|_| AgentError::Storage("tool registry poisoned".into()))?;
            if self.state.tools.iter().any(|t| t == &call.name) {
                registry.resolve(self.state.user_id, &call.name)
            } else {
                None
            }
        };
        let Some(registered) = registered else {
            let e = AgentError::HallucinatedTool(call.name.clone());
            tracing::warn!(agent_id = %self.state.id, tool = %call.name, "model called unknown tool");
            return Ok((e.to_string(), false, false, false));
        };

        let mut args = match parse_arguments(&call.name, &call.arguments) {
            Ok(args) => args,
            Err(e) => return Ok((e.to_string(), false, false, false)),
        };
        let heartbeat = take_heartbeat(&mut args);

        let mut ctx = ToolContext::new(
            self.state.id,
            &mut self.manager,
            self.recall.as_ref(),
            &self.archival,
        );
        let result = deps.invoker.invoke(&registered, &mut ctx, args).await;
        let inserted = ctx.archival_inserted;
        self.archival_len += inserted;

        match result {
            Ok(invocation) => {
                let ok = invocation.succeeded();
                if !ok {
                    tracing::warn!(agent_id = %self.state.id, tool = %call.name, "tool reported failure");
                }
                Ok((invocation.output, ok, invocation.outcome.ends_turn, heartbeat))
            }
            Err(e) if e.is_recoverable_tool_failure() => {
                tracing::warn!(agent_id = %self.state.id, tool = %call.name, error = %e, "tool call rejected");
                Ok((e.to_string(), false, false, heartbeat))
            }
            Err(e) => Err(e),
        }
    }

    /// 一轮：调用模型，执行工具，持久化本轮全部新消息
    pub async fn step(
        &mut self,
        input: Message,
        deps: &AgentDeps,
        interface: &dyn AgentInterface,
    ) -> Result<StepOutcome, AgentError> {
        let input = self.stamped(input);
        let mut context = self.window.clone();
        context.push(input.clone());

        let schemas = deps
            .tools
            .read()
            .map_err(|_| AgentError::Storage("tool registry poisoned".into()))?
            .schemas_for(self.state.user_id, &self.state.tools);
        let estimated = TokenEstimator::estimate_messages(&context);
        let budget = self.manager.budget().clone();
        let request = ModelRequest {
            llm_config: &self.state.llm_config,
            messages: &context,
            tools: &schemas,
            warning_threshold: budget.warning_threshold(),
        };
        let response = self.call_model(request, deps, interface).await?;

        if response.text.trim().is_empty() && response.tool_call.is_none() {
            return Err(AgentError::LlmError("model returned an empty response".into()));
        }
        let mut assistant = Message::assistant(self.state.id, response.text.clone());
        if let Some(call) = response.tool_call.clone() {
            assistant = assistant.with_tool_call(call);
        }
        let assistant = self.stamped(assistant);

        let mut signals = StepSignals {
            heartbeat_requested: response.heartbeat_requested,
            function_failed: false,
            token_warning: response.token_warning || budget.is_warning(estimated),
        };
        let mut new_messages = vec![input, assistant];
        let archival_before = self.archival_len;

        if let Some(call) = response.tool_call.as_ref() {
            let (output, ok, ends_turn, heartbeat) = self.run_tool(call, deps).await?;
            signals.heartbeat_requested |= heartbeat;
            signals.function_failed = !ok;
            if ok && ends_turn {
                signals.heartbeat_requested = false;
            }
            let text = package_function_response(ok, &output, Utc::now());
            let tool_msg = self.stamped(Message::tool(self.state.id, call.id.clone(), text));
            new_messages.push(tool_msg);
        }

        self.persist(new_messages.clone()).await?;
        // 工具可能修改了核心记忆或归档规模
        self.refresh_system(self.archival_len != archival_before).await?;

        for m in &new_messages {
            interface.on_event(AgentEvent::from_message(m));
        }
        tracing::debug!(
            agent_id = %self.state.id,
            heartbeat = signals.heartbeat_requested,
            function_failed = signals.function_failed,
            token_warning = signals.token_warning,
            "step finished"
        );
        Ok(StepOutcome {
            messages: new_messages,
            signals,
            usage: response.usage,
        })
    }

    fn continuation(&self, next: NextInput) -> Message {
        let now = Utc::now();
        let text = match next {
            NextInput::TokenWarning => package_token_warning(now),
            NextInput::FunctionFailed => package_heartbeat(REASON_FUNCTION_FAILED, now),
            NextInput::Heartbeat | NextInput::Caller => package_heartbeat(REASON_HEARTBEAT, now),
        };
        Message::user(self.state.id, text)
    }

    /// 链式执行：首轮输入为 input，之后由 `transition` 决定是否继续
    pub async fn run_chain(
        &mut self,
        input: Message,
        deps: &AgentDeps,
        interface: &dyn AgentInterface,
        cancel: &CancellationToken,
    ) -> Result<ChainResult, AgentError> {
        let _guard = YieldGuard::new(interface);
        let result = self.chain_loop(input, deps, interface, cancel).await;
        if let Err(e) = &result {
            tracing::error!(agent_id = %self.state.id, error = %e, "chain aborted");
            interface.on_event(AgentEvent::Error {
                kind: format!("{:?}", e.kind()),
                text: e.to_string(),
            });
        }
        result
    }

    async fn chain_loop(
        &mut self,
        input: Message,
        deps: &AgentDeps,
        interface: &dyn AgentInterface,
        cancel: &CancellationToken,
    ) -> Result<ChainResult, AgentError> {
        let mut usage = UsageStatistics::default();
        let mut messages = Vec::new();
        let mut next = input;
        let mut next_kind = NextInput::Caller;
        let mut steps = 0u32;

        loop {
            if cancel.is_cancelled() {
                tracing::info!(agent_id = %self.state.id, steps, "chain cancelled");
                return Err(AgentError::Cancelled);
            }
            interface.on_event(AgentEvent::StepStart {
                step: steps + 1,
                input: next_kind,
            });
            let outcome = self.step(next, deps, interface).await?;
            steps += 1;
            usage.record_step(outcome.usage);
            messages.extend(outcome.messages);

            let state = transition(&deps.policy, steps, outcome.signals);
            interface.step_complete(steps, state);
            tracing::debug!(agent_id = %self.state.id, steps, ?state, "chain transition");

            match state {
                ChainState::Running(kind) => {
                    interface.on_event(AgentEvent::Heartbeat { reason: kind });
                    next = self.continuation(kind);
                    next_kind = kind;
                }
                ChainState::Exhausted => {
                    tracing::warn!(agent_id = %self.state.id, steps, "chain hit step cap");
                    interface.on_event(AgentEvent::Usage { usage });
                    return Ok(ChainResult {
                        messages,
                        usage,
                        final_state: state,
                    });
                }
                ChainState::Yielded => {
                    interface.on_event(AgentEvent::Usage { usage });
                    return Ok(ChainResult {
                        messages,
                        usage,
                        final_state: state,
                    });
                }
            }
        }
    }

    /// 用户消息入口：打包为 user_message 信封后链式执行
    pub async fn send_user_message(
        &mut self,
        text: &str,
        deps: &AgentDeps,
        interface: &dyn AgentInterface,
        cancel: &CancellationToken,
    ) -> Result<ChainResult, AgentError> {
        let input = Message::user(self.state.id, package_user_message(text, Utc::now()));
        self.run_chain(input, deps, interface, cancel).await
    }

    /// 手动 heartbeat
    pub async fn heartbeat(
        &mut self,
        deps: &AgentDeps,
        interface: &dyn AgentInterface,
        cancel: &CancellationToken,
    ) -> Result<ChainResult, AgentError> {
        let input = Message::user(
            self.state.id,
            package_heartbeat(REASON_MANUAL_HEARTBEAT, Utc::now()),
        );
        self.run_chain(input, deps, interface, cancel).await
    }

    /// 手动注入 token 警告
    pub async fn memory_warning(
        &mut self,
        deps: &AgentDeps,
        interface: &dyn AgentInterface,
        cancel: &CancellationToken,
    ) -> Result<ChainResult, AgentError> {
        let input = Message::user(self.state.id, package_token_warning(Utc::now()));
        self.run_chain(input, deps, interface, cancel).await
    }

    fn last_assistant_index(&self, need_send: bool) -> Option<usize> {
        self.window.iter().rposition(|m| {
            m.role == Role::Assistant
                && (!need_send
                    || m.tool_call
                        .as_ref()
                        .map(|c| c.name == "send_message")
                        .unwrap_or(false))
        })
    }

    /// 改写最近一条 assistant 消息的内心独白
    pub async fn rethink(&mut self, text: &str) -> Result<Message, AgentError> {
        let idx = self
            .last_assistant_index(false)
            .ok_or_else(|| AgentError::Validation("no assistant message to rethink".into()))?;
        self.window[idx].text = text.to_string();
        let updated = self.window[idx].clone();
        self.recall.update(&updated).await?;
        Ok(updated)
    }

    /// 改写最近一次 send_message 的内容
    pub async fn rewrite(&mut self, text: &str) -> Result<Message, AgentError> {
        let idx = self
            .last_assistant_index(true)
            .ok_or_else(|| AgentError::Validation("no sent message to rewrite".into()))?;
        if let Some(call) = self.window[idx].tool_call.as_mut() {
            call.arguments = serde_json::json!({ "message": text }).to_string();
        }
        let updated = self.window[idx].clone();
        self.recall.update(&updated).await?;
        Ok(updated)
    }

    /// 从窗口末尾弹出至多 n 条（窗口至少保留 2 条），并从 recall 删除
    pub async fn pop(&mut self, n: usize) -> Result<Vec<Message>, AgentError> {
        let removable = self.window.len().saturating_sub(MIN_IN_CONTEXT);
        let n = n.min(removable);
        if n == 0 {
            return Ok(Vec::new());
        }
        let popped = self.window.split_off(self.window.len() - n);
        self.remove_from_recall(&popped).await?;
        Ok(popped)
    }

    async fn remove_from_recall(&mut self, popped: &[Message]) -> Result<(), AgentError> {
        let ids: Vec<Uuid> = popped.iter().map(|m| m.id).collect();
        let deleted = self.recall.delete(self.state.id, &ids).await?;
        self.recall_len = self.recall_len.saturating_sub(deleted);
        self.state.message_ids = self.window.iter().map(|m| m.id).collect();
        self.refresh_system(true).await
    }

    /// 撤销最近一条用户消息之后的全部内容，并以同样的文本重新执行
    pub async fn retry(
        &mut self,
        deps: &AgentDeps,
        interface: &dyn AgentInterface,
        cancel: &CancellationToken,
    ) -> Result<ChainResult, AgentError> {
        let idx = self
            .window
            .iter()
            .rposition(|m| m.role == Role::User && user_message_text(&m.text).is_some())
            .filter(|&i| i > 0)
            .ok_or_else(|| AgentError::Validation("no user message to retry".into()))?;
        let text = user_message_text(&self.window[idx].text).unwrap_or_default();
        let popped = self.window.split_off(idx);
        self.remove_from_recall(&popped).await?;
        self.send_user_message(&text, deps, interface, cancel).await
    }

    /// 更新单个块
    pub async fn update_block(&mut self, name: &str, value: &str) -> Result<bool, AgentError> {
        let changed = self.manager.update_block(name, value)?;
        self.sync_system_message().await?;
        Ok(changed)
    }

    /// 批量更新核心记忆：整批生效或整批不生效（含超出上下文预算的情况）
    pub async fn update_core_memory(
        &mut self,
        updates: &HashMap<String, String>,
    ) -> Result<&Memory, AgentError> {
        let mut batch: Vec<(&str, &str)> = updates
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        batch.sort();
        let snapshot = self.manager.clone();
        let system_text = self.window.first().map(|m| m.text.clone());
        self.manager.update_blocks(batch)?;
        if let Err(e) = self.sync_system_message().await {
            self.manager = snapshot;
            if let (Some(system), Some(text)) = (self.window.first_mut(), system_text) {
                system.text = text;
            }
            return Err(e);
        }
        Ok(self.manager.memory())
    }

    /// 写入归档记忆
    pub async fn insert_archival(&mut self, text: &str) -> Result<Vec<Uuid>, AgentError> {
        let ids = self
            .archival
            .insert(PassageScope::agent(self.state.id), text)
            .await?;
        self.archival_len += ids.len();
        self.refresh_system(true).await?;
        Ok(ids)
    }

    pub async fn delete_archival(&mut self, passage_id: Uuid) -> Result<(), AgentError> {
        self.archival.store().delete(self.state.id, passage_id).await?;
        self.archival_len = self.archival_len.saturating_sub(1);
        self.refresh_system(true).await
    }

    /// 挂载数据源：复制段落（保留嵌入）到本 agent 名下
    pub async fn attach_passages(&mut self, passages: Vec<Passage>) -> Result<usize, AgentError> {
        let copies: Vec<Passage> = passages
            .into_iter()
            .map(|p| Passage {
                id: Uuid::new_v4(),
                agent_id: Some(self.state.id),
                created_at: Utc::now(),
                ..p
            })
            .collect();
        let inserted = self.archival.store().insert(copies).await?.len();
        self.archival_len += inserted;
        self.refresh_system(true).await?;
        Ok(inserted)
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.state.name = name.into();
    }

    /// 替换 system 模板（强制 rebuild）
    pub async fn set_system_template(&mut self, template: &str) -> Result<(), AgentError> {
        self.manager.set_system_template(template)?;
        self.state.system = template.to_string();
        self.sync_system_message().await
    }

    /// 重新挂载工具列表（调用方负责校验名字）
    pub fn set_tools(&mut self, tools: Vec<String>) {
        self.state.tools = tools;
    }

    pub fn set_llm_config(&mut self, llm_config: crate::core::LlmConfig) {
        self.state.llm_config = llm_config;
    }

    pub fn set_embedding_config(&mut self, embedding_config: crate::core::EmbeddingConfig) {
        self.state.embedding_config = embedding_config;
    }
}

/// 从 user_message 信封中取出原文
fn user_message_text(envelope: &str) -> Option<String> {
    let v: serde_json::Value = serde_json::from_str(envelope).ok()?;
    if v.get("type")?.as_str()? != "user_message" {
        return None;
    }
    v.get("message")?.as_str().map(String::from)
}

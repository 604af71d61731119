//! AgentServer：调用方可见的运行时入口
//!
//! 持有实体存储、recall / archival 存储、模型后端、工具注册表与 AgentCache。
//! 每个对 agent 的写操作都先经 AgentCache 取得唯一句柄，再进入该 agent 的执行锁；
//! 同一 agent 的链式执行严格串行，不同 agent 之间互不阻塞。操作结束后 AgentState 写回实体存储。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::{
    AgentCache, AgentError, AgentHandle, AgentState, EmbeddingConfig, Job, LlmConfig, Source,
    ToolDescriptor, UsageStatistics, User,
};
use crate::llm::{create_embedder_from_config, create_model_from_config, ModelBackend, ToolSchema};
use crate::memory::{
    ArchivalMemory, Block, Chunker, ChunkingConfig, CursorPage, CursorQuery, InMemoryPassageStore,
    InMemoryRecallStore, Memory, Message, Passage, PassageScope, PassageStore, RecallStore,
    ScoredPassage, SqliteRecallStore,
};
use crate::runtime::{
    validate_input, Agent, AgentDeps, AgentEvent, AgentInterface, ChainPolicy, ChainResult,
    ChainState, ChannelInterface, NoopInterface, DEFAULT_POP_COUNT, DEFAULT_SYSTEM_PROMPT,
};
use crate::store::{EntityStore, InMemoryEntityStore};
use crate::tools::{
    create_sandbox_from_config, register_base_tools, validate_tool_name, SandboxedTool,
    ToolInvoker, ToolRegistry, ToolSandbox, BASE_TOOLS,
};

/// 外部协作者
pub struct ServerComponents {
    pub entities: Arc<dyn EntityStore>,
    pub recall: Arc<dyn RecallStore>,
    pub passages: Arc<dyn PassageStore>,
    pub embedder: Arc<dyn crate::llm::EmbeddingProvider>,
    pub model: Arc<dyn ModelBackend>,
    pub sandbox: Arc<dyn ToolSandbox>,
}

impl ServerComponents {
    /// 按配置组装：recall 存储（memory / sqlite）、嵌入、模型与沙箱
    pub fn from_config(config: &AppConfig) -> Result<Self, AgentError> {
        let recall: Arc<dyn RecallStore> = match config.storage.recall.as_str() {
            "sqlite" => {
                let path = config
                    .storage
                    .sqlite_path
                    .clone()
                    .unwrap_or_else(|| {
                        config
                            .app
                            .data_dir
                            .clone()
                            .unwrap_or_else(|| PathBuf::from("data"))
                            .join("recall.db")
                    });
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| AgentError::Storage(format!("create {:?}: {}", parent, e)))?;
                }
                Arc::new(SqliteRecallStore::open(path)?)
            }
            "memory" => Arc::new(InMemoryRecallStore::new()),
            other => {
                return Err(AgentError::ConfigError(format!(
                    "unknown recall storage '{}'",
                    other
                )))
            }
        };
        Ok(Self {
            entities: Arc::new(InMemoryEntityStore::new()),
            recall,
            passages: Arc::new(InMemoryPassageStore::new()),
            embedder: create_embedder_from_config(&config.embedding),
            model: create_model_from_config(&config.llm),
            sandbox: create_sandbox_from_config(&config.tools.sandbox),
        })
    }
}

/// 新建 agent 的参数；None 字段取配置默认值
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateAgentRequest {
    pub user_id: Uuid,
    pub name: Option<String>,
    pub system: Option<String>,
    pub persona: Option<String>,
    pub human: Option<String>,
    pub tools: Option<Vec<String>>,
    pub llm_config: Option<LlmConfig>,
    pub embedding_config: Option<EmbeddingConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAgentRequest {
    pub name: Option<String>,
    pub system: Option<String>,
    pub tools: Option<Vec<String>>,
    pub llm_config: Option<LlmConfig>,
    pub embedding_config: Option<EmbeddingConfig>,
}

/// 新建用户工具；json_schema 缺省时由沙箱从源码推导，name 缺省时取 schema 中的 name
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateToolRequest {
    pub user_id: Uuid,
    pub name: Option<String>,
    pub description: Option<String>,
    pub source_type: String,
    pub source_code: String,
    pub json_schema: Option<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// 同名工具已存在时覆盖
    #[serde(default)]
    pub update: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateToolRequest {
    pub description: Option<String>,
    pub source_code: Option<String>,
    pub json_schema: Option<Value>,
    pub tags: Option<Vec<String>>,
}

/// 数据源中的一篇文档
#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub text: String,
}

/// 非流式调用的结果
#[derive(Debug, Clone, Serialize)]
pub struct MessageResponse {
    pub messages: Vec<Message>,
    pub usage: UsageStatistics,
    /// 仅链式执行有终态；编辑类命令为 None
    pub final_state: Option<ChainState>,
}

impl MessageResponse {
    fn edited(messages: Vec<Message>) -> Self {
        Self {
            messages,
            usage: UsageStatistics::default(),
            final_state: None,
        }
    }
}

impl From<ChainResult> for MessageResponse {
    fn from(r: ChainResult) -> Self {
        Self {
            messages: r.messages,
            usage: r.usage,
            final_state: Some(r.final_state),
        }
    }
}

pub enum SendMessageResult {
    Complete(MessageResponse),
    /// 每条新消息一个事件，外加轮次边界与 heartbeat 标记，最后以 Done 结束
    Stream(UnboundedReceiver<AgentEvent>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub size: usize,
}

/// `/` 开头的命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Rethink(String),
    Rewrite(String),
    Retry,
    Pop(usize),
    Heartbeat,
    MemoryWarning,
}

impl Command {
    pub fn parse(input: &str) -> Result<Self, AgentError> {
        let input = input.trim();
        let body = input
            .strip_prefix('/')
            .ok_or_else(|| AgentError::Validation(format!("not a command: {:?}", input)))?;
        let (name, arg) = match body.split_once(char::is_whitespace) {
            Some((n, a)) => (n, a.trim()),
            None => (body, ""),
        };
        let need_text = |what: &str| {
            if arg.is_empty() {
                Err(AgentError::Validation(format!("/{} needs text", what)))
            } else {
                Ok(arg.to_string())
            }
        };
        match name.to_ascii_lowercase().as_str() {
            "rethink" => Ok(Command::Rethink(need_text("rethink")?)),
            "rewrite" => Ok(Command::Rewrite(need_text("rewrite")?)),
            "retry" => Ok(Command::Retry),
            "pop" => {
                if arg.is_empty() {
                    return Ok(Command::Pop(DEFAULT_POP_COUNT));
                }
                arg.parse::<usize>()
                    .map(Command::Pop)
                    .map_err(|_| AgentError::Validation(format!("invalid pop count: {:?}", arg)))
            }
            "heartbeat" => Ok(Command::Heartbeat),
            "memorywarning" => Ok(Command::MemoryWarning),
            other => Err(AgentError::Validation(format!("unknown command: /{}", other))),
        }
    }
}

struct ServerInner {
    config: AppConfig,
    entities: Arc<dyn EntityStore>,
    recall: Arc<dyn RecallStore>,
    archival: ArchivalMemory,
    model: Arc<dyn ModelBackend>,
    registry: Arc<RwLock<ToolRegistry>>,
    sandbox: Arc<dyn ToolSandbox>,
    invoker: ToolInvoker,
    cache: AgentCache,
}

#[derive(Clone)]
pub struct AgentServer {
    inner: Arc<ServerInner>,
}

impl AgentServer {
    pub fn new(config: AppConfig, components: ServerComponents) -> Result<Self, AgentError> {
        let mut registry = ToolRegistry::new();
        register_base_tools(&mut registry)?;
        let chunker = Chunker::new(ChunkingConfig::with_chunk_size(config.embedding.chunk_size));
        let archival = ArchivalMemory::new(components.passages, components.embedder, chunker);
        let invoker = ToolInvoker::new(config.tools.tool_timeout_secs);
        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                entities: components.entities,
                recall: components.recall,
                archival,
                model: components.model,
                registry: Arc::new(RwLock::new(registry)),
                sandbox: components.sandbox,
                invoker,
                cache: AgentCache::new(),
            }),
        })
    }

    pub fn from_config(config: AppConfig) -> Result<Self, AgentError> {
        let components = ServerComponents::from_config(&config)?;
        Self::new(config, components)
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    fn deps(&self, stream: bool) -> AgentDeps {
        AgentDeps {
            model: self.inner.model.clone(),
            tools: self.inner.registry.clone(),
            invoker: self.inner.invoker.clone(),
            policy: ChainPolicy::from(&self.inner.config.runtime),
            stream,
        }
    }

    fn registry_read(&self) -> Result<std::sync::RwLockReadGuard<'_, ToolRegistry>, AgentError> {
        self.inner
            .registry
            .read()
            .map_err(|_| AgentError::Storage("tool registry poisoned".into()))
    }

    fn registry_write(&self) -> Result<std::sync::RwLockWriteGuard<'_, ToolRegistry>, AgentError> {
        self.inner
            .registry
            .write()
            .map_err(|_| AgentError::Storage("tool registry poisoned".into()))
    }

    async fn require_user(&self, user_id: Uuid) -> Result<User, AgentError> {
        self.inner
            .entities
            .get_user(user_id)
            .await?
            .ok_or_else(|| AgentError::not_found("user", user_id.to_string()))
    }

    async fn require_agent(&self, agent_id: Uuid) -> Result<AgentState, AgentError> {
        self.inner
            .entities
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| AgentError::not_found("agent", agent_id.to_string()))
    }

    async fn require_source(&self, source_id: Uuid) -> Result<Source, AgentError> {
        self.inner
            .entities
            .get_source(source_id)
            .await?
            .ok_or_else(|| AgentError::not_found("source", source_id.to_string()))
    }

    /// 取得 agent 的唯一句柄；未缓存时从实体存储加载
    async fn handle(&self, agent_id: Uuid) -> Result<Arc<AgentHandle>, AgentError> {
        let inner = &self.inner;
        inner
            .cache
            .acquire(agent_id, || async move {
                let state = inner
                    .entities
                    .get_agent(agent_id)
                    .await?
                    .ok_or_else(|| AgentError::not_found("agent", agent_id.to_string()))?;
                Agent::load(
                    state,
                    inner.recall.clone(),
                    inner.archival.clone(),
                    &inner.config.runtime,
                )
                .await
            })
            .await
    }

    async fn save(&self, agent: &Agent) -> Result<(), AgentError> {
        self.inner.entities.update_agent(agent.state().clone()).await
    }

    /// 所有工具名都须在该用户可见的范围内已注册
    fn check_tools(&self, user_id: Uuid, tools: &[String]) -> Result<(), AgentError> {
        let registry = self.registry_read()?;
        for name in tools {
            if !registry.contains_for(user_id, name) {
                return Err(AgentError::not_found("tool", name.clone()));
            }
        }
        Ok(())
    }

    // ---- 用户与 agent ----

    pub async fn create_user(&self, name: &str) -> Result<User, AgentError> {
        let user = User::new(name);
        self.inner.entities.create_user(user.clone()).await?;
        tracing::info!(user_id = %user.id, "user created");
        Ok(user)
    }

    /// 删除用户：先逐个删除其 agent，再移除其工具、数据源（含段落）与任务
    pub async fn delete_user(&self, user_id: Uuid) -> Result<(), AgentError> {
        self.require_user(user_id).await?;
        for agent in self.inner.entities.list_agents(user_id).await? {
            self.delete_agent(agent.id).await?;
        }
        for source in self.inner.entities.list_sources(user_id).await? {
            self.inner.archival.store().delete_source(source.id).await?;
        }
        self.inner.entities.delete_user(user_id).await?;
        let tools = self.registry_write()?.unregister_owner(user_id);
        tracing::info!(user_id = %user_id, tools, "user deleted");
        Ok(())
    }

    pub async fn create_agent(&self, request: CreateAgentRequest) -> Result<AgentState, AgentError> {
        self.require_user(request.user_id).await?;
        let cfg = &self.inner.config;
        let id = Uuid::new_v4();
        let name = match request.name {
            Some(n) if !n.trim().is_empty() => n,
            Some(_) => return Err(AgentError::Validation("agent name is empty".into())),
            None => format!("agent-{}", &id.simple().to_string()[..8]),
        };
        if self
            .inner
            .entities
            .get_agent_by_name(request.user_id, &name)
            .await?
            .is_some()
        {
            return Err(AgentError::Validation(format!(
                "agent name '{}' already exists",
                name
            )));
        }
        let tools = request
            .tools
            .unwrap_or_else(|| BASE_TOOLS.iter().map(|s| s.to_string()).collect());
        self.check_tools(request.user_id, &tools)?;

        let memory = Memory::new()
            .with_block(Block::new(
                "persona",
                request.persona.unwrap_or_else(|| cfg.memory.persona.clone()),
                cfg.memory.persona_limit,
            ))?
            .with_block(Block::new(
                "human",
                request.human.unwrap_or_else(|| cfg.memory.human.clone()),
                cfg.memory.human_limit,
            ))?;

        let state = AgentState {
            id,
            name,
            user_id: request.user_id,
            llm_config: request
                .llm_config
                .unwrap_or_else(|| LlmConfig::from(&cfg.llm)),
            embedding_config: request
                .embedding_config
                .unwrap_or_else(|| EmbeddingConfig::from(&cfg.embedding)),
            system: request
                .system
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            memory,
            tools,
            message_ids: Vec::new(),
            created_at: Utc::now(),
        };

        let agent = Agent::create(
            state,
            self.inner.recall.clone(),
            self.inner.archival.clone(),
            &cfg.runtime,
        )
        .await?;
        let state = agent.state().clone();
        self.inner.entities.create_agent(state.clone()).await?;
        self.inner
            .cache
            .acquire(id, move || async move { Ok(agent) })
            .await?;
        Ok(state)
    }

    pub async fn get_agent_state(&self, agent_id: Uuid) -> Result<AgentState, AgentError> {
        self.require_agent(agent_id).await
    }

    pub async fn list_agents(&self, user_id: Uuid) -> Result<Vec<AgentState>, AgentError> {
        self.require_user(user_id).await?;
        self.inner.entities.list_agents(user_id).await
    }

    pub async fn update_agent(
        &self,
        agent_id: Uuid,
        request: UpdateAgentRequest,
    ) -> Result<AgentState, AgentError> {
        let current = self.require_agent(agent_id).await?;
        if let Some(name) = &request.name {
            if name.trim().is_empty() {
                return Err(AgentError::Validation("agent name is empty".into()));
            }
            let taken = self
                .inner
                .entities
                .get_agent_by_name(current.user_id, name)
                .await?
                .map(|a| a.id != agent_id)
                .unwrap_or(false);
            if taken {
                return Err(AgentError::Validation(format!(
                    "agent name '{}' already exists",
                    name
                )));
            }
        }
        if let Some(tools) = &request.tools {
            self.check_tools(current.user_id, tools)?;
        }

        let handle = self.handle(agent_id).await?;
        let mut agent = handle.lock_live().await?;
        if let Some(system) = &request.system {
            agent.set_system_template(system).await?;
        }
        if let Some(name) = request.name {
            agent.rename(name);
        }
        if let Some(tools) = request.tools {
            agent.set_tools(tools);
        }
        if let Some(llm_config) = request.llm_config {
            agent.set_llm_config(llm_config);
        }
        if let Some(embedding_config) = request.embedding_config {
            agent.set_embedding_config(embedding_config);
        }
        self.save(&agent).await?;
        Ok(agent.state().clone())
    }

    /// 删除 agent：先删实体（阻止重新加载），再从缓存移除并等待进行中的执行结束，最后清理记忆
    pub async fn delete_agent(&self, agent_id: Uuid) -> Result<(), AgentError> {
        self.require_agent(agent_id).await?;
        self.inner.entities.delete_agent(agent_id).await?;
        if let Some(handle) = self.inner.cache.release(agent_id) {
            handle.supervisor().shutdown();
            let _drained = handle.lock().await;
        }
        self.inner.recall.delete_agent(agent_id).await?;
        self.inner.archival.store().delete_agent(agent_id).await?;
        tracing::info!(agent_id = %agent_id, "agent deleted");
        Ok(())
    }

    pub async fn get_in_context_messages(&self, agent_id: Uuid) -> Result<Vec<Message>, AgentError> {
        let handle = self.handle(agent_id).await?;
        let agent = handle.lock_live().await?;
        Ok(agent.in_context_messages().to_vec())
    }

    pub async fn get_recall_summary(&self, agent_id: Uuid) -> Result<StoreSummary, AgentError> {
        self.require_agent(agent_id).await?;
        Ok(StoreSummary {
            size: self.inner.recall.size(agent_id).await?,
        })
    }

    pub async fn get_archival_summary(&self, agent_id: Uuid) -> Result<StoreSummary, AgentError> {
        self.require_agent(agent_id).await?;
        Ok(StoreSummary {
            size: self.inner.archival.store().size(agent_id).await?,
        })
    }

    // ---- 消息 ----

    /// 发送用户消息。stream=false 时返回最终消息列表与用量；stream=true 时返回事件流
    pub async fn send_message(
        &self,
        agent_id: Uuid,
        text: &str,
        stream: bool,
    ) -> Result<SendMessageResult, AgentError> {
        validate_input(text)?;
        let handle = self.handle(agent_id).await?;
        if !stream {
            let response = self.run_message(&handle, text, &NoopInterface, false).await?;
            return Ok(SendMessageResult::Complete(response));
        }

        let (tx, rx) = unbounded_channel();
        let server = self.clone();
        let text = text.to_string();
        tokio::spawn(async move {
            let interface = ChannelInterface::new(tx);
            // 错误已作为 Error 事件推送
            let _ = server.run_message(&handle, &text, &interface, true).await;
        });
        Ok(SendMessageResult::Stream(rx))
    }

    async fn run_message(
        &self,
        handle: &AgentHandle,
        text: &str,
        interface: &dyn AgentInterface,
        stream: bool,
    ) -> Result<MessageResponse, AgentError> {
        let mut agent = match handle.lock_live().await {
            Ok(agent) => agent,
            Err(e) => {
                interface.on_event(AgentEvent::Error {
                    kind: format!("{:?}", e.kind()),
                    text: e.to_string(),
                });
                interface.step_yield();
                return Err(e);
            }
        };
        let cancel = handle.supervisor().begin_run();
        let deps = self.deps(stream);
        let result = agent.send_user_message(text, &deps, interface, &cancel).await;
        // 已持久化的部分进度不回滚，状态照常写回
        let saved = self.save(&agent).await;
        let result = result?;
        saved?;
        Ok(result.into())
    }

    /// 倒序分页（start 为距最新一条的偏移）
    pub async fn get_messages(
        &self,
        agent_id: Uuid,
        start: i64,
        count: i64,
    ) -> Result<Vec<Message>, AgentError> {
        let handle = self.handle(agent_id).await?;
        let agent = handle.lock_live().await?;
        agent.page(start, count).await
    }

    /// 按 id 取单条消息（含已移出上下文窗口的）
    pub async fn get_message(&self, agent_id: Uuid, message_id: Uuid) -> Result<Message, AgentError> {
        self.require_agent(agent_id).await?;
        self.inner
            .recall
            .get_many(agent_id, &[message_id])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::not_found("message", message_id.to_string()))
    }

    pub async fn get_messages_cursor(
        &self,
        agent_id: Uuid,
        query: &CursorQuery,
    ) -> Result<CursorPage<Message>, AgentError> {
        self.require_agent(agent_id).await?;
        self.inner.recall.cursor(agent_id, query).await
    }

    /// 执行 `/` 命令
    pub async fn run_command(&self, agent_id: Uuid, input: &str) -> Result<MessageResponse, AgentError> {
        let command = Command::parse(input)?;
        let handle = self.handle(agent_id).await?;
        let mut agent = handle.lock_live().await?;
        let cancel = handle.supervisor().begin_run();
        let deps = self.deps(false);
        let interface = NoopInterface;
        tracing::info!(agent_id = %agent_id, ?command, "command");

        let result = match command {
            Command::Rethink(text) => agent.rethink(&text).await.map(|m| MessageResponse::edited(vec![m])),
            Command::Rewrite(text) => agent.rewrite(&text).await.map(|m| MessageResponse::edited(vec![m])),
            Command::Pop(n) => agent.pop(n).await.map(MessageResponse::edited),
            Command::Retry => agent.retry(&deps, &interface, &cancel).await.map(Into::into),
            Command::Heartbeat => agent.heartbeat(&deps, &interface, &cancel).await.map(Into::into),
            Command::MemoryWarning => agent
                .memory_warning(&deps, &interface, &cancel)
                .await
                .map(Into::into),
        };
        let saved = self.save(&agent).await;
        let result = result?;
        saved?;
        Ok(result)
    }

    /// 取消当前执行（在两轮之间生效）；agent 未加载时返回 false
    pub fn cancel(&self, agent_id: Uuid) -> bool {
        match self.inner.cache.get(agent_id) {
            Some(handle) => {
                handle.supervisor().cancel();
                tracing::info!(agent_id = %agent_id, "cancel requested");
                true
            }
            None => false,
        }
    }

    // ---- 记忆 ----

    pub async fn get_core_memory(&self, agent_id: Uuid) -> Result<Memory, AgentError> {
        Ok(self.require_agent(agent_id).await?.memory)
    }

    /// 批量更新核心记忆；任一块不合法则整体不生效
    pub async fn update_core_memory(
        &self,
        agent_id: Uuid,
        updates: &HashMap<String, String>,
    ) -> Result<Memory, AgentError> {
        let handle = self.handle(agent_id).await?;
        let mut agent = handle.lock_live().await?;
        let memory = agent.update_core_memory(updates).await?.clone();
        self.save(&agent).await?;
        Ok(memory)
    }

    pub async fn insert_archival(&self, agent_id: Uuid, text: &str) -> Result<Vec<Uuid>, AgentError> {
        let handle = self.handle(agent_id).await?;
        let mut agent = handle.lock_live().await?;
        let ids = agent.insert_archival(text).await?;
        self.save(&agent).await?;
        Ok(ids)
    }

    pub async fn delete_archival(&self, agent_id: Uuid, passage_id: Uuid) -> Result<(), AgentError> {
        let handle = self.handle(agent_id).await?;
        let mut agent = handle.lock_live().await?;
        agent.delete_archival(passage_id).await?;
        self.save(&agent).await
    }

    pub async fn search_archival(
        &self,
        agent_id: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredPassage>, AgentError> {
        self.require_agent(agent_id).await?;
        self.inner.archival.search(agent_id, query, limit).await
    }

    /// 按写入顺序的偏移分页
    pub async fn get_archival_page(
        &self,
        agent_id: Uuid,
        start: i64,
        count: i64,
    ) -> Result<Vec<Passage>, AgentError> {
        if start < 0 || count < 0 {
            return Err(AgentError::InvalidRange { start, count });
        }
        self.require_agent(agent_id).await?;
        self.inner
            .archival
            .store()
            .page(agent_id, start as usize, count as usize)
            .await
    }

    pub async fn get_archival_cursor(
        &self,
        agent_id: Uuid,
        query: &CursorQuery,
    ) -> Result<CursorPage<Passage>, AgentError> {
        self.require_agent(agent_id).await?;
        self.inner.archival.store().cursor(agent_id, query).await
    }

    // ---- 工具 ----

    fn register_user_tool(&self, descriptor: ToolDescriptor) -> Result<(), AgentError> {
        let timeout = Duration::from_secs(self.inner.config.tools.tool_timeout_secs);
        let owner = descriptor.user_id;
        let tool = SandboxedTool::new(descriptor, self.inner.sandbox.clone(), timeout);
        self.registry_write()?.register_for(owner, Arc::new(tool))
    }

    pub async fn create_tool(&self, request: CreateToolRequest) -> Result<ToolDescriptor, AgentError> {
        self.require_user(request.user_id).await?;
        let json_schema = match request.json_schema {
            Some(schema) => schema,
            None => self.inner.sandbox.derive_schema(&request.source_code)?,
        };
        let name = request
            .name
            .or_else(|| json_schema.get("name").and_then(|n| n.as_str()).map(String::from))
            .ok_or_else(|| AgentError::Validation("tool name is missing".into()))?;
        validate_tool_name(&name)?;
        if BASE_TOOLS.contains(&name.as_str()) {
            return Err(AgentError::Validation(format!(
                "'{}' is a built-in tool",
                name
            )));
        }
        let description = request
            .description
            .or_else(|| {
                json_schema
                    .get("description")
                    .and_then(|d| d.as_str())
                    .filter(|d| !d.is_empty())
                    .map(String::from)
            })
            .unwrap_or_default();

        let existing = self
            .inner
            .entities
            .get_tool_by_name(request.user_id, &name)
            .await?;
        if existing.is_some() && !request.update {
            return Err(AgentError::Validation(format!("tool '{}' already exists", name)));
        }
        let descriptor = ToolDescriptor {
            id: existing.as_ref().map(|t| t.id).unwrap_or_else(Uuid::new_v4),
            user_id: request.user_id,
            name,
            description,
            source_type: request.source_type,
            source_code: request.source_code,
            json_schema,
            tags: request.tags,
            created_at: existing.as_ref().map(|t| t.created_at).unwrap_or_else(Utc::now),
        };
        // 先注册：schema 非法时不落库
        self.register_user_tool(descriptor.clone())?;
        if existing.is_some() {
            self.inner.entities.update_tool(descriptor.clone()).await?;
        } else {
            self.inner.entities.create_tool(descriptor.clone()).await?;
        }
        tracing::info!(tool = %descriptor.name, "user tool registered");
        Ok(descriptor)
    }

    pub async fn update_tool(
        &self,
        tool_id: Uuid,
        request: UpdateToolRequest,
    ) -> Result<ToolDescriptor, AgentError> {
        let mut descriptor = self
            .inner
            .entities
            .get_tool(tool_id)
            .await?
            .ok_or_else(|| AgentError::not_found("tool", tool_id.to_string()))?;
        if let Some(description) = request.description {
            descriptor.description = description;
        }
        if let Some(source_code) = request.source_code {
            if request.json_schema.is_none() {
                let mut derived = self.inner.sandbox.derive_schema(&source_code)?;
                // 名字不随源码改变
                if let Some(obj) = derived.as_object_mut() {
                    obj.insert("name".into(), Value::String(descriptor.name.clone()));
                }
                descriptor.json_schema = derived;
            }
            descriptor.source_code = source_code;
        }
        if let Some(schema) = request.json_schema {
            descriptor.json_schema = schema;
        }
        if let Some(tags) = request.tags {
            descriptor.tags = tags;
        }
        self.register_user_tool(descriptor.clone())?;
        self.inner.entities.update_tool(descriptor.clone()).await?;
        Ok(descriptor)
    }

    pub async fn delete_tool(&self, tool_id: Uuid) -> Result<(), AgentError> {
        let descriptor = self
            .inner
            .entities
            .get_tool(tool_id)
            .await?
            .ok_or_else(|| AgentError::not_found("tool", tool_id.to_string()))?;
        self.inner.entities.delete_tool(tool_id).await?;
        self.registry_write()?
            .unregister_for(descriptor.user_id, &descriptor.name);
        tracing::info!(tool = %descriptor.name, "user tool deleted");
        Ok(())
    }

    /// 内置工具加该用户的自定义工具
    pub async fn list_tools(&self, user_id: Uuid) -> Result<Vec<ToolSchema>, AgentError> {
        self.require_user(user_id).await?;
        let mut names: Vec<String> = BASE_TOOLS.iter().map(|s| s.to_string()).collect();
        names.extend(
            self.inner
                .entities
                .list_tools(user_id)
                .await?
                .into_iter()
                .map(|t| t.name),
        );
        Ok(self.registry_read()?.schemas_for(user_id, &names))
    }

    // ---- 数据源与任务 ----

    pub async fn create_source(&self, user_id: Uuid, name: &str) -> Result<Source, AgentError> {
        self.require_user(user_id).await?;
        if name.trim().is_empty() {
            return Err(AgentError::Validation("source name is empty".into()));
        }
        let source = Source::new(
            user_id,
            name,
            EmbeddingConfig::from(&self.inner.config.embedding),
        );
        self.inner.entities.create_source(source.clone()).await?;
        Ok(source)
    }

    pub async fn list_sources(&self, user_id: Uuid) -> Result<Vec<Source>, AgentError> {
        self.require_user(user_id).await?;
        self.inner.entities.list_sources(user_id).await
    }

    /// 改名；同一用户下不得重名
    pub async fn update_source(&self, source_id: Uuid, name: &str) -> Result<Source, AgentError> {
        let mut source = self.require_source(source_id).await?;
        if name.trim().is_empty() {
            return Err(AgentError::Validation("source name is empty".into()));
        }
        source.name = name.to_string();
        self.inner.entities.update_source(source.clone()).await?;
        Ok(source)
    }

    /// 删除数据源及其段落；已挂载到 agent 的副本保留在各自的归档记忆中
    pub async fn delete_source(&self, source_id: Uuid) -> Result<(), AgentError> {
        self.require_source(source_id).await?;
        let removed = self.inner.archival.store().delete_source(source_id).await?;
        self.inner.entities.delete_source(source_id).await?;
        tracing::info!(source_id = %source_id, removed, "source deleted");
        Ok(())
    }

    /// 把文档分块嵌入到数据源下；以 Job 记录进度，失败写入 job.metadata.error 而不是返回错误
    pub async fn load_source(
        &self,
        source_id: Uuid,
        documents: Vec<Document>,
    ) -> Result<Job, AgentError> {
        let source = self.require_source(source_id).await?;
        let mut job = Job::new(source.user_id).with_metadata("source_id", json!(source.id));
        self.inner.entities.create_job(job.clone()).await?;
        job.start()?;
        self.inner.entities.update_job(job.clone()).await?;

        let mut num_passages = 0usize;
        let mut failure = None;
        for doc in &documents {
            match self
                .inner
                .archival
                .insert(PassageScope::source(source.id, doc.doc_id.clone()), &doc.text)
                .await
            {
                Ok(ids) => num_passages += ids.len(),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        match failure {
            None => {
                let mut metadata = Map::new();
                metadata.insert("num_passages".into(), json!(num_passages));
                metadata.insert("num_documents".into(), json!(documents.len()));
                job.complete(metadata)?;
                tracing::info!(source_id = %source.id, num_passages, "source loaded");
            }
            Some(e) => {
                tracing::warn!(source_id = %source.id, error = %e, "source load failed");
                job.fail(e.to_string())?;
            }
        }
        self.inner.entities.update_job(job.clone()).await?;
        Ok(job)
    }

    /// 挂载数据源：其段落复制进 agent 的归档记忆；重复挂载不再复制，返回 0
    pub async fn attach_source(&self, agent_id: Uuid, source_id: Uuid) -> Result<usize, AgentError> {
        self.require_source(source_id).await?;
        let passages = self.inner.archival.store().list_by_source(source_id).await?;
        let handle = self.handle(agent_id).await?;
        let mut agent = handle.lock_live().await?;
        if !self.inner.entities.attach_source(agent_id, source_id).await? {
            return Ok(0);
        }
        let copied = agent.attach_passages(passages).await?;
        self.save(&agent).await?;
        Ok(copied)
    }

    pub async fn list_attached_sources(&self, agent_id: Uuid) -> Result<Vec<Uuid>, AgentError> {
        self.require_agent(agent_id).await?;
        self.inner.entities.list_attached_sources(agent_id).await
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job, AgentError> {
        self.inner
            .entities
            .get_job(job_id)
            .await?
            .ok_or_else(|| AgentError::not_found("job", job_id.to_string()))
    }

    /// 只能删除已到终态的任务
    pub async fn delete_job(&self, job_id: Uuid) -> Result<(), AgentError> {
        let job = self.get_job(job_id).await?;
        if !job.status.is_terminal() {
            return Err(AgentError::Validation(format!(
                "job {} is still {:?}",
                job_id, job.status
            )));
        }
        self.inner.entities.delete_job(job_id).await
    }

    pub async fn list_jobs(&self, user_id: Uuid) -> Result<Vec<Job>, AgentError> {
        self.require_user(user_id).await?;
        self.inner.entities.list_jobs(user_id).await
    }

    /// 未到终态的任务
    pub async fn list_active_jobs(&self, user_id: Uuid) -> Result<Vec<Job>, AgentError> {
        Ok(self
            .list_jobs(user_id)
            .await?
            .into_iter()
            .filter(|j| !j.status.is_terminal())
            .collect())
    }

    /// 进程退出：取消所有已加载 agent 的执行
    pub fn shutdown(&self) {
        self.inner.cache.shutdown_all();
    }
}

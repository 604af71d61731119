//! AgentCache：agent id → 唯一的活动句柄
//!
//! 注册表锁只保护 HashMap 本身，临界区内不做任何 I/O、不 await；
//! 加载经 per-key 的 OnceCell 完成，同一 agent 并发 acquire 只会加载一次。
//! 句柄内的 `tokio::sync::Mutex<Agent>` 是 per-agent 的执行锁，与注册表锁相互独立。

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::core::{AgentError, SessionSupervisor};
use crate::runtime::Agent;

/// 活动 agent 句柄：执行锁 + 取消监管
pub struct AgentHandle {
    pub agent_id: Uuid,
    agent: tokio::sync::Mutex<Agent>,
    supervisor: SessionSupervisor,
}

impl AgentHandle {
    pub fn new(agent: Agent) -> Self {
        Self {
            agent_id: agent.id(),
            agent: tokio::sync::Mutex::new(agent),
            supervisor: SessionSupervisor::new(),
        }
    }

    /// 进入执行临界区；同一 agent 的链式执行严格串行
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Agent> {
        self.agent.lock().await
    }

    /// 同 lock，但句柄已被关闭（agent 已删除或进程退出）时返回 NotFound
    pub async fn lock_live(&self) -> Result<tokio::sync::MutexGuard<'_, Agent>, AgentError> {
        let guard = self.agent.lock().await;
        if self.supervisor.is_shutdown() {
            return Err(AgentError::not_found("agent", self.agent_id.to_string()));
        }
        Ok(guard)
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }
}

type Slot = Arc<OnceCell<Arc<AgentHandle>>>;

#[derive(Default)]
pub struct AgentCache {
    entries: Mutex<HashMap<Uuid, Slot>>,
}

impl AgentCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, agent_id: Uuid) -> Result<Slot, AgentError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| AgentError::Storage("agent cache poisoned".into()))?;
        Ok(Arc::clone(entries.entry(agent_id).or_default()))
    }

    /// 命中则直接返回；否则调用 load 构造 Agent 并登记。load 失败时不留下空槽位
    pub async fn acquire<F, Fut>(&self, agent_id: Uuid, load: F) -> Result<Arc<AgentHandle>, AgentError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Agent, AgentError>>,
    {
        let slot = self.slot(agent_id)?;
        let result = slot
            .get_or_try_init(|| async {
                let agent = load().await?;
                tracing::info!(agent_id = %agent_id, "agent loaded into cache");
                Ok::<_, AgentError>(Arc::new(AgentHandle::new(agent)))
            })
            .await
            .map(Arc::clone);

        if result.is_err() {
            if let Ok(mut entries) = self.entries.lock() {
                let stale = entries
                    .get(&agent_id)
                    .map(|s| Arc::ptr_eq(s, &slot) && s.get().is_none())
                    .unwrap_or(false);
                if stale {
                    entries.remove(&agent_id);
                }
            }
        }
        result
    }

    /// 移除条目；返回已加载的句柄（如有）
    pub fn release(&self, agent_id: Uuid) -> Option<Arc<AgentHandle>> {
        let slot = self.entries.lock().ok()?.remove(&agent_id)?;
        slot.get().cloned()
    }

    /// 已加载的句柄（不触发加载）
    pub fn get(&self, agent_id: Uuid) -> Option<Arc<AgentHandle>> {
        let entries = self.entries.lock().ok()?;
        entries.get(&agent_id).and_then(|s| s.get().cloned())
    }

    /// 取消所有已加载 agent 的执行（进程退出）
    pub fn shutdown_all(&self) {
        let handles: Vec<Arc<AgentHandle>> = match self.entries.lock() {
            Ok(entries) => entries.values().filter_map(|s| s.get().cloned()).collect(),
            Err(_) => return,
        };
        for handle in handles {
            handle.supervisor().shutdown();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! 实体存储抽象层
//!
//! 用户 / agent / 工具 / 数据源 / 任务按行存取，单次调用内原子，不假设跨实体事务。
//! get_* 以 Option 返回，是否视为 NotFound 由调用方决定。

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::{AgentError, AgentState, Job, Source, ToolDescriptor, User};

/// 实体存储接口
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn create_user(&self, user: User) -> Result<(), AgentError>;
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, AgentError>;
    /// 删除用户及其工具、数据源、任务；agent 由调用方先行删除
    async fn delete_user(&self, id: Uuid) -> Result<(), AgentError>;

    /// 同一用户下 agent 名唯一
    async fn create_agent(&self, agent: AgentState) -> Result<(), AgentError>;
    async fn update_agent(&self, agent: AgentState) -> Result<(), AgentError>;
    async fn get_agent(&self, id: Uuid) -> Result<Option<AgentState>, AgentError>;
    async fn get_agent_by_name(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> Result<Option<AgentState>, AgentError>;
    async fn list_agents(&self, user_id: Uuid) -> Result<Vec<AgentState>, AgentError>;
    async fn delete_agent(&self, id: Uuid) -> Result<(), AgentError>;

    /// 同一用户下工具名唯一
    async fn create_tool(&self, tool: ToolDescriptor) -> Result<(), AgentError>;
    async fn update_tool(&self, tool: ToolDescriptor) -> Result<(), AgentError>;
    async fn get_tool(&self, id: Uuid) -> Result<Option<ToolDescriptor>, AgentError>;
    async fn get_tool_by_name(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> Result<Option<ToolDescriptor>, AgentError>;
    async fn list_tools(&self, user_id: Uuid) -> Result<Vec<ToolDescriptor>, AgentError>;
    async fn delete_tool(&self, id: Uuid) -> Result<(), AgentError>;

    async fn create_source(&self, source: Source) -> Result<(), AgentError>;
    async fn get_source(&self, id: Uuid) -> Result<Option<Source>, AgentError>;
    async fn get_source_by_name(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> Result<Option<Source>, AgentError>;
    async fn list_sources(&self, user_id: Uuid) -> Result<Vec<Source>, AgentError>;
    /// 同一用户下数据源名唯一
    async fn update_source(&self, source: Source) -> Result<(), AgentError>;
    /// 同时解除所有 agent 对它的挂载
    async fn delete_source(&self, id: Uuid) -> Result<(), AgentError>;

    async fn create_job(&self, job: Job) -> Result<(), AgentError>;
    async fn update_job(&self, job: Job) -> Result<(), AgentError>;
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, AgentError>;
    async fn list_jobs(&self, user_id: Uuid) -> Result<Vec<Job>, AgentError>;
    async fn delete_job(&self, id: Uuid) -> Result<(), AgentError>;

    /// 记录 agent 挂载了数据源；重复挂载返回 false
    async fn attach_source(&self, agent_id: Uuid, source_id: Uuid) -> Result<bool, AgentError>;
    async fn list_attached_sources(&self, agent_id: Uuid) -> Result<Vec<Uuid>, AgentError>;
}

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    agents: HashMap<Uuid, AgentState>,
    tools: HashMap<Uuid, ToolDescriptor>,
    sources: HashMap<Uuid, Source>,
    jobs: HashMap<Uuid, Job>,
    attachments: HashMap<Uuid, HashSet<Uuid>>,
}

/// 内存实体存储
#[derive(Default)]
pub struct InMemoryEntityStore {
    tables: RwLock<Tables>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_creation<T, F>(mut items: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> chrono::DateTime<chrono::Utc>,
{
    items.sort_by_key(|i| key(i));
    items
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn create_user(&self, user: User) -> Result<(), AgentError> {
        self.tables.write().await.users.insert(user.id, user);
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, AgentError> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn delete_user(&self, id: Uuid) -> Result<(), AgentError> {
        let mut t = self.tables.write().await;
        if t.agents.values().any(|a| a.user_id == id) {
            return Err(AgentError::Validation(format!(
                "user {} still owns agents",
                id
            )));
        }
        t.users
            .remove(&id)
            .ok_or_else(|| AgentError::not_found("user", id.to_string()))?;
        t.tools.retain(|_, x| x.user_id != id);
        let sources: HashSet<Uuid> = t
            .sources
            .values()
            .filter(|s| s.user_id == id)
            .map(|s| s.id)
            .collect();
        t.sources.retain(|sid, _| !sources.contains(sid));
        for attached in t.attachments.values_mut() {
            attached.retain(|sid| !sources.contains(sid));
        }
        t.jobs.retain(|_, j| j.user_id != id);
        Ok(())
    }

    async fn create_agent(&self, agent: AgentState) -> Result<(), AgentError> {
        let mut t = self.tables.write().await;
        if t
            .agents
            .values()
            .any(|a| a.user_id == agent.user_id && a.name == agent.name)
        {
            return Err(AgentError::Validation(format!(
                "agent name '{}' already exists",
                agent.name
            )));
        }
        t.agents.insert(agent.id, agent);
        Ok(())
    }

    async fn update_agent(&self, agent: AgentState) -> Result<(), AgentError> {
        let mut t = self.tables.write().await;
        if t
            .agents
            .values()
            .any(|a| a.id != agent.id && a.user_id == agent.user_id && a.name == agent.name)
        {
            return Err(AgentError::Validation(format!(
                "agent name '{}' already exists",
                agent.name
            )));
        }
        match t.agents.get_mut(&agent.id) {
            Some(slot) => {
                *slot = agent;
                Ok(())
            }
            None => Err(AgentError::not_found("agent", agent.id.to_string())),
        }
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<AgentState>, AgentError> {
        Ok(self.tables.read().await.agents.get(&id).cloned())
    }

    async fn get_agent_by_name(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> Result<Option<AgentState>, AgentError> {
        Ok(self
            .tables
            .read()
            .await
            .agents
            .values()
            .find(|a| a.user_id == user_id && a.name == name)
            .cloned())
    }

    async fn list_agents(&self, user_id: Uuid) -> Result<Vec<AgentState>, AgentError> {
        let t = self.tables.read().await;
        let agents = t
            .agents
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        Ok(sorted_by_creation(agents, |a| a.created_at))
    }

    async fn delete_agent(&self, id: Uuid) -> Result<(), AgentError> {
        let mut t = self.tables.write().await;
        t.agents
            .remove(&id)
            .ok_or_else(|| AgentError::not_found("agent", id.to_string()))?;
        t.attachments.remove(&id);
        Ok(())
    }

    async fn create_tool(&self, tool: ToolDescriptor) -> Result<(), AgentError> {
        let mut t = self.tables.write().await;
        if t
            .tools
            .values()
            .any(|x| x.user_id == tool.user_id && x.name == tool.name)
        {
            return Err(AgentError::Validation(format!(
                "tool '{}' already exists",
                tool.name
            )));
        }
        t.tools.insert(tool.id, tool);
        Ok(())
    }

    async fn update_tool(&self, tool: ToolDescriptor) -> Result<(), AgentError> {
        let mut t = self.tables.write().await;
        match t.tools.get_mut(&tool.id) {
            Some(slot) => {
                *slot = tool;
                Ok(())
            }
            None => Err(AgentError::not_found("tool", tool.id.to_string())),
        }
    }

    async fn get_tool(&self, id: Uuid) -> Result<Option<ToolDescriptor>, AgentError> {
        Ok(self.tables.read().await.tools.get(&id).cloned())
    }

    async fn get_tool_by_name(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> Result<Option<ToolDescriptor>, AgentError> {
        Ok(self
            .tables
            .read()
            .await
            .tools
            .values()
            .find(|x| x.user_id == user_id && x.name == name)
            .cloned())
    }

    async fn list_tools(&self, user_id: Uuid) -> Result<Vec<ToolDescriptor>, AgentError> {
        let t = self.tables.read().await;
        let tools = t
            .tools
            .values()
            .filter(|x| x.user_id == user_id)
            .cloned()
            .collect();
        Ok(sorted_by_creation(tools, |x| x.created_at))
    }

    async fn delete_tool(&self, id: Uuid) -> Result<(), AgentError> {
        self.tables
            .write()
            .await
            .tools
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| AgentError::not_found("tool", id.to_string()))
    }

    async fn create_source(&self, source: Source) -> Result<(), AgentError> {
        let mut t = self.tables.write().await;
        if t
            .sources
            .values()
            .any(|s| s.user_id == source.user_id && s.name == source.name)
        {
            return Err(AgentError::Validation(format!(
                "source '{}' already exists",
                source.name
            )));
        }
        t.sources.insert(source.id, source);
        Ok(())
    }

    async fn get_source(&self, id: Uuid) -> Result<Option<Source>, AgentError> {
        Ok(self.tables.read().await.sources.get(&id).cloned())
    }

    async fn get_source_by_name(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> Result<Option<Source>, AgentError> {
        Ok(self
            .tables
            .read()
            .await
            .sources
            .values()
            .find(|s| s.user_id == user_id && s.name == name)
            .cloned())
    }

    async fn list_sources(&self, user_id: Uuid) -> Result<Vec<Source>, AgentError> {
        let t = self.tables.read().await;
        let sources = t
            .sources
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        Ok(sorted_by_creation(sources, |s| s.created_at))
    }

    async fn update_source(&self, source: Source) -> Result<(), AgentError> {
        let mut t = self.tables.write().await;
        if t
            .sources
            .values()
            .any(|s| s.id != source.id && s.user_id == source.user_id && s.name == source.name)
        {
            return Err(AgentError::Validation(format!(
                "source '{}' already exists",
                source.name
            )));
        }
        match t.sources.get_mut(&source.id) {
            Some(slot) => {
                *slot = source;
                Ok(())
            }
            None => Err(AgentError::not_found("source", source.id.to_string())),
        }
    }

    async fn delete_source(&self, id: Uuid) -> Result<(), AgentError> {
        let mut t = self.tables.write().await;
        t.sources
            .remove(&id)
            .ok_or_else(|| AgentError::not_found("source", id.to_string()))?;
        for attached in t.attachments.values_mut() {
            attached.remove(&id);
        }
        Ok(())
    }

    async fn create_job(&self, job: Job) -> Result<(), AgentError> {
        self.tables.write().await.jobs.insert(job.id, job);
        Ok(())
    }

    async fn update_job(&self, job: Job) -> Result<(), AgentError> {
        let mut t = self.tables.write().await;
        match t.jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job;
                Ok(())
            }
            None => Err(AgentError::not_found("job", job.id.to_string())),
        }
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, AgentError> {
        Ok(self.tables.read().await.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, user_id: Uuid) -> Result<Vec<Job>, AgentError> {
        let t = self.tables.read().await;
        let jobs = t
            .jobs
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect();
        Ok(sorted_by_creation(jobs, |j| j.created_at))
    }

    async fn delete_job(&self, id: Uuid) -> Result<(), AgentError> {
        self.tables
            .write()
            .await
            .jobs
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| AgentError::not_found("job", id.to_string()))
    }

    async fn attach_source(&self, agent_id: Uuid, source_id: Uuid) -> Result<bool, AgentError> {
        Ok(self
            .tables
            .write()
            .await
            .attachments
            .entry(agent_id)
            .or_default()
            .insert(source_id))
    }

    async fn list_attached_sources(&self, agent_id: Uuid) -> Result<Vec<Uuid>, AgentError> {
        Ok(self
            .tables
            .read()
            .await
            .attachments
            .get(&agent_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::core::{EmbeddingConfig, LlmConfig};
    use crate::memory::Memory;

    fn agent(user_id: Uuid, name: &str) -> AgentState {
        AgentState {
            id: Uuid::new_v4(),
            name: name.into(),
            user_id,
            llm_config: LlmConfig::default(),
            embedding_config: EmbeddingConfig::default(),
            system: String::new(),
            memory: Memory::new(),
            tools: vec![],
            message_ids: vec![],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_agent_names_unique_per_user() {
        let store = InMemoryEntityStore::new();
        let user = Uuid::new_v4();
        store.create_agent(agent(user, "a")).await.unwrap();
        assert!(matches!(
            store.create_agent(agent(user, "a")).await,
            Err(AgentError::Validation(_))
        ));
        store.create_agent(agent(Uuid::new_v4(), "a")).await.unwrap();
        assert_eq!(store.list_agents(user).await.unwrap().len(), 1);
        assert!(store.get_agent_by_name(user, "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_and_delete_missing_agent() {
        let store = InMemoryEntityStore::new();
        let a = agent(Uuid::new_v4(), "ghost");
        assert!(matches!(
            store.update_agent(a.clone()).await,
            Err(AgentError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete_agent(a.id).await,
            Err(AgentError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_attach_source_is_idempotent() {
        let store = InMemoryEntityStore::new();
        let (a, s) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(store.attach_source(a, s).await.unwrap());
        assert!(!store.attach_source(a, s).await.unwrap());
        assert_eq!(store.list_attached_sources(a).await.unwrap(), vec![s]);
    }

    #[tokio::test]
    async fn test_jobs_listed_in_creation_order() {
        let store = InMemoryEntityStore::new();
        let user = Uuid::new_v4();
        let first = Job::new(user);
        let second = Job::new(user);
        store.create_job(first.clone()).await.unwrap();
        store.create_job(second.clone()).await.unwrap();
        let ids: Vec<Uuid> = store.list_jobs(user).await.unwrap().iter().map(|j| j.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first.id) && ids.contains(&second.id));
    }

    #[tokio::test]
    async fn test_delete_user_requires_agents_gone_and_cascades() {
        let store = InMemoryEntityStore::new();
        let user = User::new("owner");
        store.create_user(user.clone()).await.unwrap();
        let a = agent(user.id, "a");
        store.create_agent(a.clone()).await.unwrap();
        let source = Source::new(user.id, "docs", EmbeddingConfig::default());
        store.create_source(source.clone()).await.unwrap();
        store.create_job(Job::new(user.id)).await.unwrap();
        let other_agent = Uuid::new_v4();
        store.attach_source(other_agent, source.id).await.unwrap();

        assert!(matches!(
            store.delete_user(user.id).await,
            Err(AgentError::Validation(_))
        ));
        store.delete_agent(a.id).await.unwrap();
        store.delete_user(user.id).await.unwrap();

        assert!(store.get_user(user.id).await.unwrap().is_none());
        assert!(store.list_sources(user.id).await.unwrap().is_empty());
        assert!(store.list_jobs(user.id).await.unwrap().is_empty());
        assert!(store.list_attached_sources(other_agent).await.unwrap().is_empty());
        assert!(matches!(
            store.delete_user(user.id).await,
            Err(AgentError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_rename_and_delete_source() {
        let store = InMemoryEntityStore::new();
        let user = Uuid::new_v4();
        let mut docs = Source::new(user, "docs", EmbeddingConfig::default());
        let notes = Source::new(user, "notes", EmbeddingConfig::default());
        store.create_source(docs.clone()).await.unwrap();
        store.create_source(notes.clone()).await.unwrap();

        docs.name = "notes".into();
        assert!(matches!(
            store.update_source(docs.clone()).await,
            Err(AgentError::Validation(_))
        ));
        docs.name = "manuals".into();
        store.update_source(docs.clone()).await.unwrap();
        assert!(store.get_source_by_name(user, "manuals").await.unwrap().is_some());

        let agent_id = Uuid::new_v4();
        store.attach_source(agent_id, docs.id).await.unwrap();
        store.attach_source(agent_id, notes.id).await.unwrap();
        store.delete_source(docs.id).await.unwrap();
        assert_eq!(store.list_attached_sources(agent_id).await.unwrap(), vec![notes.id]);
        assert!(matches!(
            store.delete_source(docs.id).await,
            Err(AgentError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_job() {
        let store = InMemoryEntityStore::new();
        let job = Job::new(Uuid::new_v4());
        store.create_job(job.clone()).await.unwrap();
        store.delete_job(job.id).await.unwrap();
        assert!(store.get_job(job.id).await.unwrap().is_none());
        assert!(matches!(
            store.delete_job(job.id).await,
            Err(AgentError::NotFound { .. })
        ));
    }
}

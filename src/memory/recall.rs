//! Recall 记忆：按时间追加的消息日志
//!
//! 次序为 (created_at, 插入序号)。`page_desc` 从最新一条起按倒序分页，
//! `cursor` 提供稳定的游标分页。两种实现（内存 / SQLite）遵守同一契约。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::AgentError;
use crate::memory::cursor::{paginate, CursorPage, CursorQuery, CursorRecord};
use crate::memory::Message;

impl CursorRecord for Message {
    fn cursor_id(&self) -> Uuid {
        self.id
    }

    fn cursor_time(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// 消息日志存储
#[async_trait]
pub trait RecallStore: Send + Sync {
    /// 追加一批消息；任一条校验失败则整批不写入
    async fn append(&self, messages: &[Message]) -> Result<(), AgentError>;

    /// 原位改写（system 消息重建、rethink / rewrite）
    async fn update(&self, message: &Message) -> Result<(), AgentError>;

    /// 按 id 删除，返回实际删除条数
    async fn delete(&self, agent_id: Uuid, ids: &[Uuid]) -> Result<usize, AgentError>;

    /// 按给定 id 顺序取回消息；缺失的 id 被跳过
    async fn get_many(&self, agent_id: Uuid, ids: &[Uuid]) -> Result<Vec<Message>, AgentError>;

    /// 倒序分页：offset 从最新一条起算
    async fn page_desc(
        &self,
        agent_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Message>, AgentError>;

    async fn cursor(
        &self,
        agent_id: Uuid,
        query: &CursorQuery,
    ) -> Result<CursorPage<Message>, AgentError>;

    /// 文本包含匹配（大小写不敏感），按时间倒序
    async fn search_text(
        &self,
        agent_id: Uuid,
        query: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Message>, AgentError>;

    async fn size(&self, agent_id: Uuid) -> Result<usize, AgentError>;

    async fn delete_agent(&self, agent_id: Uuid) -> Result<(), AgentError>;
}

fn validate_batch(messages: &[Message]) -> Result<(), AgentError> {
    messages.iter().try_for_each(Message::validate)
}

#[derive(Default)]
struct Log {
    next_seq: u64,
    /// agent_id -> [(seq, message)]，按插入顺序
    entries: HashMap<Uuid, Vec<(u64, Message)>>,
}

impl Log {
    /// 按 (created_at, seq) 升序
    fn sorted(&self, agent_id: Uuid) -> Vec<&(u64, Message)> {
        let mut v: Vec<&(u64, Message)> = self
            .entries
            .get(&agent_id)
            .map(|e| e.iter().collect())
            .unwrap_or_default();
        v.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at).then(a.0.cmp(&b.0)));
        v
    }
}

/// 内存实现：测试与单进程部署使用
#[derive(Default)]
pub struct InMemoryRecallStore {
    log: RwLock<Log>,
}

impl InMemoryRecallStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecallStore for InMemoryRecallStore {
    async fn append(&self, messages: &[Message]) -> Result<(), AgentError> {
        validate_batch(messages)?;
        let mut log = self.log.write().await;
        for m in messages {
            let seq = log.next_seq;
            log.next_seq += 1;
            log.entries
                .entry(m.agent_id)
                .or_default()
                .push((seq, m.clone()));
        }
        Ok(())
    }

    async fn update(&self, message: &Message) -> Result<(), AgentError> {
        let mut log = self.log.write().await;
        let slot = log
            .entries
            .get_mut(&message.agent_id)
            .and_then(|e| e.iter_mut().find(|(_, m)| m.id == message.id))
            .ok_or_else(|| AgentError::not_found("message", message.id.to_string()))?;
        slot.1 = message.clone();
        Ok(())
    }

    async fn delete(&self, agent_id: Uuid, ids: &[Uuid]) -> Result<usize, AgentError> {
        let mut log = self.log.write().await;
        let Some(entries) = log.entries.get_mut(&agent_id) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|(_, m)| !ids.contains(&m.id));
        Ok(before - entries.len())
    }

    async fn get_many(&self, agent_id: Uuid, ids: &[Uuid]) -> Result<Vec<Message>, AgentError> {
        let log = self.log.read().await;
        let Some(entries) = log.entries.get(&agent_id) else {
            return Ok(Vec::new());
        };
        let by_id: HashMap<Uuid, &Message> = entries.iter().map(|(_, m)| (m.id, m)).collect();
        Ok(ids
            .iter()
            .filter_map(|id| by_id.get(id).map(|m| (*m).clone()))
            .collect())
    }

    async fn page_desc(
        &self,
        agent_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Message>, AgentError> {
        let log = self.log.read().await;
        Ok(log
            .sorted(agent_id)
            .into_iter()
            .rev()
            .skip(offset)
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn cursor(
        &self,
        agent_id: Uuid,
        query: &CursorQuery,
    ) -> Result<CursorPage<Message>, AgentError> {
        let log = self.log.read().await;
        let empty = Vec::new();
        let entries = log.entries.get(&agent_id).unwrap_or(&empty);
        paginate(entries, query)
    }

    async fn search_text(
        &self,
        agent_id: Uuid,
        query: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Message>, AgentError> {
        let needle = query.to_lowercase();
        let log = self.log.read().await;
        Ok(log
            .sorted(agent_id)
            .into_iter()
            .rev()
            .filter(|(_, m)| m.text.to_lowercase().contains(&needle))
            .skip(offset)
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn size(&self, agent_id: Uuid) -> Result<usize, AgentError> {
        Ok(self
            .log
            .read()
            .await
            .entries
            .get(&agent_id)
            .map(|e| e.len())
            .unwrap_or(0))
    }

    async fn delete_agent(&self, agent_id: Uuid) -> Result<(), AgentError> {
        self.log.write().await.entries.remove(&agent_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn seeded(agent: Uuid, n: usize) -> Vec<Message> {
        let base = Utc::now();
        (0..n)
            .map(|i| {
                Message::user(agent, format!("message {}", i))
                    .with_created_at(base + Duration::milliseconds(i as i64))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_append_rejects_empty_batch_atomically() {
        let store = InMemoryRecallStore::new();
        let agent = Uuid::new_v4();
        let batch = vec![Message::user(agent, "ok"), Message::user(agent, "")];
        assert!(matches!(
            store.append(&batch).await,
            Err(AgentError::Validation(_))
        ));
        assert_eq!(store.size(agent).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_page_desc_is_reverse_chronological() {
        let store = InMemoryRecallStore::new();
        let agent = Uuid::new_v4();
        let msgs = seeded(agent, 5);
        store.append(&msgs).await.unwrap();
        let page = store.page_desc(agent, 1, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, msgs[3].id);
        assert_eq!(page[1].id, msgs[2].id);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let store = InMemoryRecallStore::new();
        let agent = Uuid::new_v4();
        let mut msgs = seeded(agent, 3);
        store.append(&msgs).await.unwrap();
        msgs[0].text = "rewritten".into();
        store.update(&msgs[0]).await.unwrap();
        let got = store.get_many(agent, &[msgs[0].id]).await.unwrap();
        assert_eq!(got[0].text, "rewritten");

        assert_eq!(store.delete(agent, &[msgs[1].id]).await.unwrap(), 1);
        assert_eq!(store.size(agent).await.unwrap(), 2);
        let missing = Message::user(agent, "never stored");
        assert!(store.update(&missing).await.is_err());
    }

    #[tokio::test]
    async fn test_search_text_case_insensitive() {
        let store = InMemoryRecallStore::new();
        let agent = Uuid::new_v4();
        let mut msgs = seeded(agent, 3);
        msgs[1].text = "I love Rust".into();
        store.append(&msgs).await.unwrap();
        let hits = store.search_text(agent, "rust", 0, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, msgs[1].id);
    }

    #[tokio::test]
    async fn test_agents_are_isolated() {
        let store = InMemoryRecallStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.append(&seeded(a, 2)).await.unwrap();
        store.append(&seeded(b, 3)).await.unwrap();
        assert_eq!(store.size(a).await.unwrap(), 2);
        store.delete_agent(b).await.unwrap();
        assert_eq!(store.size(b).await.unwrap(), 0);
    }
}

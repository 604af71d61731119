//! Archival 记忆：可语义检索的长期段落存储
//!
//! `ArchivalMemory` 负责分块与嵌入，`PassageStore` 只负责存取。
//! 写入时先为所有分块计算嵌入，全部成功后才落库，嵌入失败不会留下部分写入。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::AgentError;
use crate::llm::EmbeddingProvider;
use crate::memory::cursor::{paginate, CursorPage, CursorQuery, CursorRecord};
use crate::memory::Chunker;

/// 段落：文本 + 嵌入向量 + 可选归属（agent / 数据源 / 文档）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Passage {
    pub id: Uuid,
    pub text: String,
    #[serde(skip_serializing, default)]
    pub embedding: Vec<f32>,
    pub agent_id: Option<Uuid>,
    pub source_id: Option<Uuid>,
    pub doc_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CursorRecord for Passage {
    fn cursor_id(&self) -> Uuid {
        self.id
    }

    fn cursor_time(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// 写入归属
#[derive(Clone, Debug, Default)]
pub struct PassageScope {
    pub agent_id: Option<Uuid>,
    pub source_id: Option<Uuid>,
    pub doc_id: Option<String>,
}

impl PassageScope {
    pub fn agent(agent_id: Uuid) -> Self {
        Self {
            agent_id: Some(agent_id),
            ..Default::default()
        }
    }

    pub fn source(source_id: Uuid, doc_id: impl Into<String>) -> Self {
        Self {
            source_id: Some(source_id),
            doc_id: Some(doc_id.into()),
            ..Default::default()
        }
    }
}

/// 检索结果
#[derive(Clone, Debug, Serialize)]
pub struct ScoredPassage {
    pub passage: Passage,
    pub score: f32,
}

/// 段落存储（只追加，按 id 删除）
#[async_trait]
pub trait PassageStore: Send + Sync {
    async fn insert(&self, passages: Vec<Passage>) -> Result<Vec<Uuid>, AgentError>;

    /// 在 agent 的段落中按余弦相似度排序
    async fn search(
        &self,
        agent_id: Uuid,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredPassage>, AgentError>;

    async fn delete(&self, agent_id: Uuid, id: Uuid) -> Result<(), AgentError>;

    async fn cursor(
        &self,
        agent_id: Uuid,
        query: &CursorQuery,
    ) -> Result<CursorPage<Passage>, AgentError>;

    async fn size(&self, agent_id: Uuid) -> Result<usize, AgentError>;

    /// 按写入顺序取 agent 的第 start 条起、至多 count 条
    async fn page(
        &self,
        agent_id: Uuid,
        start: usize,
        count: usize,
    ) -> Result<Vec<Passage>, AgentError>;

    async fn list_by_source(&self, source_id: Uuid) -> Result<Vec<Passage>, AgentError>;

    async fn delete_agent(&self, agent_id: Uuid) -> Result<(), AgentError>;

    /// 删除数据源自身的段落（已复制给 agent 的副本保留），返回删除数量
    async fn delete_source(&self, source_id: Uuid) -> Result<usize, AgentError>;
}

#[derive(Default)]
struct Passages {
    next_seq: u64,
    entries: Vec<(u64, Passage)>,
}

/// 内存向量存储
#[derive(Default)]
pub struct InMemoryPassageStore {
    inner: RwLock<Passages>,
}

impl InMemoryPassageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PassageStore for InMemoryPassageStore {
    async fn insert(&self, passages: Vec<Passage>) -> Result<Vec<Uuid>, AgentError> {
        let mut inner = self.inner.write().await;
        let ids = passages.iter().map(|p| p.id).collect();
        for p in passages {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.entries.push((seq, p));
        }
        Ok(ids)
    }

    async fn search(
        &self,
        agent_id: Uuid,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredPassage>, AgentError> {
        let inner = self.inner.read().await;
        let mut scored: Vec<ScoredPassage> = inner
            .entries
            .iter()
            .filter(|(_, p)| p.agent_id == Some(agent_id))
            .map(|(_, p)| ScoredPassage {
                score: cosine_similarity(query, &p.embedding),
                passage: p.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn delete(&self, agent_id: Uuid, id: Uuid) -> Result<(), AgentError> {
        let mut inner = self.inner.write().await;
        let before = inner.entries.len();
        inner
            .entries
            .retain(|(_, p)| !(p.id == id && p.agent_id == Some(agent_id)));
        if inner.entries.len() == before {
            return Err(AgentError::not_found("passage", id.to_string()));
        }
        Ok(())
    }

    async fn cursor(
        &self,
        agent_id: Uuid,
        query: &CursorQuery,
    ) -> Result<CursorPage<Passage>, AgentError> {
        let inner = self.inner.read().await;
        let owned: Vec<(u64, Passage)> = inner
            .entries
            .iter()
            .filter(|(_, p)| p.agent_id == Some(agent_id))
            .cloned()
            .collect();
        paginate(&owned, query)
    }

    async fn size(&self, agent_id: Uuid) -> Result<usize, AgentError> {
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .iter()
            .filter(|(_, p)| p.agent_id == Some(agent_id))
            .count())
    }

    async fn page(
        &self,
        agent_id: Uuid,
        start: usize,
        count: usize,
    ) -> Result<Vec<Passage>, AgentError> {
        let inner = self.inner.read().await;
        let mut owned: Vec<&(u64, Passage)> = inner
            .entries
            .iter()
            .filter(|(_, p)| p.agent_id == Some(agent_id))
            .collect();
        owned.sort_by_key(|(seq, _)| *seq);
        Ok(owned
            .into_iter()
            .skip(start)
            .take(count)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn list_by_source(&self, source_id: Uuid) -> Result<Vec<Passage>, AgentError> {
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .iter()
            .filter(|(_, p)| p.source_id == Some(source_id) && p.agent_id.is_none())
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn delete_agent(&self, agent_id: Uuid) -> Result<(), AgentError> {
        self.inner
            .write()
            .await
            .entries
            .retain(|(_, p)| p.agent_id != Some(agent_id));
        Ok(())
    }

    async fn delete_source(&self, source_id: Uuid) -> Result<usize, AgentError> {
        let mut inner = self.inner.write().await;
        let before = inner.entries.len();
        inner
            .entries
            .retain(|(_, p)| !(p.source_id == Some(source_id) && p.agent_id.is_none()));
        Ok(before - inner.entries.len())
    }
}

/// 余弦相似度
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// 归档记忆：分块 + 嵌入 + 存储
#[derive(Clone)]
pub struct ArchivalMemory {
    store: Arc<dyn PassageStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Chunker,
}

impl ArchivalMemory {
    pub fn new(
        store: Arc<dyn PassageStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        chunker: Chunker,
    ) -> Self {
        Self {
            store,
            embedder,
            chunker,
        }
    }

    pub fn store(&self) -> &Arc<dyn PassageStore> {
        &self.store
    }

    /// 分块、嵌入后写入；返回新段落 id
    pub async fn insert(&self, scope: PassageScope, text: &str) -> Result<Vec<Uuid>, AgentError> {
        let chunks = self.chunker.chunk(text);
        if chunks.is_empty() {
            return Err(AgentError::Validation("archival text is empty".into()));
        }

        let mut passages = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let embedding = self.embed(&chunk).await?;
            passages.push(Passage {
                id: Uuid::new_v4(),
                text: chunk,
                embedding,
                agent_id: scope.agent_id,
                source_id: scope.source_id,
                doc_id: scope.doc_id.clone(),
                created_at: Utc::now(),
            });
        }
        self.store.insert(passages).await
    }

    pub async fn search(
        &self,
        agent_id: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredPassage>, AgentError> {
        let embedding = self.embed(query).await?;
        self.store.search(agent_id, &embedding, limit).await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AgentError> {
        let embedding = self.embedder.embed(text).await?;
        if embedding.is_empty() {
            return Err(AgentError::Embedding("empty embedding".into()));
        }
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::HashEmbedder;
    use crate::memory::ChunkingConfig;

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, AgentError> {
            Err(AgentError::Embedding("backend down".into()))
        }
    }

    fn archival(embedder: Arc<dyn EmbeddingProvider>) -> ArchivalMemory {
        ArchivalMemory::new(
            Arc::new(InMemoryPassageStore::new()),
            embedder,
            Chunker::new(ChunkingConfig::with_chunk_size(40)),
        )
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);

        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &c)).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_insert_chunks_and_search_ranks_best_first() {
        let mem = archival(Arc::new(HashEmbedder::new(128)));
        let agent = Uuid::new_v4();
        mem.insert(PassageScope::agent(agent), "my cat is named Ferris")
            .await
            .unwrap();
        mem.insert(PassageScope::agent(agent), "the weather was rainy today")
            .await
            .unwrap();
        let hits = mem.search(agent, "cat named Ferris", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].passage.text.contains("Ferris"));
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn test_embedding_failure_writes_nothing() {
        let mem = archival(Arc::new(FailingEmbedder));
        let agent = Uuid::new_v4();
        let err = mem
            .insert(PassageScope::agent(agent), "anything at all")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Embedding(_)));
        assert_eq!(mem.store().size(agent).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_long_text_split_into_passages() {
        let mem = archival(Arc::new(HashEmbedder::new(64)));
        let agent = Uuid::new_v4();
        let text = "First sentence here. Second sentence follows. Third one closes it out nicely.";
        let ids = mem.insert(PassageScope::agent(agent), text).await.unwrap();
        assert!(ids.len() > 1);
        assert_eq!(mem.store().size(agent).await.unwrap(), ids.len());
    }

    #[tokio::test]
    async fn test_delete_and_cursor() {
        let mem = archival(Arc::new(HashEmbedder::new(32)));
        let agent = Uuid::new_v4();
        let mut ids = Vec::new();
        for t in ["one", "two", "three"] {
            ids.extend(mem.insert(PassageScope::agent(agent), t).await.unwrap());
        }
        let page = mem.store().cursor(agent, &CursorQuery::limit(2)).await.unwrap();
        assert_eq!(page.records.len(), 2);
        let rest = mem
            .store()
            .cursor(agent, &CursorQuery::limit(2).after(page.next_cursor.unwrap()))
            .await
            .unwrap();
        assert_eq!(rest.records.len(), 1);
        assert_eq!(rest.records[0].id, ids[2]);

        mem.store().delete(agent, ids[0]).await.unwrap();
        assert!(mem.store().delete(agent, ids[0]).await.is_err());
        assert_eq!(mem.store().size(agent).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_page_in_insertion_order() {
        let mem = archival(Arc::new(HashEmbedder::new(32)));
        let agent = Uuid::new_v4();
        let mut ids = Vec::new();
        for t in ["one", "two", "three", "four"] {
            ids.extend(mem.insert(PassageScope::agent(agent), t).await.unwrap());
        }
        let page: Vec<Uuid> = mem
            .store()
            .page(agent, 1, 2)
            .await
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(page, ids[1..3].to_vec());
        assert!(mem.store().page(agent, 4, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_source_keeps_agent_copies() {
        let mem = archival(Arc::new(HashEmbedder::new(32)));
        let source = Uuid::new_v4();
        let agent = Uuid::new_v4();
        mem.insert(PassageScope::source(source, "a.txt"), "shared knowledge")
            .await
            .unwrap();
        let copy = Passage {
            id: Uuid::new_v4(),
            agent_id: Some(agent),
            ..mem.store().list_by_source(source).await.unwrap()[0].clone()
        };
        mem.store().insert(vec![copy]).await.unwrap();

        assert_eq!(mem.store().delete_source(source).await.unwrap(), 1);
        assert!(mem.store().list_by_source(source).await.unwrap().is_empty());
        assert_eq!(mem.store().size(agent).await.unwrap(), 1);
    }
}

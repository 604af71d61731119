//! 嵌入 API：供 archival 记忆使用
//!
//! OpenAiEmbedder 调用 OpenAI 兼容的 /embeddings 端点；HashEmbedder 为本地确定性实现（词袋特征哈希），无需网络。

use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;

use crate::config::EmbeddingSection;
use crate::core::AgentError;

/// 嵌入提供方：失败统一为 AgentError::Embedding
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AgentError>;
}

/// 使用 async-openai 调用 OpenAI 兼容的 embeddings API
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
}

impl OpenAiEmbedder {
    /// 从环境变量与可选 base_url 创建（与 LLM 共用 OPENAI_API_KEY / base_url）
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AgentError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AgentError::Embedding("cannot embed empty text".into()));
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::String(text.to_string()))
            .build()
            .map_err(|e| AgentError::Embedding(e.to_string()))?;
        let response = tokio::time::timeout(self.timeout, self.client.embeddings().create(request))
            .await
            .map_err(|_| AgentError::Embedding("embedding request timed out".into()))?
            .map_err(|e| AgentError::Embedding(e.to_string()))?;
        response
            .data
            .first()
            .map(|e| e.embedding.clone())
            .ok_or_else(|| AgentError::Embedding("empty embedding response".into()))
    }
}

/// 确定性本地嵌入：小写分词后做特征哈希，再 L2 归一化
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        for token in tokenize_lower(text) {
            let h = fnv1a(token.as_bytes());
            let idx = (h % self.dim as u64) as usize;
            // 高位决定符号，降低碰撞带来的偏置
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AgentError> {
        if text.trim().is_empty() {
            return Err(AgentError::Embedding("cannot embed empty text".into()));
        }
        Ok(self.embed_text(text))
    }
}

/// 按非字母数字切分并小写
fn tokenize_lower(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// 从应用配置创建嵌入提供方；openai 缺少 API Key 时回退到 hash
pub fn create_embedder_from_config(section: &EmbeddingSection) -> Arc<dyn EmbeddingProvider> {
    if section.provider == "openai" {
        let key = std::env::var("OPENAI_API_KEY").ok();
        if key.as_deref().unwrap_or("").is_empty() {
            tracing::warn!("embedding provider 'openai' without OPENAI_API_KEY, using hash embedder");
        } else {
            return Arc::new(OpenAiEmbedder::new(
                section.base_url.as_deref(),
                &section.model,
                key.as_deref(),
            ));
        }
    }
    Arc::new(HashEmbedder::new(section.dim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::cosine_similarity;

    #[tokio::test]
    async fn test_hash_embedder_is_deterministic_and_normalized() {
        let e = HashEmbedder::new(64);
        let a = e.embed("Hello world").await.unwrap();
        let b = e.embed("hello, WORLD").await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_hash_embedder_similarity() {
        let e = HashEmbedder::new(256);
        let q = e.embed("favorite color blue").await.unwrap();
        let near = e.embed("my favorite color is blue").await.unwrap();
        let far = e.embed("train schedule tomorrow").await.unwrap();
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[tokio::test]
    async fn test_empty_text_is_embedding_error() {
        let e = HashEmbedder::new(8);
        assert!(matches!(e.embed("  ").await, Err(AgentError::Embedding(_))));
    }

    #[test]
    fn test_config_fallback_to_hash() {
        let section = EmbeddingSection {
            provider: "hash".into(),
            ..Default::default()
        };
        let _embedder = create_embedder_from_config(&section);
    }
}

//! LLM 层：模型后端与嵌入提供方的抽象与实现（OpenAI 兼容 / Hash / Mock / Scripted）

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod parse;
pub mod traits;

pub use embedding::{create_embedder_from_config, EmbeddingProvider, HashEmbedder, OpenAiEmbedder};
pub use mock::{MockModel, Scripted, ScriptedModel};
pub use openai::{create_model_from_config, OpenAiBackend, TokenUsage};
pub use parse::{parse_reply, ParsedReply};
pub use traits::{
    ModelBackend, ModelChunk, ModelRequest, ModelResponse, ModelStream, ModelUsage, ToolSchema,
};

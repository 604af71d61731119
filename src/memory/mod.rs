//! 记忆层：核心记忆（块）、recall（消息日志）、archival（向量段落）与上下文预算

pub mod archival;
pub mod block;
pub mod chunker;
pub mod cursor;
pub mod manager;
pub mod message;
pub mod recall;
pub mod sqlite;
pub mod token_budget;

pub use archival::{
    cosine_similarity, ArchivalMemory, InMemoryPassageStore, Passage, PassageScope, PassageStore,
    ScoredPassage,
};
pub use block::{Block, Memory};
pub use chunker::{Chunker, ChunkingConfig};
pub use cursor::{CursorPage, CursorQuery, OrderBy};
pub use manager::MemoryManager;
pub use message::{Message, Role, ToolCall};
pub use recall::{InMemoryRecallStore, RecallStore};
pub use sqlite::SqliteRecallStore;
pub use token_budget::{TokenBudget, TokenEstimator};

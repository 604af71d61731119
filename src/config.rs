//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MNEMO__*` 覆盖（双下划线表示嵌套，如 `MNEMO__RUNTIME__CHAINING=false`）。
//! 配置只在启动时加载一次，之后以值的形式传入 `AgentServer::new`，不存在全局可变单例。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub runtime: RuntimeSection,
    pub llm: LlmSection,
    pub embedding: EmbeddingSection,
    pub tools: ToolsSection,
    pub memory: MemorySection,
    pub storage: StorageSection,
}

/// [app] 段：应用名、数据目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// SQLite 等持久化文件所在目录，未设置时用 ./data
    pub data_dir: Option<PathBuf>,
}

/// [runtime] 段：链式执行策略
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSection {
    /// 关闭后每次 send_message 只执行一轮
    #[serde(default = "default_chaining")]
    pub chaining: bool,
    /// 最大链式步数；None 表示不设上限
    #[serde(default = "default_max_chaining_steps")]
    pub max_chaining_steps: Option<u32>,
    /// 上下文窗口内最多保留的消息条数（含 system 消息）
    #[serde(default = "default_max_in_context_messages")]
    pub max_in_context_messages: usize,
    /// 估算 token 超过 context_window 的该比例时触发 token_warning
    #[serde(default = "default_token_warning_fraction")]
    pub token_warning_fraction: f64,
}

fn default_chaining() -> bool {
    true
}

fn default_max_chaining_steps() -> Option<u32> {
    Some(10)
}

fn default_max_in_context_messages() -> usize {
    64
}

fn default_token_warning_fraction() -> f64 {
    0.75
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            chaining: default_chaining(),
            max_chaining_steps: default_max_chaining_steps(),
            max_in_context_messages: default_max_in_context_messages(),
            token_warning_fraction: default_token_warning_fraction(),
        }
    }
}

/// [llm] 段：后端选择、上下文窗口与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：mock / openai
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

fn default_provider() -> String {
    "mock".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_context_window() -> usize {
    8192
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            context_window: default_context_window(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

/// [embedding] 段：嵌入后端（openai / hash）
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingSection {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// hash 嵌入的维度
    #[serde(default = "default_embedding_dim")]
    pub dim: usize,
    /// 归档写入时的分块大小（字符数）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dim() -> usize {
    256
}

fn default_chunk_size() -> usize {
    500
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            base_url: None,
            dim: default_embedding_dim(),
            chunk_size: default_chunk_size(),
        }
    }
}

/// [tools] 段：工具超时与用户工具沙箱
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default)]
    pub sandbox: SandboxSection,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            sandbox: SandboxSection::default(),
        }
    }
}

/// [tools.sandbox] 段：用户自定义工具的执行方式
///
/// enabled = false 时用户工具可注册但调用必然失败；
/// interpreters 把 source_type 映射为解释器程序（子进程执行，源码不进入本进程）。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub interpreters: HashMap<String, String>,
}

/// [memory] 段：新建 agent 时的默认核心记忆
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_persona")]
    pub persona: String,
    #[serde(default = "default_human")]
    pub human: String,
    #[serde(default = "default_block_limit")]
    pub persona_limit: usize,
    #[serde(default = "default_block_limit")]
    pub human_limit: usize,
}

fn default_persona() -> String {
    "I am Sam, a helpful assistant with a long memory.".to_string()
}

fn default_human() -> String {
    "The user has not told me about themselves yet.".to_string()
}

fn default_block_limit() -> usize {
    2000
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            persona: default_persona(),
            human: default_human(),
            persona_limit: default_block_limit(),
            human_limit: default_block_limit(),
        }
    }
}

/// [storage] 段：recall 存储后端（memory / sqlite）
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_recall_backend")]
    pub recall: String,
    pub sqlite_path: Option<PathBuf>,
}

fn default_recall_backend() -> String {
    "memory".to_string()
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            recall: default_recall_backend(),
            sqlite_path: None,
        }
    }
}

/// 从 config 目录加载配置，环境变量 MNEMO__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MNEMO__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MNEMO")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert!(cfg.runtime.chaining);
        assert_eq!(cfg.runtime.max_chaining_steps, Some(10));
        assert_eq!(cfg.llm.provider, "mock");
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
        assert_eq!(cfg.storage.recall, "memory");
    }

    #[test]
    fn test_load_from_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[runtime]\nchaining = false\nmax_chaining_steps = 3\n\n[llm]\ncontext_window = 4096\n",
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert!(!cfg.runtime.chaining);
        assert_eq!(cfg.runtime.max_chaining_steps, Some(3));
        assert_eq!(cfg.llm.context_window, 4096);
    }
}

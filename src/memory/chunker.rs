//! 文档分块：归档写入与数据源加载前，把长文本切成可嵌入的段落（UTF-8 安全）

/// 分块策略
#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// 目标块大小（字符数）
    pub chunk_size: usize,
    /// 块之间的重叠（字符数）
    pub chunk_overlap: usize,
    /// 分隔符优先级（从高到低）
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            separators: vec![
                "\n\n".to_string(),
                "\n".to_string(),
                "。".to_string(),
                ". ".to_string(),
                "！".to_string(),
                "？".to_string(),
                "! ".to_string(),
                "? ".to_string(),
                " ".to_string(),
            ],
        }
    }
}

impl ChunkingConfig {
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap: (chunk_size / 10).min(50),
            ..Default::default()
        }
    }
}

/// 文档分块器
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    /// 按分隔符优先断开；返回去除首尾空白后的非空块
    pub fn chunk(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let chars: Vec<char> = text.chars().collect();
        let total_chars = chars.len();
        let chunk_size = self.config.chunk_size.max(1);

        let mut current_idx = 0;
        while current_idx < total_chars {
            let target_end = (current_idx + chunk_size).min(total_chars);
            let mut actual_end = target_end;

            // 不是末尾时尝试在分隔符处断开
            if target_end < total_chars {
                let slice: String = chars[current_idx..target_end].iter().collect();
                for sep in &self.config.separators {
                    if let Some(pos) = slice.rfind(sep.as_str()) {
                        let chars_to_sep = slice[..pos].chars().count() + sep.chars().count();
                        if chars_to_sep > 0 {
                            actual_end = current_idx + chars_to_sep;
                            break;
                        }
                    }
                }
            }

            let chunk_text: String = chars[current_idx..actual_end].iter().collect();
            let trimmed = chunk_text.trim();
            if !trimmed.is_empty() {
                chunks.push(trimmed.to_string());
            }

            if actual_end >= total_chars {
                break;
            }
            let overlap = self.config.chunk_overlap.min(actual_end - current_idx);
            let next_start = actual_end.saturating_sub(overlap);
            // 确保前进
            current_idx = if next_start > current_idx {
                next_start
            } else {
                actual_end
            };
        }

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_single_chunk() {
        let chunker = Chunker::default();
        assert_eq!(chunker.chunk("  hello world  "), vec!["hello world".to_string()]);
        assert!(chunker.chunk("   ").is_empty());
    }

    #[test]
    fn test_chunking_respects_size() {
        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: 20,
            chunk_overlap: 5,
            ..Default::default()
        });

        let text = "这是第一段话。这是第二句话。这是第三句话。\n\n这是第二段。这里有更多内容。";
        let chunks = chunker.chunk(text);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(!chunk.is_empty());
            assert!(chunk.chars().count() <= 20);
        }
    }

    #[test]
    fn test_breaks_at_separator() {
        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: 12,
            chunk_overlap: 0,
            ..Default::default()
        });
        let chunks = chunker.chunk("alpha beta\n\ngamma delta");
        assert_eq!(chunks[0], "alpha beta");
    }

    #[test]
    fn test_chunking_config_default() {
        let config = ChunkingConfig::default();
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.chunk_overlap, 50);
        assert!(!config.separators.is_empty());
    }
}

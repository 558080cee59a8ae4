use atalaya_core::model::{Chunk, DocumentId};

/// Fixed-character windows with overlap. Character counts, not bytes, so
/// multibyte text never splits inside a code point.
#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub target_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_size: 900,
            overlap: 120,
        }
    }
}

impl ChunkingConfig {
    fn step(&self) -> usize {
        self.target_size.saturating_sub(self.overlap).max(1)
    }
}

pub fn chunk_text(text: &str, config: &ChunkingConfig) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }

    // Byte offset of every char boundary, plus the end of the text.
    let mut boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    boundaries.push(text.len());
    let total_chars = boundaries.len() - 1;

    let mut out = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + config.target_size).min(total_chars);
        out.push(text[boundaries[start]..boundaries[end]].to_string());
        if end == total_chars {
            break;
        }
        start += config.step();
    }
    out
}

/// Chunks a document's text into entity rows with contiguous indices.
pub fn chunk_document(
    document_id: &DocumentId,
    text: &str,
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    chunk_text(text, config)
        .into_iter()
        .enumerate()
        .map(|(i, content)| Chunk::new(document_id.clone(), i as u32, content))
        .collect()
}

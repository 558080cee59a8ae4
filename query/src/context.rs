use atalaya_core::model::ScoredChunk;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;

/// One `[S#]` citation entry, in 1:1 correspondence with the chunks used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub index: usize,
    pub document_id: String,
    pub document_title: String,
}

#[derive(Debug, Clone)]
pub struct BuiltContext {
    pub text: String,
    pub chunks_used: Vec<ScoredChunk>,
    pub sources: Vec<SourceRef>,
}

impl BuiltContext {
    pub fn is_empty(&self) -> bool {
        self.chunks_used.is_empty()
    }

    fn empty() -> Self {
        Self {
            text: String::new(),
            chunks_used: Vec::new(),
            sources: Vec::new(),
        }
    }
}

/// Counts size in tokens when injected; characters otherwise.
pub type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Assembles the delimited context passed to the LLM:
///
/// ```text
/// ---[S1]---
/// <sanitized chunk content>
/// ---[FIN S1]---
///
/// FUENTES:
/// [S1] → <title> (<document_id>)
/// ```
pub struct ContextBuilder {
    max_size: usize,
    token_counter: Option<TokenCounter>,
}

impl ContextBuilder {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            token_counter: None,
        }
    }

    pub fn with_token_counter(mut self, counter: TokenCounter) -> Self {
        self.token_counter = Some(counter);
        self
    }

    fn measure(&self, text: &str) -> usize {
        match &self.token_counter {
            Some(counter) => counter(text),
            None => text.chars().count(),
        }
    }

    pub fn build(&self, chunks: &[ScoredChunk]) -> BuiltContext {
        let mut seen: HashSet<[u8; 32]> = HashSet::new();
        let mut blocks: Vec<String> = Vec::new();
        let mut used: Vec<ScoredChunk> = Vec::new();
        let mut sources: Vec<SourceRef> = Vec::new();
        let mut total = 0usize;

        for chunk in chunks {
            if !seen.insert(fingerprint(chunk)) {
                continue;
            }

            let index = used.len() + 1;
            let block = format!(
                "---[S{}]---\n{}\n---[FIN S{}]---",
                index,
                sanitize(&chunk.chunk.content),
                index
            );

            let cost = self.measure(&block) + if blocks.is_empty() { 0 } else { 2 };
            if total + cost > self.max_size {
                break;
            }
            total += cost;

            blocks.push(block);
            sources.push(SourceRef {
                index,
                document_id: chunk.chunk.document_id.as_str().to_string(),
                document_title: chunk.document_title.clone(),
            });
            used.push(chunk.clone());
        }

        if used.is_empty() {
            return BuiltContext::empty();
        }

        let mut text = blocks.join("\n\n");
        text.push_str("\n\nFUENTES:\n");
        for source in &sources {
            text.push_str(&format!(
                "[S{}] → {} ({})\n",
                source.index, source.document_title, source.document_id
            ));
        }

        BuiltContext {
            text,
            chunks_used: used,
            sources,
        }
    }
}

fn fingerprint(chunk: &ScoredChunk) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(chunk.chunk.document_id.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(chunk.chunk.content.as_bytes());
    hasher.finalize().into()
}

/// Defuses source-marker lookalikes inside retrieved text. Not reversible;
/// the builder never reconstructs raw chunk content.
fn sanitize(content: &str) -> String {
    content
        .replace("---[", "~~~[")
        .replace("FUENTES:", "FUENTES;")
        .replace("fuentes:", "fuentes;")
}

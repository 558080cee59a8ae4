use atalaya_core::config::RerankMode;
use atalaya_core::model::ScoredChunk;
use providers::llm::LLMService;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// The llm mode scores at most this many candidates per query.
const LLM_CANDIDATE_LIMIT: usize = 20;
const LLM_SCORE_MAX_TOKENS: u32 = 8;
const DEFAULT_LLM_SCORE: f32 = 5.0;

/// Trims a candidate list to `top_k`. Selection varies by mode; the
/// survivors always keep their input order so downstream citation indices
/// stay stable.
pub struct Reranker {
    mode: RerankMode,
    top_k: usize,
    llm: Option<Arc<dyn LLMService>>,
}

impl Reranker {
    pub fn new(mode: RerankMode, top_k: usize) -> Self {
        Self {
            mode,
            top_k: top_k.max(1),
            llm: None,
        }
    }

    pub fn disabled() -> Self {
        Self::new(RerankMode::Disabled, usize::MAX)
    }

    pub fn with_llm(mut self, llm: Arc<dyn LLMService>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub async fn rerank(&self, query: &str, chunks: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
        match self.mode {
            RerankMode::Disabled => chunks,
            RerankMode::Heuristic => self.keep_best(chunks, |position, chunk| {
                heuristic_score(query, chunk, position)
            }),
            RerankMode::Llm => self.rerank_llm(query, chunks).await,
        }
    }

    fn keep_best<F>(&self, chunks: Vec<ScoredChunk>, score: F) -> Vec<ScoredChunk>
    where
        F: Fn(usize, &ScoredChunk) -> f32,
    {
        if chunks.len() <= self.top_k {
            return chunks;
        }

        let mut ranked: Vec<(usize, f32)> = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (i, score(i, c)))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let keep: HashSet<usize> = ranked.into_iter().take(self.top_k).map(|(i, _)| i).collect();
        chunks
            .into_iter()
            .enumerate()
            .filter(|(i, _)| keep.contains(i))
            .map(|(_, c)| c)
            .collect()
    }

    async fn rerank_llm(&self, query: &str, chunks: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
        let Some(llm) = self.llm.clone() else {
            warn!("llm rerank requested without an llm, falling back to heuristic");
            return self.keep_best(chunks, |position, chunk| {
                heuristic_score(query, chunk, position)
            });
        };

        let mut chunks = chunks;
        chunks.truncate(LLM_CANDIDATE_LIMIT);

        let mut scores = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let prompt = format!(
                "Puntúa de 0 a 10 la relevancia del fragmento para la pregunta.\n\
                 Responde solo con el número.\n\nPregunta: {}\n\nFragmento:\n{}",
                query, chunk.chunk.content
            );
            let score = match llm.generate_text(&prompt, LLM_SCORE_MAX_TOKENS).await {
                Ok(raw) => parse_score(&raw),
                Err(err) => {
                    warn!("llm rerank scoring failed: {}", err);
                    DEFAULT_LLM_SCORE
                }
            };
            scores.push(score);
        }

        self.keep_best(chunks, |position, _| scores[position])
    }
}

fn parse_score(raw: &str) -> f32 {
    raw.split(|c: char| !c.is_ascii_digit() && c != '.')
        .find(|s| !s.is_empty())
        .and_then(|s| s.parse::<f32>().ok())
        .map(|s| s.clamp(0.0, 10.0))
        .unwrap_or(DEFAULT_LLM_SCORE)
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_string())
        .collect()
}

/// Deterministic mix of term overlap, chunk length, original position and
/// similarity (when present).
fn heuristic_score(query: &str, chunk: &ScoredChunk, position: usize) -> f32 {
    let query_terms = tokenize(query);
    let chunk_terms = tokenize(&chunk.chunk.content);

    let overlap = if query_terms.is_empty() {
        0.0
    } else {
        query_terms.intersection(&chunk_terms).count() as f32 / query_terms.len() as f32
    };
    let length = (chunk.chunk.content.chars().count() as f32 / 900.0).min(1.0);
    let position_bonus = 1.0 / (1.0 + position as f32);
    let similarity = ((chunk.score + 1.0) / 2.0).clamp(0.0, 1.0);

    0.5 * overlap + 0.15 * length + 0.15 * position_bonus + 0.2 * similarity
}

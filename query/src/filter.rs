use atalaya_core::config::InjectionFilterMode;
use atalaya_core::model::{ScoredChunk, INJECTION_RISK_KEY};

/// Retrieval-side gate over the risk flags the ingestion pipeline wrote into
/// chunk metadata.
#[derive(Debug, Clone, Copy)]
pub struct InjectionFilter {
    mode: InjectionFilterMode,
    threshold: f32,
}

impl InjectionFilter {
    pub fn new(mode: InjectionFilterMode, threshold: f32) -> Self {
        Self { mode, threshold }
    }

    pub fn off() -> Self {
        Self::new(InjectionFilterMode::Off, 1.0)
    }

    fn risk(chunk: &ScoredChunk) -> f32 {
        chunk
            .chunk
            .metadata
            .get(INJECTION_RISK_KEY)
            .and_then(|raw| raw.parse::<f32>().ok())
            .unwrap_or(0.0)
    }

    /// `downrank` is a stable partition: safe chunks keep their relative
    /// order, flagged chunks move to the tail keeping theirs. It never
    /// re-sorts by similarity.
    pub fn apply(&self, chunks: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
        match self.mode {
            InjectionFilterMode::Off => chunks,
            InjectionFilterMode::Exclude => chunks
                .into_iter()
                .filter(|c| Self::risk(c) < self.threshold)
                .collect(),
            InjectionFilterMode::Downrank => {
                let (safe, flagged): (Vec<ScoredChunk>, Vec<ScoredChunk>) = chunks
                    .into_iter()
                    .partition(|c| Self::risk(c) < self.threshold);
                safe.into_iter().chain(flagged).collect()
            }
        }
    }
}

use atalaya_core::model::Chunk;

pub use atalaya_core::model::{INJECTION_RISK_KEY as RISK_KEY, INJECTION_SIGNALS_KEY as SIGNALS_KEY};

struct SignalPattern {
    name: &'static str,
    weight: f32,
    phrases: &'static [&'static str],
}

/// Fixed pattern table. Only signal names and a score are ever persisted,
/// never the matched text.
const PATTERNS: [SignalPattern; 4] = [
    SignalPattern {
        name: "instruction_override",
        weight: 0.7,
        phrases: &[
            "ignore previous instructions",
            "ignore all previous",
            "disregard the above",
            "disregard previous",
            "olvida las instrucciones",
            "ignora las instrucciones",
        ],
    },
    SignalPattern {
        name: "prompt_disclosure",
        weight: 0.5,
        phrases: &[
            "reveal the system prompt",
            "system prompt",
            "muestra el prompt",
            "revela el prompt",
        ],
    },
    SignalPattern {
        name: "role_hijack",
        weight: 0.4,
        phrases: &["you are now", "act as if", "pretend to be", "eres ahora", "actúa como"],
    },
    SignalPattern {
        name: "delimiter_forgery",
        weight: 0.3,
        phrases: &["---[s", "---[fin", "fuentes:"],
    },
];

/// Deterministic prompt-injection risk in [0, 1]: independent signal weights
/// combined as `1 - Π(1 - w)`.
pub fn score_injection(text: &str) -> (f32, Vec<&'static str>) {
    let lowered = text.to_lowercase();
    let mut signals = Vec::new();
    let mut survival = 1.0f32;

    for pattern in &PATTERNS {
        if pattern.phrases.iter().any(|p| lowered.contains(p)) {
            signals.push(pattern.name);
            survival *= 1.0 - pattern.weight;
        }
    }

    (1.0 - survival, signals)
}

/// Attaches risk flags to chunk metadata for the retrieval-side filter.
pub fn annotate_chunk(chunk: &mut Chunk) {
    let (score, signals) = score_injection(&chunk.content);
    if signals.is_empty() {
        return;
    }
    chunk
        .metadata
        .insert(RISK_KEY.to_string(), format!("{:.3}", score));
    chunk
        .metadata
        .insert(SIGNALS_KEY.to_string(), signals.join(","));
}

/// Reads the persisted risk back out of chunk metadata.
pub fn risk_of(chunk: &Chunk) -> f32 {
    chunk
        .metadata
        .get(RISK_KEY)
        .and_then(|raw| raw.parse::<f32>().ok())
        .unwrap_or(0.0)
}

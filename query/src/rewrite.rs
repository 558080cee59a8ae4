use providers::llm::LLMService;
use providers::prompt::PromptAssembler;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

const SHORT_QUERY_CHARS: usize = 50;
const MIN_HISTORY_TURNS: usize = 2;
const MAX_REWRITE_TOKENS: u32 = 64;
const MAX_REWRITE_CHARS: usize = 300;

const FOLLOW_UP_MARKERS: [&str; 14] = [
    "eso", "esto", "aquello", "él", "ella", "ellos", "también", "entonces", "it", "that", "this",
    "they", "also", "then",
];

/// A conversation turn accumulated by the caller; the core never persists
/// these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

impl HistoryTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Feature-flagged follow-up rewriter. Any fault falls back to the original
/// query; a rewrite can degrade relevance but must never break the request.
pub struct QueryRewriter {
    llm: Arc<dyn LLMService>,
    prompts: Arc<PromptAssembler>,
    prompt_version: String,
}

impl QueryRewriter {
    pub fn new(
        llm: Arc<dyn LLMService>,
        prompts: Arc<PromptAssembler>,
        prompt_version: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            prompts,
            prompt_version: prompt_version.into(),
        }
    }

    fn should_rewrite(query: &str, history: &[HistoryTurn]) -> bool {
        if history.len() < MIN_HISTORY_TURNS {
            return false;
        }
        if query.chars().count() < SHORT_QUERY_CHARS {
            return true;
        }

        let last_user = history
            .iter()
            .rev()
            .find(|turn| turn.role == "user")
            .map(|turn| turn.content.to_lowercase())
            .unwrap_or_default();
        FOLLOW_UP_MARKERS.iter().any(|marker| {
            last_user
                .split(|c: char| !c.is_alphanumeric() && c != 'á' && c != 'é' && c != 'í' && c != 'ó' && c != 'ú')
                .any(|word| word == *marker)
        })
    }

    pub async fn rewrite(&self, query: &str, history: &[HistoryTurn]) -> String {
        if !Self::should_rewrite(query, history) {
            return query.to_string();
        }

        let prompt = match self.prompts.load(&self.prompt_version, "query_rewrite") {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!("rewrite prompt unavailable, keeping original query: {}", err);
                return query.to_string();
            }
        };

        let rendered_history = history
            .iter()
            .map(|turn| format!("{}: {}", turn.role, turn.content))
            .collect::<Vec<_>>()
            .join("\n");
        let kwargs: HashMap<String, String> = HashMap::from([
            ("history".to_string(), rendered_history),
            ("query".to_string(), query.to_string()),
        ]);

        let formatted = match prompt.format(&kwargs) {
            Ok(formatted) => formatted,
            Err(err) => {
                warn!("rewrite prompt formatting failed: {}", err);
                return query.to_string();
            }
        };

        match self.llm.generate_text(&formatted, MAX_REWRITE_TOKENS).await {
            Ok(rewritten) => {
                let rewritten = rewritten.trim();
                if rewritten.is_empty() || rewritten.chars().count() > MAX_REWRITE_CHARS {
                    debug!("rewrite rejected, keeping original query");
                    query.to_string()
                } else {
                    rewritten.to_string()
                }
            }
            Err(err) => {
                warn!("rewrite call failed, keeping original query: {}", err);
                query.to_string()
            }
        }
    }
}

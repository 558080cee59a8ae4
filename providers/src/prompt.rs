use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

const POLICY_SEPARATOR: &str = "\n\n---\n\n";
const FALLBACK_VERSION: &str = "v1";

#[derive(Error, Debug)]
pub enum PromptError {
    #[error("invalid prompt version: {0}")]
    InvalidVersion(String),
    #[error("policy file not found for language {0}")]
    PolicyNotFound(String),
    #[error("template not found: {capability} ({version})")]
    TemplateNotFound { capability: String, version: String },
    #[error("template for {capability} declares no metadata block")]
    MissingMetadata { capability: String },
    #[error("template body lacks declared placeholder {{{name}}}")]
    MissingPlaceholder { name: String },
    #[error("missing required input: {name}")]
    MissingInput { name: String },
    #[error("prompt io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptMetadata {
    pub required: Vec<String>,
    pub optional: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub metadata: PromptMetadata,
    pub body: String,
}

impl PromptTemplate {
    /// Parses the leading metadata block:
    ///
    /// ```text
    /// ---
    /// required: context, query
    /// optional: tone
    /// ---
    /// <body>
    /// ```
    ///
    /// Every declared input must appear as a `{name}` placeholder in the
    /// body; templates that break that are rejected at load time.
    pub fn parse(raw: &str, capability: &str) -> Result<Self, PromptError> {
        let trimmed = raw.trim_start();
        let rest = trimmed.strip_prefix("---").ok_or_else(|| {
            PromptError::MissingMetadata {
                capability: capability.to_string(),
            }
        })?;
        let (header, body) = rest
            .split_once("---")
            .ok_or_else(|| PromptError::MissingMetadata {
                capability: capability.to_string(),
            })?;

        let mut metadata = PromptMetadata::default();
        for line in header.lines() {
            let line = line.trim();
            if let Some(names) = line.strip_prefix("required:") {
                metadata.required = parse_name_list(names);
            } else if let Some(names) = line.strip_prefix("optional:") {
                metadata.optional = parse_name_list(names);
            }
        }

        let body = body.trim_start_matches('\n').to_string();
        for name in metadata.required.iter().chain(metadata.optional.iter()) {
            if !body.contains(&placeholder(name)) {
                return Err(PromptError::MissingPlaceholder { name: name.clone() });
            }
        }

        Ok(Self { metadata, body })
    }
}

fn parse_name_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect()
}

fn placeholder(name: &str) -> String {
    format!("{{{}}}", name)
}

/// A policy-prefixed template ready to format. The policy always precedes
/// task text so nothing in retrieved context can override the contract.
#[derive(Debug, Clone)]
pub struct ComposedPrompt {
    pub metadata: PromptMetadata,
    pub text: String,
}

impl ComposedPrompt {
    pub fn format(&self, kwargs: &HashMap<String, String>) -> Result<String, PromptError> {
        for name in &self.metadata.required {
            if !kwargs.contains_key(name) {
                return Err(PromptError::MissingInput { name: name.clone() });
            }
        }

        let mut out = self.text.clone();
        for name in self.metadata.required.iter().chain(self.metadata.optional.iter()) {
            let value = kwargs.get(name).map(String::as_str).unwrap_or("");
            out = out.replace(&placeholder(name), value);
        }
        Ok(out)
    }
}

/// Loads versioned capability templates from a prompts directory:
///
/// ```text
/// prompts/
///   policy/secure_contract_es.md
///   v1/rag_answer_es.md
///   v2/rag_answer_es.md
/// ```
///
/// Results are cached per instance; file edits need a fresh loader.
pub struct PromptAssembler {
    root: PathBuf,
    language: String,
    cache: Mutex<HashMap<(String, String), Arc<ComposedPrompt>>>,
}

impl PromptAssembler {
    pub fn new(root: impl AsRef<Path>, language: impl Into<String>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            language: language.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn load(
        &self,
        version: &str,
        capability: &str,
    ) -> Result<Arc<ComposedPrompt>, PromptError> {
        validate_version(version)?;

        let cache_key = (version.to_string(), capability.to_string());
        if let Some(hit) = self.cache.lock().unwrap().get(&cache_key) {
            return Ok(hit.clone());
        }

        let policy_path = self
            .root
            .join("policy")
            .join(format!("secure_contract_{}.md", self.language));
        let policy = std::fs::read_to_string(&policy_path)
            .map_err(|_| PromptError::PolicyNotFound(self.language.clone()))?;

        let raw = self
            .read_template(version, capability)
            .or_else(|err| {
                if version != FALLBACK_VERSION {
                    debug!(
                        version,
                        capability, "prompt version missing, falling back to v1"
                    );
                    self.read_template(FALLBACK_VERSION, capability)
                } else {
                    Err(err)
                }
            })?;

        let template = PromptTemplate::parse(&raw, capability)?;
        let composed = Arc::new(ComposedPrompt {
            metadata: template.metadata,
            text: format!("{}{}{}", policy.trim_end(), POLICY_SEPARATOR, template.body),
        });

        self.cache
            .lock()
            .unwrap()
            .insert(cache_key, composed.clone());
        Ok(composed)
    }

    fn read_template(&self, version: &str, capability: &str) -> Result<String, PromptError> {
        let path = self
            .root
            .join(version)
            .join(format!("{}_{}.md", capability, self.language));
        std::fs::read_to_string(&path).map_err(|_| PromptError::TemplateNotFound {
            capability: capability.to_string(),
            version: version.to_string(),
        })
    }
}

fn validate_version(version: &str) -> Result<(), PromptError> {
    let digits = version
        .strip_prefix('v')
        .filter(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()));
    if digits.is_none() {
        return Err(PromptError::InvalidVersion(version.to_string()));
    }
    Ok(())
}

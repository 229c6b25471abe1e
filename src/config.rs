//! TOML configuration.
//!
//! Every section is optional; a missing file section falls back to the
//! defaults below. A minimal config registering one model:
//!
//! ```toml
//! [models.gpt-4o-mini]
//! provider = "openai"
//! context_window = 128000
//! cost_per_1k_input = 0.00015
//! cost_per_1k_output = 0.0006
//! supports_json = true
//! ```
//!
//! | Section | Type |
//! |---------|------|
//! | `[chunking]` | [`ChunkerConfig`] |
//! | `[retrieval]` | [`RetrievalConfig`] |
//! | `[embedding]` | [`EmbeddingConfig`] |
//! | `[generation]` | [`GenerationConfig`] |
//! | `[review]` | [`ReviewConfig`] |
//! | `[models.<id>]` | [`ModelConfig`] |
//! | `[tasks.<task_type>]` | [`TaskRequirement`] |

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use narrative_forge_core::chunk::ChunkerConfig;
use narrative_forge_core::retrieval::{
    AugmentOptions, RetrievalOptions, DEFAULT_MAX_CONTEXT_LENGTH, DEFAULT_MAX_TOKENS,
    DEFAULT_MIN_SCORE, DEFAULT_TOP_K,
};
use narrative_forge_core::router::{ModelConfig, TaskRequirement, TaskType, CHINESE_PROVIDERS};

use crate::review::ReviewConfig;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Providers accepted in `[models.<id>]` besides [`CHINESE_PROVIDERS`].
const MODEL_PROVIDERS: &[&str] = &[
    "openai",
    "anthropic",
    "google",
    "mistral",
    "openrouter",
    "ollama",
];

/// Above this `min_score` the hash embedder rarely matches anything but
/// near-identical text.
const HASH_MIN_SCORE_CEILING: f64 = 0.3;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub chunking: ChunkerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    /// Registered in id order.
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
    /// Overrides for the built-in task requirements.
    #[serde(default)]
    pub tasks: BTreeMap<TaskType, TaskRequirement>,
}

impl Config {
    /// Describes a `retrieval.min_score` the configured embedder is not
    /// expected to reach.
    pub fn min_score_warning(&self) -> Option<String> {
        (self.embedding.provider == "hash" && self.retrieval.min_score > HASH_MIN_SCORE_CEILING)
            .then(|| {
                format!(
                    "retrieval.min_score = {} is above what the hash embedder reaches ({}); \
                     stages will mostly fall back to the opening of the narrative",
                    self.retrieval.min_score, HASH_MIN_SCORE_CEILING
                )
            })
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_max_context_length")]
    pub max_context_length: usize,
    #[serde(default)]
    pub include_metadata: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            min_score: DEFAULT_MIN_SCORE,
            max_tokens: DEFAULT_MAX_TOKENS,
            max_context_length: DEFAULT_MAX_CONTEXT_LENGTH,
            include_metadata: false,
        }
    }
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}
fn default_min_score() -> f64 {
    DEFAULT_MIN_SCORE
}
fn default_max_tokens() -> usize {
    DEFAULT_MAX_TOKENS
}
fn default_max_context_length() -> usize {
    DEFAULT_MAX_CONTEXT_LENGTH
}

impl RetrievalConfig {
    pub fn options(&self) -> RetrievalOptions {
        RetrievalOptions {
            top_k: self.top_k,
            min_score: self.min_score,
            max_tokens: self.max_tokens,
        }
    }

    pub fn augment_options(&self) -> AugmentOptions {
        AugmentOptions {
            max_context_length: self.max_context_length,
            include_metadata: self.include_metadata,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Ollama base URL.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hash".to_string(),
            model: None,
            dims: None,
            url: None,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    /// True for providers that call out over HTTP.
    pub fn is_remote(&self) -> bool {
        matches!(self.provider.as_str(), "openai" | "ollama")
    }
}

/// Defaults for the chat-completions client.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub temperature: Option<f32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            timeout_secs: 120,
            temperature: None,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    validate(&config)?;
    Ok(config)
}

/// Check value ranges and provider names.
pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }

    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.min_score) {
        bail!("retrieval.min_score must be in [0.0, 1.0]");
    }
    if config.retrieval.max_tokens == 0 {
        bail!("retrieval.max_tokens must be > 0");
    }

    match config.embedding.provider.as_str() {
        "hash" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_remote() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    } else if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }

    for (id, model) in &config.models {
        let provider = model.provider.to_lowercase();
        if !MODEL_PROVIDERS.contains(&provider.as_str())
            && !CHINESE_PROVIDERS.contains(&provider.as_str())
        {
            bail!("models.{}: unknown provider '{}'", id, model.provider);
        }
        if model.context_window == 0 || model.max_tokens == 0 {
            bail!("models.{}: context_window and max_tokens must be > 0", id);
        }
    }

    if let Some(warning) = config.min_score_warning() {
        tracing::warn!("{}", warning);
    }

    if config.review.required_stages.is_empty() && config.review.enabled {
        tracing::warn!("review is enabled but no stages require review");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use narrative_forge_core::router::Capability;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let file = write_config("");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.retrieval.top_k, DEFAULT_TOP_K);
        assert_eq!(config.embedding.provider, "hash");
        assert!(config.review.enabled);
        assert!(config.models.is_empty());
    }

    #[test]
    fn test_full_config_parses() {
        let file = write_config(
            r#"
[chunking]
max_tokens = 300
known_characters = ["Elena"]

[retrieval]
top_k = 3
min_score = 0.5

[review]
enabled = true
required_stages = ["story_bible", "shots"]
lock_timeout_secs = 60

[models.deepseek-chat]
provider = "deepseek"
context_window = 64000
cost_per_1k_input = 0.00027
cost_per_1k_output = 0.0011
supports_json = true

[tasks.shot_planning]
required_capabilities = ["json_mode"]
preferred_capabilities = ["cheap"]
min_context_window = 4000
"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.chunking.max_tokens, 300);
        assert_eq!(config.chunking.known_characters, vec!["Elena".to_string()]);
        assert_eq!(config.retrieval.options().top_k, 3);
        assert_eq!(config.review.required_stages.len(), 2);
        assert_eq!(config.models["deepseek-chat"].context_window, 64000);
        let shots = &config.tasks[&TaskType::ShotPlanning];
        assert_eq!(shots.required_capabilities, vec![Capability::JsonMode]);
    }

    #[test]
    fn test_rejects_out_of_range_min_score() {
        let file = write_config("[retrieval]\nmin_score = 1.5\n");
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("min_score"));
    }

    #[test]
    fn test_remote_embedding_requires_dims() {
        let file = write_config("[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\n");
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn test_rejects_unknown_model_provider() {
        let file = write_config("[models.mystery]\nprovider = \"acme\"\n");
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("unknown provider"));
    }

    #[test]
    fn test_min_score_warning_for_hash_embedder() {
        let defaults = Config::default();
        let warning = defaults.min_score_warning().unwrap();
        assert!(warning.contains("retrieval.min_score = 0.7"));

        let file = write_config("[retrieval]\nmin_score = 0.2\n");
        let relaxed = load_config(file.path()).unwrap();
        assert!(relaxed.min_score_warning().is_none());

        let file = write_config(
            "[embedding]\nprovider = \"ollama\"\nmodel = \"nomic-embed-text\"\ndims = 768\n",
        );
        let remote = load_config(file.path()).unwrap();
        assert!(remote.min_score_warning().is_none());
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = load_config(Path::new("/nonexistent/nforge.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}

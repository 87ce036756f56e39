//! Engine configuration.
//!
//! Every key resolves from, in order of priority:
//! 1. The `MEMDEX_<KEY>` environment variable (e.g. `MEMDEX_BATCH_SIZE`)
//! 2. The `settings` table of the state database (`memdex config set`)
//! 3. The built-in default

use crate::{
    chunking::ChunkingConfig,
    error::{Error, Result},
    normalizer::{CategoryRule, NormalizerConfig},
    state_db::StateDb,
    tfidf::TfidfParams,
};

pub const ENV_PREFIX: &str = "MEMDEX_";

pub const DEFAULT_BATCH_SIZE: u64 = 20_000;
pub const DEFAULT_SUB_BATCH_SIZE: usize = 50;

pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_EMBEDDING_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 1536;
pub const DEFAULT_EMBEDDING_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_EMBEDDING_MAX_RETRIES: u32 = 3;

/// Every recognized settings key, in display order.
pub const KEYS: &[&str] = &[
    "batch_size",
    "sub_batch_size",
    "max_words",
    "min_chunk_chars",
    "min_field_chars",
    "min_document_chars",
    "max_depth",
    "text_fields",
    "category_rules",
    "embedding_model",
    "embedding_base_url",
    "embedding_dimension",
    "embedding_timeout_secs",
    "embedding_max_retries",
    "tfidf_max_features",
    "tfidf_ngram_max",
];

/// Settings for the remote embedding service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingConfig {
    pub model: String,
    pub base_url: String,
    pub dimension: usize,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            base_url: DEFAULT_EMBEDDING_BASE_URL.to_string(),
            dimension: DEFAULT_EMBEDDING_DIMENSION,
            timeout_secs: DEFAULT_EMBEDDING_TIMEOUT_SECS,
            max_retries: DEFAULT_EMBEDDING_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Non-empty corpus lines per batch.
    pub batch_size: u64,
    /// Chunks per embedding call and per sub-batch file.
    pub sub_batch_size: usize,
    pub chunking: ChunkingConfig,
    pub normalizer: NormalizerConfig,
    pub embedding: EmbeddingConfig,
    pub tfidf: TfidfParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            sub_batch_size: DEFAULT_SUB_BATCH_SIZE,
            chunking: ChunkingConfig::default(),
            normalizer: NormalizerConfig::default(),
            embedding: EmbeddingConfig::default(),
            tfidf: TfidfParams::default(),
        }
    }
}

impl EngineConfig {
    /// Resolve the configuration from the process environment and `db`.
    pub fn resolve(db: &StateDb) -> Result<Self> {
        Self::resolve_with(|name| std::env::var(name).ok(), db)
    }

    /// Resolve the configuration with a custom environment lookup.
    pub fn resolve_with(
        env: impl Fn(&str) -> Option<String>,
        db: &StateDb,
    ) -> Result<Self> {
        let mut config = Self::default();
        for key in KEYS {
            let value = match env(&env_var_name(key)) {
                Some(v) => Some(v),
                None => db.get_setting(key)?,
            };
            if let Some(value) = value {
                config.apply(key, &value)?;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Set one key from its string form.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            "batch_size" => self.batch_size = parse(key, value)?,
            "sub_batch_size" => self.sub_batch_size = parse(key, value)?,
            "max_words" => self.chunking.max_words = parse(key, value)?,
            "min_chunk_chars" => self.chunking.min_chars = parse(key, value)?,
            "min_field_chars" => {
                self.normalizer.min_field_chars = parse(key, value)?
            }
            "min_document_chars" => {
                self.normalizer.min_document_chars = parse(key, value)?
            }
            "max_depth" => self.normalizer.max_depth = parse(key, value)?,
            "text_fields" => {
                self.normalizer.text_fields = value
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "category_rules" => {
                self.normalizer.category_rules = parse_category_rules(value)?
            }
            "embedding_model" => self.embedding.model = value.to_string(),
            "embedding_base_url" => {
                self.embedding.base_url =
                    value.trim_end_matches('/').to_string()
            }
            "embedding_dimension" => {
                self.embedding.dimension = parse(key, value)?
            }
            "embedding_timeout_secs" => {
                self.embedding.timeout_secs = parse(key, value)?
            }
            "embedding_max_retries" => {
                self.embedding.max_retries = parse(key, value)?
            }
            "tfidf_max_features" => {
                self.tfidf.max_features = parse(key, value)?
            }
            "tfidf_ngram_max" => self.tfidf.ngram_max = parse(key, value)?,
            _ => {
                return Err(Error::Config(format!(
                    "unknown setting '{key}' (known: {})",
                    KEYS.join(", ")
                )));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size as usize),
            ("sub_batch_size", self.sub_batch_size),
            ("max_words", self.chunking.max_words),
            ("embedding_dimension", self.embedding.dimension),
            ("tfidf_max_features", self.tfidf.max_features),
            ("tfidf_ngram_max", self.tfidf.ngram_max),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{key} must be positive")));
            }
        }
        if self.normalizer.text_fields.is_empty() {
            return Err(Error::Config("text_fields must not be empty".into()));
        }
        Ok(())
    }

    /// Current value of `key` in its string form.
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "batch_size" => self.batch_size.to_string(),
            "sub_batch_size" => self.sub_batch_size.to_string(),
            "max_words" => self.chunking.max_words.to_string(),
            "min_chunk_chars" => self.chunking.min_chars.to_string(),
            "min_field_chars" => self.normalizer.min_field_chars.to_string(),
            "min_document_chars" => {
                self.normalizer.min_document_chars.to_string()
            }
            "max_depth" => self.normalizer.max_depth.to_string(),
            "text_fields" => self.normalizer.text_fields.join(","),
            "category_rules" => {
                format_category_rules(&self.normalizer.category_rules)
            }
            "embedding_model" => self.embedding.model.clone(),
            "embedding_base_url" => self.embedding.base_url.clone(),
            "embedding_dimension" => self.embedding.dimension.to_string(),
            "embedding_timeout_secs" => {
                self.embedding.timeout_secs.to_string()
            }
            "embedding_max_retries" => self.embedding.max_retries.to_string(),
            "tfidf_max_features" => self.tfidf.max_features.to_string(),
            "tfidf_ngram_max" => self.tfidf.ngram_max.to_string(),
            _ => return None,
        };
        Some(value)
    }
}

/// Check that `value` is acceptable for `key` before storing it.
pub fn validate_setting(key: &str, value: &str) -> Result<()> {
    let mut config = EngineConfig::default();
    config.apply(key, value)?;
    config.validate()
}

/// Environment variable that overrides `key`.
pub fn env_var_name(key: &str) -> String {
    format!("{ENV_PREFIX}{}", key.to_ascii_uppercase())
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        Error::Config(format!("invalid value for {key}: '{value}'"))
    })
}

/// Rules are a JSON object of category to keyword list, kept in the
/// order written: `{"Kitchen": ["recipe", "cooking"]}`.
fn parse_category_rules(value: &str) -> Result<Vec<CategoryRule>> {
    let invalid = || {
        Error::Config(
            "category_rules must be a JSON object of category to keyword \
             list"
                .into(),
        )
    };
    let map: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(value).map_err(|_| invalid())?;

    map.into_iter()
        .map(|(category, keywords)| {
            let keywords: Vec<String> =
                serde_json::from_value(keywords).map_err(|_| invalid())?;
            Ok(CategoryRule { category, keywords })
        })
        .collect()
}

fn format_category_rules(rules: &[CategoryRule]) -> String {
    let map: serde_json::Map<String, serde_json::Value> = rules
        .iter()
        .map(|r| (r.category.clone(), serde_json::json!(r.keywords)))
        .collect();
    serde_json::Value::Object(map).to_string()
}

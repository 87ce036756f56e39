use std::{thread, time::Duration};

use reqwest::{
    StatusCode,
    blocking::Client,
    header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::EmbeddingConfig,
    embedding::Embedder,
    error::{Error, Result},
};

pub const API_KEY_ENV_VAR: &str = "OPENAI_API_KEY";

/// Embedding service client with retry and backoff on transient failures.
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimension: usize,
    max_retries: u32,
}

impl OpenAiEmbedder {
    /// Build a client, reading the API key from `OPENAI_API_KEY`.
    pub fn from_env(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var(API_KEY_ENV_VAR).unwrap_or_default();
        Self::new(&api_key, config)
    }

    pub fn new(api_key: &str, config: &EmbeddingConfig) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(Error::Config(format!(
                "{API_KEY_ENV_VAR} is not set; it is required for \
                 embedding builds and queries"
            )));
        }
        if config.model.trim().is_empty() {
            return Err(Error::Config("embedding_model is empty".into()));
        }

        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| Error::Config("invalid API key".into()))?;
        headers.insert(AUTHORIZATION, auth);
        headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| {
                Error::Embedding(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/embeddings",
                config.base_url.trim_end_matches('/')
            ),
            model: config.model.clone(),
            dimension: config.dimension,
            max_retries: config.max_retries,
        })
    }

    /// Output size to request. `text-embedding-ada-002` has a fixed size
    /// and rejects the parameter.
    fn requested_dimensions(&self) -> Option<usize> {
        (self.model != "text-embedding-ada-002").then_some(self.dimension)
    }

    fn should_retry(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    fn is_retryable(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect() || err.is_request()
    }

    fn backoff(attempt: u32) -> Duration {
        Duration::from_millis(500 * (1 << attempt.min(5)))
    }
}

impl Embedder for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.requested_dimensions(),
        };
        let mut attempt = 0;
        loop {
            let failure = match self
                .client
                .post(&self.endpoint)
                .json(&request)
                .send()
            {
                Ok(resp) if resp.status().is_success() => {
                    let mut parsed: EmbeddingResponse =
                        resp.json().map_err(|e| {
                            Error::Embedding(format!(
                                "malformed embedding response: {e}"
                            ))
                        })?;
                    parsed.data.sort_by_key(|entry| entry.index);
                    if parsed.data.len() != texts.len() {
                        return Err(Error::Embedding(format!(
                            "service returned {} embeddings for {} inputs",
                            parsed.data.len(),
                            texts.len()
                        )));
                    }
                    return Ok(parsed
                        .data
                        .into_iter()
                        .map(|entry| entry.embedding)
                        .collect());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp
                        .text()
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    let retry = Self::should_retry(status);
                    (retry, format!("request failed ({status}): {body}"))
                }
                Err(e) => (Self::is_retryable(&e), e.to_string()),
            };

            let (retry, message) = failure;
            if retry && attempt < self.max_retries {
                attempt += 1;
                debug!(attempt, error = %message, "Retrying embedding request");
                thread::sleep(Self::backoff(attempt));
                continue;
            }
            return Err(Error::Embedding(message));
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

//! Embedding adapter for knowledge retrieval. Queries must be embedded with
//! the same model as the stored chunks.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::provider::{EmbeddingProvider, ProviderError};
use crate::retry::{with_retries, DEFAULT_ATTEMPTS};

const EMBED_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiEmbeddings {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        model: Option<String>,
    ) -> Result<Self, ProviderError> {
        if api_key.is_empty() {
            return Err(ProviderError::Misconfigured(
                "embedding API key is not set".into(),
            ));
        }
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(EMBED_TIMEOUT)
                .build()
                .map_err(ProviderError::Http)?,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".to_string()),
            model: model.unwrap_or_else(|| "text-embedding-3-small".to_string()),
        })
    }

    async fn embed_once(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "input": text,
            }))
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status, "embedding API error: {body}");
            return Err(ProviderError::Api {
                status,
                message: body,
            });
        }

        let api: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        api.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| ProviderError::Parse("empty embedding response".into()))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn name(&self) -> &str {
        "openai"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        with_retries("embeddings", DEFAULT_ATTEMPTS, || self.embed_once(text)).await
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

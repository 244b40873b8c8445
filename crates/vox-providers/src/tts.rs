//! Cloud TTS over the OpenAI-compatible `/v1/audio/speech` endpoint.
//! Requests WAV output and decodes it to PCM; the controller resamples to
//! its wire rate.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::provider::{ProviderError, Synthesis, TtsProvider};
use crate::retry::{with_retries, DEFAULT_ATTEMPTS};

const TTS_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub struct CloudTts {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    voice: String,
}

impl CloudTts {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        model: Option<String>,
        voice: Option<String>,
    ) -> Result<Self, ProviderError> {
        if api_key.is_empty() {
            return Err(ProviderError::Misconfigured("TTS API key is not set".into()));
        }
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(TTS_TIMEOUT)
                .build()
                .map_err(ProviderError::Http)?,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".to_string()),
            model: model.unwrap_or_else(|| "tts-1".to_string()),
            voice: voice.unwrap_or_else(|| "alloy".to_string()),
        })
    }

    async fn synthesize_once(&self, text: &str) -> Result<Synthesis, ProviderError> {
        let url = format!("{}/v1/audio/speech", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "voice": self.voice,
                "input": text,
                "response_format": "wav",
            }))
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status, body = %body, "speech API error");
            return Err(ProviderError::Api {
                status,
                message: body,
            });
        }

        let bytes = resp.bytes().await?;
        decode_wav(&bytes)
    }
}

#[async_trait]
impl TtsProvider for CloudTts {
    fn name(&self) -> &str {
        "openai"
    }

    async fn synthesize(&self, text: &str) -> Result<Synthesis, ProviderError> {
        debug!(chars = text.len(), voice = %self.voice, "synthesizing reply");
        with_retries("openai-tts", DEFAULT_ATTEMPTS, || self.synthesize_once(text)).await
    }
}

/// Decode a WAV byte buffer into mono PCM.
pub(crate) fn decode_wav(bytes: &[u8]) -> Result<Synthesis, ProviderError> {
    let (samples, sample_rate) =
        vox_audio::decode_wav_bytes(bytes).map_err(|e| ProviderError::Parse(e.to_string()))?;
    Ok(Synthesis {
        samples,
        sample_rate,
    })
}

//! Local neural-TTS microservice adapter. The service runs next to the
//! worker and returns WAV bytes from a simple POST.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::provider::{ProviderError, Synthesis, TtsProvider};
use crate::retry::{with_retries, DEFAULT_ATTEMPTS};
use crate::tts::decode_wav;

const TTS_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub struct KokoroTts {
    client: reqwest::Client,
    base_url: String,
    voice: String,
    speed: f32,
}

impl KokoroTts {
    pub fn new(
        base_url: Option<String>,
        voice: Option<String>,
        speed: Option<f32>,
    ) -> Result<Self, ProviderError> {
        let base_url = base_url
            .ok_or_else(|| ProviderError::Misconfigured("kokoro URL is not set".into()))?;
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(TTS_TIMEOUT)
                .build()
                .map_err(ProviderError::Http)?,
            base_url,
            voice: voice.unwrap_or_else(|| "af_heart".to_string()),
            speed: speed.unwrap_or(1.0),
        })
    }

    async fn synthesize_once(&self, text: &str) -> Result<Synthesis, ProviderError> {
        let url = format!("{}/synthesize", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "text": text,
                "voice": self.voice,
                "speed": self.speed,
            }))
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status, "kokoro synthesis error: {body}");
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
impl TtsProvider for KokoroTts {
    fn name(&self) -> &str {
        "kokoro"
    }

    async fn synthesize(&self, text: &str) -> Result<Synthesis, ProviderError> {
        debug!(chars = text.len(), voice = %self.voice, "local synthesis");
        with_retries("kokoro", DEFAULT_ATTEMPTS, || self.synthesize_once(text)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_url_is_misconfigured() {
        let err = KokoroTts::new(None, None, None).unwrap_err();
        assert!(matches!(err, ProviderError::Misconfigured(_)));
    }
}

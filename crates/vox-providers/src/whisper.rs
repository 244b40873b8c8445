//! Whisper-style STT over the OpenAI-compatible `/v1/audio/transcriptions`
//! endpoint. The captured utterance is shipped as a WAV part.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use vox_audio::wav_bytes;

use crate::provider::{AudioClip, ProviderError, SttProvider, Transcription};
use crate::retry::{with_retries, DEFAULT_ATTEMPTS};

const STT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct WhisperStt {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl WhisperStt {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        model: Option<String>,
    ) -> Result<Self, ProviderError> {
        if api_key.is_empty() {
            return Err(ProviderError::Misconfigured("STT API key is not set".into()));
        }
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(STT_TIMEOUT)
                .build()
                .map_err(ProviderError::Http)?,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".to_string()),
            model: model.unwrap_or_else(|| "whisper-1".to_string()),
        })
    }

    async fn transcribe_once(&self, wav: Vec<u8>) -> Result<Transcription, ProviderError> {
        let url = format!("{}/v1/audio/transcriptions", self.base_url);
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .part("file", part);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "transcription API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let api: TranscriptionResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(Transcription {
            text: api.text.trim().to_string(),
            confidence: api.confidence.unwrap_or(1.0),
            is_final: true,
        })
    }
}

#[async_trait]
impl SttProvider for WhisperStt {
    fn name(&self) -> &str {
        "whisper"
    }

    async fn transcribe(&self, audio: &AudioClip) -> Result<Transcription, ProviderError> {
        let wav = wav_bytes(&audio.samples, audio.sample_rate)
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        debug!(ms = audio.duration_ms(), bytes = wav.len(), "transcribing utterance");
        with_retries("whisper", DEFAULT_ATTEMPTS, || self.transcribe_once(wav.clone())).await
    }
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
    confidence: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_misconfigured() {
        let err = WhisperStt::new(String::new(), None, None).unwrap_err();
        assert!(matches!(err, ProviderError::Misconfigured(_)));
    }

    #[test]
    fn response_text_is_trimmed() {
        let api: TranscriptionResponse =
            serde_json::from_str(r#"{"text": "  Hello. \n"}"#).unwrap();
        assert_eq!(api.text.trim(), "Hello.");
        assert!(api.confidence.is_none());
    }
}

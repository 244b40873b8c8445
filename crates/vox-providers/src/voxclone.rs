//! Zero-shot voice-cloning TTS via the cloning microservice.
//!
//! The reference audio locator can be a `data:audio/...;base64,` URI, an
//! absolute path, or a bare file name resolved against the configured audio
//! directory. Loading happens once at construction; when it fails the
//! provider stays constructible but every synthesis returns
//! `ReferenceAudio`, which the fallback wrapper converts into a one-time
//! switch to the cloud TTS.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::provider::{ProviderError, Synthesis, TtsProvider};
use crate::retry::{with_retries, DEFAULT_ATTEMPTS};

const CLONE_TIMEOUT: Duration = Duration::from_secs(15);

pub struct VoxCloneTts {
    client: reqwest::Client,
    base_url: String,
    license_key: String,
    reference_audio: Option<Vec<u8>>,
    speed: f32,
    sample_rate: u32,
}

impl VoxCloneTts {
    pub fn new(
        base_url: Option<String>,
        license_key: Option<String>,
        locator: &str,
        audio_dir: Option<&str>,
        speed: Option<f32>,
    ) -> Result<Self, ProviderError> {
        let base_url = base_url
            .ok_or_else(|| ProviderError::Misconfigured("voxclone URL is not set".into()))?;

        let reference_audio = match load_reference_audio(locator, audio_dir) {
            Ok(bytes) => {
                info!(bytes = bytes.len(), "reference audio loaded");
                Some(bytes)
            }
            Err(e) => {
                warn!("reference audio load failed: {e}");
                None
            }
        };

        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(CLONE_TIMEOUT)
                .build()
                .map_err(ProviderError::Http)?,
            base_url,
            license_key: license_key.unwrap_or_default(),
            reference_audio,
            speed: speed.unwrap_or(1.0),
            sample_rate: 24_000,
        })
    }

    pub fn has_reference_audio(&self) -> bool {
        self.reference_audio.is_some()
    }

    async fn synthesize_once(&self, text: &str, reference: &[u8]) -> Result<Synthesis, ProviderError> {
        let url = format!("{}/v1/clone", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("X-VoxNexus-License", &self.license_key)
            .json(&serde_json::json!({
                "text": text,
                "reference_audio_base64": base64::engine::general_purpose::STANDARD.encode(reference),
                "speed": self.speed,
                "sample_rate": self.sample_rate,
            }))
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 403 {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Misconfigured(format!(
                "license verification failed: {body}"
            )));
        }
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status, "clone API error: {body}");
            return Err(ProviderError::Api {
                status,
                message: body,
            });
        }

        let api: CloneResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        let audio = base64::engine::general_purpose::STANDARD
            .decode(&api.audio_base64)
            .map_err(|e| ProviderError::Parse(format!("audio_base64: {e}")))?;

        debug!(
            latency_ms = api.latency_ms,
            duration_ms = api.duration_ms,
            "cloning complete"
        );

        Ok(Synthesis {
            samples: vox_audio::pcm_from_le_bytes(&audio),
            sample_rate: api.sample_rate.unwrap_or(self.sample_rate),
        })
    }
}

#[async_trait]
impl TtsProvider for VoxCloneTts {
    fn name(&self) -> &str {
        "voxclone"
    }

    /// The cloning service is fast but not streaming, so longer input is
    /// synthesized sentence by sentence and the PCM concatenated.
    async fn synthesize(&self, text: &str) -> Result<Synthesis, ProviderError> {
        let Some(ref reference) = self.reference_audio else {
            return Err(ProviderError::ReferenceAudio(
                "no reference audio loaded".into(),
            ));
        };

        let mut samples = Vec::new();
        let mut sample_rate = self.sample_rate;
        for sentence in split_sentences(text) {
            let synthesis = with_retries("voxclone", DEFAULT_ATTEMPTS, || {
                self.synthesize_once(&sentence, reference)
            })
            .await?;
            sample_rate = synthesis.sample_rate;
            samples.extend(synthesis.samples);
        }
        Ok(Synthesis {
            samples,
            sample_rate,
        })
    }
}

/// Split text into sentences at `.`, `!`, `?`, or newline, keeping the
/// terminator with its sentence. A trailing fragment is its own entry.
fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?' | '\n') {
            let sentence = current.trim();
            if !sentence.is_empty() {
                out.push(sentence.to_string());
            }
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        out.push(tail.to_string());
    }
    out
}

/// Resolve the reference-audio locator: data URI, then absolute/relative
/// path, then a file under the configured audio directory.
fn load_reference_audio(locator: &str, audio_dir: Option<&str>) -> Result<Vec<u8>, ProviderError> {
    if locator.is_empty() {
        return Err(ProviderError::ReferenceAudio("empty locator".into()));
    }

    if locator.starts_with("data:audio/") {
        let b64 = locator
            .split_once(',')
            .map(|(_, b)| b)
            .ok_or_else(|| ProviderError::ReferenceAudio("malformed data URI".into()))?;
        return base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| ProviderError::ReferenceAudio(format!("data URI decode: {e}")));
    }

    if Path::new(locator).exists() {
        return std::fs::read(locator)
            .map_err(|e| ProviderError::ReferenceAudio(format!("{locator}: {e}")));
    }

    if let Some(dir) = audio_dir {
        let candidate = Path::new(dir).join(locator);
        if candidate.exists() {
            return std::fs::read(&candidate)
                .map_err(|e| ProviderError::ReferenceAudio(format!("{}: {e}", candidate.display())));
        }
    }

    Err(ProviderError::ReferenceAudio(format!(
        "not found: {locator}"
    )))
}

#[derive(Deserialize)]
struct CloneResponse {
    audio_base64: String,
    sample_rate: Option<u32>,
    #[serde(default)]
    duration_ms: f64,
    #[serde(default)]
    latency_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn data_uri_locator_decodes() {
        let payload = b"RIFFfake";
        let uri = format!(
            "data:audio/wav;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(payload)
        );
        let bytes = load_reference_audio(&uri, None).unwrap();
        assert_eq!(bytes, payload);
    }

    #[test]
    fn path_locator_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"sample-bytes").unwrap();
        let bytes = load_reference_audio(file.path().to_str().unwrap(), None).unwrap();
        assert_eq!(bytes, b"sample-bytes");
    }

    #[test]
    fn bare_name_resolves_against_audio_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("agent-voice.wav"), b"ref").unwrap();
        let bytes =
            load_reference_audio("agent-voice.wav", Some(dir.path().to_str().unwrap())).unwrap();
        assert_eq!(bytes, b"ref");
    }

    #[test]
    fn sentences_split_on_terminators() {
        assert_eq!(
            split_sentences("Hello there. How are you? Fine!"),
            vec!["Hello there.", "How are you?", "Fine!"]
        );
        assert_eq!(split_sentences("no terminator"), vec!["no terminator"]);
        assert_eq!(
            split_sentences("line one\nline two. tail"),
            vec!["line one", "line two.", "tail"]
        );
        assert!(split_sentences("   ").is_empty());
    }

    #[test]
    fn missing_locator_is_reference_audio_error() {
        let err = load_reference_audio("does-not-exist.wav", None).unwrap_err();
        assert!(matches!(err, ProviderError::ReferenceAudio(_)));
    }

    #[tokio::test]
    async fn synthesis_without_reference_fails_fast() {
        let tts = VoxCloneTts::new(
            Some("http://localhost:8000".into()),
            None,
            "missing.wav",
            None,
            None,
        )
        .unwrap();
        assert!(!tts.has_reference_audio());
        let err = tts.synthesize("hello").await.unwrap_err();
        assert!(matches!(err, ProviderError::ReferenceAudio(_)));
    }
}

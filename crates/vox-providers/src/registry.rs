//! Name-keyed provider registries. Controllers never construct adapters
//! directly — an `AgentConfig` names its providers and the registry resolves
//! them, so deployments can swap services without touching session code.

use std::collections::HashMap;
use std::sync::Arc;

use vox_core::config::ProvidersConfig;
use vox_db::types::ProviderSpec;

use crate::embeddings::OpenAiEmbeddings;
use crate::kokoro::KokoroTts;
use crate::openai::OpenAiLlm;
use crate::provider::{
    EmbeddingProvider, LlmProvider, ProviderError, SttProvider, TtsProvider,
};
use crate::tts::CloudTts;
use crate::voxclone::VoxCloneTts;
use crate::whisper::WhisperStt;

pub type SttBuilder =
    Box<dyn Fn(&ProviderSpec, &ProvidersConfig) -> Result<Arc<dyn SttProvider>, ProviderError> + Send + Sync>;
pub type LlmBuilder =
    Box<dyn Fn(&ProviderSpec, &ProvidersConfig) -> Result<Arc<dyn LlmProvider>, ProviderError> + Send + Sync>;
pub type TtsBuilder =
    Box<dyn Fn(&ProviderSpec, &ProvidersConfig) -> Result<Arc<dyn TtsProvider>, ProviderError> + Send + Sync>;

/// Pull a string option off a provider spec.
pub fn opt_str(spec: &ProviderSpec, key: &str) -> Option<String> {
    spec.options.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// Pull a float option off a provider spec.
pub fn opt_f32(spec: &ProviderSpec, key: &str) -> Option<f32> {
    spec.options.get(key).and_then(|v| v.as_f64()).map(|v| v as f32)
}

macro_rules! registry {
    ($name:ident, $builder:ty, $trait:ty) => {
        pub struct $name {
            builders: HashMap<String, $builder>,
        }

        impl $name {
            pub fn empty() -> Self {
                Self {
                    builders: HashMap::new(),
                }
            }

            pub fn register(&mut self, name: impl Into<String>, builder: $builder) {
                self.builders.insert(name.into(), builder);
            }

            pub fn build(
                &self,
                spec: &ProviderSpec,
                config: &ProvidersConfig,
            ) -> Result<Arc<$trait>, ProviderError> {
                let builder = self
                    .builders
                    .get(&spec.provider)
                    .ok_or_else(|| ProviderError::UnknownProvider(spec.provider.clone()))?;
                builder(spec, config)
            }

            pub fn names(&self) -> Vec<&str> {
                self.builders.keys().map(String::as_str).collect()
            }
        }
    };
}

registry!(SttRegistry, SttBuilder, dyn SttProvider);
registry!(LlmRegistry, LlmBuilder, dyn LlmProvider);
registry!(TtsRegistry, TtsBuilder, dyn TtsProvider);

impl Default for SttRegistry {
    fn default() -> Self {
        let mut reg = Self::empty();
        reg.register("whisper", Box::new(|spec, cfg| {
            Ok(Arc::new(WhisperStt::new(
                cfg.stt_api_key.clone().unwrap_or_default(),
                cfg.stt_base_url.clone(),
                opt_str(spec, "model"),
            )?))
        }));
        reg
    }
}

impl Default for LlmRegistry {
    fn default() -> Self {
        let mut reg = Self::empty();
        reg.register("openai", Box::new(|_spec, cfg| {
            Ok(Arc::new(OpenAiLlm::new(
                cfg.llm_api_key.clone().unwrap_or_default(),
                cfg.llm_base_url.clone(),
            )?))
        }));
        reg
    }
}

impl Default for TtsRegistry {
    fn default() -> Self {
        let mut reg = Self::empty();
        reg.register("openai", Box::new(|spec, cfg| {
            Ok(Arc::new(CloudTts::new(
                cfg.tts_api_key.clone().unwrap_or_default(),
                cfg.tts_base_url.clone(),
                opt_str(spec, "model"),
                opt_str(spec, "voice"),
            )?))
        }));
        reg.register("kokoro", Box::new(|spec, cfg| {
            Ok(Arc::new(KokoroTts::new(
                cfg.kokoro_url.clone(),
                opt_str(spec, "voice"),
                opt_f32(spec, "speed"),
            )?))
        }));
        reg.register("voxclone", Box::new(|spec, cfg| {
            // The factory resolves voice-profile ids into a locator under
            // the `reference_audio` key before this builder runs.
            let locator = opt_str(spec, "reference_audio")
                .or_else(|| opt_str(spec, "voice_id"))
                .unwrap_or_default();
            Ok(Arc::new(VoxCloneTts::new(
                cfg.voxclone_url.clone(),
                cfg.voxclone_license_key.clone(),
                &locator,
                cfg.cloning_audio_dir.as_deref(),
                opt_f32(spec, "speed"),
            )?))
        }));
        reg
    }
}

/// Build the embedding provider, or `None` when no key is configured
/// (knowledge retrieval is simply not exposed then).
pub fn build_embeddings(config: &ProvidersConfig) -> Option<Arc<dyn EmbeddingProvider>> {
    let key = config
        .embedding_api_key
        .clone()
        .or_else(|| config.llm_api_key.clone())?;
    OpenAiEmbeddings::new(key, config.embedding_base_url.clone(), None)
        .ok()
        .map(|p| Arc::new(p) as Arc<dyn EmbeddingProvider>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(provider: &str, options: serde_json::Value) -> ProviderSpec {
        ProviderSpec {
            provider: provider.to_string(),
            options,
        }
    }

    fn config() -> ProvidersConfig {
        ProvidersConfig {
            stt_api_key: Some("sk-stt".into()),
            llm_api_key: Some("sk-llm".into()),
            tts_api_key: Some("sk-tts".into()),
            ..ProvidersConfig::default()
        }
    }

    #[test]
    fn default_registries_resolve_known_names() {
        let cfg = config();
        assert!(SttRegistry::default().build(&spec("whisper", json!({})), &cfg).is_ok());
        assert!(LlmRegistry::default().build(&spec("openai", json!({})), &cfg).is_ok());
        assert!(TtsRegistry::default()
            .build(&spec("openai", json!({"voice": "alloy"})), &cfg)
            .is_ok());
    }

    #[test]
    fn unknown_provider_name_errors() {
        let err = LlmRegistry::default()
            .build(&spec("frontier-9000", json!({})), &config())
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnknownProvider(_)));
    }

    #[test]
    fn missing_credentials_surface_misconfigured() {
        let cfg = ProvidersConfig::default();
        let err = LlmRegistry::default()
            .build(&spec("openai", json!({})), &cfg)
            .unwrap_err();
        assert!(matches!(err, ProviderError::Misconfigured(_)));
    }

    #[test]
    fn custom_registration_overrides_nothing_else() {
        let mut reg = TtsRegistry::default();
        reg.register("null", Box::new(|_, _| {
            Err(ProviderError::Unavailable("null provider".into()))
        }));
        assert!(reg.names().contains(&"null"));
        assert!(reg.names().contains(&"voxclone"));
    }

    #[test]
    fn embeddings_need_a_key() {
        assert!(build_embeddings(&ProvidersConfig::default()).is_none());
        assert!(build_embeddings(&config()).is_some());
    }
}

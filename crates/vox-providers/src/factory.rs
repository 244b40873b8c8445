//! Session factory: reads an `AgentConfig` and materialises the per-session
//! provider pipeline. Idempotent per session; nothing is memoized across
//! sessions, so a stuck HTTP connection dies with its call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use vox_core::config::ProvidersConfig;
use vox_db::types::{AgentConfig, ProviderSpec};
use vox_db::Database;

use crate::provider::{
    EmbeddingProvider, LlmProvider, ProviderError, SttProvider, Synthesis, TtsProvider,
};
use crate::registry::{build_embeddings, opt_str, LlmRegistry, SttRegistry, TtsRegistry};

/// Everything a turn engine needs from the provider layer.
pub struct SessionPipeline {
    pub stt: Arc<dyn SttProvider>,
    pub llm: Arc<dyn LlmProvider>,
    pub tts: Arc<dyn TtsProvider>,
    pub embeddings: Option<Arc<dyn EmbeddingProvider>>,
    /// Model id handed to the LLM on every request.
    pub model: String,
}

pub struct SessionFactory {
    config: ProvidersConfig,
    stt: SttRegistry,
    llm: LlmRegistry,
    tts: TtsRegistry,
    db: Arc<Database>,
}

impl SessionFactory {
    pub fn new(config: ProvidersConfig, db: Arc<Database>) -> Self {
        Self {
            config,
            stt: SttRegistry::default(),
            llm: LlmRegistry::default(),
            tts: TtsRegistry::default(),
            db,
        }
    }

    /// Swap in a custom registry set (tests, alternative deployments).
    pub fn with_registries(
        mut self,
        stt: SttRegistry,
        llm: LlmRegistry,
        tts: TtsRegistry,
    ) -> Self {
        self.stt = stt;
        self.llm = llm;
        self.tts = tts;
        self
    }

    /// Embedding provider for knowledge retrieval, independent of any
    /// particular session.
    pub fn embeddings(&self) -> Option<Arc<dyn EmbeddingProvider>> {
        build_embeddings(&self.config)
    }

    /// Assemble the pipeline for one session.
    pub fn assemble(&self, agent: &AgentConfig) -> Result<SessionPipeline, ProviderError> {
        let stt = self.stt.build(&agent.stt, &self.config)?;
        let llm = self.llm.build(&agent.llm, &self.config)?;

        let tts_spec = self.resolve_tts_spec(agent);
        let primary = self.tts.build(&tts_spec, &self.config)?;

        // A cloning TTS gets a cloud fallback handle; anything else plays
        // straight through.
        let tts: Arc<dyn TtsProvider> = if tts_spec.provider == "voxclone" {
            match self.build_cloud_fallback(&tts_spec) {
                Some(fallback) => Arc::new(FallbackTts::new(primary, fallback)),
                None => {
                    warn!("no cloud TTS credentials for voxclone fallback");
                    primary
                }
            }
        } else {
            primary
        };

        let model = opt_str(&agent.llm, "model").unwrap_or_else(|| "gpt-4o-mini".to_string());

        info!(
            agent = %agent.id,
            stt = %agent.stt.provider,
            llm = %agent.llm.provider,
            tts = %tts_spec.provider,
            "session pipeline assembled"
        );

        Ok(SessionPipeline {
            stt,
            llm,
            tts,
            embeddings: build_embeddings(&self.config),
            model,
        })
    }

    /// Resolve a `voice_profile_id` option into a concrete reference-audio
    /// locator; other specs pass through untouched.
    fn resolve_tts_spec(&self, agent: &AgentConfig) -> ProviderSpec {
        let mut spec = agent.tts.clone();
        if let Some(extras) = &agent.tts_extras {
            if let (Some(spec_map), Some(extra_map)) =
                (spec.options.as_object_mut(), extras.as_object())
            {
                for (k, v) in extra_map {
                    spec_map.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }

        if spec.provider == "voxclone" {
            if let Some(profile_id) = opt_str(&spec, "voice_profile_id") {
                match self.db.get_voice_profile(&profile_id) {
                    Ok(Some(profile)) => {
                        if let Some(map) = spec.options.as_object_mut() {
                            map.insert(
                                "reference_audio".to_string(),
                                serde_json::Value::String(profile.reference_audio_url),
                            );
                        }
                    }
                    Ok(None) => warn!(profile_id, "voice profile not found"),
                    Err(e) => warn!(profile_id, "voice profile lookup failed: {e}"),
                }
            }
        }
        spec
    }

    fn build_cloud_fallback(&self, spec: &ProviderSpec) -> Option<Arc<dyn TtsProvider>> {
        let fallback_spec = ProviderSpec {
            provider: "openai".to_string(),
            options: serde_json::json!({
                "voice": opt_str(spec, "fallback_voice").unwrap_or_else(|| "alloy".to_string()),
            }),
        };
        self.tts.build(&fallback_spec, &self.config).ok()
    }
}

/// Cloud fallback for a voice-cloning TTS whose reference audio is gone.
///
/// The switch is one-way and happens at most once: after the first
/// `ReferenceAudio` failure every later synthesis goes straight to the
/// fallback, never retrying the clone per turn.
pub struct FallbackTts {
    primary: Arc<dyn TtsProvider>,
    fallback: Arc<dyn TtsProvider>,
    switched: AtomicBool,
}

impl FallbackTts {
    pub fn new(primary: Arc<dyn TtsProvider>, fallback: Arc<dyn TtsProvider>) -> Self {
        Self {
            primary,
            fallback,
            switched: AtomicBool::new(false),
        }
    }

    pub fn is_switched(&self) -> bool {
        self.switched.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TtsProvider for FallbackTts {
    fn name(&self) -> &str {
        if self.is_switched() {
            self.fallback.name()
        } else {
            self.primary.name()
        }
    }

    async fn synthesize(&self, text: &str) -> Result<Synthesis, ProviderError> {
        if self.is_switched() {
            return self.fallback.synthesize(text).await;
        }
        match self.primary.synthesize(text).await {
            Err(ProviderError::ReferenceAudio(reason)) => {
                warn!(%reason, "switching to cloud TTS fallback");
                self.switched.store(true, Ordering::Relaxed);
                self.fallback.synthesize(text).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingTts {
        name: &'static str,
        calls: AtomicU32,
        fail_reference: bool,
    }

    impl CountingTts {
        fn new(name: &'static str, fail_reference: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicU32::new(0),
                fail_reference,
            })
        }
    }

    #[async_trait]
    impl TtsProvider for CountingTts {
        fn name(&self) -> &str {
            self.name
        }

        async fn synthesize(&self, _text: &str) -> Result<Synthesis, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_reference {
                Err(ProviderError::ReferenceAudio("gone".into()))
            } else {
                Ok(Synthesis {
                    samples: vec![0; 160],
                    sample_rate: 8_000,
                })
            }
        }
    }

    #[tokio::test]
    async fn fallback_switches_once_and_stays() {
        let primary = CountingTts::new("voxclone", true);
        let fallback = CountingTts::new("openai", false);
        let tts = FallbackTts::new(primary.clone(), fallback.clone());

        tts.synthesize("first").await.unwrap();
        tts.synthesize("second").await.unwrap();
        tts.synthesize("third").await.unwrap();

        // primary was tried exactly once, never per-turn afterwards
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 3);
        assert!(tts.is_switched());
        assert_eq!(tts.name(), "openai");
    }

    #[tokio::test]
    async fn healthy_primary_is_never_bypassed() {
        let primary = CountingTts::new("voxclone", false);
        let fallback = CountingTts::new("openai", false);
        let tts = FallbackTts::new(primary.clone(), fallback.clone());

        tts.synthesize("hello").await.unwrap();
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
        assert!(!tts.is_switched());
    }

    #[test]
    fn assemble_is_idempotent_per_session() {
        use vox_core::config::ProvidersConfig;
        use vox_core::types::AgentConfigId;

        let db = Arc::new(Database::open_in_memory().unwrap());
        let factory = SessionFactory::new(
            ProvidersConfig {
                stt_api_key: Some("sk".into()),
                llm_api_key: Some("sk".into()),
                tts_api_key: Some("sk".into()),
                ..ProvidersConfig::default()
            },
            db,
        );
        let agent = AgentConfig {
            id: AgentConfigId::from("a1"),
            name: "support".into(),
            llm: ProviderSpec {
                provider: "openai".into(),
                options: serde_json::json!({"model": "gpt-4o"}),
            },
            stt: ProviderSpec {
                provider: "whisper".into(),
                options: serde_json::json!({}),
            },
            tts: ProviderSpec {
                provider: "openai".into(),
                options: serde_json::json!({"voice": "alloy"}),
            },
            system_prompt: String::new(),
            tts_extras: None,
            created_at: String::new(),
            updated_at: String::new(),
        };

        let p1 = factory.assemble(&agent).unwrap();
        let p2 = factory.assemble(&agent).unwrap();
        assert_eq!(p1.model, "gpt-4o");
        // distinct instances — no cross-session memoization
        assert!(!Arc::ptr_eq(&p1.stt, &p2.stt));
    }
}

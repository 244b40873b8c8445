use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VoxError};

// Fabric constants — shared by every process that touches the broker.
pub const TAKEOVER_LOCK_TTL_SECS: u64 = 30;
pub const HEARTBEAT_TTL_SECS: u64 = 30;
pub const HEARTBEAT_REFRESH_SECS: u64 = 10;
pub const ROOM_CLAIM_TTL_SECS: u64 = 3600;
pub const SIP_REG_REFRESH_SECS: u32 = 300;

pub const DEFAULT_HTTP_PORT: u16 = 8089;
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Top-level config (voxnexus.toml + VOX_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VoxConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub sip: SipConfig,
    #[serde(default)]
    pub livekit: LiveKitConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub guardian: GuardianSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_HTTP_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// `redis://host:port/db` or `memory://` for single-process runs.
    #[serde(default = "default_broker_url")]
    pub url: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    /// First local UDP port; each extension binds port_base + index.
    #[serde(default = "default_sip_port_base")]
    pub port_base: u16,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Directory for per-call recorder and announcement WAV files.
    #[serde(default = "default_audio_dir")]
    pub audio_dir: String,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            port_base: default_sip_port_base(),
            user_agent: default_user_agent(),
            audio_dir: default_audio_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LiveKitConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    /// Base URL of the room-claim service (gateway's own /claim-room by default).
    pub claim_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub stt_api_key: Option<String>,
    pub stt_base_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_base_url: Option<String>,
    pub tts_api_key: Option<String>,
    pub tts_base_url: Option<String>,
    pub embedding_api_key: Option<String>,
    pub embedding_base_url: Option<String>,
    /// Local neural-TTS microservice.
    pub kokoro_url: Option<String>,
    /// Voice-cloning microservice.
    pub voxclone_url: Option<String>,
    pub voxclone_license_key: Option<String>,
    /// Directory searched for reference audio when a voice profile holds a
    /// bare file name.
    pub cloning_audio_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardianSettings {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Fallback auto-handoff threshold when an agent has no guardian_configs row.
    #[serde(default = "default_handoff_threshold")]
    pub handoff_threshold: f64,
    pub alert_webhook_url: Option<String>,
}

impl Default for GuardianSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            handoff_threshold: default_handoff_threshold(),
            alert_webhook_url: None,
        }
    }
}

impl VoxConfig {
    /// Load config: explicit path > VOX_CONFIG env > ./voxnexus.toml,
    /// with VOX_* environment overrides on top.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = path
            .map(str::to_string)
            .or_else(|| std::env::var("VOX_CONFIG").ok())
            .unwrap_or_else(|| "voxnexus.toml".to_string());

        // double-underscore section separator so snake_case keys survive:
        // VOX_PROVIDERS__LLM_API_KEY → providers.llm_api_key
        Figment::new()
            .merge(Toml::file(&file))
            .merge(Env::prefixed("VOX_").split("__"))
            .extract()
            .map_err(|e| VoxError::Config(e.to_string()))
    }
}

fn default_port() -> u16 {
    DEFAULT_HTTP_PORT
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_db_path() -> String {
    "voxnexus.db".to_string()
}

fn default_broker_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_sip_port_base() -> u16 {
    5060
}

fn default_user_agent() -> String {
    "VoxNexus-Bridge/0.4".to_string()
}

fn default_audio_dir() -> String {
    std::env::temp_dir()
        .join("voxnexus-audio")
        .to_string_lossy()
        .into_owned()
}

fn default_handoff_threshold() -> f64 {
    0.75
}

fn bool_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = VoxConfig::default();
        assert_eq!(cfg.gateway.port, DEFAULT_HTTP_PORT);
        assert!(cfg.guardian.enabled);
        assert!(cfg.broker.url.starts_with("redis://"));
        assert!((cfg.guardian.handoff_threshold - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn lock_ttl_is_at_least_thirty_seconds() {
        assert!(TAKEOVER_LOCK_TTL_SECS >= 30);
    }
}

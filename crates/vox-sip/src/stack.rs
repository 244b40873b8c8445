//! SIP user-agent contract.
//!
//! The production binding wraps a native SIP stack whose callbacks fire on
//! its own worker threads; implementations post [`SipEvent`]s into the mpsc
//! sender handed to them at startup and return quickly. All state changes
//! happen later, on the controller loop.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::mpsc;

use vox_turn::CallMedia;

use crate::error::Result;

/// Stack-assigned account slot.
pub type AccountId = u64;
/// Stack-assigned call slot.
pub type CallHandle = u64;

/// Everything needed to register one extension with its registrar.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// `sip:user@server`
    pub id_uri: String,
    /// `sip:server:port`
    pub registrar_uri: String,
    pub username: String,
    pub password: String,
    /// Digest auth realm; `*` matches any.
    pub realm: String,
    pub outbound_proxy: Option<String>,
    /// Registration refresh interval.
    pub reg_interval_secs: u32,
    pub local_port: u16,
    pub user_agent: String,
}

/// Events marshaled from the stack's threads onto the controller loop.
#[derive(Debug, Clone)]
pub enum SipEvent {
    RegistrationState {
        account: AccountId,
        registered: bool,
        status_code: u16,
        reason: String,
    },
    IncomingCall {
        account: AccountId,
        call: CallHandle,
        remote_uri: String,
        remote_name: Option<String>,
    },
    /// The call's audio stream became active.
    MediaActive { call: CallHandle },
    CallEnded { call: CallHandle },
}

/// Sender the stack uses to post events; the controller owns the receiver.
pub type SipEventSender = mpsc::Sender<SipEvent>;

/// Media attached to an answered call: a capture/playback pair for the turn
/// engine plus the recorder file the stack appends raw caller audio to
/// (tailed by the takeover bridge).
pub struct CallMediaBundle {
    pub media: Box<dyn CallMedia>,
    pub recorder_path: PathBuf,
}

#[async_trait]
pub trait SipStack: Send + Sync {
    async fn add_account(&self, config: &AccountConfig) -> Result<AccountId>;

    async fn remove_account(&self, account: AccountId) -> Result<()>;

    /// Answer an incoming call (200 for accept).
    async fn answer(&self, call: CallHandle, status_code: u16) -> Result<()>;

    async fn hangup(&self, call: CallHandle) -> Result<()>;

    /// Attach media to an answered call. Re-attachable: the release path may
    /// open fresh media when rebuilding a torn-down engine.
    async fn open_media(&self, call: CallHandle) -> Result<CallMediaBundle>;

    /// Play a WAV file directly on the call media, bypassing any engine.
    async fn play_wav(&self, call: CallHandle, path: &Path) -> Result<()>;

    /// Stop any in-flight direct playback.
    async fn stop_playback(&self, call: CallHandle) -> Result<()>;
}

/// Stand-in for deployments without the native UA binding linked (admin
/// surface development, WebRTC-only workers). Accounts are accepted but
/// never register; call operations fail.
pub struct NullSipStack;

#[async_trait]
impl SipStack for NullSipStack {
    async fn add_account(&self, config: &AccountConfig) -> Result<AccountId> {
        tracing::warn!(uri = %config.id_uri, "null SIP stack: account accepted but will not register");
        Ok(0)
    }

    async fn remove_account(&self, _account: AccountId) -> Result<()> {
        Ok(())
    }

    async fn answer(&self, _call: CallHandle, _status_code: u16) -> Result<()> {
        Err(crate::error::SipError::Stack("no SIP stack linked".into()))
    }

    async fn hangup(&self, _call: CallHandle) -> Result<()> {
        Err(crate::error::SipError::Stack("no SIP stack linked".into()))
    }

    async fn open_media(&self, _call: CallHandle) -> Result<CallMediaBundle> {
        Err(crate::error::SipError::Stack("no SIP stack linked".into()))
    }

    async fn play_wav(&self, _call: CallHandle, _path: &Path) -> Result<()> {
        Err(crate::error::SipError::Stack("no SIP stack linked".into()))
    }

    async fn stop_playback(&self, _call: CallHandle) -> Result<()> {
        Err(crate::error::SipError::Stack("no SIP stack linked".into()))
    }
}

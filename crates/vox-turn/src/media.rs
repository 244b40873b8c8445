//! Call-media contract: the one seam between the turn engine and whatever
//! actually carries audio (a SIP call's media port, a WebRTC participant
//! track, or a test fixture).

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media ended")]
    Ended,

    #[error("capture failed: {0}")]
    Capture(String),

    #[error("playback failed: {0}")]
    Playback(String),
}

/// Bidirectional audio for one call. All PCM is 16-bit mono.
#[async_trait]
pub trait CallMedia: Send {
    /// Native capture/playback rate of this leg (8 kHz telephony,
    /// 48 kHz WebRTC).
    fn sample_rate(&self) -> u32;

    /// Next captured 20 ms frame, pacing the caller at real time.
    /// `Ok(None)` means the media has ended (hangup / disconnect).
    async fn capture_frame(&mut self) -> Result<Option<Vec<i16>>, MediaError>;

    /// Play PCM at `sample_rate`; resolves when playback completes.
    async fn play(&mut self, samples: &[i16], sample_rate: u32) -> Result<(), MediaError>;

    /// Cut any in-flight playback immediately.
    async fn stop_playback(&mut self) -> Result<(), MediaError>;
}

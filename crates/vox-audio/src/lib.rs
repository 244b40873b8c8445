//! Telephony-grade audio primitives: PCM conversion, RIFF WAV I/O,
//! cheap resampling, voice-activity detection, and the vibe-driven voice
//! adapter applied to synthesized replies.
//!
//! Everything here operates on 16-bit signed mono PCM. The telephony leg
//! runs at 8 kHz (20 ms frame = 160 samples = 320 bytes); the WebRTC leg at
//! 48 kHz (20 ms = 960 samples). Resampling between the two deliberately
//! uses linear interpolation upward and box-filter decimation downward —
//! cheap and artifact-free enough for 20 ms voice frames.

pub mod chameleon;
pub mod pcm;
pub mod resample;
pub mod vad;
pub mod wav;

pub use chameleon::{AdapterConfig, VibeVector, VoiceAdapter};
pub use pcm::{pcm_from_le_bytes, pcm_to_le_bytes, rms};
pub use resample::{downsample_box, resample_any, upsample_linear};
pub use vad::{UtteranceDetector, VadConfig};
pub use wav::{decode_wav_bytes, read_wav, wav_bytes, write_wav, WAV_HEADER_LEN};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported format: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Telephony sample rate (Hz).
pub const TELEPHONY_RATE: u32 = 8_000;
/// WebRTC sample rate (Hz).
pub const WEBRTC_RATE: u32 = 48_000;
/// Frame duration used throughout the capture and bridge loops.
pub const FRAME_MS: u32 = 20;

/// Samples per frame at the given rate.
pub const fn frame_samples(sample_rate: u32) -> usize {
    (sample_rate / 1000 * FRAME_MS) as usize
}

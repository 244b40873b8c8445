//! RIFF WAV encode/decode for 16-bit mono PCM.
//!
//! Files written here always carry the standard 44-byte header: the bridge
//! loop tails the call recorder file by raw byte position, so the header
//! length is a wire constant, not an implementation detail.

use std::io::Cursor;
use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::{AudioError, Result};

/// Standard RIFF header length for PCM WAV with a single `data` chunk.
pub const WAV_HEADER_LEN: u64 = 44;

fn spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

/// Write mono PCM to a WAV file on disk.
pub fn write_wav(path: &Path, samples: &[i16], sample_rate: u32) -> Result<()> {
    let mut writer = WavWriter::create(path, spec(sample_rate))?;
    for &s in samples {
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Encode mono PCM as an in-memory WAV byte buffer.
pub fn wav_bytes(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec(sample_rate))?;
        for &s in samples {
            writer.write_sample(s)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Decode an in-memory WAV buffer into mono PCM plus sample rate. Stereo
/// input is downmixed by taking the left channel.
pub fn decode_wav_bytes(bytes: &[u8]) -> Result<(Vec<i16>, u32)> {
    let reader = WavReader::new(Cursor::new(bytes))?;
    let wav_spec = reader.spec();
    if wav_spec.bits_per_sample != 16 || wav_spec.sample_format != SampleFormat::Int {
        return Err(AudioError::Unsupported(format!(
            "{}-bit {:?} (16-bit int required)",
            wav_spec.bits_per_sample, wav_spec.sample_format
        )));
    }
    let channels = wav_spec.channels.max(1) as usize;
    let sample_rate = wav_spec.sample_rate;
    let samples: Vec<i16> = reader
        .into_samples::<i16>()
        .filter_map(|s| s.ok())
        .step_by(channels)
        .collect();
    Ok((samples, sample_rate))
}

/// Read a mono 16-bit WAV file, returning samples and sample rate.
pub fn read_wav(path: &Path) -> Result<(Vec<i16>, u32)> {
    let reader = WavReader::open(path)?;
    let wav_spec = reader.spec();
    if wav_spec.channels != 1 {
        return Err(AudioError::Unsupported(format!(
            "{} channels (mono required)",
            wav_spec.channels
        )));
    }
    if wav_spec.bits_per_sample != 16 || wav_spec.sample_format != SampleFormat::Int {
        return Err(AudioError::Unsupported(format!(
            "{}-bit {:?} (16-bit int required)",
            wav_spec.bits_per_sample, wav_spec.sample_format
        )));
    }
    let sample_rate = wav_spec.sample_rate;
    let samples = reader
        .into_samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok((samples, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_wav_has_standard_header() {
        let samples: Vec<i16> = (0..160).map(|i| (i * 100) as i16).collect();
        let bytes = wav_bytes(&samples, 8_000).unwrap();
        // 44-byte header + 2 bytes per sample
        assert_eq!(bytes.len() as u64, WAV_HEADER_LEN + samples.len() as u64 * 2);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        // sample rate field at offset 24
        assert_eq!(
            u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]),
            8_000
        );
    }

    #[test]
    fn file_round_trip() {
        let dir = std::env::temp_dir().join("vox-audio-wav-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("round_trip.wav");

        let samples: Vec<i16> = (0..320).map(|i| ((i % 128) * 200 - 12000) as i16).collect();
        write_wav(&path, &samples, 8_000).unwrap();
        let (read, rate) = read_wav(&path).unwrap();
        assert_eq!(rate, 8_000);
        assert_eq!(read, samples);

        std::fs::remove_file(&path).ok();
    }
}

//! The audio mirror: vibe-driven post-processing of synthesized speech.
//!
//! Caller emotional state arrives as a [`VibeVector`]; it maps to DSP
//! parameters that reshape the agent's voice before playback — an agitated
//! caller hears a deeper, slower, warmer voice, an energetic one a slightly
//! brighter and quicker one. Three CPU-cheap transforms, applied in order:
//!
//! 1. pitch shift (resample + time-correct back to length)
//! 2. time stretch (windowed overlap-add)
//! 3. low-pass (4th-order Butterworth as two cascaded biquads)
//!
//! Parameter changes are smoothed with an EMA so the voice never jumps
//! between states mid-sentence. One adapter per call; not thread-safe.

use std::f32::consts::PI;

/// Caller emotional state, both components in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VibeVector {
    pub agitation: f32,
    pub energy: f32,
}

impl VibeVector {
    /// Approximate the caller's state from conversation signals: sustained
    /// negative sentiment and risk drive agitation, sustained positive
    /// sentiment drives energy.
    pub fn from_signals(mean_sentiment: f32, risk_score: f32) -> Self {
        Self {
            agitation: ((-mean_sentiment).clamp(0.0, 1.0) * 0.5
                + risk_score.clamp(0.0, 1.0) * 0.5)
                .clamp(0.0, 1.0),
            energy: mean_sentiment.clamp(0.0, 1.0),
        }
    }
}

/// DSP transformation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformParams {
    /// Semitones to shift, -12 to +12.
    pub pitch_semitones: f32,
    /// Time-stretch factor, 0.5 to 2.0 (> 1 is faster).
    pub speed_factor: f32,
    /// Cutoff in Hz; `None` disables the filter.
    pub lowpass_cutoff: Option<f32>,
}

impl Default for TransformParams {
    fn default() -> Self {
        Self {
            pitch_semitones: 0.0,
            speed_factor: 1.0,
            lowpass_cutoff: None,
        }
    }
}

impl TransformParams {
    pub fn pitch_ratio(&self) -> f32 {
        2.0_f32.powf(self.pitch_semitones / 12.0)
    }

    fn is_passthrough(&self) -> bool {
        self.pitch_semitones.abs() < 0.01
            && (self.speed_factor - 1.0).abs() < 0.01
            && self.lowpass_cutoff.is_none()
    }
}

/// Agitation above this gets the calming response.
pub const AGITATION_THRESHOLD: f32 = 0.7;
/// Energy above this gets the matching-enthusiasm response.
pub const ENERGY_THRESHOLD: f32 = 0.8;

/// Deeper, slower, warmer.
const CALM_RESPONSE: TransformParams = TransformParams {
    pitch_semitones: -2.0,
    speed_factor: 0.9,
    lowpass_cutoff: Some(3_500.0),
};

/// Slightly higher and quicker, brightness kept.
const ENERGETIC_RESPONSE: TransformParams = TransformParams {
    pitch_semitones: 1.0,
    speed_factor: 1.1,
    lowpass_cutoff: None,
};

/// Hard-threshold vibe mapping. Priority: agitation > energy > neutral
/// (calming an angry caller wins).
pub fn map_vibe_to_transform(vibe: VibeVector) -> TransformParams {
    if vibe.agitation > AGITATION_THRESHOLD {
        return CALM_RESPONSE;
    }
    if vibe.energy > ENERGY_THRESHOLD {
        return ENERGETIC_RESPONSE;
    }
    TransformParams::default()
}

/// Graded mapping: scale the preset by how far past the threshold the vibe
/// sits, for gradual transitions instead of hard switches.
pub fn interpolate_transform(vibe: VibeVector, smoothing: f32) -> TransformParams {
    let agitation_intensity =
        ((vibe.agitation - AGITATION_THRESHOLD) / (1.0 - AGITATION_THRESHOLD)).max(0.0);
    let energy_intensity = ((vibe.energy - ENERGY_THRESHOLD) / (1.0 - ENERGY_THRESHOLD)).max(0.0);

    if agitation_intensity > 0.0 {
        let intensity = agitation_intensity * smoothing;
        return TransformParams {
            pitch_semitones: CALM_RESPONSE.pitch_semitones * intensity,
            speed_factor: 1.0 + (CALM_RESPONSE.speed_factor - 1.0) * intensity,
            lowpass_cutoff: if intensity > 0.5 {
                CALM_RESPONSE.lowpass_cutoff
            } else {
                None
            },
        };
    }
    if energy_intensity > 0.0 {
        let intensity = energy_intensity * smoothing;
        return TransformParams {
            pitch_semitones: ENERGETIC_RESPONSE.pitch_semitones * intensity,
            speed_factor: 1.0 + (ENERGETIC_RESPONSE.speed_factor - 1.0) * intensity,
            lowpass_cutoff: None,
        };
    }
    TransformParams::default()
}

// ── biquad low-pass ───────────────────────────────────────────────────────────

/// One direct-form-II-transposed biquad section with persistent state.
#[derive(Debug, Clone, Default)]
struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: f32,
    z2: f32,
}

impl Biquad {
    fn lowpass(cutoff_hz: f32, sample_rate: f32, q: f32) -> Self {
        let w0 = 2.0 * PI * (cutoff_hz / sample_rate).min(0.49);
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * q);
        let a0 = 1.0 + alpha;
        Self {
            b0: ((1.0 - cos_w0) / 2.0) / a0,
            b1: (1.0 - cos_w0) / a0,
            b2: ((1.0 - cos_w0) / 2.0) / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha) / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }

    fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

/// Butterworth pole Q values for a 4th-order filter split into two sections.
const BUTTERWORTH_Q: [f32; 2] = [0.541_196_1, 1.306_563];

// ── DSP engine ────────────────────────────────────────────────────────────────

/// Stateful transform chain for one call. Filter coefficients are cached per
/// cutoff; filter state persists across chunks so block edges stay smooth.
pub struct DspEngine {
    sample_rate: u32,
    chunk_size: usize,
    window: Vec<f32>,
    filter: Option<(f32, [Biquad; 2])>,
}

impl DspEngine {
    pub fn new(sample_rate: u32, chunk_size: usize) -> Self {
        Self {
            sample_rate,
            chunk_size,
            window: hann_window(chunk_size),
            filter: None,
        }
    }

    /// Provider-native rates vary; retune when a clip arrives at a new one.
    pub fn ensure_rate(&mut self, sample_rate: u32) {
        if self.sample_rate != sample_rate {
            self.sample_rate = sample_rate;
            self.filter = None;
        }
    }

    /// Apply pitch shift, time stretch, and low-pass in that order.
    /// Input and output are float PCM in [-1, 1].
    pub fn process_chunk(&mut self, audio: &[f32], params: TransformParams) -> Vec<f32> {
        let mut out;

        if params.pitch_semitones.abs() > 0.01 {
            out = pitch_shift_resample(audio, params.pitch_ratio());
        } else {
            out = audio.to_vec();
        }

        if (params.speed_factor - 1.0).abs() > 0.01 {
            out = self.time_stretch_ola(&out, params.speed_factor);
        }

        if let Some(cutoff) = params.lowpass_cutoff {
            out = self.apply_lowpass(&out, cutoff);
        }

        for s in &mut out {
            *s = s.clamp(-1.0, 1.0);
        }
        out
    }

    /// Overlap-add time stretch: window at the analysis hop, place at the
    /// synthesis hop, normalise by the accumulated window.
    fn time_stretch_ola(&self, audio: &[f32], speed_factor: f32) -> Vec<f32> {
        let n = audio.len();
        let target_len = (n as f32 / speed_factor) as usize;
        if target_len < 2 || n < 2 {
            return audio.to_vec();
        }

        let chunk = self.chunk_size.min(n);
        let window = if chunk == self.chunk_size {
            self.window.clone()
        } else {
            hann_window(chunk)
        };

        let analysis_hop = (chunk / 2).max(1);
        let synthesis_hop = ((analysis_hop as f32 / speed_factor) as usize).max(1);

        let mut padded = audio.to_vec();
        padded.resize(n + chunk, 0.0);

        let mut out = vec![0.0f32; target_len + chunk];
        let mut norm = vec![0.0f32; target_len + chunk];

        let n_frames = (padded.len() - chunk) / analysis_hop;
        for i in 0..n_frames {
            let start_in = i * analysis_hop;
            let start_out = i * synthesis_hop;
            if start_out + chunk > out.len() {
                break;
            }
            for j in 0..chunk {
                out[start_out + j] += padded[start_in + j] * window[j];
                norm[start_out + j] += window[j];
            }
        }

        out.truncate(target_len);
        for (s, w) in out.iter_mut().zip(&norm) {
            *s /= w.max(1e-8);
        }
        out
    }

    fn apply_lowpass(&mut self, audio: &[f32], cutoff_hz: f32) -> Vec<f32> {
        let rate = self.sample_rate as f32;
        let rebuild = match &self.filter {
            Some((cached, _)) => (*cached - cutoff_hz).abs() > f32::EPSILON,
            None => true,
        };
        if rebuild {
            self.filter = Some((
                cutoff_hz,
                [
                    Biquad::lowpass(cutoff_hz, rate, BUTTERWORTH_Q[0]),
                    Biquad::lowpass(cutoff_hz, rate, BUTTERWORTH_Q[1]),
                ],
            ));
        }
        let (_, sections) = self.filter.as_mut().unwrap();

        audio
            .iter()
            .map(|&x| {
                let mid = sections[0].process(x);
                sections[1].process(mid)
            })
            .collect()
    }

    pub fn reset(&mut self) {
        if let Some((_, sections)) = &mut self.filter {
            for s in sections {
                s.reset();
            }
        }
    }
}

/// Pitch shift via resampling: resample by 1/ratio, then stretch back to the
/// original length with linear interpolation. Cheap and length-preserving.
fn pitch_shift_resample(audio: &[f32], pitch_ratio: f32) -> Vec<f32> {
    if (pitch_ratio - 1.0).abs() < 0.001 || audio.len() < 2 {
        return audio.to_vec();
    }
    let n = audio.len();
    let new_len = ((n as f32 / pitch_ratio) as usize).max(2);
    let resampled = lerp_resample(audio, new_len);
    lerp_resample(&resampled, n)
}

fn lerp_resample(input: &[f32], out_len: usize) -> Vec<f32> {
    let last = input.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f32 * last as f32 / (out_len.max(2) - 1) as f32;
            let idx = (pos as usize).min(last);
            if idx >= last {
                return input[last];
            }
            let frac = pos - idx as f32;
            input[idx] + (input[idx + 1] - input[idx]) * frac
        })
        .collect()
}

fn hann_window(n: usize) -> Vec<f32> {
    if n < 2 {
        return vec![1.0; n];
    }
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / (n - 1) as f32).cos()))
        .collect()
}

// ── voice adapter ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub sample_rate: u32,
    /// 20 ms at the default rate.
    pub chunk_size: usize,
    /// Graded parameter mapping instead of hard thresholds.
    pub use_interpolation: bool,
    /// Scale on the graded mapping's intensity.
    pub smoothing_factor: f32,
    /// EMA step toward the target parameters per processed clip.
    pub param_alpha: f32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            chunk_size: 480,
            use_interpolation: true,
            smoothing_factor: 0.3,
            param_alpha: 0.1,
        }
    }
}

/// Per-call voice adaptation. Feed each synthesized clip with the current
/// vibe; the output replaces the clip before playback.
pub struct VoiceAdapter {
    config: AdapterConfig,
    engine: DspEngine,
    current: TransformParams,
    target: TransformParams,
    state_name: &'static str,
}

impl VoiceAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self {
            engine: DspEngine::new(config.sample_rate, config.chunk_size),
            config,
            current: TransformParams::default(),
            target: TransformParams::default(),
            state_name: "neutral",
        }
    }

    /// Adapt one clip of 16-bit PCM at `sample_rate`.
    pub fn process(&mut self, samples: &[i16], sample_rate: u32, vibe: VibeVector) -> Vec<i16> {
        self.engine.ensure_rate(sample_rate);

        self.target = if self.config.use_interpolation {
            interpolate_transform(vibe, self.config.smoothing_factor)
        } else {
            map_vibe_to_transform(vibe)
        };
        self.current = smooth_params(self.current, self.target, self.config.param_alpha);
        self.state_name = state_of(vibe);

        if self.current.is_passthrough() {
            return samples.to_vec();
        }

        let audio: Vec<f32> = samples.iter().map(|&s| s as f32 / 32_768.0).collect();
        let out = self.engine.process_chunk(&audio, self.current);
        out.iter().map(|&s| (s * 32_767.0) as i16).collect()
    }

    pub fn current_params(&self) -> TransformParams {
        self.current
    }

    /// Current adaptation state name, for logging.
    pub fn state(&self) -> &'static str {
        self.state_name
    }

    pub fn reset(&mut self) {
        self.engine.reset();
        self.current = TransformParams::default();
        self.target = TransformParams::default();
        self.state_name = "neutral";
    }
}

/// EMA toward the target. The filter on/off switch is not interpolated.
fn smooth_params(current: TransformParams, target: TransformParams, alpha: f32) -> TransformParams {
    let lerp = |a: f32, b: f32| a + alpha * (b - a);
    TransformParams {
        pitch_semitones: lerp(current.pitch_semitones, target.pitch_semitones),
        speed_factor: lerp(current.speed_factor, target.speed_factor),
        lowpass_cutoff: target.lowpass_cutoff,
    }
}

fn state_of(vibe: VibeVector) -> &'static str {
    if vibe.agitation > AGITATION_THRESHOLD {
        "high_agitation"
    } else if vibe.energy > ENERGY_THRESHOLD {
        "high_energy"
    } else {
        "neutral"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / rate as f32).sin() * 0.5)
            .collect()
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn pitch_ratio_follows_equal_temperament() {
        let up = TransformParams {
            pitch_semitones: 12.0,
            ..TransformParams::default()
        };
        let down = TransformParams {
            pitch_semitones: -12.0,
            ..TransformParams::default()
        };
        assert!((up.pitch_ratio() - 2.0).abs() < 1e-4);
        assert!((down.pitch_ratio() - 0.5).abs() < 1e-4);
    }

    #[test]
    fn agitation_beats_energy() {
        let both = VibeVector {
            agitation: 0.9,
            energy: 0.9,
        };
        assert_eq!(map_vibe_to_transform(both), CALM_RESPONSE);
        assert_eq!(
            map_vibe_to_transform(VibeVector {
                agitation: 0.1,
                energy: 0.9
            }),
            ENERGETIC_RESPONSE
        );
        assert_eq!(
            map_vibe_to_transform(VibeVector::default()),
            TransformParams::default()
        );
    }

    #[test]
    fn interpolation_is_neutral_below_thresholds() {
        let params = interpolate_transform(
            VibeVector {
                agitation: 0.5,
                energy: 0.5,
            },
            0.3,
        );
        assert_eq!(params, TransformParams::default());

        let params = interpolate_transform(
            VibeVector {
                agitation: 1.0,
                energy: 0.0,
            },
            0.3,
        );
        assert!(params.pitch_semitones < 0.0);
        assert!(params.speed_factor < 1.0);
    }

    #[test]
    fn pitch_shift_preserves_length() {
        let input = sine(440.0, 24_000, 2_400);
        let shifted = pitch_shift_resample(&input, 2.0_f32.powf(-2.0 / 12.0));
        assert_eq!(shifted.len(), input.len());
        // energy roughly preserved
        assert!((rms(&shifted) - rms(&input)).abs() < 0.1);
    }

    #[test]
    fn time_stretch_changes_duration() {
        let mut engine = DspEngine::new(24_000, 480);
        let input = sine(300.0, 24_000, 2_400);
        let slow = engine.process_chunk(
            &input,
            TransformParams {
                speed_factor: 0.9,
                ..TransformParams::default()
            },
        );
        // 0.9× speed is ~11% longer
        assert!(slow.len() > input.len());
        assert!((slow.len() as f32 - input.len() as f32 / 0.9).abs() < 4.0);

        let fast = engine.process_chunk(
            &input,
            TransformParams {
                speed_factor: 1.1,
                ..TransformParams::default()
            },
        );
        assert!(fast.len() < input.len());
    }

    #[test]
    fn lowpass_attenuates_highs_not_lows() {
        let mut engine = DspEngine::new(24_000, 480);
        let params = TransformParams {
            lowpass_cutoff: Some(3_000.0),
            ..TransformParams::default()
        };

        let low = sine(400.0, 24_000, 4_800);
        let low_out = engine.process_chunk(&low, params);
        let low_ratio = rms(&low_out) / rms(&low);

        engine.reset();
        let high = sine(10_000.0, 24_000, 4_800);
        let high_out = engine.process_chunk(&high, params);
        let high_ratio = rms(&high_out) / rms(&high);

        assert!(low_ratio > 0.9, "passband attenuated: {low_ratio}");
        assert!(high_ratio < 0.1, "stopband leaked: {high_ratio}");
    }

    #[test]
    fn neutral_vibe_is_bit_exact_passthrough() {
        let mut adapter = VoiceAdapter::new(AdapterConfig::default());
        let samples: Vec<i16> = (0..480).map(|i| (i * 17 % 2_000 - 1_000) as i16).collect();
        let out = adapter.process(&samples, 24_000, VibeVector::default());
        assert_eq!(out, samples);
        assert_eq!(adapter.state(), "neutral");
    }

    #[test]
    fn ema_converges_toward_the_target() {
        let mut adapter = VoiceAdapter::new(AdapterConfig {
            use_interpolation: false,
            ..AdapterConfig::default()
        });
        let clip: Vec<i16> = vec![500; 480];
        let vibe = VibeVector {
            agitation: 0.95,
            energy: 0.0,
        };
        for _ in 0..50 {
            adapter.process(&clip, 24_000, vibe);
        }
        let params = adapter.current_params();
        assert!((params.pitch_semitones - CALM_RESPONSE.pitch_semitones).abs() < 0.1);
        assert!((params.speed_factor - CALM_RESPONSE.speed_factor).abs() < 0.01);
        assert_eq!(adapter.state(), "high_agitation");
    }

    #[test]
    fn full_jump_applies_the_calm_preset() {
        let mut adapter = VoiceAdapter::new(AdapterConfig {
            use_interpolation: false,
            param_alpha: 1.0,
            ..AdapterConfig::default()
        });
        let clip: Vec<i16> = (0..2_400)
            .map(|i| ((2.0 * PI * 440.0 * i as f32 / 24_000.0).sin() * 12_000.0) as i16)
            .collect();
        let out = adapter.process(
            &clip,
            24_000,
            VibeVector {
                agitation: 0.9,
                energy: 0.0,
            },
        );
        // 0.9× speed makes the clip longer
        assert!(out.len() > clip.len());
    }

    #[test]
    fn reset_returns_to_neutral() {
        let mut adapter = VoiceAdapter::new(AdapterConfig {
            param_alpha: 1.0,
            ..AdapterConfig::default()
        });
        adapter.process(
            &[0; 480],
            24_000,
            VibeVector {
                agitation: 1.0,
                energy: 0.0,
            },
        );
        adapter.reset();
        assert_eq!(adapter.current_params(), TransformParams::default());
        assert_eq!(adapter.state(), "neutral");
    }
}

//! Sample-level DSP for the capture path and playback conversion.
//!
//! The capture pipeline is a chain of typed stages fed from the device
//! callback's ring buffer: downmix → resample to 16 kHz → compressor →
//! fixed-size framing → voice-activity flag.

use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::time::Duration;
use tracing::error;

/// Rate the live endpoint expects microphone audio at.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
pub const CAPTURE_MIME_TYPE: &str = "audio/pcm;rate=16000";
/// Samples per outbound frame (128 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = 2048;
/// Mean absolute amplitude (0..1) above which a frame counts as speech.
pub const VAD_THRESHOLD: f32 = 0.02;

pub const COMPRESSOR_THRESHOLD_DB: f32 = -24.0;
pub const COMPRESSOR_RATIO: f32 = 4.0;
pub const COMPRESSOR_ATTACK: Duration = Duration::from_millis(3);
pub const COMPRESSOR_RELEASE: Duration = Duration::from_millis(250);

const RESAMPLER_CHUNK: usize = 1024;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )?;
    Ok(resampler)
}

/// Resamples one complete mono buffer. The output is cut to the exact
/// length implied by the rate ratio.
pub fn resample_all(samples: &[f32], in_rate: u32, out_rate: u32) -> anyhow::Result<Vec<f32>> {
    if in_rate == out_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let mut resampler = create_resampler(in_rate as f64, out_rate as f64, RESAMPLER_CHUNK)?;
    let mut out = Vec::with_capacity(samples.len() * out_rate as usize / in_rate as usize + 1);
    let mut rest = samples;
    while rest.len() >= resampler.input_frames_next() {
        let n = resampler.input_frames_next();
        let res = resampler.process(&[&rest[..n]], None)?;
        out.extend_from_slice(&res[0]);
        rest = &rest[n..];
    }
    if !rest.is_empty() {
        let res = resampler.process_partial(Some(&[rest]), None)?;
        out.extend_from_slice(&res[0]);
    }
    let expected = (samples.len() as f64 * out_rate as f64 / in_rate as f64).ceil() as usize;
    out.truncate(expected);
    Ok(out)
}

/// Incremental resampler for an unbounded stream; keeps the input remainder
/// between calls.
pub struct StreamResampler {
    inner: FastFixedIn<f32>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32) -> anyhow::Result<Self> {
        Ok(Self {
            inner: create_resampler(in_rate as f64, out_rate as f64, RESAMPLER_CHUNK)?,
            pending: Vec::with_capacity(RESAMPLER_CHUNK * 2),
        })
    }

    pub fn push(&mut self, samples: &[f32]) -> Vec<f32> {
        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        loop {
            let need = self.inner.input_frames_next();
            if self.pending.len() < need {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..need).collect();
            match self.inner.process(&[chunk], None) {
                Ok(res) => out.extend_from_slice(&res[0]),
                Err(e) => {
                    error!(error = %e, "Resampling failed, dropping chunk");
                    break;
                }
            }
        }
        out
    }
}

/// Averages interleaved channels into mono.
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 | 1 => interleaved.to_vec(),
        n => interleaved
            .chunks_exact(n as usize)
            .map(|frame| frame.iter().sum::<f32>() / n as f32)
            .collect(),
    }
}

/// Feed-forward peak compressor.
#[derive(Debug, Clone)]
pub struct Compressor {
    threshold_db: f32,
    ratio: f32,
    attack_coeff: f32,
    release_coeff: f32,
    envelope: f32,
}

impl Compressor {
    pub fn new(sample_rate: u32) -> Self {
        Self::with_params(
            sample_rate,
            COMPRESSOR_THRESHOLD_DB,
            COMPRESSOR_RATIO,
            COMPRESSOR_ATTACK,
            COMPRESSOR_RELEASE,
        )
    }

    pub fn with_params(
        sample_rate: u32,
        threshold_db: f32,
        ratio: f32,
        attack: Duration,
        release: Duration,
    ) -> Self {
        Self {
            threshold_db,
            ratio: ratio.max(1.0),
            attack_coeff: smoothing_coeff(attack, sample_rate),
            release_coeff: smoothing_coeff(release, sample_rate),
            envelope: 0.0,
        }
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        let slope = 1.0 - 1.0 / self.ratio;
        for s in samples.iter_mut() {
            let level = s.abs();
            let coeff = if level > self.envelope {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.envelope = coeff * self.envelope + (1.0 - coeff) * level;

            let over_db = 20.0 * self.envelope.max(1e-9).log10() - self.threshold_db;
            if over_db > 0.0 {
                *s *= 10f32.powf(-over_db * slope / 20.0);
            }
        }
    }
}

fn smoothing_coeff(time: Duration, sample_rate: u32) -> f32 {
    let samples = time.as_secs_f32() * sample_rate as f32;
    if samples <= 0.0 { 0.0 } else { (-1.0 / samples).exp() }
}

/// Cuts a sample stream into equal frames, holding the remainder.
#[derive(Debug)]
pub struct Framer {
    frame_samples: usize,
    pending: Vec<i16>,
}

impl Framer {
    pub fn new(frame_samples: usize) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
            pending: Vec::with_capacity(frame_samples),
        }
    }

    pub fn push(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            frames.push(self.pending.drain(..self.frame_samples).collect());
        }
        frames
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// Amplitude-based voice activity for one frame.
pub fn voice_active(frame: &[i16]) -> bool {
    if frame.is_empty() {
        return false;
    }
    let mean = frame.iter().map(|&s| (s as f32).abs()).sum::<f32>() / frame.len() as f32;
    mean / 32768.0 > VAD_THRESHOLD
}

/// One fixed-size outbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub pcm: Vec<i16>,
    pub voice_active: bool,
}

/// Device samples in, 16 kHz mono frames out.
pub struct CapturePipeline {
    channels: u16,
    resampler: Option<StreamResampler>,
    compressor: Compressor,
    framer: Framer,
}

impl CapturePipeline {
    pub fn new(device_rate: u32, channels: u16) -> anyhow::Result<Self> {
        let resampler = if device_rate == CAPTURE_SAMPLE_RATE {
            None
        } else {
            Some(StreamResampler::new(device_rate, CAPTURE_SAMPLE_RATE)?)
        };
        Ok(Self {
            channels,
            resampler,
            compressor: Compressor::new(CAPTURE_SAMPLE_RATE),
            framer: Framer::new(FRAME_SAMPLES),
        })
    }

    pub fn push(&mut self, interleaved: &[f32]) -> Vec<AudioFrame> {
        let mono = downmix(interleaved, self.channels);
        let mut mono = match self.resampler.as_mut() {
            Some(r) => r.push(&mono),
            None => mono,
        };
        self.compressor.process(&mut mono);
        let pcm = convert_f32_to_i16(&mono);
        self.framer
            .push(&pcm)
            .into_iter()
            .map(|pcm| AudioFrame {
                voice_active: voice_active(&pcm),
                pcm,
            })
            .collect()
    }
}

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Little-endian PCM16 as base64, the wire form of an outbound frame.
pub fn encode_i16(pcm16: &[i16]) -> String {
    let pcm16_bytes: Vec<u8> = pcm16
        .iter()
        .flat_map(|&sample| sample.to_le_bytes())
        .collect();
    base64::engine::general_purpose::STANDARD.encode(&pcm16_bytes)
}

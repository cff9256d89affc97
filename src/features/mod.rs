//! Feature extraction for one conversion window
//!
//! Pitch estimation and speech-unit encoding are delegated to a
//! [`FeatureExtractor`]; the per-hop volume curve, the pitch shift and the
//! voice-activity mask are computed here.

pub mod onnx;

use crate::error::{AppError, Result};
use ndarray::Array2;
use tracing::debug;

pub use onnx::OnnxFeatureExtractor;

/// Frames whose volume is at or below -60 dBFS count as unvoiced
pub const VOICED_THRESHOLD: f32 = 0.001;

/// Frames added on each side of the voiced flags before dilation
const MASK_PAD: usize = 4;

/// Width of the dilation window
const MASK_WINDOW: usize = 2 * MASK_PAD + 1;

/// Delegated signal analysis.
///
/// Implementations wrap a pitch detector and a speech-unit encoder. Both
/// operate on the full retained window at the processing sample rate and
/// produce one value (or vector) per hop.
pub trait FeatureExtractor: Send + Sync {
    /// Name for logging
    fn name(&self) -> &str;

    /// Per-hop fundamental frequency in Hz, unvoiced frames interpolated
    /// from their voiced neighbours
    fn estimate_f0(
        &self,
        audio: &[f32],
        geometry: &FrameGeometry,
        detector: &str,
    ) -> Result<Vec<f32>>;

    /// Speech-unit embeddings, one row per hop
    fn encode_units(&self, audio: &[f32], geometry: &FrameGeometry) -> Result<Array2<f32>>;
}

/// Frame layout of the active model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    /// Processing sample rate of the input window
    pub sample_rate: u32,
    /// Input samples per model frame
    pub hop_size: usize,
    /// Output samples per model frame
    pub block_size: usize,
}

impl FrameGeometry {
    /// Frames covering `samples` input samples
    pub fn frames_for(&self, samples: usize) -> usize {
        samples / self.hop_size.max(1) + 1
    }
}

/// Features for one window
#[derive(Debug, Clone)]
pub struct Features {
    /// Pitch curve after the semitone shift
    pub f0: Vec<f32>,
    /// Per-hop RMS volume
    pub volume: Vec<f32>,
    /// Smoothed voice-activity mask at block resolution
    pub mask: Vec<f32>,
    /// Unit embeddings (frames x dim)
    pub units: Array2<f32>,
}

impl Features {
    /// Number of hop frames covered by the volume curve
    pub fn frames(&self) -> usize {
        self.volume.len()
    }
}

/// Run all extractors over `audio`.
///
/// The mask is upsampled by the geometry's block size (samples per frame at
/// the model's output rate).
pub fn extract_features(
    extractor: &dyn FeatureExtractor,
    audio: &[f32],
    geometry: &FrameGeometry,
    semitones: i64,
    detector: &str,
) -> Result<Features> {
    if geometry.hop_size == 0 {
        return Err(AppError::Config("hop size must be positive".to_string()));
    }

    let mut f0 = extractor.estimate_f0(audio, geometry, detector)?;
    shift_pitch(&mut f0, semitones);

    let volume = volume_curve(audio, geometry.hop_size);
    let voiced: Vec<bool> = volume.iter().map(|&v| v > VOICED_THRESHOLD).collect();
    let mask = smooth_voiced_mask(&voiced, geometry.block_size);

    let units = extractor.encode_units(audio, geometry)?;

    debug!(
        "Features from {}: {} f0 frames, {} volume frames, units {:?}",
        extractor.name(),
        f0.len(),
        volume.len(),
        units.dim()
    );

    Ok(Features {
        f0,
        volume,
        mask,
        units,
    })
}

/// Multiply a pitch curve by `2^(semitones / 12)`
pub fn shift_pitch(f0: &mut [f32], semitones: i64) {
    let factor = 2f32.powf(semitones as f32 / 12.0);
    for value in f0.iter_mut() {
        *value *= factor;
    }
}

/// Per-hop RMS volume.
///
/// The squared signal is reflect-padded by half a hop on each side so that
/// frame `n` is centred on sample `n * hop_size`; the curve has
/// `len / hop_size + 1` frames.
pub fn volume_curve(audio: &[f32], hop_size: usize) -> Vec<f32> {
    let hop_size = hop_size.max(1);
    let n_frames = audio.len() / hop_size + 1;
    if audio.is_empty() {
        return vec![0.0; n_frames];
    }

    let squared: Vec<f32> = audio.iter().map(|s| s * s).collect();
    let left = hop_size / 2;
    let right = (hop_size + 1) / 2;
    let padded = reflect_pad(&squared, left, right);

    (0..n_frames)
        .map(|n| {
            let start = (n * hop_size).min(padded.len());
            let end = ((n + 1) * hop_size).min(padded.len());
            let frame = &padded[start..end];
            if frame.is_empty() {
                0.0
            } else {
                (frame.iter().sum::<f32>() / frame.len() as f32).sqrt()
            }
        })
        .collect()
}

/// Reflect padding without repeating the edge sample; falls back to edge
/// replication where the signal is too short to mirror
fn reflect_pad(signal: &[f32], left: usize, right: usize) -> Vec<f32> {
    let len = signal.len();
    let mut out = Vec::with_capacity(len + left + right);
    for i in (1..=left).rev() {
        out.push(signal[i.min(len - 1)]);
    }
    out.extend_from_slice(signal);
    for i in 1..=right {
        out.push(signal[(len - 1).saturating_sub(i)]);
    }
    out
}

/// Smooth per-frame voiced flags into a sample-resolution mask.
///
/// The flags are padded by four frames on each side (edge replication), each
/// output frame takes the maximum over a nine-frame window, and every frame
/// is repeated `block_size` times. The result has `flags.len() * block_size`
/// entries of 0.0 or 1.0.
pub fn smooth_voiced_mask(flags: &[bool], block_size: usize) -> Vec<f32> {
    let (Some(&first), Some(&last)) = (flags.first(), flags.last()) else {
        return Vec::new();
    };

    let mut padded = Vec::with_capacity(flags.len() + 2 * MASK_PAD);
    padded.extend(std::iter::repeat(first).take(MASK_PAD));
    padded.extend_from_slice(flags);
    padded.extend(std::iter::repeat(last).take(MASK_PAD));

    let mut mask = Vec::with_capacity(flags.len() * block_size);
    for window in padded.windows(MASK_WINDOW) {
        let value = if window.iter().any(|&v| v) { 1.0 } else { 0.0 };
        mask.extend(std::iter::repeat(value).take(block_size));
    }
    mask
}

/// Truncate or edge-extend a per-frame curve to `frames` entries
pub fn align_frames(curve: &[f32], frames: usize) -> Vec<f32> {
    let mut out: Vec<f32> = curve.iter().copied().take(frames).collect();
    let fill = curve.last().copied().unwrap_or(0.0);
    out.resize(frames, fill);
    out
}

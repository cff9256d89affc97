//! Silence gate
//!
//! Energy-based decision on whether a cycle is worth converting. Quiet
//! chunks skip feature extraction and inference entirely and are emitted as
//! silence of the exact requested length.

use tracing::debug;

/// Configuration for the silence gate
#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    /// RMS below which the cycle is gated
    pub threshold: f32,
    /// Carry-over factor applied to the previous volume before comparison.
    /// 0.0 disables smoothing.
    pub decay: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold: 0.00001,
            decay: 0.0,
        }
    }
}

impl GateConfig {
    pub fn with_threshold(threshold: f32) -> Self {
        Self {
            threshold,
            ..Default::default()
        }
    }
}

/// Outcome of the gate for one cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateDecision {
    /// Whether the cycle goes through inference
    pub pass: bool,
    /// Volume carried to the next cycle
    pub smoothed_volume: f32,
}

/// Compute RMS (Root Mean Square) energy of audio samples
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

/// Decide whether a region with `volume` passes, given the volume of the
/// previous cycle
pub fn gate(volume: f32, previous_volume: f32, config: &GateConfig) -> GateDecision {
    let smoothed_volume = volume.max(previous_volume * config.decay);
    let pass = smoothed_volume >= config.threshold;
    if !pass {
        debug!(
            "Gated: volume={:.6}, threshold={:.6}",
            smoothed_volume, config.threshold
        );
    }
    GateDecision {
        pass,
        smoothed_volume,
    }
}

//! Rolling input buffer
//!
//! Accumulates normalized input samples across chunks and keeps only the
//! context the model needs: the chunk itself, the crossfade overlap and some
//! extra lookback. The retained length is always rounded up to a whole number
//! of model hops, since the model output is truncated to hop boundaries.

use tracing::debug;

/// Scale between 16-bit PCM and normalized f32 samples
pub const PCM_SCALE: f32 = 32768.0;

/// View of the buffer for one conversion cycle
#[derive(Debug, Clone, Copy)]
pub struct AudioWindow<'a> {
    /// Entire retained buffer (input of feature extraction)
    pub full: &'a [f32],
    /// Part of the buffer that is about to be emitted (input of the silence gate)
    pub crop: &'a [f32],
}

/// Append-only sample accumulator with bounded, hop-aligned retention
#[derive(Debug, Clone)]
pub struct RollingAudioBuffer {
    samples: Vec<f32>,
    hop_size: usize,
    retention: usize,
}

/// Round `size` up to the next multiple of `hop_size`, or down when rounding
/// up would overflow
pub fn align_to_hop(size: usize, hop_size: usize) -> usize {
    let hop_size = hop_size.max(1);
    match size % hop_size {
        0 => size,
        rem => size
            .checked_add(hop_size - rem)
            .unwrap_or(size - rem),
    }
}

impl RollingAudioBuffer {
    /// Create an empty buffer for a model advancing `hop_size` samples per step
    pub fn new(hop_size: usize) -> Self {
        let hop_size = hop_size.max(1);
        Self {
            samples: Vec::new(),
            hop_size,
            retention: hop_size,
        }
    }

    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    /// Current retention length (always a multiple of the hop size)
    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// True once the buffer holds a full retention window
    pub fn is_primed(&self) -> bool {
        self.samples.len() >= self.retention
    }

    /// Recompute the retention length for the given chunk geometry.
    ///
    /// Returns the new retention, which is also the expected length of the
    /// converted segment for this cycle.
    pub fn set_geometry(
        &mut self,
        input_size: usize,
        crossfade_size: usize,
        extra_size: usize,
    ) -> usize {
        let size = input_size
            .saturating_add(crossfade_size)
            .saturating_add(extra_size);
        let retention = align_to_hop(size, self.hop_size);
        if retention != self.retention {
            debug!(
                "Buffer retention {} -> {} samples (hop {})",
                self.retention, retention, self.hop_size
            );
            self.retention = retention;
            self.truncate_front();
        }
        self.retention
    }

    /// Normalize 16-bit samples, append them and drop the oldest samples
    /// beyond the retention length
    pub fn append(&mut self, samples: &[i16]) {
        self.samples
            .extend(samples.iter().map(|&s| s as f32 / PCM_SCALE));
        self.truncate_front();
    }

    /// Split the buffer into the full window and the crop region.
    ///
    /// The crop region is the last `input_size + crossfade_size` samples
    /// without the trailing `crossfade_size`. Before priming, whatever is
    /// available is used; nothing is padded.
    pub fn extract_window(&self, input_size: usize, crossfade_size: usize) -> AudioWindow<'_> {
        let len = self.samples.len();
        let start = len.saturating_sub(input_size + crossfade_size);
        let end = len.saturating_sub(crossfade_size).max(start);
        AudioWindow {
            full: &self.samples,
            crop: &self.samples[start..end],
        }
    }

    /// Drop all buffered samples
    pub fn reset(&mut self) {
        self.samples.clear();
    }

    fn truncate_front(&mut self) {
        if self.samples.len() > self.retention {
            let excess = self.samples.len() - self.retention;
            self.samples.drain(..excess);
        }
    }
}

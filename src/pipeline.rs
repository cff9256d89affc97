//! Per-chunk conversion cycle
//!
//! One cycle: append the chunk to the rolling buffer, gate on the volume of
//! the region about to be emitted, extract features, run the backend, then
//! crossfade the result against the tail of the previous cycle.

use crate::audio::{
    blend, compute_rms, from_pcm16, gate, to_pcm16, GateConfig, RollingAudioBuffer,
};
use crate::engine::{ConversionContext, VoiceBackend};
use crate::features::{extract_features, FeatureExtractor};
use crate::settings::{ConversionSettings, MAX_EXTRA_CONVERT_SIZE};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sample rate the DDSP family processes at
pub const SAMPLING_RATE: u32 = 44100;

/// Lifecycle of the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PipelineState {
    /// No backend loaded yet
    #[default]
    Idle,
    /// Buffer still shorter than its retention length
    Priming,
    Steady,
    /// Backend being replaced
    Reloading,
    /// Stream stopped and backend released
    Stopped,
}

/// Converted samples and volume carried from one cycle to the next
#[derive(Debug, Clone, Default)]
pub struct PreviousTail {
    samples: Vec<f32>,
    volume: f32,
}

impl PreviousTail {
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Keep the tail at `len` samples; a size change restarts from silence
    fn fit(&mut self, len: usize) {
        if self.samples.len() != len {
            self.samples = vec![0.0; len];
        }
    }

    fn silence(&mut self) {
        self.samples.iter_mut().for_each(|s| *s = 0.0);
    }
}

/// Buffer, carry-over state and backend of one stream
pub struct ConversionPipeline {
    backend: Box<dyn VoiceBackend>,
    extractor: Arc<dyn FeatureExtractor>,
    buffer: RollingAudioBuffer,
    tail: PreviousTail,
    gate_decay: f32,
}

impl ConversionPipeline {
    pub fn new(backend: Box<dyn VoiceBackend>, extractor: Arc<dyn FeatureExtractor>) -> Self {
        let hop_size = backend.geometry().hop_size;
        info!(
            "Pipeline for {} (hop {}, extractor {})",
            backend.name(),
            hop_size,
            extractor.name()
        );
        Self {
            backend,
            extractor,
            buffer: RollingAudioBuffer::new(hop_size),
            tail: PreviousTail::default(),
            gate_decay: GateConfig::default().decay,
        }
    }

    /// Let the gate hold open for a while after loud input: the previous
    /// volume is multiplied by `decay` before comparing
    pub fn with_gate_decay(mut self, decay: f32) -> Self {
        self.gate_decay = decay;
        self
    }

    pub fn state(&self) -> PipelineState {
        if self.buffer.is_primed() {
            PipelineState::Steady
        } else {
            PipelineState::Priming
        }
    }

    pub fn backend(&self) -> &dyn VoiceBackend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn VoiceBackend {
        self.backend.as_mut()
    }

    pub fn buffer(&self) -> &RollingAudioBuffer {
        &self.buffer
    }

    pub fn tail(&self) -> &PreviousTail {
        &self.tail
    }

    /// Drop buffered input and carry-over state
    pub fn reset(&mut self) {
        self.buffer.reset();
        self.tail = PreviousTail::default();
    }

    /// Release the backend
    pub fn shutdown(mut self) {
        self.reset();
        self.backend.unload();
    }

    /// Convert one chunk.
    ///
    /// Always returns exactly `input_size` samples. Silence, a missing model
    /// and conversion failures all come out as zeros.
    pub fn process(
        &mut self,
        raw: &[i16],
        input_size: usize,
        crossfade_size: usize,
        settings: &ConversionSettings,
    ) -> Vec<i16> {
        let crossfade_size = crossfade_size.min(input_size);
        let extra_size = settings.extra_convert_size.clamp(0, MAX_EXTRA_CONVERT_SIZE) as usize;
        let convert_size = self
            .buffer
            .set_geometry(input_size, crossfade_size, extra_size);
        self.buffer.append(raw);
        self.tail.fit(crossfade_size);
        // Only the last input + crossfade samples of a segment are kept
        let emitted = input_size + crossfade_size;

        let window = self.buffer.extract_window(input_size, crossfade_size);
        let volume = compute_rms(window.crop);
        let gate_config = GateConfig {
            threshold: settings.silent_threshold as f32,
            decay: self.gate_decay,
        };
        let decision = gate(volume, self.tail.volume, &gate_config);
        self.tail.volume = decision.smoothed_volume;

        let segment = if decision.pass {
            let geometry = self.backend.geometry();
            let converted = extract_features(
                self.extractor.as_ref(),
                window.full,
                &geometry,
                settings.tran,
                &settings.f0_detector,
            )
            .and_then(|features| {
                let context = ConversionContext {
                    window: window.full,
                    features,
                    geometry,
                    convert_size,
                    settings,
                };
                self.backend.infer(&context)
            });

            match converted {
                Ok(segment) => segment,
                Err(e) => {
                    warn!("Conversion failed, emitting silence: {}", e);
                    self.tail.silence();
                    vec![0; emitted]
                }
            }
        } else {
            self.tail.silence();
            vec![0; emitted]
        };

        debug!(
            "Cycle: {} in, window {}, volume {:.6}, segment {}",
            raw.len(),
            self.buffer.len(),
            volume,
            segment.len()
        );

        let aligned = right_align(&from_pcm16(&segment), emitted);
        let (head, rest) = aligned.split_at(input_size);
        let out = blend(&self.tail.samples, head, 0);
        self.tail.samples = rest.to_vec();
        to_pcm16(&out)
    }
}

/// Last `len` samples of `segment`, left-padded with zeros when shorter
fn right_align(segment: &[f32], len: usize) -> Vec<f32> {
    if segment.len() >= len {
        return segment[segment.len() - len..].to_vec();
    }
    let mut out = vec![0.0; len - segment.len()];
    out.extend_from_slice(segment);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::align_to_hop;
    use crate::engine::tests::EchoBackend;
    use crate::error::{AppError, Result};
    use crate::features::tests::FlatExtractor;
    use crate::features::FrameGeometry;
    use ndarray::Array2;
    use std::sync::atomic::Ordering;

    fn settings(extra: i64) -> ConversionSettings {
        ConversionSettings {
            extra_convert_size: extra,
            ..ConversionSettings::default()
        }
    }

    struct FailingExtractor;

    impl FeatureExtractor for FailingExtractor {
        fn name(&self) -> &str {
            "failing"
        }

        fn estimate_f0(&self, _: &[f32], _: &FrameGeometry, _: &str) -> Result<Vec<f32>> {
            Err(AppError::Inference("pitch model crashed".to_string()))
        }

        fn encode_units(&self, _: &[f32], _: &FrameGeometry) -> Result<Array2<f32>> {
            Err(AppError::Inference("unit model crashed".to_string()))
        }
    }

    #[test]
    fn test_silence_end_to_end() {
        let backend = EchoBackend::new(320, 1.0).loaded();
        let calls = backend.infer_calls.clone();
        let mut pipeline = ConversionPipeline::new(Box::new(backend), Arc::new(FlatExtractor::new(200.0)));

        let raw = vec![0i16; 3200];
        for _ in 0..5 {
            let out = pipeline.process(&raw, 3200, 320, &settings(1024));
            assert_eq!(out.len(), 3200);
            assert!(out.iter().all(|&s| s == 0));
            assert!(pipeline.buffer().len() <= pipeline.buffer().retention());
        }
        assert_eq!(pipeline.buffer().retention(), 4800);
        assert_eq!(pipeline.state(), PipelineState::Steady);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_gate_skips_extraction_and_inference() {
        let backend = EchoBackend::new(320, 1.0).loaded();
        let calls = backend.infer_calls.clone();
        let extractor = Arc::new(FlatExtractor::new(200.0));
        let mut pipeline = ConversionPipeline::new(Box::new(backend), extractor.clone());

        // Quiet but nonzero input stays under a high threshold
        let mut quiet = settings(0);
        quiet.silent_threshold = 0.5;
        let out = pipeline.process(&vec![100i16; 640], 640, 64, &quiet);

        assert!(out.iter().all(|&s| s == 0));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_constant_signal_is_continuous() {
        let backend = EchoBackend::new(320, 1.0).loaded();
        let mut pipeline = ConversionPipeline::new(Box::new(backend), Arc::new(FlatExtractor::new(200.0)));
        let raw = vec![16384i16; 3200];

        // First chunk fades in from the zero tail
        let first = pipeline.process(&raw, 3200, 320, &settings(1024));
        assert_eq!(first.len(), 3200);
        assert_eq!(first[0], 0);
        assert_eq!(first[3199], 16384);
        assert!(first.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(pipeline.state(), PipelineState::Priming);

        let second = pipeline.process(&raw, 3200, 320, &settings(1024));
        assert!(second.iter().all(|&s| s == 16384));
        assert_eq!(pipeline.state(), PipelineState::Steady);
        assert_eq!(pipeline.tail().samples().len(), 320);
    }

    #[test]
    fn test_oversized_extra_context_is_bounded() {
        let backend = EchoBackend::new(320, 1.0).loaded();
        let mut pipeline = ConversionPipeline::new(Box::new(backend), Arc::new(FlatExtractor::new(200.0)));

        // Struct fields bypass the settings schema; the cycle still clamps
        let out = pipeline.process(&vec![0i16; 3200], 3200, 320, &settings(i64::MAX));
        assert_eq!(out, vec![0; 3200]);
        assert_eq!(
            pipeline.buffer().retention(),
            align_to_hop(3200 + 320 + MAX_EXTRA_CONVERT_SIZE as usize, 320)
        );

        let out = pipeline.process(&vec![0i16; 3200], 3200, 320, &settings(-5));
        assert_eq!(out.len(), 3200);
        assert_eq!(pipeline.buffer().retention(), 3520);
    }

    #[test]
    fn test_unloaded_backend_yields_silence() {
        let backend = EchoBackend::new(320, 1.0);
        let mut pipeline = ConversionPipeline::new(Box::new(backend), Arc::new(FlatExtractor::new(200.0)));
        let out = pipeline.process(&vec![16384i16; 1024], 1024, 256, &settings(0));
        assert_eq!(out.len(), 1024);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_extraction_failure_yields_silence() {
        let backend = EchoBackend::new(320, 1.0).loaded();
        let calls = backend.infer_calls.clone();
        let mut pipeline = ConversionPipeline::new(Box::new(backend), Arc::new(FailingExtractor));
        let out = pipeline.process(&vec![16384i16; 1024], 1024, 256, &settings(0));
        assert_eq!(out, vec![0; 1024]);
        assert!(pipeline.tail().samples().iter().all(|&s| s == 0.0));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_crossfade_clamped_to_input() {
        let backend = EchoBackend::new(160, 1.0).loaded();
        let mut pipeline = ConversionPipeline::new(Box::new(backend), Arc::new(FlatExtractor::new(200.0)));
        let out = pipeline.process(&vec![1000i16; 320], 320, 4096, &settings(0));
        assert_eq!(out.len(), 320);
        assert_eq!(pipeline.tail().samples().len(), 320);
    }

    #[test]
    fn test_gate_decay_holds_after_loud_input() {
        let backend = EchoBackend::new(320, 1.0).loaded();
        let calls = backend.infer_calls.clone();
        let mut pipeline = ConversionPipeline::new(Box::new(backend), Arc::new(FlatExtractor::new(200.0)))
            .with_gate_decay(0.99);
        let mut loud = settings(0);
        loud.silent_threshold = 0.1;

        pipeline.process(&vec![16384i16; 640], 640, 64, &loud);
        pipeline.process(&vec![0i16; 640], 640, 64, &loud);
        // The retained window is all zeros by now; only the decayed volume
        // keeps the gate open
        pipeline.process(&vec![0i16; 640], 640, 64, &loud);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(pipeline.tail().volume() > 0.1);
    }

    #[test]
    fn test_reset_clears_state() {
        let backend = EchoBackend::new(320, 1.0).loaded();
        let mut pipeline = ConversionPipeline::new(Box::new(backend), Arc::new(FlatExtractor::new(200.0)));
        pipeline.process(&vec![16384i16; 640], 640, 64, &settings(0));
        pipeline.reset();
        assert!(pipeline.buffer().is_empty());
        assert!(pipeline.tail().samples().is_empty());
        assert_eq!(pipeline.state(), PipelineState::Priming);
    }

    #[test]
    fn test_right_align() {
        assert_eq!(right_align(&[1.0, 2.0, 3.0], 2), vec![2.0, 3.0]);
        assert_eq!(right_align(&[1.0], 3), vec![0.0, 0.0, 1.0]);
    }
}

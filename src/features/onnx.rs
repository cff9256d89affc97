//! ONNX Runtime feature extractor
//!
//! Wraps two exported models:
//! - a speech-unit encoder (HuBERT/ContentVec style): `[1, N]` 16kHz audio in,
//!   `[1, T, D]` unit embeddings out
//! - a pitch estimator (RMVPE/CREPE style): `[1, N]` 16kHz audio in, `[1, T]`
//!   f0 in Hz out (0 for unvoiced frames)
//!
//! Both run at 16kHz; results are mapped onto the model hop grid of the
//! processing rate by nearest-frame lookup.

use crate::audio::resample;
use crate::engine::session::{build_session, ExecutionProvider};
use crate::error::{AppError, Result};
use crate::features::{FeatureExtractor, FrameGeometry};
use ndarray::Array2;
use ort::session::{Session, SessionInputValue};
use ort::value::Tensor;
use parking_lot::Mutex;
use std::path::Path;
use tracing::{debug, info};

/// Sample rate expected by the encoder and pitch models
const ENCODER_SAMPLE_RATE: u32 = 16000;

pub struct OnnxFeatureExtractor {
    unit_session: Mutex<Session>,
    pitch_session: Mutex<Session>,
}

impl OnnxFeatureExtractor {
    /// Load both models on the CPU provider
    pub fn load(unit_model: &Path, pitch_model: &Path) -> Result<Self> {
        for path in [unit_model, pitch_model] {
            if !path.exists() {
                return Err(AppError::NotFound(format!(
                    "feature model not found: {}",
                    path.display()
                )));
            }
        }

        info!("Loading unit encoder from {:?}", unit_model);
        let unit_session = build_session(unit_model, &ExecutionProvider::Cpu)?;
        info!("Loading pitch estimator from {:?}", pitch_model);
        let pitch_session = build_session(pitch_model, &ExecutionProvider::Cpu)?;

        Ok(Self {
            unit_session: Mutex::new(unit_session),
            pitch_session: Mutex::new(pitch_session),
        })
    }

    fn run_single(session: &Mutex<Session>, audio: &[f32]) -> Result<(Vec<usize>, Vec<f32>)> {
        let mut session = session.lock();
        let input_name = session
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .ok_or_else(|| AppError::Inference("feature model has no inputs".to_string()))?;

        let tensor = Tensor::from_array(([1usize, audio.len()], audio.to_vec()))
            .map_err(|e| AppError::Inference(format!("Failed to create audio tensor: {}", e)))?;

        let outputs = session
            .run(vec![(input_name, SessionInputValue::from(tensor))])
            .map_err(|e| AppError::Inference(format!("Feature inference failed: {}", e)))?;
        if outputs.len() == 0 {
            return Err(AppError::Inference(
                "feature model returned no outputs".to_string(),
            ));
        }

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AppError::Inference(format!("Failed to extract output: {}", e)))?;
        let shape = shape.iter().map(|&d| d.max(0) as usize).collect();
        Ok((shape, data.to_vec()))
    }
}

impl FeatureExtractor for OnnxFeatureExtractor {
    fn name(&self) -> &str {
        "ONNX Runtime"
    }

    fn estimate_f0(
        &self,
        audio: &[f32],
        geometry: &FrameGeometry,
        detector: &str,
    ) -> Result<Vec<f32>> {
        let input = resample(audio, geometry.sample_rate, ENCODER_SAMPLE_RATE)?;
        let (_, raw) = Self::run_single(&self.pitch_session, &input)?;
        debug!("Pitch model ({}) produced {} frames", detector, raw.len());

        let f0 = interpolate_unvoiced(&raw);
        let frames = geometry.frames_for(audio.len());
        Ok(nearest_frames(&f0, frames))
    }

    fn encode_units(&self, audio: &[f32], geometry: &FrameGeometry) -> Result<Array2<f32>> {
        let input = resample(audio, geometry.sample_rate, ENCODER_SAMPLE_RATE)?;
        let (shape, data) = Self::run_single(&self.unit_session, &input)?;

        let (t, d) = match shape.as_slice() {
            [_, t, d] => (*t, *d),
            [t, d] => (*t, *d),
            other => {
                return Err(AppError::Inference(format!(
                    "unexpected unit encoder output shape {:?}",
                    other
                )))
            }
        };
        let units = Array2::from_shape_vec((t, d), data)
            .map_err(|e| AppError::Inference(format!("Failed to shape units: {}", e)))?;

        let frames = geometry.frames_for(audio.len());
        let mut out = Array2::zeros((frames, d));
        if t > 0 {
            for (i, mut row) in out.outer_iter_mut().enumerate() {
                let src = (i * t / frames).min(t - 1);
                row.assign(&units.row(src));
            }
        }
        Ok(out)
    }
}

/// Fill unvoiced (zero) frames by linear interpolation between voiced
/// neighbours; leading and trailing gaps take the nearest voiced value
pub fn interpolate_unvoiced(f0: &[f32]) -> Vec<f32> {
    let voiced: Vec<usize> = f0
        .iter()
        .enumerate()
        .filter(|(_, v)| **v > 0.0)
        .map(|(i, _)| i)
        .collect();
    let (Some(&first), Some(&last)) = (voiced.first(), voiced.last()) else {
        return f0.to_vec();
    };

    let mut out = f0.to_vec();
    for value in out.iter_mut().take(first) {
        *value = f0[first];
    }
    for value in out.iter_mut().skip(last + 1) {
        *value = f0[last];
    }
    for pair in voiced.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        for i in a + 1..b {
            let k = (i - a) as f32 / (b - a) as f32;
            out[i] = f0[a] + k * (f0[b] - f0[a]);
        }
    }
    out
}

/// Map a curve onto `frames` entries by nearest-frame lookup
fn nearest_frames(curve: &[f32], frames: usize) -> Vec<f32> {
    if curve.is_empty() {
        return vec![0.0; frames];
    }
    (0..frames)
        .map(|i| curve[(i * curve.len() / frames.max(1)).min(curve.len() - 1)])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_unvoiced() {
        let f0 = vec![0.0, 100.0, 0.0, 0.0, 200.0, 0.0];
        let out = interpolate_unvoiced(&f0);
        assert_eq!(out[0], 100.0);
        assert!((out[2] - 133.333).abs() < 1e-2);
        assert!((out[3] - 166.666).abs() < 1e-2);
        assert_eq!(out[5], 200.0);
    }

    #[test]
    fn test_interpolate_all_unvoiced_is_unchanged() {
        assert_eq!(interpolate_unvoiced(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_nearest_frames() {
        assert_eq!(nearest_frames(&[1.0, 2.0], 4), vec![1.0, 1.0, 2.0, 2.0]);
        assert_eq!(nearest_frames(&[], 3), vec![0.0; 3]);
    }

    #[test]
    fn test_missing_model_is_not_found() {
        let result = OnnxFeatureExtractor::load(
            Path::new("/nonexistent/units.onnx"),
            Path::new("/nonexistent/pitch.onnx"),
        );
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}

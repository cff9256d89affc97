//! ONNX Runtime backend for exported VITS-style voice conversion models
//!
//! The model is described by a JSON config:
//! - `data.sampling_rate`: processing and output sample rate
//! - `data.hop_length`: samples per model frame
//! - `spk`: speaker name to id table
//!
//! Inputs are bound by name, so exports that omit optional inputs (noise,
//! volume, predict_f0) load as well. The execution provider can be switched
//! while the model is loaded.

use crate::audio::to_pcm16;
use crate::engine::session::{build_session, f32_input, i64_input, row, ExecutionProvider};
use crate::engine::{read_config, BackendInfo, ConversionContext, ModelFiles, VoiceBackend};
use crate::error::{AppError, Result};
use crate::features::{align_frames, FrameGeometry, VOICED_THRESHOLD};
use crate::settings::{ConversionSettings, SettingValue, PROVIDER_KEY};
use ndarray::{Array1, Array2, Array3};
use ort::session::{Session, SessionInputValue};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Channel count of the latent noise input when the model does not declare it
const DEFAULT_NOISE_CHANNELS: usize = 192;

const NOISE_SEED: u64 = 0x2545_f491_4f6c_dd1d;

#[derive(Debug, Clone, Deserialize)]
struct OnnxModelConfig {
    data: OnnxDataConfig,
    #[serde(default)]
    spk: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct OnnxDataConfig {
    sampling_rate: u32,
    hop_length: usize,
}

impl OnnxModelConfig {
    fn from_file(path: &Path) -> Result<Self> {
        let config: OnnxModelConfig = serde_json::from_str(&read_config(path)?)?;
        if config.data.sampling_rate == 0 || config.data.hop_length == 0 {
            return Err(AppError::Config(format!(
                "{}: sampling_rate and hop_length must be positive",
                path.display()
            )));
        }
        Ok(config)
    }
}

/// Role of a declared model input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputKind {
    Units,
    F0,
    Voiced,
    FrameIndex,
    Noise,
    Speaker,
    PredictF0,
    Volume,
    Length,
}

fn classify_input(name: &str) -> Option<InputKind> {
    let name = name.to_ascii_lowercase();
    let kind = match name.as_str() {
        "c" | "units" | "phone" | "hubert" | "feats" => InputKind::Units,
        "f0" | "pitchf" => InputKind::F0,
        "uv" | "mask" => InputKind::Voiced,
        "mel2ph" => InputKind::FrameIndex,
        "noise" | "noise_scale" | "noice_scale" => InputKind::Noise,
        "sid" | "g" | "spk_id" => InputKind::Speaker,
        "predict_f0" => InputKind::PredictF0,
        "volume" | "vol" => InputKind::Volume,
        "length" | "lengths" | "c_lengths" => InputKind::Length,
        _ => return None,
    };
    Some(kind)
}

/// Loaded model state
struct LoadedOnnxModel {
    config: OnnxModelConfig,
    weights: PathBuf,
    session: Session,
    /// (name, kind, declared rank) for every model input
    inputs: Vec<(String, InputKind, usize)>,
}

/// ONNX Runtime voice conversion backend
pub struct OnnxBackend {
    model: Option<LoadedOnnxModel>,
    provider: ExecutionProvider,
    rng: StdRng,
}

impl OnnxBackend {
    pub fn new() -> Self {
        Self {
            model: None,
            provider: ExecutionProvider::Cpu,
            rng: StdRng::seed_from_u64(NOISE_SEED),
        }
    }

    /// Boxed constructor for the backend registry
    pub fn boxed() -> Box<dyn VoiceBackend> {
        Box::new(Self::new())
    }

    fn weights_for(files: &ModelFiles) -> Result<&Path> {
        files.secondary.as_deref().ok_or_else(|| {
            AppError::Config("the Onnx framework needs an ONNX model file".to_string())
        })
    }

    fn describe_inputs(session: &Session) -> Result<Vec<(String, InputKind, usize)>> {
        let mut inputs = Vec::new();
        for input in session.inputs() {
            let name = input.name().to_string();
            let rank = input.dtype().tensor_shape().map_or(1, |shape| shape.len());
            let kind = classify_input(&name).ok_or_else(|| {
                AppError::Inference(format!("unsupported model input '{}'", name))
            })?;
            debug!("Model input {} -> {:?} (rank {})", name, kind, rank);
            inputs.push((name, kind, rank));
        }
        Ok(inputs)
    }

    /// Rebuild the session on `provider`; on failure the current session
    /// stays in place
    fn reconfigure(&mut self, provider: ExecutionProvider) -> Result<()> {
        let Some(model) = self.model.as_mut() else {
            self.provider = provider;
            return Ok(());
        };
        if self.provider == provider {
            debug!("Provider {} already active", provider);
            return Ok(());
        }

        let session = build_session(&model.weights, &provider)
            .map_err(|e| AppError::Device(format!("Cannot switch to {}: {}", provider, e)))?;
        model.session = session;
        info!("Switched from {} to {}", self.provider, provider);
        self.provider = provider;
        Ok(())
    }

    /// Standard-normal latent noise scaled by `scale`
    fn noise(&mut self, len: usize, scale: f32) -> Vec<f32> {
        (0..len)
            .map(|_| self.rng.sample::<f32, _>(StandardNormal) * scale)
            .collect()
    }

    fn input_value(
        &mut self,
        kind: InputKind,
        rank: usize,
        context: &ConversionContext<'_>,
        frames: usize,
    ) -> Result<SessionInputValue<'static>> {
        let settings = context.settings;
        let features = &context.features;
        let value = match kind {
            InputKind::Units => {
                let dim = features.units.ncols();
                let mut units = Array3::<f32>::zeros((1, frames, dim));
                let rows = features.units.nrows();
                if rows > 0 {
                    for t in 0..frames {
                        units
                            .slice_mut(ndarray::s![0, t, ..])
                            .assign(&features.units.row(t.min(rows - 1)));
                    }
                }
                f32_input(units)?
            }
            InputKind::F0 => {
                let f0 = align_frames(&features.f0, frames);
                f32_input(row(f0)?)?
            }
            InputKind::Voiced => {
                let voiced: Vec<f32> = align_frames(&features.volume, frames)
                    .into_iter()
                    .map(|v| if v > VOICED_THRESHOLD { 1.0 } else { 0.0 })
                    .collect();
                f32_input(row(voiced)?)?
            }
            InputKind::Volume => {
                let volume = align_frames(&features.volume, frames);
                f32_input(row(volume)?)?
            }
            InputKind::FrameIndex => {
                let index: Vec<i64> = (1..=frames as i64).collect();
                let arr = Array2::from_shape_vec((1, frames), index)
                    .map_err(|e| AppError::Inference(format!("Failed to shape mel2ph: {}", e)))?;
                i64_input(arr)?
            }
            InputKind::Noise if rank >= 3 => {
                let noise = self.noise(DEFAULT_NOISE_CHANNELS * frames, settings.noise_scale as f32);
                let arr = Array3::from_shape_vec((1, DEFAULT_NOISE_CHANNELS, frames), noise)
                    .map_err(|e| AppError::Inference(format!("Failed to shape noise: {}", e)))?;
                f32_input(arr)?
            }
            InputKind::Noise => {
                f32_input(Array1::from_vec(vec![settings.noise_scale as f32]))?
            }
            InputKind::Speaker => {
                i64_input(Array1::from_vec(vec![settings.dst_id]))?
            }
            InputKind::PredictF0 => {
                i64_input(Array1::from_vec(vec![settings.predict_f0]))?
            }
            InputKind::Length => {
                i64_input(Array1::from_vec(vec![frames as i64]))?
            }
        };
        Ok(value)
    }
}

impl Default for OnnxBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VoiceBackend for OnnxBackend {
    fn name(&self) -> &str {
        "Onnx"
    }

    fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    fn validate(&self, files: &ModelFiles) -> Result<()> {
        OnnxModelConfig::from_file(&files.config)?;
        Self::weights_for(files)?;
        Ok(())
    }

    fn load(&mut self, files: &ModelFiles) -> Result<()> {
        let config = OnnxModelConfig::from_file(&files.config)?;
        let weights = Self::weights_for(files)?.to_path_buf();

        info!("Loading ONNX voice model from {:?}", weights);
        let session = build_session(&weights, &self.provider)?;
        let inputs = Self::describe_inputs(&session)?;

        info!(
            "ONNX voice model ready: {} Hz, hop {}, {} speakers, {} inputs",
            config.data.sampling_rate,
            config.data.hop_length,
            config.spk.len(),
            inputs.len()
        );
        self.model = Some(LoadedOnnxModel {
            config,
            weights,
            session,
            inputs,
        });
        Ok(())
    }

    fn geometry(&self) -> FrameGeometry {
        match &self.model {
            Some(model) => FrameGeometry {
                sample_rate: model.config.data.sampling_rate,
                hop_size: model.config.data.hop_length,
                block_size: model.config.data.hop_length,
            },
            None => FrameGeometry {
                sample_rate: crate::pipeline::SAMPLING_RATE,
                hop_size: 512,
                block_size: 512,
            },
        }
    }

    fn update_setting(
        &mut self,
        key: &str,
        value: &SettingValue,
        settings: &ConversionSettings,
    ) -> Result<bool> {
        let device_id = settings.gpu as i32;
        let provider = match key {
            PROVIDER_KEY => value.to_string().parse::<ExecutionProvider>()?.with_device(device_id),
            "gpu" if self.provider.is_gpu() => self.provider.with_device(device_id),
            _ => return Ok(false),
        };
        self.reconfigure(provider)?;
        Ok(true)
    }

    fn infer(&mut self, context: &ConversionContext<'_>) -> Result<Vec<i16>> {
        let Some(inputs) = self.model.as_ref().map(|m| m.inputs.clone()) else {
            warn!("ONNX voice model not loaded");
            return Ok(vec![0]);
        };
        let frames = context.features.frames();

        let mut input_map: Vec<(String, SessionInputValue<'static>)> = Vec::new();
        for (name, kind, rank) in inputs {
            let value = self.input_value(kind, rank, context, frames)?;
            input_map.push((name, value));
        }

        let Some(model) = self.model.as_mut() else {
            return Ok(vec![0]);
        };
        let outputs = model
            .session
            .run(input_map)
            .map_err(|e| AppError::Inference(format!("Voice model inference failed: {}", e)))?;
        if outputs.len() == 0 {
            return Err(AppError::Inference(
                "voice model returned no outputs".to_string(),
            ));
        }

        let (_, audio) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AppError::Inference(format!("Failed to extract audio output: {}", e)))?;
        debug!("Voice model produced {} samples for {} frames", audio.len(), frames);
        Ok(to_pcm16(audio))
    }

    fn describe(&self) -> BackendInfo {
        BackendInfo {
            name: self.name().to_string(),
            providers: if self.model.is_some() {
                self.provider.active_names()
            } else {
                Vec::new()
            },
            speakers: self
                .model
                .as_ref()
                .map(|m| m.config.spk.clone())
                .unwrap_or_default(),
            geometry: self.model.as_ref().map(|_| self.geometry()),
        }
    }

    fn unload(&mut self) {
        if self.model.take().is_some() {
            info!("ONNX voice model unloaded");
        }
    }
}

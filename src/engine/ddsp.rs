//! DDSP backend for differentiable-DSP singing voice models
//!
//! The model config is YAML with a `data` section (`block_size`,
//! `sampling_rate`, encoder parameters) and a `model` section (`n_spk`).
//! Input is processed at 44.1kHz; the hop at that rate is
//! `block_size * 44100 / sampling_rate`. The synthesised signal is gated by
//! the voice-activity mask and brought back to 44.1kHz.

use crate::audio::{resample, to_pcm16};
use crate::engine::session::{build_session, f32_input, i64_input, row, ExecutionProvider};
use crate::engine::{read_config, BackendInfo, ConversionContext, ModelFiles, VoiceBackend};
use crate::error::{AppError, Result};
use crate::features::{align_frames, FrameGeometry};
use crate::pipeline::SAMPLING_RATE;
use crate::settings::{ConversionSettings, SettingValue, PROVIDER_KEY};
use ndarray::{Array2, Array3};
use ort::session::{Session, SessionInputValue};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
struct DdspModelConfig {
    data: DdspDataConfig,
    #[serde(default)]
    model: DdspNetConfig,
}

#[derive(Debug, Clone, Deserialize)]
struct DdspDataConfig {
    block_size: usize,
    sampling_rate: u32,
    #[serde(default)]
    encoder: Option<String>,
    #[serde(default)]
    encoder_sample_rate: Option<u32>,
    #[serde(default)]
    encoder_hop_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct DdspNetConfig {
    #[serde(default = "default_n_spk")]
    n_spk: i64,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

fn default_n_spk() -> i64 {
    1
}

impl Default for DdspNetConfig {
    fn default() -> Self {
        Self {
            n_spk: default_n_spk(),
            kind: None,
        }
    }
}

impl DdspModelConfig {
    fn from_file(path: &Path) -> Result<Self> {
        let config: DdspModelConfig = serde_yaml::from_str(&read_config(path)?)?;
        if config.data.block_size == 0 || config.data.sampling_rate == 0 {
            return Err(AppError::Config(format!(
                "{}: block_size and sampling_rate must be positive",
                path.display()
            )));
        }
        if config.hop_size() == 0 {
            return Err(AppError::Config(format!(
                "{}: block_size {} is too small for {} Hz",
                path.display(),
                config.data.block_size,
                config.data.sampling_rate
            )));
        }
        Ok(config)
    }

    /// Input samples per frame at the processing rate
    fn hop_size(&self) -> usize {
        self.data.block_size * SAMPLING_RATE as usize / self.data.sampling_rate as usize
    }

    fn speakers(&self) -> BTreeMap<String, i64> {
        (1..=self.model.n_spk.max(1))
            .map(|id| (format!("speaker{}", id), id))
            .collect()
    }
}

/// Loaded model state
struct LoadedDdspModel {
    config: DdspModelConfig,
    session: Session,
    inputs: Vec<(String, usize)>,
}

/// DDSP voice conversion backend (CPU only)
pub struct DdspBackend {
    model: Option<LoadedDdspModel>,
}

impl DdspBackend {
    pub fn new() -> Self {
        Self { model: None }
    }

    pub fn boxed() -> Box<dyn VoiceBackend> {
        Box::new(Self::new())
    }

    fn weights_for(files: &ModelFiles) -> Result<&Path> {
        files
            .primary
            .as_deref()
            .or(files.secondary.as_deref())
            .ok_or_else(|| AppError::Config("the Ddsp framework needs a model file".to_string()))
    }

    /// Build the input for one declared model input. Frame curves go in as
    /// `[1, T, 1]` or `[1, T]` depending on the declared rank.
    fn input_value(
        name: &str,
        rank: usize,
        context: &ConversionContext<'_>,
        frames: usize,
        n_spk: i64,
    ) -> Result<SessionInputValue<'static>> {
        let curve = |values: Vec<f32>| -> Result<SessionInputValue<'static>> {
            if rank >= 3 {
                let arr = Array3::from_shape_vec((1, frames, 1), values)
                    .map_err(|e| AppError::Inference(format!("Failed to shape {}: {}", name, e)))?;
                f32_input(arr)
            } else {
                f32_input(row(values)?)
            }
        };

        match name.to_ascii_lowercase().as_str() {
            "units" | "hubert" => {
                let units = &context.features.units;
                let dim = units.ncols();
                let mut arr = Array3::<f32>::zeros((1, frames, dim));
                if units.nrows() > 0 {
                    for t in 0..frames {
                        arr.slice_mut(ndarray::s![0, t, ..])
                            .assign(&units.row(t.min(units.nrows() - 1)));
                    }
                }
                f32_input(arr)
            }
            "f0" => curve(align_frames(&context.features.f0, frames)),
            "volume" => curve(align_frames(&context.features.volume, frames)),
            "spk_id" | "sid" => {
                let spk_id = context.settings.dst_id.clamp(1, n_spk.max(1));
                let arr = Array2::from_shape_vec((1, 1), vec![spk_id])
                    .map_err(|e| AppError::Inference(format!("Failed to shape spk_id: {}", e)))?;
                i64_input(arr)
            }
            other => Err(AppError::Inference(format!(
                "unsupported DDSP model input '{}'",
                other
            ))),
        }
    }
}

impl Default for DdspBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Multiply `signal` by `mask`, extending the mask with its last value
pub(crate) fn apply_mask(signal: &mut [f32], mask: &[f32]) {
    let fill = mask.last().copied().unwrap_or(1.0);
    for (i, sample) in signal.iter_mut().enumerate() {
        *sample *= mask.get(i).copied().unwrap_or(fill);
    }
}

impl VoiceBackend for DdspBackend {
    fn name(&self) -> &str {
        "Ddsp"
    }

    fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    fn validate(&self, files: &ModelFiles) -> Result<()> {
        DdspModelConfig::from_file(&files.config)?;
        Self::weights_for(files)?;
        Ok(())
    }

    fn load(&mut self, files: &ModelFiles) -> Result<()> {
        let config = DdspModelConfig::from_file(&files.config)?;
        let weights = Self::weights_for(files)?;

        info!("Loading DDSP model from {:?}", weights);
        let session = build_session(weights, &ExecutionProvider::Cpu)?;
        let inputs = session
            .inputs()
            .iter()
            .map(|input| {
                let rank = input.dtype().tensor_shape().map_or(1, |shape| shape.len());
                (input.name().to_string(), rank)
            })
            .collect();

        info!(
            "DDSP model ready: {} with {} speakers, block {} at {} Hz, encoder {:?} at {:?} Hz / hop {:?}, hop {} at {} Hz",
            config.model.kind.as_deref().unwrap_or("unknown"),
            config.model.n_spk,
            config.data.block_size,
            config.data.sampling_rate,
            config.data.encoder,
            config.data.encoder_sample_rate,
            config.data.encoder_hop_size,
            config.hop_size(),
            SAMPLING_RATE
        );
        self.model = Some(LoadedDdspModel {
            config,
            session,
            inputs,
        });
        Ok(())
    }

    fn geometry(&self) -> FrameGeometry {
        match &self.model {
            Some(model) => FrameGeometry {
                sample_rate: SAMPLING_RATE,
                hop_size: model.config.hop_size(),
                block_size: model.config.data.block_size,
            },
            None => FrameGeometry {
                sample_rate: SAMPLING_RATE,
                hop_size: 512,
                block_size: 512,
            },
        }
    }

    fn update_setting(
        &mut self,
        key: &str,
        _value: &SettingValue,
        _settings: &ConversionSettings,
    ) -> Result<bool> {
        if key == PROVIDER_KEY && self.model.is_some() {
            return Err(AppError::Unsupported(
                "DDSP models run on the CPU provider only".to_string(),
            ));
        }
        Ok(false)
    }

    fn infer(&mut self, context: &ConversionContext<'_>) -> Result<Vec<i16>> {
        let Some(model) = self.model.as_mut() else {
            warn!("DDSP model not loaded");
            return Ok(vec![0]);
        };
        let frames = context.features.frames();
        let n_spk = model.config.model.n_spk;

        let mut input_map: Vec<(String, SessionInputValue<'static>)> = Vec::new();
        for (name, rank) in &model.inputs {
            let value = Self::input_value(name, *rank, context, frames, n_spk)?;
            input_map.push((name.clone(), value));
        }

        let outputs = model
            .session
            .run(input_map)
            .map_err(|e| AppError::Inference(format!("DDSP inference failed: {}", e)))?;
        if outputs.len() == 0 {
            return Err(AppError::Inference("DDSP model returned no outputs".to_string()));
        }
        let (_, signal) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AppError::Inference(format!("Failed to extract DDSP signal: {}", e)))?;

        let mut signal = signal.to_vec();
        apply_mask(&mut signal, &context.features.mask);

        let model_rate = model.config.data.sampling_rate;
        let signal = if model_rate != SAMPLING_RATE {
            resample(&signal, model_rate, SAMPLING_RATE)?
        } else {
            signal
        };
        debug!("DDSP produced {} samples for {} frames", signal.len(), frames);
        Ok(to_pcm16(&signal))
    }

    fn describe(&self) -> BackendInfo {
        BackendInfo {
            name: self.name().to_string(),
            providers: if self.model.is_some() {
                ExecutionProvider::Cpu.active_names()
            } else {
                Vec::new()
            },
            speakers: self
                .model
                .as_ref()
                .map(|m| m.config.speakers())
                .unwrap_or_default(),
            geometry: self.model.as_ref().map(|_| self.geometry()),
        }
    }

    fn unload(&mut self) {
        if self.model.take().is_some() {
            info!("DDSP model unloaded");
        }
    }
}

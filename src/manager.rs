//! Entry point for hosts: model loading, settings and chunk processing
//!
//! Chunks are processed one at a time under the pipeline lock, which model
//! reload and unload take as well. Settings sit behind their own lock so a
//! long inference never blocks setting updates or status reads; each cycle
//! works on a copy taken when it starts.

use crate::config::ManagerConfig;
use crate::engine::{BackendRegistry, ModelFiles};
use crate::error::{AppError, Result};
use crate::features::{FeatureExtractor, OnnxFeatureExtractor};
use crate::pipeline::{ConversionPipeline, PipelineState};
use crate::settings::{
    forwards_to_backend, RuntimeInfo, SettingValue, SettingsSnapshot, SettingsStore, PROVIDER_KEY,
};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct VoiceChangerManager {
    settings: RwLock<SettingsStore>,
    runtime: RwLock<RuntimeInfo>,
    pipeline: Mutex<Option<ConversionPipeline>>,
    /// Bumped by stop and reload; cycles started under an older value are
    /// discarded
    generation: AtomicU64,
    registry: BackendRegistry,
    extractor: Arc<dyn FeatureExtractor>,
    model_dir: Option<PathBuf>,
    gate_decay: f32,
}

impl VoiceChangerManager {
    pub fn new(registry: BackendRegistry, extractor: Arc<dyn FeatureExtractor>) -> Self {
        Self {
            settings: RwLock::new(SettingsStore::new()),
            runtime: RwLock::new(RuntimeInfo::default()),
            pipeline: Mutex::new(None),
            generation: AtomicU64::new(0),
            registry,
            extractor,
            model_dir: None,
            gate_decay: 0.0,
        }
    }

    /// Build a manager with the ONNX feature extractor and the built-in
    /// backend families, applying the configured initial settings
    pub fn from_config(config: &ManagerConfig) -> Result<Self> {
        let (Some(unit_model), Some(pitch_model)) =
            (config.unit_encoder_model.as_deref(), config.pitch_model.as_deref())
        else {
            return Err(AppError::Config(
                "unit_encoder_model and pitch_model must be configured".to_string(),
            ));
        };
        let extractor = OnnxFeatureExtractor::load(
            &config.model_path(unit_model),
            &config.model_path(pitch_model),
        )?;

        let mut manager = Self::new(BackendRegistry::with_builtins(), Arc::new(extractor));
        if let Some(dir) = &config.model_dir {
            manager = manager.with_model_dir(dir.clone());
        }
        if let Some(decay) = config.gate_decay {
            manager = manager.with_gate_decay(decay);
        }
        manager.settings.write().apply_all(&config.settings);
        Ok(manager)
    }

    /// Resolve relative model file names against `dir`
    pub fn with_model_dir(mut self, dir: PathBuf) -> Self {
        self.model_dir = Some(dir);
        self
    }

    pub fn with_gate_decay(mut self, decay: f32) -> Self {
        self.gate_decay = decay;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.runtime.read().state
    }

    fn set_state(&self, state: PipelineState) {
        let mut runtime = self.runtime.write();
        if runtime.state != state {
            debug!("Pipeline state {:?} -> {:?}", runtime.state, state);
            runtime.state = state;
        }
    }

    /// Load a model with the backend family named by the `framework` setting.
    ///
    /// File names of `"-"` or `""` are omitted. Files are resolved and the
    /// model config is checked before the current backend is touched, so those
    /// failures leave it running. Once the current backend has been released,
    /// a failure to acquire the new one leaves the manager idle.
    pub fn load_model(
        &self,
        config: &str,
        primary: Option<&str>,
        secondary: Option<&str>,
        aux: Option<&str>,
    ) -> Result<SettingsSnapshot> {
        let files = ModelFiles::resolve(self.model_dir.as_deref(), config, primary, secondary, aux)?;
        let framework = self.settings.read().current().framework.clone();
        let mut backend = self.registry.create(&framework)?;
        backend.validate(&files)?;

        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut slot = self.pipeline.lock();
        self.set_state(PipelineState::Reloading);

        if let Some(previous) = slot.take() {
            info!("Releasing {} backend", previous.backend().name());
            previous.shutdown();
        }

        if let Err(e) = backend.load(&files) {
            warn!("Failed to load {} model: {}", framework, e);
            self.settings.write().set_speakers(BTreeMap::new());
            *self.runtime.write() = RuntimeInfo::default();
            return Err(e);
        }

        let info = backend.describe();
        self.settings.write().set_speakers(info.speakers.clone());
        let pipeline =
            ConversionPipeline::new(backend, self.extractor.clone()).with_gate_decay(self.gate_decay);
        *self.runtime.write() = RuntimeInfo {
            state: pipeline.state(),
            backend: Some(info),
            files: Some(files),
            loaded_at: Some(Utc::now()),
        };
        *slot = Some(pipeline);
        drop(slot);

        info!("{} model loaded", framework);
        Ok(self.get_info())
    }

    /// Update one setting.
    ///
    /// Returns `Ok(false)` for unknown keys and values that do not coerce.
    /// `onnxExecutionProvider` and `gpu` are also applied to the loaded
    /// backend; if it cannot switch, the error is returned and the previous
    /// value is kept.
    pub fn update_setting(&self, key: &str, value: impl Into<SettingValue>) -> Result<bool> {
        let value = value.into();
        if !forwards_to_backend(key) {
            return Ok(self.settings.write().update(key, &value));
        }

        let mut slot = self.pipeline.lock();
        let previous = self.settings.read().get(key);
        let stored = self.settings.write().update(key, &value);
        if key != PROVIDER_KEY && !stored {
            return Ok(false);
        }
        let Some(pipeline) = slot.as_mut() else {
            if key == PROVIDER_KEY {
                warn!("No model loaded, ignoring {}", key);
            }
            return Ok(stored);
        };

        let settings = self.settings.read().current().clone();
        match pipeline.backend_mut().update_setting(key, &value, &settings) {
            Ok(applied) => {
                self.runtime.write().backend = Some(pipeline.backend().describe());
                Ok(stored || applied)
            }
            Err(e) => {
                if let Some(previous) = previous {
                    self.settings.write().update(key, &previous);
                }
                warn!("{} rejected {} = {}: {}", pipeline.backend().name(), key, value, e);
                Err(e)
            }
        }
    }

    /// Settings plus runtime info of the active backend
    pub fn get_info(&self) -> SettingsSnapshot {
        let settings = self.settings.read();
        let runtime = self.runtime.read();
        settings.snapshot(&runtime)
    }

    /// Convert one chunk of 16-bit input into `input_size` output samples.
    ///
    /// Without a loaded model the result is silence. A stop or reload that
    /// happens while the chunk waits or runs makes it return
    /// [`AppError::Cancelled`].
    pub fn process_chunk(
        &self,
        raw: &[i16],
        input_size: usize,
        crossfade_size: usize,
    ) -> Result<Vec<i16>> {
        let generation = self.generation.load(Ordering::SeqCst);
        let mut slot = self.pipeline.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Chunk cancelled while queued");
            return Err(AppError::Cancelled);
        }

        let Some(pipeline) = slot.as_mut() else {
            warn!("No model loaded ({:?}), emitting silence", self.state());
            return Ok(vec![0; input_size]);
        };

        let settings = self.settings.read().current().clone();
        let out = pipeline.process(raw, input_size, crossfade_size, &settings);

        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Chunk cancelled during conversion");
            return Err(AppError::Cancelled);
        }
        self.set_state(pipeline.state());
        Ok(out)
    }

    /// [`process_chunk`](Self::process_chunk) on a blocking worker thread
    pub async fn process_chunk_async(
        self: &Arc<Self>,
        raw: Vec<i16>,
        input_size: usize,
        crossfade_size: usize,
    ) -> Result<Vec<i16>> {
        let manager = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            manager.process_chunk(&raw, input_size, crossfade_size)
        })
        .await
        .map_err(|e| AppError::Inference(format!("Conversion worker failed: {}", e)))?
    }

    /// Release the backend; later chunks yield silence until the next load
    pub fn unload(&self) {
        self.release(PipelineState::Idle);
    }

    /// Cancel pending cycles, drop buffered audio and release the backend
    pub fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.release(PipelineState::Stopped);
    }

    fn release(&self, state: PipelineState) {
        let mut slot = self.pipeline.lock();
        if let Some(pipeline) = slot.take() {
            info!("Releasing {} backend", pipeline.backend().name());
            pipeline.shutdown();
        }
        self.settings.write().set_speakers(BTreeMap::new());
        *self.runtime.write() = RuntimeInfo {
            state,
            ..RuntimeInfo::default()
        };
    }
}

//! Manager configuration
//!
//! A TOML file where every field is optional, overlaid by `STREAMVC_*`
//! environment variables:
//!
//! ```toml
//! model_dir = "/srv/models"
//! unit_encoder_model = "units.onnx"
//! pitch_model = "rmvpe.onnx"
//! log_file = "streamvc.log"
//! gate_decay = 0.9
//!
//! [settings]
//! tran = 12
//! framework = "Ddsp"
//! ```

use crate::error::{AppError, Result};
use crate::settings::SettingValue;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

pub const ENV_MODEL_DIR: &str = "STREAMVC_MODEL_DIR";
pub const ENV_UNIT_ENCODER_MODEL: &str = "STREAMVC_UNIT_ENCODER_MODEL";
pub const ENV_PITCH_MODEL: &str = "STREAMVC_PITCH_MODEL";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManagerConfig {
    /// Directory that relative model file names resolve against
    #[serde(default)]
    pub model_dir: Option<PathBuf>,

    /// Speech-unit encoder used for feature extraction
    #[serde(default)]
    pub unit_encoder_model: Option<PathBuf>,

    /// Pitch estimator used for feature extraction
    #[serde(default)]
    pub pitch_model: Option<PathBuf>,

    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Per-cycle decay of the silence gate's carried volume (0 disables)
    #[serde(default)]
    pub gate_decay: Option<f32>,

    /// Initial setting values, applied through the regular update path
    #[serde(default)]
    pub settings: BTreeMap<String, SettingValue>,
}

impl ManagerConfig {
    /// Read `path` (when given) and apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    AppError::Config(format!("Failed to read {}: {}", path.display(), e))
                })?;
                let config = Self::from_toml_str(&content)?;
                info!("Loaded config from {}", path.display());
                config
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Override fields from environment variables looked up through `var`
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = |name: &str| var(name).filter(|v| !v.trim().is_empty()).map(PathBuf::from);
        if let Some(dir) = path(ENV_MODEL_DIR) {
            self.model_dir = Some(dir);
        }
        if let Some(model) = path(ENV_UNIT_ENCODER_MODEL) {
            self.unit_encoder_model = Some(model);
        }
        if let Some(model) = path(ENV_PITCH_MODEL) {
            self.pitch_model = Some(model);
        }
    }

    /// Resolve a configured model path against `model_dir`
    pub fn model_path(&self, path: &Path) -> PathBuf {
        match &self.model_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }
}

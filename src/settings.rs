//! Conversion settings and their update schema
//!
//! Settings are partitioned by kind (integer, float, string). Every mutable
//! field is listed once in a static schema table; updates look the key up
//! there and coerce the incoming value to the field's kind.

use crate::engine::{BackendInfo, ModelFiles};
use crate::pipeline::PipelineState;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

/// Setting that selects the backend's execution provider. It is forwarded to
/// the backend instead of being stored.
pub const PROVIDER_KEY: &str = "onnxExecutionProvider";

/// Keys whose updates are also offered to the active backend
pub fn forwards_to_backend(key: &str) -> bool {
    key == PROVIDER_KEY || key == "gpu"
}

/// Largest accepted `extraConvertSize`, about 24 seconds at 44.1kHz
pub const MAX_EXTRA_CONVERT_SIZE: i64 = 1 << 20;

/// A setting value as received from a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Int,
    Float,
    Str,
}

impl SettingValue {
    /// Convert to `kind`, or `None` when the value cannot be represented.
    ///
    /// Integers accept floats (truncated toward zero) and numeric strings;
    /// floats accept integers and numeric strings; strings accept anything.
    pub fn coerce(&self, kind: SettingKind) -> Option<SettingValue> {
        match (kind, self) {
            (SettingKind::Int, SettingValue::Int(v)) => Some(SettingValue::Int(*v)),
            (SettingKind::Int, SettingValue::Float(v)) if v.is_finite() => {
                Some(SettingValue::Int(v.trunc() as i64))
            }
            (SettingKind::Int, SettingValue::Str(s)) => {
                s.trim().parse::<i64>().ok().map(SettingValue::Int)
            }
            (SettingKind::Float, SettingValue::Int(v)) => Some(SettingValue::Float(*v as f64)),
            (SettingKind::Float, SettingValue::Float(v)) if v.is_finite() => {
                Some(SettingValue::Float(*v))
            }
            (SettingKind::Float, SettingValue::Str(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(SettingValue::Float),
            (SettingKind::Str, value) => Some(SettingValue::Str(value.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Int(v) => write!(f, "{}", v),
            SettingValue::Float(v) => write!(f, "{}", v),
            SettingValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for SettingValue {
    fn from(v: i64) -> Self {
        SettingValue::Int(v)
    }
}

impl From<i32> for SettingValue {
    fn from(v: i32) -> Self {
        SettingValue::Int(v as i64)
    }
}

impl From<f64> for SettingValue {
    fn from(v: f64) -> Self {
        SettingValue::Float(v)
    }
}

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        SettingValue::Str(v.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(v: String) -> Self {
        SettingValue::Str(v)
    }
}

/// Tunable conversion parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionSettings {
    /// GPU device index
    pub gpu: i64,
    /// Target speaker id
    pub dst_id: i64,
    /// Pitch shift in semitones
    pub tran: i64,
    pub predict_f0: i64,
    /// Extra context samples kept in front of each window
    pub extra_convert_size: i64,

    pub noise_scale: f64,
    /// RMS below which a chunk is treated as silence
    pub silent_threshold: f64,
    pub cluster_infer_ratio: f64,

    /// Backend family used by the next load
    pub framework: String,
    /// Pitch detector algorithm
    pub f0_detector: String,

    /// Speaker table of the loaded model
    pub speakers: BTreeMap<String, i64>,
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            gpu: 0,
            dst_id: 0,
            tran: 20,
            predict_f0: 0,
            extra_convert_size: 1024 * 32,
            noise_scale: 0.3,
            silent_threshold: 0.00001,
            cluster_infer_ratio: 0.1,
            framework: "Onnx".to_string(),
            f0_detector: "dio".to_string(),
            speakers: BTreeMap::new(),
        }
    }
}

struct SettingField {
    name: &'static str,
    kind: SettingKind,
    get: fn(&ConversionSettings) -> SettingValue,
    set: fn(&mut ConversionSettings, &SettingValue),
    /// Accepts the coerced value
    valid: fn(&SettingValue) -> bool,
}

fn any_value(_: &SettingValue) -> bool {
    true
}

macro_rules! field {
    ($name:literal, Int, $field:ident, $range:expr) => {
        SettingField {
            valid: |v| matches!(v, SettingValue::Int(x) if ($range).contains(x)),
            ..field!($name, Int, $field)
        }
    };
    ($name:literal, Int, $field:ident) => {
        SettingField {
            name: $name,
            kind: SettingKind::Int,
            get: |s| SettingValue::Int(s.$field),
            set: |s, v| {
                if let SettingValue::Int(x) = v {
                    s.$field = *x;
                }
            },
            valid: any_value,
        }
    };
    ($name:literal, Float, $field:ident) => {
        SettingField {
            name: $name,
            kind: SettingKind::Float,
            get: |s| SettingValue::Float(s.$field),
            set: |s, v| {
                if let SettingValue::Float(x) = v {
                    s.$field = *x;
                }
            },
            valid: any_value,
        }
    };
    ($name:literal, Str, $field:ident) => {
        SettingField {
            name: $name,
            kind: SettingKind::Str,
            get: |s| SettingValue::Str(s.$field.clone()),
            set: |s, v| {
                if let SettingValue::Str(x) = v {
                    s.$field = x.clone();
                }
            },
            valid: any_value,
        }
    };
}

static FIELDS: &[SettingField] = &[
    field!("gpu", Int, gpu),
    field!("dstId", Int, dst_id),
    field!("tran", Int, tran),
    field!("predictF0", Int, predict_f0),
    field!("extraConvertSize", Int, extra_convert_size, 0..=MAX_EXTRA_CONVERT_SIZE),
    field!("noiseScale", Float, noise_scale),
    // Spelling used by older clients
    field!("noiceScale", Float, noise_scale),
    field!("silentThreshold", Float, silent_threshold),
    field!("clusterInferRatio", Float, cluster_infer_ratio),
    field!("framework", Str, framework),
    field!("f0Detector", Str, f0_detector),
];

static FIELD_INDEX: Lazy<HashMap<&'static str, &'static SettingField>> =
    Lazy::new(|| FIELDS.iter().map(|field| (field.name, field)).collect());

/// Owner of the current settings
#[derive(Debug, Clone, Default)]
pub struct SettingsStore {
    settings: ConversionSettings,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &ConversionSettings {
        &self.settings
    }

    /// Kind of a schema field, `None` for keys outside the schema
    pub fn kind_of(key: &str) -> Option<SettingKind> {
        FIELD_INDEX.get(key).map(|field| field.kind)
    }

    pub fn get(&self, key: &str) -> Option<SettingValue> {
        FIELD_INDEX.get(key).map(|field| (field.get)(&self.settings))
    }

    /// Set `key` to `value`.
    ///
    /// Returns `false`, leaving the settings unchanged, when the key is not
    /// part of the schema or the value does not coerce to the field's kind.
    pub fn update(&mut self, key: &str, value: &SettingValue) -> bool {
        let Some(field) = FIELD_INDEX.get(key) else {
            warn!("Unknown setting: {}", key);
            return false;
        };
        let Some(coerced) = value.coerce(field.kind) else {
            warn!("Cannot use {:?} for {} ({:?})", value, key, field.kind);
            return false;
        };
        if !(field.valid)(&coerced) {
            warn!("Value {} out of range for {}", coerced, key);
            return false;
        }

        (field.set)(&mut self.settings, &coerced);
        debug!("Setting {} = {}", key, coerced);
        true
    }

    /// Apply a batch of initial values, skipping rejected ones
    pub fn apply_all<'a, I>(&mut self, values: I) -> usize
    where
        I: IntoIterator<Item = (&'a String, &'a SettingValue)>,
    {
        let mut applied = 0;
        for (key, value) in values {
            if self.update(key, value) {
                applied += 1;
            }
        }
        info!("Applied {} initial settings", applied);
        applied
    }

    pub fn set_speakers(&mut self, speakers: BTreeMap<String, i64>) {
        self.settings.speakers = speakers;
    }

    /// Settings plus runtime info of the active backend
    pub fn snapshot(&self, runtime: &RuntimeInfo) -> SettingsSnapshot {
        let files = runtime.files.as_ref();
        let geometry = runtime.backend.as_ref().and_then(|b| b.geometry);

        SettingsSnapshot {
            settings: self.settings.clone(),
            onnx_execution_providers: runtime
                .backend
                .as_ref()
                .map(|b| b.providers.clone())
                .unwrap_or_default(),
            config_file: file_name(files.map(|f| f.config.as_path())),
            model_file: file_name(files.and_then(|f| f.primary.as_deref())),
            onnx_model_file: file_name(files.and_then(|f| f.secondary.as_deref())),
            cluster_model_file: file_name(files.and_then(|f| f.aux.as_deref())),
            backend: runtime.backend.as_ref().map(|b| b.name.clone()),
            state: runtime.state,
            hop_size: geometry.map(|g| g.hop_size),
            sampling_rate: geometry.map(|g| g.sample_rate),
            loaded_at: runtime.loaded_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// File name without directories; `""` when the file no longer exists
pub fn basename(path: &Path) -> String {
    if !path.exists() {
        return String::new();
    }
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_name(path: Option<&Path>) -> String {
    path.map(basename).unwrap_or_default()
}

/// Backend-side facts merged into snapshots
#[derive(Debug, Clone, Default)]
pub struct RuntimeInfo {
    pub state: PipelineState,
    pub backend: Option<BackendInfo>,
    pub files: Option<ModelFiles>,
    pub loaded_at: Option<DateTime<Utc>>,
}

/// Serializable view of settings and runtime state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsSnapshot {
    #[serde(flatten)]
    pub settings: ConversionSettings,
    pub onnx_execution_providers: Vec<String>,
    pub config_file: String,
    pub model_file: String,
    pub onnx_model_file: String,
    pub cluster_model_file: String,
    pub backend: Option<String>,
    pub state: PipelineState,
    pub hop_size: Option<usize>,
    pub sampling_rate: Option<u32>,
    pub loaded_at: Option<String>,
}

pub mod ddsp;
pub mod onnxruntime;
pub mod registry;
pub mod session;

use crate::error::{AppError, Result};
use crate::features::{Features, FrameGeometry};
use crate::settings::{ConversionSettings, SettingValue};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

pub use ddsp::DdspBackend;
pub use onnxruntime::OnnxBackend;
pub use registry::BackendRegistry;
pub use session::ExecutionProvider;

/// File name meaning "no file" in load requests
pub const OMITTED_FILE: &str = "-";

/// Files making up one model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    /// Model configuration (hyper-parameters, speaker table)
    pub config: PathBuf,
    /// Main weights
    pub primary: Option<PathBuf>,
    /// Alternate export of the weights (ONNX)
    pub secondary: Option<PathBuf>,
    /// Auxiliary weights (e.g. cluster model)
    pub aux: Option<PathBuf>,
}

impl ModelFiles {
    /// Resolve file names from a load request.
    ///
    /// `"-"` and empty names mean "omitted". Relative names are looked up in
    /// `base_dir` when one is given. Every named file must exist.
    pub fn resolve(
        base_dir: Option<&Path>,
        config: &str,
        primary: Option<&str>,
        secondary: Option<&str>,
        aux: Option<&str>,
    ) -> Result<Self> {
        let config = resolve_file(base_dir, Some(config))?
            .ok_or_else(|| AppError::Config("model config file is required".to_string()))?;
        Ok(Self {
            config,
            primary: resolve_file(base_dir, primary)?,
            secondary: resolve_file(base_dir, secondary)?,
            aux: resolve_file(base_dir, aux)?,
        })
    }
}

fn resolve_file(base_dir: Option<&Path>, name: Option<&str>) -> Result<Option<PathBuf>> {
    let name = match name.map(str::trim) {
        None | Some("") | Some(OMITTED_FILE) => return Ok(None),
        Some(name) => name,
    };
    let path = match base_dir {
        Some(dir) if Path::new(name).is_relative() => dir.join(name),
        _ => PathBuf::from(name),
    };
    if !path.is_file() {
        return Err(AppError::NotFound(format!("File not found: {}", path.display())));
    }
    Ok(Some(path))
}

/// Everything a backend sees for one cycle
#[derive(Debug)]
pub struct ConversionContext<'a> {
    /// Full retained input window at the processing rate
    pub window: &'a [f32],
    pub features: Features,
    pub geometry: FrameGeometry,
    /// Expected length of the converted segment
    pub convert_size: usize,
    /// Settings snapshot taken at the start of the cycle
    pub settings: &'a ConversionSettings,
}

/// Runtime facts a backend reports about itself
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendInfo {
    pub name: String,
    /// Active execution providers, highest priority first
    pub providers: Vec<String>,
    /// Speaker name -> id table from the model config
    pub speakers: BTreeMap<String, i64>,
    pub geometry: Option<FrameGeometry>,
}

/// A conversion-model family
///
/// The pipeline drives every family through this interface and never
/// branches on the concrete type.
pub trait VoiceBackend: Send {
    /// Get the backend name for logging
    fn name(&self) -> &str;

    /// Check if weights are loaded and ready
    fn is_loaded(&self) -> bool;

    /// Check that `files` are usable by this family without acquiring any
    /// resources (config parsing, required files present)
    fn validate(&self, files: &ModelFiles) -> Result<()>;

    /// Acquire the model
    fn load(&mut self, files: &ModelFiles) -> Result<()>;

    /// Frame layout of the loaded model
    fn geometry(&self) -> FrameGeometry;

    /// React to a setting change. Returns `Ok(true)` when the backend acted
    /// on the key, `Ok(false)` when the key does not concern it.
    fn update_setting(
        &mut self,
        key: &str,
        value: &SettingValue,
        settings: &ConversionSettings,
    ) -> Result<bool> {
        let _ = (value, settings);
        debug!("{} ignores setting {}", self.name(), key);
        Ok(false)
    }

    /// Convert one window into a 16-bit segment.
    ///
    /// Without a loaded model this returns a single zero sample.
    fn infer(&mut self, context: &ConversionContext<'_>) -> Result<Vec<i16>>;

    /// Runtime info for status reporting
    fn describe(&self) -> BackendInfo;

    /// Release the model
    fn unload(&mut self);
}

/// Read a model config file to a string
pub(crate) fn read_config(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        AppError::Config(format!("Failed to read model config {}: {}", path.display(), e))
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::to_pcm16;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempPath;

    /// File removed when the returned path is dropped
    pub(crate) fn temp_file(name: &str, contents: &str) -> TempPath {
        let mut file = tempfile::Builder::new()
            .prefix("streamvc-")
            .suffix(&format!("-{}", name))
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.into_temp_path()
    }

    /// Backend that echoes the input window with a fixed gain
    pub(crate) struct EchoBackend {
        pub hop_size: usize,
        pub gain: f32,
        pub loaded: bool,
        pub infer_calls: Arc<AtomicUsize>,
        pub unload_calls: Arc<AtomicUsize>,
        pub live_provider: bool,
        pub provider: ExecutionProvider,
        /// Time each inference takes
        pub delay: Duration,
        /// Make `load` fail after validation passed
        pub fail_load: bool,
    }

    impl EchoBackend {
        pub fn new(hop_size: usize, gain: f32) -> Self {
            Self {
                hop_size,
                gain,
                loaded: false,
                infer_calls: Arc::new(AtomicUsize::new(0)),
                unload_calls: Arc::new(AtomicUsize::new(0)),
                live_provider: false,
                provider: ExecutionProvider::Cpu,
                delay: Duration::ZERO,
                fail_load: false,
            }
        }

        pub fn loaded(mut self) -> Self {
            self.loaded = true;
            self
        }
    }

    impl VoiceBackend for EchoBackend {
        fn name(&self) -> &str {
            "echo"
        }

        fn is_loaded(&self) -> bool {
            self.loaded
        }

        fn validate(&self, files: &ModelFiles) -> Result<()> {
            let text = read_config(&files.config)?;
            if text.contains("invalid") {
                return Err(AppError::Config("invalid echo config".to_string()));
            }
            Ok(())
        }

        fn load(&mut self, _files: &ModelFiles) -> Result<()> {
            if self.fail_load {
                return Err(AppError::Inference("echo weights rejected".to_string()));
            }
            self.loaded = true;
            Ok(())
        }

        fn geometry(&self) -> FrameGeometry {
            FrameGeometry {
                sample_rate: 16000,
                hop_size: self.hop_size,
                block_size: self.hop_size,
            }
        }

        fn update_setting(
            &mut self,
            key: &str,
            value: &SettingValue,
            settings: &ConversionSettings,
        ) -> Result<bool> {
            if !self.live_provider {
                return Err(AppError::Unsupported(format!("{} cannot change {}", self.name(), key)));
            }
            let provider = match key {
                crate::settings::PROVIDER_KEY => value
                    .to_string()
                    .parse::<ExecutionProvider>()?
                    .with_device(settings.gpu as i32),
                "gpu" => self.provider.with_device(settings.gpu as i32),
                _ => return Ok(false),
            };
            if let ExecutionProvider::Cuda { device_id } = provider {
                if device_id > 0 {
                    return Err(AppError::Device(format!("no CUDA device {}", device_id)));
                }
            }
            self.provider = provider;
            Ok(true)
        }

        fn infer(&mut self, context: &ConversionContext<'_>) -> Result<Vec<i16>> {
            if !self.loaded {
                return Ok(vec![0]);
            }
            self.infer_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            let scaled: Vec<f32> = context.window.iter().map(|s| s * self.gain).collect();
            Ok(to_pcm16(&scaled))
        }

        fn describe(&self) -> BackendInfo {
            BackendInfo {
                name: self.name().to_string(),
                providers: self.provider.active_names(),
                speakers: BTreeMap::from([("echo".to_string(), 0)]),
                geometry: Some(self.geometry()),
            }
        }

        fn unload(&mut self) {
            self.loaded = false;
            self.unload_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_resolve_omitted_files() {
        let config = temp_file("config.json", "{}");
        let files = ModelFiles::resolve(
            None,
            config.to_str().unwrap(),
            Some("-"),
            None,
            Some(""),
        )
        .unwrap();
        assert_eq!(files.config, config.to_path_buf());
        assert!(files.primary.is_none());
        assert!(files.secondary.is_none());
        assert!(files.aux.is_none());
    }

    #[test]
    fn test_resolve_relative_to_base_dir() {
        let config = temp_file("config.yaml", "data: {}");
        let dir = config.parent().unwrap();
        let name = config.file_name().unwrap().to_str().unwrap();
        let files = ModelFiles::resolve(Some(dir), name, None, None, None).unwrap();
        assert_eq!(files.config, config.to_path_buf());
    }

    #[test]
    fn test_resolve_missing_file() {
        let config = temp_file("config.json", "{}");
        let result = ModelFiles::resolve(
            None,
            config.to_str().unwrap(),
            Some("/nonexistent/model.onnx"),
            None,
            None,
        );
        assert!(matches!(result, Err(AppError::NotFound(_))));

        let result = ModelFiles::resolve(None, "-", None, None, None);
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}

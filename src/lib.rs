pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod features;
pub mod manager;
pub mod pipeline;
pub mod settings;

pub use config::ManagerConfig;
pub use engine::{BackendRegistry, ExecutionProvider, ModelFiles, VoiceBackend};
pub use error::{AppError, Result};
pub use features::{FeatureExtractor, OnnxFeatureExtractor};
pub use manager::VoiceChangerManager;
pub use pipeline::{ConversionPipeline, PipelineState};
pub use settings::{ConversionSettings, SettingValue, SettingsSnapshot};

use std::fs::File;
use std::path::Path;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default log filter when `RUST_LOG` is not set
const DEFAULT_LOG_DIRECTIVE: &str = "streamvc=debug";

/// Initialize logging to the console and, when `log_file` is given, to that
/// file as well
pub fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = File::create(path).map_err(|e| {
                AppError::Config(format!("Failed to create log file {}: {}", path.display(), e))
            })?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVE));

    tracing_subscriber::registry()
        .with(fmt::layer()) // Console output
        .with(file_layer) // File output
        .with(filter)
        .try_init()
        .map_err(|e| AppError::Config(format!("Failed to initialize logging: {}", e)))
}

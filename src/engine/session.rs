//! ONNX Runtime session construction shared by the backends and the feature
//! extractor

use crate::error::{AppError, Result};
use ndarray::{Array, Array2, Dimension};
use ort::ep::{self, ExecutionProviderDispatch};
use ort::session::{builder::GraphOptimizationLevel, Session, SessionInputValue};
use ort::value::Tensor;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Execution provider an ONNX session runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionProvider {
    #[default]
    Cpu,
    Cuda { device_id: i32 },
    DirectMl { device_id: i32 },
    OpenVino,
}

impl ExecutionProvider {
    /// Provider name as ONNX Runtime reports it
    pub fn ort_name(&self) -> &'static str {
        match self {
            ExecutionProvider::Cpu => "CPUExecutionProvider",
            ExecutionProvider::Cuda { .. } => "CUDAExecutionProvider",
            ExecutionProvider::DirectMl { .. } => "DmlExecutionProvider",
            ExecutionProvider::OpenVino => "OpenVINOExecutionProvider",
        }
    }

    /// Same provider family on another device, where the family has devices
    pub fn with_device(self, device_id: i32) -> Self {
        match self {
            ExecutionProvider::Cuda { .. } => ExecutionProvider::Cuda { device_id },
            ExecutionProvider::DirectMl { .. } => ExecutionProvider::DirectMl { device_id },
            other => other,
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(
            self,
            ExecutionProvider::Cuda { .. } | ExecutionProvider::DirectMl { .. }
        )
    }

    /// Providers registered on a session, in priority order. Accelerated
    /// providers fail hard instead of silently falling back to the CPU.
    fn dispatch(&self) -> Vec<ExecutionProviderDispatch> {
        match self {
            ExecutionProvider::Cpu => vec![ep::CPU::default().build()],
            ExecutionProvider::Cuda { device_id } => vec![ep::CUDA::default()
                .with_device_id(*device_id)
                .build()
                .error_on_failure()],
            ExecutionProvider::DirectMl { device_id } => vec![ep::DirectML::default()
                .with_device_id(*device_id)
                .build()
                .error_on_failure()],
            ExecutionProvider::OpenVino => vec![ep::OpenVINO::default()
                .build()
                .error_on_failure()],
        }
    }

    /// Providers a session on this provider reports as active
    pub fn active_names(&self) -> Vec<String> {
        match self {
            ExecutionProvider::Cpu => vec![self.ort_name().to_string()],
            other => vec![
                other.ort_name().to_string(),
                ExecutionProvider::Cpu.ort_name().to_string(),
            ],
        }
    }
}

impl fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionProvider::Cuda { device_id } | ExecutionProvider::DirectMl { device_id } => {
                write!(f, "{} (device {})", self.ort_name(), device_id)
            }
            other => f.write_str(other.ort_name()),
        }
    }
}

impl FromStr for ExecutionProvider {
    type Err = AppError;

    /// Parse an ONNX Runtime provider name or its short alias (`cpu`,
    /// `cuda`, `directml`/`dml`, `openvino`); device ids default to 0
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpuexecutionprovider" | "cpu" => Ok(ExecutionProvider::Cpu),
            "cudaexecutionprovider" | "cuda" => Ok(ExecutionProvider::Cuda { device_id: 0 }),
            "dmlexecutionprovider" | "directml" | "dml" => {
                Ok(ExecutionProvider::DirectMl { device_id: 0 })
            }
            "openvinoexecutionprovider" | "openvino" => Ok(ExecutionProvider::OpenVino),
            _ => Err(AppError::Config(format!(
                "unknown execution provider: {}",
                s.trim()
            ))),
        }
    }
}

/// Build a session for `model_path` on `provider`
pub fn build_session(model_path: &Path, provider: &ExecutionProvider) -> Result<Session> {
    // Initialize ONNX Runtime (commit() returns bool in ort 2.0)
    let _ = ort::init().with_name("streamvc").commit();

    let session = Session::builder()
        .map_err(|e| AppError::Inference(format!("Failed to create session builder: {}", e)))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| AppError::Inference(format!("Failed to set optimization level: {}", e)))?
        .with_execution_providers(provider.dispatch())
        .map_err(|e| AppError::Device(format!("Failed to register {}: {}", provider, e)))?
        .commit_from_file(model_path)
        .map_err(|e| {
            AppError::Inference(format!(
                "Failed to load model {}: {}",
                model_path.display(),
                e
            ))
        })?;

    info!("Loaded {:?} on {}", model_path, provider);
    Ok(session)
}

/// Shape a curve as a `[1, T]` model input
pub(crate) fn row(values: Vec<f32>) -> Result<Array2<f32>> {
    let len = values.len();
    Array2::from_shape_vec((1, len), values)
        .map_err(|e| AppError::Inference(format!("Failed to shape [1, {}] input: {}", len, e)))
}

pub(crate) fn f32_input<D: Dimension + 'static>(
    array: Array<f32, D>,
) -> Result<SessionInputValue<'static>> {
    let tensor = Tensor::from_array(array)
        .map_err(|e| AppError::Inference(format!("Failed to create f32 input: {}", e)))?;
    Ok(SessionInputValue::from(tensor))
}

pub(crate) fn i64_input<D: Dimension + 'static>(
    array: Array<i64, D>,
) -> Result<SessionInputValue<'static>> {
    let tensor = Tensor::from_array(array)
        .map_err(|e| AppError::Inference(format!("Failed to create i64 input: {}", e)))?;
    Ok(SessionInputValue::from(tensor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_provider_names() {
        assert_eq!(
            "CUDAExecutionProvider".parse::<ExecutionProvider>().unwrap(),
            ExecutionProvider::Cuda { device_id: 0 }
        );
        assert_eq!(
            "CPUExecutionProvider".parse::<ExecutionProvider>().unwrap(),
            ExecutionProvider::Cpu
        );
        assert!("TPUExecutionProvider".parse::<ExecutionProvider>().is_err());
    }

    #[test]
    fn test_parse_short_aliases() {
        assert_eq!("cpu".parse::<ExecutionProvider>().unwrap(), ExecutionProvider::Cpu);
        assert_eq!(
            " CUDA ".parse::<ExecutionProvider>().unwrap(),
            ExecutionProvider::Cuda { device_id: 0 }
        );
        assert_eq!(
            "directml".parse::<ExecutionProvider>().unwrap(),
            ExecutionProvider::DirectMl { device_id: 0 }
        );
        assert_eq!(
            "openvino".parse::<ExecutionProvider>().unwrap(),
            ExecutionProvider::OpenVino
        );
        assert!(matches!(
            "coreml".parse::<ExecutionProvider>(),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_with_device_keeps_family() {
        let cuda = ExecutionProvider::Cuda { device_id: 0 }.with_device(2);
        assert_eq!(cuda, ExecutionProvider::Cuda { device_id: 2 });
        assert_eq!(ExecutionProvider::Cpu.with_device(2), ExecutionProvider::Cpu);
        assert!(cuda.is_gpu());
    }

    #[test]
    fn test_active_names_include_cpu_fallback() {
        let names = ExecutionProvider::Cuda { device_id: 1 }.active_names();
        assert_eq!(names, vec!["CUDAExecutionProvider", "CPUExecutionProvider"]);
    }
}

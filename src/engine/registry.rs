//! Framework name -> backend constructor table
//!
//! The `framework` setting picks the backend family at load time. Families
//! ship as constructors so a fresh, unloaded instance is created per load.

use crate::engine::{DdspBackend, OnnxBackend, VoiceBackend};
use crate::error::{AppError, Result};
use std::collections::BTreeMap;
use tracing::debug;

pub type BackendFactory = Box<dyn Fn() -> Box<dyn VoiceBackend> + Send + Sync>;

pub struct BackendRegistry {
    factories: BTreeMap<String, (String, BackendFactory)>,
}

impl BackendRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the built-in `Onnx` and `Ddsp` families
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("Onnx", OnnxBackend::boxed);
        registry.register("Ddsp", DdspBackend::boxed);
        registry
    }

    /// Register (or replace) a family. Names match case-insensitively.
    pub fn register<F>(&mut self, framework: &str, factory: F)
    where
        F: Fn() -> Box<dyn VoiceBackend> + Send + Sync + 'static,
    {
        debug!("Registering backend family {}", framework);
        self.factories.insert(
            framework.to_ascii_lowercase(),
            (framework.to_string(), Box::new(factory)),
        );
    }

    /// Fresh, unloaded backend for `framework`
    pub fn create(&self, framework: &str) -> Result<Box<dyn VoiceBackend>> {
        self.factories
            .get(&framework.to_ascii_lowercase())
            .map(|(_, factory)| factory())
            .ok_or_else(|| {
                AppError::Config(format!(
                    "unknown framework '{}', available: {:?}",
                    framework,
                    self.frameworks()
                ))
            })
    }

    /// Registered family names
    pub fn frameworks(&self) -> Vec<String> {
        self.factories.values().map(|(name, _)| name.clone()).collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::EchoBackend;

    #[test]
    fn test_builtins() {
        let registry = BackendRegistry::with_builtins();
        assert_eq!(registry.frameworks(), vec!["Ddsp", "Onnx"]);
        assert_eq!(registry.create("Onnx").unwrap().name(), "Onnx");
        assert_eq!(registry.create("ddsp").unwrap().name(), "Ddsp");
    }

    #[test]
    fn test_unknown_framework() {
        let registry = BackendRegistry::with_builtins();
        assert!(matches!(registry.create("Torch"), Err(AppError::Config(_))));
    }

    #[test]
    fn test_register_custom_family() {
        let mut registry = BackendRegistry::new();
        registry.register("Torch", || Box::new(EchoBackend::new(320, 1.0)));
        let backend = registry.create("torch").unwrap();
        assert_eq!(backend.name(), "echo");
        assert!(!backend.is_loaded());
    }
}

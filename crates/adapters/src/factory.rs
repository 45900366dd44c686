//! Configuration-driven adapter registry.

use std::collections::HashMap;
use std::sync::Arc;

use foundry_core::config::{EngineConfig, ExecutionMode};
use serde_json::Value;

use crate::adapter::GenerationAdapter;
use crate::comfyui::ComfyUIAdapter;
use crate::error::{AdapterError, FactoryError};
use crate::mock::MockAdapter;
use crate::vetting::WorkflowVetting;

/// Backend used when `model_params.model` is absent.
pub const DEFAULT_BACKEND: &str = "mock";

/// Maps backend names (and aliases) to adapter instances.
///
/// Lookups are case-insensitive. A segment selects its backend with
/// `model_params.model`.
pub struct AdapterFactory {
    adapters: HashMap<String, Arc<dyn GenerationAdapter>>,
    aliases: HashMap<String, String>,
    mode: ExecutionMode,
}

impl AdapterFactory {
    /// Empty registry; `mode` decides whether mock backends may be
    /// registered.
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            adapters: HashMap::new(),
            aliases: HashMap::new(),
            mode,
        }
    }

    /// Registry for `config`: the mock backend in developer mode, ComfyUI
    /// when `comfyui_url` is set, vetting workflows for the execution mode.
    pub fn from_config(config: &EngineConfig) -> Result<Self, FactoryError> {
        let mut factory = Self::new(config.execution_mode);
        if config.execution_mode.allows_mock_backend() {
            factory.register_mock(Arc::new(MockAdapter::new()));
        }
        if let Some(url) = &config.comfyui_url {
            let vetting = WorkflowVetting::for_mode(
                config.execution_mode,
                config.workflow_allowlist_path.as_deref(),
            )?;
            factory.register("comfyui", Arc::new(ComfyUIAdapter::new(url.clone(), vetting)?));
        }
        tracing::info!(
            mode = config.execution_mode.as_str(),
            backends = ?factory.backends(),
            "Generation backends registered",
        );
        Ok(factory)
    }

    pub fn register(&mut self, name: &str, adapter: Arc<dyn GenerationAdapter>) -> &mut Self {
        self.adapters.insert(name.to_ascii_lowercase(), adapter);
        self
    }

    /// Register `adapter` as `mock` with the `mock-ai` alias. Ignored outside
    /// developer mode.
    pub fn register_mock(&mut self, adapter: Arc<dyn GenerationAdapter>) -> &mut Self {
        if !self.mode.allows_mock_backend() {
            tracing::warn!(
                mode = self.mode.as_str(),
                "Mock backend is not allowed in this execution mode"
            );
            return self;
        }
        self.register("mock", adapter);
        self.alias("mock-ai", "mock")
    }

    pub fn alias(&mut self, alias: &str, target: &str) -> &mut Self {
        self.aliases
            .insert(alias.to_ascii_lowercase(), target.to_ascii_lowercase());
        self
    }

    /// Sorted canonical backend names.
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn GenerationAdapter>, AdapterError> {
        let name = name.to_ascii_lowercase();
        let canonical = self.aliases.get(&name).unwrap_or(&name);
        self.adapters.get(canonical).cloned().ok_or_else(|| {
            AdapterError::UnsupportedCapability(format!(
                "backend '{name}' is not available in {} mode (available: {})",
                self.mode.as_str(),
                self.backends().join(", ")
            ))
        })
    }

    /// Backend named by `model_params.model`, defaulting to
    /// [`DEFAULT_BACKEND`].
    pub fn resolve_for(
        &self,
        model_params: &Value,
    ) -> Result<Arc<dyn GenerationAdapter>, AdapterError> {
        let name = match model_params.get("model") {
            None | Some(Value::Null) => DEFAULT_BACKEND,
            Some(Value::String(name)) => name.as_str(),
            Some(other) => {
                return Err(AdapterError::InvalidParameters(format!(
                    "model must be a string, got {other}"
                )))
            }
        };
        self.resolve(name)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn developer() -> AdapterFactory {
        let mut factory = AdapterFactory::new(ExecutionMode::Developer);
        factory.register_mock(Arc::new(MockAdapter::new()));
        factory
    }

    #[test]
    fn default_and_aliases_resolve_to_mock() {
        let factory = developer();
        for params in [json!({}), json!({ "model": "mock" }), json!({ "model": "Mock-AI" })] {
            assert_eq!(factory.resolve_for(&params).unwrap().backend(), "mock");
        }
    }

    #[test]
    fn unknown_backend_is_unsupported() {
        let factory = developer();
        let err = factory
            .resolve_for(&json!({ "model": "runway" }))
            .err()
            .unwrap();
        assert_matches!(err, AdapterError::UnsupportedCapability(_));
        assert!(!err.is_retryable());
    }

    #[test]
    fn non_string_model_is_invalid() {
        assert_matches!(
            developer().resolve_for(&json!({ "model": 3 })).err(),
            Some(AdapterError::InvalidParameters(_))
        );
    }

    #[test]
    fn production_refuses_mock() {
        let mut factory = AdapterFactory::new(ExecutionMode::Production);
        factory.register_mock(Arc::new(MockAdapter::new()));
        assert!(factory.backends().is_empty());
        assert_matches!(
            factory.resolve("mock").err(),
            Some(AdapterError::UnsupportedCapability(_))
        );
    }

    #[test]
    fn from_config_registers_configured_backends() {
        let config = EngineConfig {
            comfyui_url: Some("http://localhost:8188".into()),
            ..EngineConfig::default()
        };
        let factory = AdapterFactory::from_config(&config).unwrap();
        assert_eq!(factory.backends(), ["comfyui", "mock"]);
    }

    #[test]
    fn from_config_rejects_malformed_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allowlist.json");
        std::fs::write(&path, "[{").unwrap();
        let config = EngineConfig {
            execution_mode: ExecutionMode::Production,
            comfyui_url: Some("http://localhost:8188".into()),
            workflow_allowlist_path: Some(path),
            ..EngineConfig::default()
        };
        assert_matches!(
            AdapterFactory::from_config(&config).err(),
            Some(FactoryError::Allowlist(_))
        );
    }
}

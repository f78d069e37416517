//! RLM construction configuration.
//!
//! Grounded on `kowalski-rlm/src/config.rs`'s serde-serializable builder
//! (`with_*` chainable methods + a `validate()` cross-field check) and on
//! `kowalski-core/src/config.rs`'s environment-override pattern
//! (`apply_env_overrides`). Recognized options mirror `spec.md` §6's
//! Configuration list exactly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One Backend specification: which kind, plus its constructor kwargs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSpec {
    pub backend: String,
    pub backend_kwargs: HashMap<String, serde_json::Value>,
}

impl BackendSpec {
    pub fn new(backend: impl Into<String>) -> Self {
        Self { backend: backend.into(), backend_kwargs: HashMap::new() }
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.backend_kwargs.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlmConfig {
    pub backend: BackendSpec,
    pub environment: String,
    pub environment_kwargs: HashMap<String, serde_json::Value>,
    pub max_depth: u32,
    pub max_iterations: u32,
    pub other_backends: Vec<BackendSpec>,
    pub custom_system_prompt: Option<String>,
    pub persistent: bool,
    pub verbose: bool,
    /// Whether budget exhaustion without a FINAL marker is a hard error
    /// (`RlmError::Budget`) rather than the best-effort DEFAULT_ANSWER path.
    /// `spec.md` §7 allows either; default follows DEFAULT_ANSWER since
    /// that's what the original source always does.
    pub fatal_budget_exhaustion: bool,
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            backend: BackendSpec::new("direct"),
            environment: "in_process".to_string(),
            environment_kwargs: HashMap::new(),
            max_depth: 1,
            max_iterations: 30,
            other_backends: Vec::new(),
            custom_system_prompt: None,
            persistent: false,
            verbose: false,
            fatal_budget_exhaustion: false,
        }
    }
}

impl RlmConfig {
    pub fn new(backend: BackendSpec) -> Self {
        Self { backend, ..Default::default() }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_environment_kwarg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.environment_kwargs.insert(key.into(), value);
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_other_backends(mut self, other_backends: Vec<BackendSpec>) -> Self {
        self.other_backends = other_backends;
        self
    }

    pub fn with_custom_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.custom_system_prompt = Some(prompt.into());
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Cross-field validation, matching `kowalski-rlm/src/config.rs::validate`'s
    /// `Result<(), String>` shape.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_iterations == 0 {
            return Err("max_iterations must be >= 1".to_string());
        }
        if self.persistent
            && !matches!(self.environment.as_str(), "in_process" | "subprocess")
        {
            return Err(format!(
                "persistent=true is not supported for environment type '{}'; \
                 supported environments: in_process, subprocess",
                self.environment
            ));
        }
        Ok(())
    }

    /// Applies `RLM_*` environment variable overrides, matching
    /// `kowalski-core::config::Config::apply_env_overrides`.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(backend) = std::env::var("RLM_BACKEND") {
            self.backend.backend = backend;
        }
        if let Ok(model) = std::env::var("RLM_MODEL") {
            self.backend
                .backend_kwargs
                .insert("model_name".to_string(), serde_json::Value::String(model));
        }
        if let Ok(max_depth) = std::env::var("RLM_MAX_DEPTH") {
            if let Ok(parsed) = max_depth.parse() {
                self.max_depth = parsed;
            }
        }
        if let Ok(max_iterations) = std::env::var("RLM_MAX_ITERATIONS") {
            if let Ok(parsed) = max_iterations.parse() {
                self.max_iterations = parsed;
            }
        }
        self
    }

    /// Backend spec to use at a given recursion depth `d >= 1`, per
    /// `spec.md` §4.5's stable tie-break: entry `d-1` if it exists,
    /// otherwise the default backend.
    pub fn backend_for_depth(&self, depth: u32) -> &BackendSpec {
        if depth == 0 {
            return &self.backend;
        }
        self.other_backends
            .get((depth - 1) as usize)
            .unwrap_or(&self.backend)
    }

    /// Loads config from a TOML file, layered over `Self::default()` so a
    /// file only needs to name the fields it overrides. Matches
    /// `kowalski-core::config::Config`'s layered-source intent, using the
    /// `config` crate's builder instead of hand-rolled merging.
    pub fn load_from_file(path: &std::path::Path) -> Result<Self, String> {
        let defaults = serde_json::to_string(&Self::default()).map_err(|e| e.to_string())?;
        let built = config::Config::builder()
            .add_source(config::File::from_str(&defaults, config::FileFormat::Json))
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| e.to_string())?;
        built.try_deserialize().map_err(|e| e.to_string())
    }

    /// `$XDG_CONFIG_HOME/rlm/config.toml` (or the platform equivalent via
    /// `dirs::config_dir`), the default path `rlm-cli` checks before falling
    /// back to an all-default config.
    pub fn default_config_path() -> Option<std::path::PathBuf> {
        dirs::config_dir().map(|dir| dir.join("rlm").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_zero_iterations() {
        let config = RlmConfig::default().with_max_iterations(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_persistence_on_unsupported_environment() {
        let config = RlmConfig::default()
            .with_environment("remote")
            .with_persistent(true);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_persistence_on_in_process() {
        let config = RlmConfig::default()
            .with_environment("in_process")
            .with_persistent(true);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn backend_for_depth_falls_back_to_default() {
        let config = RlmConfig::default()
            .with_other_backends(vec![BackendSpec::new("b1")]);
        assert_eq!(config.backend_for_depth(0).backend, "direct");
        assert_eq!(config.backend_for_depth(1).backend, "b1");
        assert_eq!(config.backend_for_depth(2).backend, "direct");
    }

    #[test]
    fn load_from_file_overrides_only_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rlm.toml");
        std::fs::write(&path, "max_depth = 3\nmax_iterations = 10\n").unwrap();

        let config = RlmConfig::load_from_file(&path).unwrap();
        assert_eq!(config.max_depth, 3);
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.environment, "in_process");
    }

    #[test]
    fn load_from_file_rejects_a_missing_path() {
        let missing = std::path::PathBuf::from("/nonexistent/rlm.toml");
        assert!(RlmConfig::load_from_file(&missing).is_err());
    }
}

//! Constructs a concrete [`rlm_backend::Backend`] from a
//! [`rlm_core::BackendSpec`].
//!
//! Grounded on `kowalski-rlm/src/builder.rs`'s pattern of dispatching a
//! string discriminator plus a kwargs map to a concrete client constructor.
//! Recognized `backend` discriminators: `"direct"` (an Ollama-style
//! generate endpoint) and `"http_proxy"` / `"openai_compat"` (an
//! OpenAI-compatible chat endpoint). The recursive-RLM variant (`spec.md`
//! §4.5) is never constructed here — it is assembled by
//! [`crate::rlm::Rlm`] directly, since it needs the owning RLM's
//! configuration, not just a kwargs map.

use std::sync::Arc;

use rlm_backend::{Backend, DirectBackend, OpenAiCompatBackend};
use rlm_core::{BackendSpec, RlmError, RlmResult};

fn kwarg_str(spec: &BackendSpec, key: &str) -> Option<String> {
    spec.backend_kwargs.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn require_str(spec: &BackendSpec, key: &str) -> RlmResult<String> {
    kwarg_str(spec, key).ok_or_else(|| {
        RlmError::configuration(format!(
            "backend '{}' requires a '{key}' kwarg",
            spec.backend
        ))
    })
}

/// Builds the Backend named by `spec.backend`, raising `RlmError::Configuration`
/// immediately for an unknown discriminator or missing required kwargs, per
/// `spec.md` §7's Configuration error row: "Raised immediately; no RLM
/// instance is produced."
pub fn build_backend(spec: &BackendSpec) -> RlmResult<Arc<dyn Backend>> {
    match spec.backend.as_str() {
        "direct" => {
            let base_url = require_str(spec, "base_url")?;
            let model_name = kwarg_str(spec, "model_name").unwrap_or_else(|| "default".to_string());
            Ok(Arc::new(DirectBackend::new(base_url, model_name)?))
        }
        "http_proxy" | "openai_compat" => {
            let base_url = require_str(spec, "base_url")?;
            let model_name = require_str(spec, "model_name")?;
            let api_key = kwarg_str(spec, "api_key");
            Ok(Arc::new(OpenAiCompatBackend::new(base_url, model_name, api_key)?))
        }
        other => Err(RlmError::configuration(format!("unknown backend kind '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_direct_backend_from_kwargs() {
        let spec = BackendSpec::new("direct")
            .with_kwarg("base_url", json!("http://localhost:11434"))
            .with_kwarg("model_name", json!("llama3"));
        let backend = build_backend(&spec).unwrap();
        assert_eq!(backend.model_name(), "llama3");
    }

    #[test]
    fn missing_required_kwarg_is_a_configuration_error() {
        let spec = BackendSpec::new("http_proxy");
        let err = build_backend(&spec).unwrap_err();
        assert!(matches!(err, RlmError::Configuration(_)));
    }

    #[test]
    fn unknown_backend_kind_is_a_configuration_error() {
        let spec = BackendSpec::new("carrier-pigeon");
        let err = build_backend(&spec).unwrap_err();
        assert!(matches!(err, RlmError::Configuration(_)));
    }
}

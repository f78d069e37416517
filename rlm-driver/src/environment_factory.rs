//! Constructs a concrete [`rlm_environment::Environment`] from an
//! `environment` discriminator string and its kwargs map (`spec.md` §6).
//!
//! Grounded on the same kwargs-dispatch pattern as
//! [`crate::backend_factory`]. Recognized discriminators: `"in_process"`,
//! `"subprocess"`, `"container"` (requires a `container` kwarg naming an
//! already-running container), `"remote"` (requires a `base_url` kwarg).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use rlm_core::{RlmError, RlmResult};
use rlm_environment::{ContainerEnvironment, Environment, InProcessEnvironment, RemoteEnvironment, SubprocessEnvironment};
use serde_json::Value;

fn kwarg_str(kwargs: &HashMap<String, Value>, key: &str) -> Option<String> {
    kwargs.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn require_str(kwargs: &HashMap<String, Value>, kind: &str, key: &str) -> RlmResult<String> {
    kwarg_str(kwargs, key).ok_or_else(|| {
        RlmError::configuration(format!("environment '{kind}' requires a '{key}' kwarg"))
    })
}

/// Builds the Environment named by `kind`. `depth` is the Router depth its
/// injected `llm_query`/`llm_query_batched` calls are tagged with — always
/// `1` relative to the RLM instance that owns this Environment, since
/// deeper recursion is handled by a fresh nested RLM (and its own fresh
/// Environment), not by a larger depth number inside the same Environment.
pub async fn build_environment(
    kind: &str,
    kwargs: &HashMap<String, Value>,
    router_addr: SocketAddr,
    depth: u32,
) -> RlmResult<Arc<dyn Environment>> {
    match kind {
        "in_process" => Ok(Arc::new(InProcessEnvironment::new(router_addr, depth)?)),
        "subprocess" => Ok(Arc::new(SubprocessEnvironment::new(router_addr, depth).await?)),
        "container" => {
            let container = require_str(kwargs, "container", "container")?;
            Ok(Arc::new(ContainerEnvironment::new(container, router_addr, depth).await?))
        }
        "remote" => {
            let base_url = require_str(kwargs, "remote", "base_url")?;
            Ok(Arc::new(RemoteEnvironment::new(base_url, router_addr, depth)?))
        }
        other => Err(RlmError::configuration(format!("unknown environment kind '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_in_process_environment() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let env = build_environment("in_process", &HashMap::new(), addr, 1).await;
        assert!(env.is_ok());
    }

    #[tokio::test]
    async fn unknown_environment_kind_is_a_configuration_error() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let err = build_environment("quantum-foam", &HashMap::new(), addr, 1).await.unwrap_err();
        assert!(matches!(err, RlmError::Configuration(_)));
    }

    #[tokio::test]
    async fn container_without_kwarg_is_a_configuration_error() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let err = build_environment("container", &HashMap::new(), addr, 1).await.unwrap_err();
        assert!(matches!(err, RlmError::Configuration(_)));
    }
}

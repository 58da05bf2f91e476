//! Agent invocation port.
//!
//! The engine, the compressor and the judge panel all reach language models
//! through [`AgentInvoker`]. The core owns retries and timeouts; adapters
//! only perform the call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors from a single agent call.
#[derive(Debug, Clone, Error)]
pub enum InvocationError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("response could not be decoded: {0}")]
    InvalidResponse(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent unavailable: {0}")]
    Unavailable(String),
}

/// One call to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    /// Logical agent name (planner, researcher-2, judge:skeptic, …).
    pub agent: String,
    pub model: String,
    pub prompt: String,
    /// Optional system preamble.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl InvocationRequest {
    pub fn new(agent: impl Into<String>, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            model: model.into(),
            prompt: prompt.into(),
            system: None,
            temperature: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Text returned by an agent plus its reported token usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub text: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

/// Opaque external call to a language-model agent.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: InvocationRequest) -> Result<AgentResponse, InvocationError>;
}

/// Shared reference to an invoker.
pub type SharedInvoker = Arc<dyn AgentInvoker>;

/// Run `invoker` with a timeout, mapping elapsed time to [`InvocationError::Timeout`].
pub async fn invoke_with_timeout(
    invoker: &dyn AgentInvoker,
    request: InvocationRequest,
    timeout: Duration,
) -> Result<AgentResponse, InvocationError> {
    match tokio::time::timeout(timeout, invoker.invoke(request)).await {
        Ok(result) => result,
        Err(_) => Err(InvocationError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowInvoker;

    #[async_trait]
    impl AgentInvoker for SlowInvoker {
        async fn invoke(&self, _request: InvocationRequest) -> Result<AgentResponse, InvocationError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(AgentResponse {
                text: "late".into(),
                tokens_in: 1,
                tokens_out: 1,
            })
        }
    }

    #[tokio::test]
    async fn test_timeout_maps_to_error() {
        let req = InvocationRequest::new("slow", "claude-haiku", "hi");
        let result = invoke_with_timeout(&SlowInvoker, req, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(InvocationError::Timeout(_))));
    }

    #[test]
    fn test_request_builder() {
        let req = InvocationRequest::new("judge:skeptic", "claude-opus", "review")
            .with_system("be skeptical")
            .with_temperature(0.2);
        assert_eq!(req.system.as_deref(), Some("be skeptical"));
        assert_eq!(req.temperature, Some(0.2));
    }
}

//! OpenAI-compatible chat completions client.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tiergate_coordination::{AgentInvoker, AgentResponse, InvocationError, InvocationRequest};
use tracing::debug;

/// Default endpoint when `TIERGATE_API_BASE` is unset.
pub const DEFAULT_API_BASE: &str = "http://localhost:8080/v1";

/// Invoker that POSTs to `{base_url}/chat/completions`.
#[derive(Debug, Clone)]
pub struct HttpInvoker {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    max_tokens: u32,
    request_timeout: Duration,
}

impl HttpInvoker {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            max_tokens: 2048,
            request_timeout: Duration::from_secs(300),
        }
    }

    /// Endpoint and key from `TIERGATE_API_BASE` and `TIERGATE_API_KEY`.
    pub fn from_env() -> Self {
        let base = std::env::var("TIERGATE_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.into());
        Self::new(base, std::env::var("TIERGATE_API_KEY").ok())
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Transport-level ceiling; the engine applies its own per-call timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// Chat completions request body for `request`.
pub fn build_body(request: &InvocationRequest, max_tokens: u32) -> Value {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    messages.push(json!({"role": "user", "content": request.prompt}));

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "max_tokens": max_tokens,
    });
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    body
}

/// Pull the first choice's content and the usage counters out of a response.
pub fn parse_completion(body: &Value) -> Result<AgentResponse, InvocationError> {
    let text = body["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| InvocationError::InvalidResponse("response has no message content".into()))?;
    if text.trim().is_empty() {
        return Err(InvocationError::InvalidResponse("empty completion".into()));
    }
    let usage = |key: &str| body["usage"][key].as_u64().unwrap_or(0).min(u32::MAX as u64) as u32;
    Ok(AgentResponse {
        text: text.to_string(),
        tokens_in: usage("prompt_tokens"),
        tokens_out: usage("completion_tokens"),
    })
}

#[async_trait]
impl AgentInvoker for HttpInvoker {
    async fn invoke(&self, request: InvocationRequest) -> Result<AgentResponse, InvocationError> {
        let body = build_body(&request, self.max_tokens);
        debug!(agent = %request.agent, model = %request.model, "Sending chat completion");

        let mut http = self
            .client
            .post(self.endpoint())
            .timeout(self.request_timeout)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            http = http.header("Authorization", format!("Bearer {key}"));
        }

        let response = http.send().await.map_err(|e| {
            if e.is_timeout() {
                InvocationError::Timeout(self.request_timeout)
            } else if e.is_connect() {
                InvocationError::Unavailable(e.to_string())
            } else {
                InvocationError::RequestFailed(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("API error ({status}): {text}");
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                InvocationError::Unavailable(message)
            } else {
                InvocationError::RequestFailed(message)
            });
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| InvocationError::InvalidResponse(e.to_string()))?;
        parse_completion(&json)
    }
}

//! Agent adapters for the tiergate engine: an OpenAI-compatible HTTP
//! invoker and a scripted invoker for dry runs.

pub mod http;
pub mod scripted;

pub use http::HttpInvoker;
pub use scripted::ScriptedInvoker;

/// Install the global `tracing` subscriber. `RUST_LOG` overrides `default`.
pub fn init_tracing(default: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Parse a snake_case enum name through its serde representation.
pub fn parse_snake_case<T: serde::de::DeserializeOwned>(value: &str) -> anyhow::Result<T> {
    let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
    serde_json::from_value(serde_json::Value::String(normalized))
        .map_err(|e| anyhow::anyhow!("invalid value '{value}': {e}"))
}

//! Backend adapter factory: `(backend_name, options) -> LmClient`
//! (spec.md §6 Programmatic surface).

pub mod http;
pub mod mock;

use std::sync::Arc;

use crate::client::{ConfigError, LmClient};

/// Resolve a backend name plus option dictionary into a concrete
/// [`LmClient`]. Unknown backend names are a configuration error surfaced
/// at construction time (spec.md §7).
pub fn create_client(
    backend: &str,
    options: &serde_json::Value,
) -> Result<Arc<dyn LmClient>, ConfigError> {
    let model_name = options
        .get("model_name")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    match backend {
        "mock" => {
            if let Some(script) = options.get("script").and_then(|v| v.as_array()) {
                let script = script
                    .iter()
                    .map(|v| v.as_str().unwrap_or("").to_string())
                    .collect();
                Ok(Arc::new(mock::MockLmClient::scripted(model_name, script)))
            } else {
                let reply = options
                    .get("reply")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                Ok(Arc::new(mock::MockLmClient::constant(model_name, reply)))
            }
        }
        "openai" | "http" => {
            let base_url = options
                .get("base_url")
                .and_then(|v| v.as_str())
                .unwrap_or("https://api.openai.com/v1")
                .to_string();
            let api_key = options
                .get("api_key")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            Ok(Arc::new(http::HttpLmClient::new(
                base_url, model_name, api_key,
            )))
        }
        other => Err(ConfigError(format!("unknown backend '{}'", other))),
    }
}

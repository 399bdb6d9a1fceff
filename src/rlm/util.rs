//! Small free functions shared across modules that don't deserve their own
//! home. Ported from `rlm_utils.py` in the original implementation.

/// Strip any object key whose lower-cased name contains both `"api"` and
/// `"key"` before it's embedded in a [`crate::types::TrajectoryMetadata`] or
/// handed to a logger (spec.md §9 — credentials must never reach the
/// trajectory log).
pub fn filter_sensitive_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let filtered = map
                .iter()
                .filter(|(key, _)| !is_sensitive_key(key))
                .map(|(key, value)| (key.clone(), filter_sensitive_keys(value)))
                .collect();
            serde_json::Value::Object(filtered)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(filter_sensitive_keys).collect())
        }
        other => other.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    lower.contains("api") && lower.contains("key")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_api_key_regardless_of_casing() {
        let input = json!({
            "API_Key": "sk-secret",
            "model_name": "gpt-4",
            "nested": { "openai_api_key": "sk-another", "temperature": 0.2 },
        });

        let filtered = filter_sensitive_keys(&input);

        assert_eq!(filtered.get("API_Key"), None);
        assert_eq!(filtered["model_name"], "gpt-4");
        assert_eq!(filtered["nested"].get("openai_api_key"), None);
        assert_eq!(filtered["nested"]["temperature"], 0.2);
    }

    #[test]
    fn leaves_unrelated_keys_untouched() {
        let input = json!({ "keystone": "value", "apiversion": "v1" });
        let filtered = filter_sensitive_keys(&input);
        assert_eq!(filtered, input);
    }
}

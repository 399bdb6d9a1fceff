//! Thin reference adapter for OpenAI-compatible Chat Completions endpoints.
//!
//! Grounded on the shape of the teacher's `clients/openai.rs` (model name +
//! base URL + a `Mutex<TokenUsage>` slot updated after every call) but
//! generalized to any OpenAI-compatible `/chat/completions` endpoint and
//! built directly on `reqwest` rather than a vendor SDK, since concrete LM
//! adapters are an external collaborator (spec.md §1) and this crate has no
//! business depending on a specific vendor's forked client crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::client::{ClientError, LmClient};
use crate::types::{Message, Prompt, Role, UsageSummary};

/// Chat-completion client for any server speaking the OpenAI
/// `/v1/chat/completions` wire format (OpenAI itself, or a local
/// OpenAI-compatible gateway).
pub struct HttpLmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    usage: Mutex<UsageSummary>,
    last_usage: Mutex<UsageSummary>,
}

impl HttpLmClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            usage: Mutex::new(UsageSummary::new()),
            last_usage: Mutex::new(UsageSummary::new()),
        }
    }

    fn to_wire_messages(prompt: &Prompt) -> Vec<WireMessage> {
        match prompt {
            Prompt::Text(s) => vec![WireMessage {
                role: "user".to_string(),
                content: s.clone(),
            }],
            Prompt::Messages(messages) => messages.iter().map(WireMessage::from).collect(),
        }
    }
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

impl From<&Message> for WireMessage {
    fn from(m: &Message) -> Self {
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        WireMessage {
            role: role.to_string(),
            content: m.content.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl LmClient for HttpLmClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn acompletion(&self, prompt: Prompt) -> Result<(String, UsageSummary), ClientError> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: Self::to_wire_messages(&prompt),
        };

        let mut request = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ClientError(format!(
                "upstream returned status {}",
                response.status()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ClientError(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ClientError("response contained no choices".to_string()))?;

        let usage = parsed.usage.unwrap_or_default();
        let mut call_usage = UsageSummary::new();
        call_usage.record(&self.model, usage.prompt_tokens, usage.completion_tokens, 0.0);

        self.usage.lock().await.merge(&call_usage);
        *self.last_usage.lock().await = call_usage.clone();

        Ok((content, call_usage))
    }

    async fn get_usage_summary(&self) -> UsageSummary {
        self.usage.lock().await.clone()
    }

    async fn get_last_usage(&self) -> UsageSummary {
        self.last_usage.lock().await.clone()
    }
}

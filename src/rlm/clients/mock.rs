//! Deterministic in-memory [`LmClient`] used by the test suite.
//!
//! Mirrors the role `MockToolProtocol` plays in the teacher's
//! `mcp_server.rs` tests: a hand-written stand-in rather than a mocking
//! framework, since that's what the teacher reaches for.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::client::{ClientError, LmClient};
use crate::types::{Prompt, UsageSummary};

type Responder = Box<dyn Fn(&Prompt) -> String + Send + Sync>;

/// A client whose replies are computed by a supplied closure, or drawn in
/// order from a fixed script (repeating the last entry once exhausted).
pub struct MockLmClient {
    model_name: String,
    responder: Responder,
    usage: Mutex<UsageSummary>,
    last_usage: Mutex<UsageSummary>,
}

impl MockLmClient {
    pub fn new(
        model_name: impl Into<String>,
        responder: impl Fn(&Prompt) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            responder: Box::new(responder),
            usage: Mutex::new(UsageSummary::new()),
            last_usage: Mutex::new(UsageSummary::new()),
        }
    }

    /// A client that always returns `reply`, regardless of what it's asked.
    pub fn constant(model_name: impl Into<String>, reply: impl Into<String>) -> Self {
        let reply = reply.into();
        Self::new(model_name, move |_| reply.clone())
    }

    /// A client that returns `script[0]` on the first call, `script[1]` on
    /// the second, and so on, repeating the final entry thereafter.
    pub fn scripted(model_name: impl Into<String>, script: Vec<String>) -> Self {
        let turn = Mutex::new(0usize);
        Self::new(model_name, move |_| {
            let mut i = turn.lock().unwrap();
            let reply = script
                .get(*i)
                .or_else(|| script.last())
                .cloned()
                .unwrap_or_default();
            *i += 1;
            reply
        })
    }

    fn prompt_len(prompt: &Prompt) -> usize {
        match prompt {
            Prompt::Text(s) => s.len(),
            Prompt::Messages(messages) => messages.iter().map(|m| m.content.len()).sum(),
        }
    }
}

#[async_trait]
impl LmClient for MockLmClient {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn acompletion(&self, prompt: Prompt) -> Result<(String, UsageSummary), ClientError> {
        let reply = (self.responder)(&prompt);
        let input_tokens = (Self::prompt_len(&prompt) / 4).max(1) as u64;
        let output_tokens = (reply.len() / 4).max(1) as u64;

        let mut call_usage = UsageSummary::new();
        call_usage.record(&self.model_name, input_tokens, output_tokens, 0.0);

        self.usage.lock().unwrap().merge(&call_usage);
        *self.last_usage.lock().unwrap() = call_usage.clone();

        Ok((reply, call_usage))
    }

    async fn get_usage_summary(&self) -> UsageSummary {
        self.usage.lock().unwrap().clone()
    }

    async fn get_last_usage(&self) -> UsageSummary {
        self.last_usage.lock().unwrap().clone()
    }
}

//! Core data model shared by every component of the RLM driver.
//!
//! Mirrors `rlm.core.types` from the original Python implementation: message
//! history, per-turn iteration records, REPL results, and usage accounting.
//! Nothing here talks to a model or a process — it's the vocabulary the rest
//! of the crate is written in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Role of a single message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single role-tagged message.
///
/// `content` is stored as `Arc<str>` so that message history — which is
/// cloned once per turn to build that turn's prompt — stays cheap to copy.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: Arc<str>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<Arc<str>>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<Arc<str>>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<Arc<str>>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<Arc<str>>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// The two admissible shapes of a completion request's payload (spec.md §3).
///
/// A plain string is read by the environment as a text file; a structured
/// payload is serialized to JSON and deserialized back inside the
/// environment as the `context` binding.
#[derive(Debug, Clone)]
pub enum CompletionRequest {
    Text(String),
    Structured(serde_json::Value),
}

impl CompletionRequest {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CompletionRequest::Text(s) => Some(s),
            CompletionRequest::Structured(_) => None,
        }
    }
}

impl From<String> for CompletionRequest {
    fn from(s: String) -> Self {
        CompletionRequest::Text(s)
    }
}

impl From<&str> for CompletionRequest {
    fn from(s: &str) -> Self {
        CompletionRequest::Text(s.to_string())
    }
}

impl From<serde_json::Value> for CompletionRequest {
    fn from(v: serde_json::Value) -> Self {
        CompletionRequest::Structured(v)
    }
}

/// What gets sent to an [`LmClient`](crate::client::LmClient) for a single
/// call: either a bare string or a full message history.
#[derive(Debug, Clone)]
pub enum Prompt {
    Text(String),
    Messages(Vec<Message>),
}

impl From<Vec<Message>> for Prompt {
    fn from(messages: Vec<Message>) -> Self {
        Prompt::Messages(messages)
    }
}

impl From<CompletionRequest> for Prompt {
    fn from(req: CompletionRequest) -> Self {
        match req {
            CompletionRequest::Text(s) => Prompt::Text(s),
            CompletionRequest::Structured(v) => Prompt::Text(v.to_string()),
        }
    }
}

/// A value captured from the environment's persistent bindings after an
/// `execute_code` call. Only simple scalar/composite shapes are captured —
/// anything else collapses to its Python `repr()`-equivalent string.
#[derive(Debug, Clone)]
pub enum BindingValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<BindingValue>),
    Dict(HashMap<String, BindingValue>),
    Other(String),
}

/// One sub-completion performed by `llm_query`/`llm_query_batched` while a
/// code block was executing.
#[derive(Debug, Clone)]
pub struct NestedCall {
    pub prompt: String,
    pub model: Option<String>,
    pub result: RlmChatCompletion,
}

/// Result of executing one fenced code block against the environment.
#[derive(Debug, Clone)]
pub struct ReplResult {
    pub stdout: String,
    pub stderr: String,
    pub bindings: HashMap<String, BindingValue>,
    pub execution_time: Duration,
    pub nested_calls: Vec<NestedCall>,
}

impl ReplResult {
    pub fn empty() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            bindings: HashMap::new(),
            execution_time: Duration::default(),
            nested_calls: Vec::new(),
        }
    }
}

/// One fenced `` ```repl ``` `` block found in a turn's response, paired
/// with its execution result, in source order.
#[derive(Debug, Clone)]
pub struct CodeBlock {
    pub code: String,
    pub result: ReplResult,
}

/// Everything that happened during turn *i* of a completion.
///
/// Immutable once emitted to the logger — the synthetic "out of iterations"
/// closing turn is logged as a normal `RlmIteration` whose `final_answer`
/// equals its `response` (spec.md §3 Invariants).
#[derive(Debug, Clone)]
pub struct RlmIteration {
    pub prompt: Vec<Message>,
    pub response: String,
    pub code_blocks: Vec<CodeBlock>,
    pub iteration_time: Duration,
    pub final_answer: Option<String>,
}

/// Per-model token/cost aggregate.
#[derive(Debug, Clone, Default)]
pub struct ModelUsage {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub call_count: u64,
    pub cost: f64,
}

impl ModelUsage {
    pub fn add(&mut self, other: &ModelUsage) {
        self.total_input_tokens += other.total_input_tokens;
        self.total_output_tokens += other.total_output_tokens;
        self.call_count += other.call_count;
        self.cost += other.cost;
    }
}

/// Root usage summary: one [`ModelUsage`] aggregate per model name.
///
/// Aggregation is additive and commutative (spec.md §3 Invariants): merging
/// two summaries in either order yields the same totals.
#[derive(Debug, Clone, Default)]
pub struct UsageSummary {
    pub per_model: HashMap<String, ModelUsage>,
}

impl UsageSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, model: &str, input_tokens: u64, output_tokens: u64, cost: f64) {
        let entry = self.per_model.entry(model.to_string()).or_default();
        entry.total_input_tokens += input_tokens;
        entry.total_output_tokens += output_tokens;
        entry.call_count += 1;
        entry.cost += cost;
    }

    /// Merge another summary into this one. Additive and commutative.
    pub fn merge(&mut self, other: &UsageSummary) {
        for (model, usage) in &other.per_model {
            self.per_model.entry(model.clone()).or_default().add(usage);
        }
    }

    pub fn total_call_count(&self) -> u64 {
        self.per_model.values().map(|u| u.call_count).sum()
    }
}

/// Return value of a top-level `completion()` call.
#[derive(Debug, Clone)]
pub struct RlmChatCompletion {
    pub root_model: String,
    pub prompt: CompletionRequest,
    pub response: String,
    pub usage_summary: UsageSummary,
    pub execution_time: Duration,
}

/// One record emitted at controller start, before the first turn runs.
///
/// Sensitive options (key names containing both "api" and "key",
/// case-insensitive) have already been stripped from `backend_options` and
/// `environment_options` by the time this struct is constructed — see
/// [`crate::util::filter_sensitive_keys`].
#[derive(Debug, Clone)]
pub struct TrajectoryMetadata {
    pub backend: String,
    pub backend_options: serde_json::Value,
    pub environment_type: String,
    pub environment_options: serde_json::Value,
    pub max_depth: u32,
    pub max_iterations: u32,
    pub root_model: String,
    pub other_backends: Vec<String>,
}

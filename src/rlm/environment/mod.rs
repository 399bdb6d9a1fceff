//! The Execution Environment: a sandboxed, stateful place to run the code
//! blocks a model emits (spec.md §4.2).
//!
//! `Environment` is the seam between the Iteration Controller and whatever
//! actually evaluates `` ```repl ``` `` blocks. `local` is the only concrete
//! flavor this crate ships; `IsolatedEnvironment` names the stronger
//! isolation flavor spec.md leaves unspecified beyond "same contract,
//! stronger boundary" and is not implemented here.

pub mod local;

use std::error::Error;
use std::fmt;

use async_trait::async_trait;

use crate::client::ConfigError;
use crate::types::CompletionRequest;

/// Failure setting up or tearing down an environment: temp-directory
/// creation, context materialization, or interpreter initialization.
#[derive(Debug)]
pub struct EnvironmentError(pub String);

impl fmt::Display for EnvironmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "environment error: {}", self.0)
    }
}

impl Error for EnvironmentError {}

/// Where `llm_query`/`llm_query_batched` calls from inside evaluated code
/// should be routed — the LM Handler's bound loopback address (spec.md §4.3).
#[derive(Debug, Clone)]
pub struct LmHandlerAddress {
    pub host: String,
    pub port: u16,
}

/// A sandboxed, stateful place to execute model-emitted code.
///
/// One instance is scoped to a single top-level `completion()` call:
/// `setup` runs once before the first turn, `execute_code` runs zero or
/// more times (once per `` ```repl ``` `` block across every turn), and
/// `cleanup` runs once, unconditionally, even if a turn panics or an
/// earlier call failed (spec.md §4.2 Invariants).
#[async_trait]
pub trait Environment: Send + Sync {
    /// Allocate whatever backing resources this environment needs (a temp
    /// directory, an interpreter, a namespace) and inject the `llm_query`
    /// helpers bound to `handler`.
    async fn setup(&self, handler: LmHandlerAddress) -> Result<(), EnvironmentError>;

    /// Materialize `payload` as the `context` binding: a text payload is
    /// written to a file and read back as a string; a structured payload is
    /// round-tripped through JSON (spec.md §3, §4.2).
    async fn load_context(&self, payload: &CompletionRequest) -> Result<(), EnvironmentError>;

    /// Execute one code block against the persistent namespace. Never fails
    /// to the caller: any exception raised by the code becomes text in
    /// [`crate::types::ReplResult::stderr`] instead (spec.md §4.2 Invariants).
    async fn execute_code(&self, code: &str) -> crate::types::ReplResult;

    /// Release backing resources. Idempotent and best-effort — called
    /// exactly once per completion regardless of how the completion ended.
    async fn cleanup(&self);
}

/// Resolve an environment kind name plus option dictionary into a concrete
/// [`Environment`]. Unknown kind names (and the unimplemented `"isolated"`
/// flavor) are a configuration error surfaced at construction time.
pub fn create_environment(
    kind: &str,
    options: &serde_json::Value,
) -> Result<Box<dyn Environment>, ConfigError> {
    match kind {
        "local" => Ok(Box::new(local::LocalReplEnvironment::new(options))),
        "isolated" => Err(ConfigError(
            "the \"isolated\" environment flavor is not implemented by this build".to_string(),
        )),
        other => Err(ConfigError(format!("unknown environment kind '{}'", other))),
    }
}

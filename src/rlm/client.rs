//! The [`LmClient`] trait — the abstract text-in/text-out model interface
//! the rest of the crate depends on.
//!
//! Grounded on the teacher's `ClientWrapper` trait
//! (`client_wrapper.rs`): a thin, provider-agnostic contract plus usage
//! accounting, leaving concrete wire formats to adapters. Concrete adapters
//! are external collaborators (spec.md §1) — this crate carries only what's
//! needed to exercise and test the core: a deterministic `mock` backend and
//! a thin `http` adapter for OpenAI-compatible chat endpoints.

use async_trait::async_trait;
use std::error::Error;
use std::fmt;

use crate::types::{Prompt, UsageSummary};

/// Transport, auth, or quota failure raised by an [`LmClient`].
#[derive(Debug)]
pub struct ClientError(pub String);

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LM client error: {}", self.0)
    }
}

impl Error for ClientError {}

/// Abstract text-completion model with usage accounting.
///
/// All implementations must be `Send + Sync`: the LM Handler (§4.3) serves
/// concurrent requests from multiple evaluator threads and therefore must be
/// able to share a client across tasks.
#[async_trait]
pub trait LmClient: Send + Sync {
    /// Model identifier used for usage accounting and routing
    /// (spec.md §4.3 registry lookup).
    fn model_name(&self) -> &str;

    /// Blocking-style single completion. Implementations that are
    /// inherently async should prefer overriding [`LmClient::acompletion`]
    /// and delegating here via a runtime handle if a sync caller needs it;
    /// the Controller only ever calls `acompletion`.
    async fn completion(&self, prompt: Prompt) -> Result<(String, UsageSummary), ClientError> {
        self.acompletion(prompt).await
    }

    /// Suspending completion. Concurrent calls to the same client instance
    /// must be safe (spec.md §5) — returns the usage recorded by *this*
    /// call alongside its reply, rather than leaving callers to read it back
    /// out of a shared "last call" slot afterward: two concurrent calls on
    /// the same client (as `llm_query_batched` can produce, routing through
    /// one registered client with no `model` override) would otherwise race
    /// over which call's usage that slot holds by the time each awaits it.
    async fn acompletion(&self, prompt: Prompt) -> Result<(String, UsageSummary), ClientError>;

    /// Cumulative usage across every call made on this client instance.
    /// Counters are monotone non-decreasing (spec.md §8, property 6).
    async fn get_usage_summary(&self) -> UsageSummary;

    /// Usage recorded by the most recent call to complete, or a zeroed
    /// summary if no call has completed yet. Purely an introspection
    /// convenience (spec.md §4.1) — callers that need the usage tied to a
    /// *specific* call must use `acompletion`'s own return value instead,
    /// since this reflects whichever call wrote it last under concurrency.
    async fn get_last_usage(&self) -> UsageSummary;
}

/// Configuration error raised at construction time: unknown backend or
/// environment name, or `max_depth` outside the supported range.
#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl Error for ConfigError {}

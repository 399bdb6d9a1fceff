// src/lib.rs

// Import the top-level `rlm` module.
pub mod rlm;

// Re-exporting key items for easier external access.
pub use rlm::client::{ClientError, ConfigError, LmClient};
pub use rlm::clients;
pub use rlm::config::RlmConfig;
pub use rlm::controller::{CompletionError, Rlm};
pub use rlm::environment::{Environment, EnvironmentError};
pub use rlm::handler::LmHandler;
pub use rlm::types::{
    BindingValue, CodeBlock, CompletionRequest, Message, ModelUsage, NestedCall, Prompt, ReplResult,
    Role, RlmChatCompletion, RlmIteration, TrajectoryMetadata, UsageSummary,
};

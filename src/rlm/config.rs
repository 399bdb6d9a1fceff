//! Ambient defaults for the RLM driver.
//!
//! Mirrors the teacher's own `config.rs`: a plain struct users build however
//! they like, no file-format parsing dependency introduced for it. Per-call
//! overrides (backend, environment kind, `max_iterations`, ...) live on
//! [`crate::controller::Rlm`] itself — this struct only carries the defaults
//! that don't vary per completion.
//!
//! # Example
//!
//! ```rust
//! use rlm::RlmConfig;
//! use std::path::PathBuf;
//!
//! let config = RlmConfig {
//!     trajectory_log_dir: PathBuf::from("/var/log/rlm"),
//!     ..RlmConfig::default()
//! };
//! ```

use std::path::PathBuf;

/// Global defaults for the RLM driver.
pub struct RlmConfig {
    /// Directory [`crate::logger::TrajectoryLogger`] writes `.jsonl` files
    /// to when a completion doesn't specify its own.
    pub trajectory_log_dir: PathBuf,

    /// Default turn budget for [`crate::controller::Rlm::completion`] when
    /// a call doesn't override it (spec.md §3).
    pub default_max_iterations: u32,

    /// Default recursion depth ceiling (spec.md §5).
    pub default_max_depth: u32,

    /// Default cap on concurrently in-flight `llm_query_batched` entries
    /// per LM Handler (spec.md §4.3, §9 Open Question).
    pub default_max_concurrent_subqueries: usize,
}

impl Default for RlmConfig {
    /// `./rlm_trajectories`, 30 turns, depth 1, 8 concurrent sub-queries —
    /// matches the original implementation's own defaults.
    fn default() -> Self {
        Self {
            trajectory_log_dir: PathBuf::from("rlm_trajectories"),
            default_max_iterations: 30,
            default_max_depth: 1,
            default_max_concurrent_subqueries: 8,
        }
    }
}

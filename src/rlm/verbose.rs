//! Optional progress narration for a completion (spec.md §4.7) — thin
//! wrapper over the `log` facade the rest of this crate already uses, so
//! turning it on costs nothing more than an `env_logger` filter change.

use crate::types::RlmIteration;

/// Narrates a completion's turns as they happen. The default impl logs at
/// `info`/`debug` level; callers that want different output (a TUI, a
/// progress bar) implement this trait themselves and pass it to the
/// controller instead.
pub trait VerbosePrinter: Send + Sync {
    fn on_turn_start(&self, turn: u32, max_iterations: u32) {
        log::info!("turn {}/{}", turn, max_iterations);
    }

    fn on_response(&self, response: &str) {
        log::debug!("model response:\n{}", response);
    }

    fn on_code_block(&self, index: usize, code: &str) {
        log::debug!("executing code block {}:\n{}", index, code);
    }

    fn on_iteration_complete(&self, iteration: &RlmIteration) {
        log::debug!(
            "turn complete in {:?}, {} code block(s), final_answer={}",
            iteration.iteration_time,
            iteration.code_blocks.len(),
            iteration.final_answer.is_some()
        );
    }

    fn on_synthesis(&self) {
        log::info!("iteration budget exhausted, synthesizing final answer");
    }
}

/// The default narrator: forwards everything to [`log`] at its default
/// levels and adds nothing else.
pub struct LogVerbosePrinter;

impl VerbosePrinter for LogVerbosePrinter {}

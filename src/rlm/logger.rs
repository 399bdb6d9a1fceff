//! Trajectory Logger: a JSON-lines audit trail of one completion, written
//! to `{name}_{timestamp}_{run_id}.jsonl` (spec.md §4.6).
//!
//! Carried forward despite spec.md framing trajectory logging as outside
//! its immediate scope: it's ambient data-capture infrastructure in the
//! same family as the teacher's own structured logging, not a feature a
//! Non-goal excludes, so the house rule (ambient concerns survive
//! regardless of Non-goals) keeps it in.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

use crate::types::{RlmIteration, TrajectoryMetadata};
use crate::util::filter_sensitive_keys;

#[derive(Debug)]
pub struct LoggerError(pub String);

impl std::fmt::Display for LoggerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "trajectory logger error: {}", self.0)
    }
}

impl std::error::Error for LoggerError {}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record<'a> {
    Metadata {
        run_id: &'a str,
        timestamp: &'a str,
        backend: &'a str,
        backend_options: serde_json::Value,
        environment_type: &'a str,
        environment_options: serde_json::Value,
        max_depth: u32,
        max_iterations: u32,
        root_model: &'a str,
        other_backends: &'a [String],
    },
    Iteration {
        iteration: u32,
        timestamp: &'a str,
        prompt_messages: usize,
        response: &'a str,
        code_block_count: usize,
        iteration_time_secs: f64,
        final_answer: &'a Option<String>,
    },
}

/// Writes one JSON object per line to a file scoped to a single completion.
/// `log_metadata` must be called exactly once, before any `log` call —
/// mirrors the original's "metadata is the first line" convention.
pub struct TrajectoryLogger {
    file: Mutex<std::fs::File>,
    run_id: String,
    next_turn: Mutex<u32>,
}

impl TrajectoryLogger {
    /// Create the log file at `directory/{name}_{timestamp}_{run_id}.jsonl`.
    pub fn new(directory: &Path, name: &str, run_id: &str, timestamp: &str) -> Result<Self, LoggerError> {
        std::fs::create_dir_all(directory)
            .map_err(|e| LoggerError(format!("creating log directory: {}", e)))?;

        let path: PathBuf = directory.join(format!("{}_{}_{}.jsonl", name, timestamp, run_id));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LoggerError(format!("opening {:?}: {}", path, e)))?;

        Ok(Self {
            file: Mutex::new(file),
            run_id: run_id.to_string(),
            next_turn: Mutex::new(1),
        })
    }

    /// Emit the metadata record. Sensitive option keys are stripped before
    /// serialization (spec.md §9).
    pub fn log_metadata(&self, metadata: &TrajectoryMetadata, timestamp: &str) -> Result<(), LoggerError> {
        let record = Record::Metadata {
            run_id: &self.run_id,
            timestamp,
            backend: &metadata.backend,
            backend_options: filter_sensitive_keys(&metadata.backend_options),
            environment_type: &metadata.environment_type,
            environment_options: filter_sensitive_keys(&metadata.environment_options),
            max_depth: metadata.max_depth,
            max_iterations: metadata.max_iterations,
            root_model: &metadata.root_model,
            other_backends: &metadata.other_backends,
        };
        self.write_line(&record)
    }

    /// Emit one iteration record, 1-based and monotonically increasing
    /// regardless of call order (spec.md §4.6 Invariants) — the turn
    /// number is assigned by the logger itself, not passed in. `timestamp`
    /// must be an ISO-8601 local time (spec.md §6), stamped by the caller
    /// at the moment the iteration completed, mirroring how the original
    /// `rlm_logger.py` stamps every `log()` call, not only metadata.
    pub fn log(&self, iteration: &RlmIteration, timestamp: &str) -> Result<(), LoggerError> {
        let turn = {
            let mut next = self.next_turn.lock().unwrap();
            let current = *next;
            *next += 1;
            current
        };

        let record = Record::Iteration {
            iteration: turn,
            timestamp,
            prompt_messages: iteration.prompt.len(),
            response: &iteration.response,
            code_block_count: iteration.code_blocks.len(),
            iteration_time_secs: iteration.iteration_time.as_secs_f64(),
            final_answer: &iteration.final_answer,
        };
        self.write_line(&record)
    }

    fn write_line(&self, record: &impl Serialize) -> Result<(), LoggerError> {
        let mut line =
            serde_json::to_string(record).map_err(|e| LoggerError(format!("serializing record: {}", e)))?;
        line.push('\n');

        let mut file = self.file.lock().unwrap();
        file.write_all(line.as_bytes())
            .map_err(|e| LoggerError(format!("writing trajectory log: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn metadata_then_iterations_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let logger = TrajectoryLogger::new(dir.path(), "rlm", "run-1", "20260101T000000Z").unwrap();

        let metadata = TrajectoryMetadata {
            backend: "mock".to_string(),
            backend_options: serde_json::json!({ "api_key": "sk-secret", "model_name": "m" }),
            environment_type: "local".to_string(),
            environment_options: serde_json::json!({}),
            max_depth: 1,
            max_iterations: 30,
            root_model: "m".to_string(),
            other_backends: vec![],
        };
        logger.log_metadata(&metadata, "20260101T000000Z").unwrap();

        let iteration = RlmIteration {
            prompt: vec![],
            response: "FINAL(done)".to_string(),
            code_blocks: vec![],
            iteration_time: Duration::from_millis(5),
            final_answer: Some("done".to_string()),
        };
        logger.log(&iteration, "2026-01-01T00:00:01-08:00").unwrap();
        logger.log(&iteration, "2026-01-01T00:00:02-08:00").unwrap();

        let path = dir
            .path()
            .join("rlm_20260101T000000Z_run-1.jsonl");
        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(!lines[0].contains("sk-secret"));
        assert!(lines[1].contains("\"iteration\":1"));
        assert!(lines[2].contains("\"iteration\":2"));
    }
}

//! The Iteration Controller: owns one completion end-to-end (spec.md §4.5).
//!
//! Grounded on the teacher's per-call resource scoping in `agent.rs`-style
//! orchestration (spawn collaborators, drive a loop, tear down on every exit
//! path) generalized to this driver's triad: a fresh [`LmHandler`] and
//! [`Environment`] per `completion()` call, a strictly serial turn loop, and
//! unconditional teardown.

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::client::{ClientError, ConfigError, LmClient};
use crate::clients;
use crate::environment::{self, Environment, LmHandlerAddress};
use crate::handler::LmHandler;
use crate::logger::TrajectoryLogger;
use crate::parsing;
use crate::types::{
    CodeBlock, CompletionRequest, Message, Prompt, RlmChatCompletion, RlmIteration,
    TrajectoryMetadata,
};
use crate::util::filter_sensitive_keys;
use crate::verbose::VerbosePrinter;

#[derive(Debug)]
pub enum CompletionError {
    Config(ConfigError),
    Client(ClientError),
    Handler(String),
    Environment(String),
}

impl fmt::Display for CompletionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionError::Config(e) => write!(f, "{}", e),
            CompletionError::Client(e) => write!(f, "{}", e),
            CompletionError::Handler(e) => write!(f, "LM handler error: {}", e),
            CompletionError::Environment(e) => write!(f, "environment error: {}", e),
        }
    }
}

impl Error for CompletionError {}

const DEFAULT_SYSTEM_PROMPT: &str = "You are operating inside a Recursive Language Model driver. \
Respond with a ```repl``` fenced code block to run code against a persistent, stateful evaluator, \
or terminate by writing FINAL(<text>) or FINAL_VAR(<binding name>) at the start of a line. \
Code you run can call llm_query(prompt, model=None) or llm_query_batched(prompts, model=None) to \
delegate sub-questions to a language model. The `context` binding holds the original request.";

/// Configuration for a single controller instance, matching spec.md §4.5's
/// field list one-for-one. Construct with [`Rlm::new`] and the `with_*`
/// builder methods; `completion` is the only entry point.
pub struct Rlm {
    backend: String,
    backend_options: serde_json::Value,
    environment_kind: String,
    environment_options: serde_json::Value,
    auxiliary_backends: Vec<(String, serde_json::Value)>,
    max_depth: u32,
    max_iterations: u32,
    system_prompt: Option<String>,
    logger: Option<Arc<TrajectoryLogger>>,
    verbose: Option<Arc<dyn VerbosePrinter>>,
    max_concurrent_subqueries: usize,
}

impl Rlm {
    /// `max_depth` defaults to 1 (the only supported value; spec.md §7 treats
    /// anything greater as a configuration error), `max_iterations` to 30,
    /// environment kind to `"local"`.
    pub fn new(backend: impl Into<String>, backend_options: serde_json::Value) -> Self {
        Self {
            backend: backend.into(),
            backend_options,
            environment_kind: "local".to_string(),
            environment_options: serde_json::json!({}),
            auxiliary_backends: Vec::new(),
            max_depth: 1,
            max_iterations: 30,
            system_prompt: None,
            logger: None,
            verbose: None,
            max_concurrent_subqueries: 8,
        }
    }

    pub fn with_environment(
        mut self,
        kind: impl Into<String>,
        options: serde_json::Value,
    ) -> Self {
        self.environment_kind = kind.into();
        self.environment_options = options;
        self
    }

    pub fn with_auxiliary_backend(mut self, backend: impl Into<String>, options: serde_json::Value) -> Self {
        self.auxiliary_backends.push((backend.into(), options));
        self
    }

    /// Values greater than 1 are rejected at construction time — depth
    /// greater than 1 is an explicit Non-goal (spec.md §1, §7).
    pub fn with_max_depth(mut self, max_depth: u32) -> Result<Self, ConfigError> {
        if max_depth > 1 {
            return Err(ConfigError(
                "max_depth greater than 1 is not supported".to_string(),
            ));
        }
        self.max_depth = max_depth;
        Ok(self)
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_logger(mut self, logger: Arc<TrajectoryLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_verbose_printer(mut self, verbose: Arc<dyn VerbosePrinter>) -> Self {
        self.verbose = Some(verbose);
        self
    }

    pub fn with_max_concurrent_subqueries(mut self, cap: usize) -> Self {
        self.max_concurrent_subqueries = cap.max(1);
        self
    }

    /// Run one completion to termination (spec.md §4.5 algorithm).
    ///
    /// `current_depth` is always 0 in this build — recursive sub-completions
    /// (depth > 1) are an explicit Non-goal, so the only way the fallback
    /// path in step 1 triggers is `max_depth == 0`.
    pub async fn completion(
        &self,
        prompt: impl Into<CompletionRequest>,
        root_prompt: Option<String>,
    ) -> Result<RlmChatCompletion, CompletionError> {
        let prompt: CompletionRequest = prompt.into();
        let current_depth: u32 = 0;

        if current_depth >= self.max_depth {
            return self.flat_fallback(prompt).await;
        }

        self.run_turn_loop(prompt, root_prompt).await
    }

    async fn flat_fallback(&self, prompt: CompletionRequest) -> Result<RlmChatCompletion, CompletionError> {
        let start = Instant::now();
        let client = clients::create_client(&self.backend, &self.backend_options)
            .map_err(CompletionError::Config)?;

        let (response, _call_usage) = client
            .acompletion(Prompt::from(prompt.clone()))
            .await
            .map_err(CompletionError::Client)?;

        Ok(RlmChatCompletion {
            root_model: client.model_name().to_string(),
            prompt,
            response,
            usage_summary: client.get_usage_summary().await,
            execution_time: start.elapsed(),
        })
    }

    async fn run_turn_loop(
        &self,
        prompt: CompletionRequest,
        root_prompt: Option<String>,
    ) -> Result<RlmChatCompletion, CompletionError> {
        let start = Instant::now();

        let primary = clients::create_client(&self.backend, &self.backend_options)
            .map_err(CompletionError::Config)?;

        let mut auxiliary_clients = Vec::with_capacity(self.auxiliary_backends.len());
        for (name, options) in &self.auxiliary_backends {
            auxiliary_clients.push(clients::create_client(name, options).map_err(CompletionError::Config)?);
        }

        // Resolved before the handler starts: a bad environment kind is a
        // configuration error with nothing yet to tear down. Once the
        // handler exists, every exit path below must stop it (spec.md §8,
        // property 1), so nothing past this point may return early with `?`.
        let environment = environment::create_environment(&self.environment_kind, &self.environment_options)
            .map_err(CompletionError::Config)?;

        let mut handler = LmHandler::start(primary.clone(), auxiliary_clients, self.max_concurrent_subqueries)
            .await
            .map_err(|e| CompletionError::Handler(e.to_string()))?;

        let handler_address = LmHandlerAddress {
            host: handler.host().to_string(),
            port: handler.port(),
        };

        let setup_result = environment.setup(handler_address).await;
        let result = match setup_result {
            Ok(()) => match environment.load_context(&prompt).await {
                Ok(()) => {
                    self.log_metadata(&prompt);
                    self.drive_turns(&*environment, &handler, &*primary, &prompt, root_prompt, start)
                        .await
                }
                Err(e) => Err(CompletionError::Environment(e.to_string())),
            },
            Err(e) => Err(CompletionError::Environment(e.to_string())),
        };

        handler.stop().await;
        environment.cleanup().await;

        result
    }

    fn log_metadata(&self, prompt: &CompletionRequest) {
        let Some(logger) = &self.logger else { return };

        let _ = prompt;
        let metadata = TrajectoryMetadata {
            backend: self.backend.clone(),
            backend_options: filter_sensitive_keys(&self.backend_options),
            environment_type: self.environment_kind.clone(),
            environment_options: filter_sensitive_keys(&self.environment_options),
            max_depth: self.max_depth,
            max_iterations: self.max_iterations,
            root_model: self
                .backend_options
                .get("model_name")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            other_backends: self.auxiliary_backends.iter().map(|(name, _)| name.clone()).collect(),
        };

        let _ = logger.log_metadata(&metadata, &iso_timestamp());
    }

    async fn drive_turns(
        &self,
        environment: &dyn Environment,
        handler: &LmHandler,
        primary: &dyn LmClient,
        prompt: &CompletionRequest,
        root_prompt: Option<String>,
        completion_start: Instant,
    ) -> Result<RlmChatCompletion, CompletionError> {
        let system_prompt = self.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let mut history = vec![Message::system(format!(
            "{}\n\nQuery metadata: {}",
            system_prompt,
            describe_prompt(prompt)
        ))];

        for turn in 0..self.max_iterations {
            let turn_start = Instant::now();
            let mut turn_prompt = history.clone();
            turn_prompt.push(Message::user(per_turn_suffix(root_prompt.as_deref(), turn)));

            if let Some(printer) = &self.verbose {
                printer.on_turn_start(turn, self.max_iterations);
            }

            let (response, call_usage) = primary
                .acompletion(Prompt::Messages(turn_prompt.clone()))
                .await
                .map_err(CompletionError::Client)?;
            handler.record_usage(&call_usage).await;

            if let Some(printer) = &self.verbose {
                printer.on_response(&response);
            }

            let mut code_blocks = Vec::new();
            for (index, code) in parsing::find_code_blocks(&response).into_iter().enumerate() {
                if let Some(printer) = &self.verbose {
                    printer.on_code_block(index, &code);
                }
                let result = environment.execute_code(&code).await;
                code_blocks.push(CodeBlock { code, result });
            }

            let final_answer = parsing::find_final_answer(&response, environment).await;

            let iteration = RlmIteration {
                prompt: turn_prompt,
                response,
                code_blocks,
                iteration_time: turn_start.elapsed(),
                final_answer: final_answer.clone(),
            };

            if let Some(printer) = &self.verbose {
                printer.on_iteration_complete(&iteration);
            }
            if let Some(logger) = &self.logger {
                let _ = logger.log(&iteration, &iso_timestamp());
            }

            if let Some(answer) = final_answer {
                return Ok(RlmChatCompletion {
                    root_model: primary.model_name().to_string(),
                    prompt: prompt.clone(),
                    response: answer,
                    usage_summary: handler.usage_summary().await,
                    execution_time: completion_start.elapsed(),
                });
            }

            for (role, content) in parsing::format_iteration(&iteration) {
                history.push(Message::new(role, content));
            }
        }

        if let Some(printer) = &self.verbose {
            printer.on_synthesis();
        }

        let synth_start = Instant::now();
        let mut synth_prompt = history.clone();
        synth_prompt.push(Message::user(
            "The iteration budget has been exhausted. Based on the conversation so far, \
             provide your best final answer now as plain text.",
        ));

        let (synth_response, synth_call_usage) = primary
            .acompletion(Prompt::Messages(synth_prompt.clone()))
            .await
            .map_err(CompletionError::Client)?;
        handler.record_usage(&synth_call_usage).await;

        let synth_iteration = RlmIteration {
            prompt: synth_prompt,
            response: synth_response.clone(),
            code_blocks: Vec::new(),
            iteration_time: synth_start.elapsed(),
            final_answer: Some(synth_response.clone()),
        };
        if let Some(logger) = &self.logger {
            let _ = logger.log(&synth_iteration, &iso_timestamp());
        }

        Ok(RlmChatCompletion {
            root_model: primary.model_name().to_string(),
            prompt: prompt.clone(),
            response: synth_response,
            usage_summary: handler.usage_summary().await,
            execution_time: completion_start.elapsed(),
        })
    }
}

/// ISO-8601 local timestamp for trajectory log records (spec.md §6).
fn iso_timestamp() -> String {
    chrono::Local::now().to_rfc3339()
}

fn describe_prompt(prompt: &CompletionRequest) -> String {
    match prompt {
        CompletionRequest::Text(s) => format!("type=text, length={} chars", s.chars().count()),
        CompletionRequest::Structured(value) => {
            let shape = match value {
                serde_json::Value::Object(map) => format!("object with {} keys", map.len()),
                serde_json::Value::Array(items) => format!("array with {} items", items.len()),
                _ => "scalar".to_string(),
            };
            format!("type=structured, structure={}", shape)
        }
    }
}

fn per_turn_suffix(root_prompt: Option<&str>, turn_index: u32) -> String {
    let instruction = format!(
        "(turn {}) Continue working the problem. Use a ```repl``` block to run code, \
         or emit FINAL(...)/FINAL_VAR(...) to finish.",
        turn_index
    );
    match root_prompt {
        Some(root) => format!("{}\n\n{}", root, instruction),
        None => instruction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_backend_options() -> serde_json::Value {
        serde_json::json!({ "model_name": "test-model" })
    }

    #[tokio::test]
    async fn s1_happy_path_final_marker() {
        let rlm = Rlm::new("mock", serde_json::json!({ "model_name": "m", "reply": "FINAL(42)" }));
        let result = rlm.completion("Return 42.", None).await.unwrap();
        assert_eq!(result.response, "42");
    }

    #[tokio::test]
    async fn s6_iteration_exhaustion_synthesizes() {
        let rlm = Rlm::new("mock", serde_json::json!({ "model_name": "m", "reply": "no marker here" }))
            .with_max_iterations(2);
        let result = rlm.completion("keep going", None).await.unwrap();
        assert_eq!(result.response, "no marker here");
    }

    #[tokio::test]
    async fn flat_fallback_on_zero_depth() {
        let rlm = Rlm::new("mock", serde_json::json!({ "model_name": "m", "reply": "flat" }))
            .with_max_depth(0)
            .unwrap();
        let result = rlm.completion("anything", None).await.unwrap();
        assert_eq!(result.response, "flat");
    }

    #[test]
    fn rejects_depth_greater_than_one() {
        let rlm = Rlm::new("mock", mock_backend_options());
        let err = rlm.with_max_depth(2).unwrap_err();
        assert!(err.to_string().contains("max_depth"));
    }
}

//! The LM Handler: a loopback HTTP server that lets code running inside an
//! [`Environment`](crate::environment::Environment) issue sub-queries to
//! language models (spec.md §4.3).
//!
//! Modeled on the teacher's `mcp_http_adapter.rs`: bind an ephemeral port on
//! `127.0.0.1`, build an [`axum::Router`], hand the listener to
//! `axum::serve` inside a spawned task, and keep the [`tokio::task::JoinHandle`]
//! as the sole shutdown mechanism. The one addition this driver needs that
//! the teacher's adapter didn't is a concurrency cap on batched fan-out
//! (spec.md §9 Open Question, resolved via a `Semaphore`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::client::LmClient;
use crate::types::{Prompt, UsageSummary};

/// Wire request for `POST /query`.
#[derive(Debug, Deserialize, Serialize)]
pub struct QueryRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// Wire response for `POST /query`.
#[derive(Debug, Deserialize, Serialize)]
pub struct QueryResponse {
    pub response: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub execution_time_ms: u64,
    /// Set when this particular request failed; `response` then holds an
    /// `"Error: ..."` string rather than a model reply. Batched requests
    /// report partial failure per-index this way instead of failing the
    /// whole batch (spec.md §4.2, §4.3 Failure).
    #[serde(default)]
    pub error: Option<String>,
}

impl QueryResponse {
    fn failed(message: String) -> Self {
        Self {
            response: format!("Error: {}", message),
            model: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            execution_time_ms: 0,
            error: Some(message),
        }
    }
}

/// Wire request for `POST /query_batched`: prompts are answered concurrently
/// but returned in the order submitted (spec.md §4.3 Invariants).
#[derive(Debug, Deserialize, Serialize)]
pub struct BatchedQueryRequest {
    pub prompts: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BatchedQueryResponse {
    pub results: Vec<QueryResponse>,
}

struct HandlerState {
    primary: Arc<dyn LmClient>,
    auxiliary: HashMap<String, Arc<dyn LmClient>>,
    concurrency: Arc<Semaphore>,
    usage: Mutex<UsageSummary>,
}

/// Running LM Handler instance: an axum server bound to an ephemeral
/// loopback port, plus the join handle used to tear it down.
pub struct LmHandler {
    state: Arc<HandlerState>,
    join_handle: Option<JoinHandle<()>>,
    host: String,
    port: u16,
}

impl LmHandler {
    /// Bind a fresh ephemeral port, register `primary` as the default
    /// client and `auxiliary` as additional clients keyed by model name
    /// (spec.md §4.3 registry), and start serving in the background.
    ///
    /// `max_concurrent_subqueries` caps how many `llm_query_batched` entries
    /// run at once across every call this handler serves during its
    /// lifetime — not per batch, since an evaluator could in principle issue
    /// overlapping batches.
    pub async fn start(
        primary: Arc<dyn LmClient>,
        auxiliary: Vec<Arc<dyn LmClient>>,
        max_concurrent_subqueries: usize,
    ) -> std::io::Result<Self> {
        let aux_map = auxiliary
            .into_iter()
            .map(|client| (client.model_name().to_string(), client))
            .collect();

        let state = Arc::new(HandlerState {
            primary,
            auxiliary: aux_map,
            concurrency: Arc::new(Semaphore::new(max_concurrent_subqueries.max(1))),
            usage: Mutex::new(UsageSummary::new()),
        });

        let app = Router::new()
            .route("/query", post(handle_query))
            .route("/query_batched", post(handle_query_batched))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;
        log::debug!("LM handler listening on {}", local_addr);

        let join_handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            state,
            join_handle: Some(join_handle),
            host: local_addr.ip().to_string(),
            port: local_addr.port(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Cumulative usage across every sub-query this handler has served,
    /// across every client it holds — folded into the top-level
    /// [`crate::types::RlmChatCompletion::usage_summary`] at completion end.
    pub async fn usage_summary(&self) -> UsageSummary {
        self.state.usage.lock().await.clone()
    }

    /// Merge usage from a call the controller made directly against the
    /// primary client (the outer turn-loop completion, which bypasses this
    /// handler's HTTP surface) so `usage_summary` reflects every call made
    /// during the completion, not only the nested ones routed through
    /// `/query`/`/query_batched` (spec.md §8, property 6).
    pub async fn record_usage(&self, usage: &UsageSummary) {
        self.state.usage.lock().await.merge(usage);
    }

    /// Stop serving. Idempotent — a second call is a no-op.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            handle.abort();
            let _ = handle.await;
            log::debug!("LM handler on {}:{} stopped", self.host, self.port);
        }
    }
}

fn resolve_client(state: &HandlerState, model: Option<&str>) -> Arc<dyn LmClient> {
    match model {
        Some(name) => state
            .auxiliary
            .get(name)
            .cloned()
            .unwrap_or_else(|| state.primary.clone()),
        None => state.primary.clone(),
    }
}

/// Never fails the caller: transport/client errors become a `QueryResponse`
/// with `error` set rather than a propagated `Err`, so a failing entry in a
/// batch never drags the other entries down with it (spec.md §4.3 Failure).
async fn run_one(state: &Arc<HandlerState>, prompt: String, model: Option<String>) -> QueryResponse {
    let _permit = match state.concurrency.acquire().await {
        Ok(permit) => permit,
        Err(e) => return QueryResponse::failed(e.to_string()),
    };

    let client = resolve_client(state, model.as_deref());
    let request_id = Uuid::new_v4();
    let start = Instant::now();
    log::debug!("sub-query {} routed to model {}", request_id, client.model_name());
    // Usage comes back from this specific `acompletion` call, not a
    // separate `get_last_usage()` read afterward — `llm_query_batched` can
    // fan multiple concurrent `run_one` calls out to the same registered
    // client, and a shared "last call" slot would let one task observe
    // another's concurrently-completed write (spec.md §5).
    let (response, call_usage) = match client.acompletion(Prompt::Text(prompt)).await {
        Ok(r) => r,
        Err(e) => return QueryResponse::failed(e.to_string()),
    };
    let elapsed = start.elapsed();

    state.usage.lock().await.merge(&call_usage);

    let (input_tokens, output_tokens, cost) = call_usage
        .per_model
        .get(client.model_name())
        .map(|u| (u.total_input_tokens, u.total_output_tokens, u.cost))
        .unwrap_or((0, 0, 0.0));

    QueryResponse {
        response,
        model: client.model_name().to_string(),
        input_tokens,
        output_tokens,
        cost,
        execution_time_ms: elapsed.as_millis() as u64,
        error: None,
    }
}

async fn handle_query(
    State(state): State<Arc<HandlerState>>,
    Json(request): Json<QueryRequest>,
) -> Json<QueryResponse> {
    Json(run_one(&state, request.prompt, request.model).await)
}

/// Fans every prompt out concurrently and reports failures per index
/// (spec.md §4.3: "partial failure yields per-index error strings, not an
/// aggregate failure"). The envelope itself only fails on malformed input.
async fn handle_query_batched(
    State(state): State<Arc<HandlerState>>,
    Json(request): Json<BatchedQueryRequest>,
) -> Json<BatchedQueryResponse> {
    let futures = request
        .prompts
        .into_iter()
        .map(|prompt| run_one(&state, prompt, request.model.clone()));

    let results = futures_util::future::join_all(futures).await;
    Json(BatchedQueryResponse { results })
}

//! `LocalReplEnvironment`: a non-isolated, persistent Python sandbox backed
//! by an embedded CPython interpreter.
//!
//! Grounded on `other_examples/manifests/annikahannig-rlm-rs`, the one repo
//! in the retrieval pack that rewrites this exact system in Rust and does
//! so by embedding CPython via `pyo3` rather than writing a Rust-native
//! expression evaluator — there is no idiomatic way to reproduce Python's
//! exact `print`/exception/namespace semantics other than running Python.
//!
//! State is held behind `std::sync::Mutex` because every [`Environment`]
//! method takes `&self`: the Iteration Controller shares one instance across
//! a completion's turns without taking `&mut`, matching how the teacher's
//! adapters hand out `Arc<dyn Trait>` handles.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use pyo3::prelude::*;
use pyo3::types::{PyCFunction, PyDict, PyList, PyTuple};
use tokio::sync::Mutex as AsyncMutex;

use crate::environment::{Environment, EnvironmentError, LmHandlerAddress};
use crate::handler::{BatchedQueryRequest, BatchedQueryResponse, QueryRequest, QueryResponse};
use crate::types::{
    BindingValue, CompletionRequest, NestedCall, ReplResult, RlmChatCompletion, UsageSummary,
};

/// `std::env::set_current_dir` is process-global state. Two completions
/// running concurrently, each with its own `LocalReplEnvironment` and its
/// own temp directory, would otherwise race over the working directory
/// during `execute_code`. CPython's GIL already serializes everything else
/// about this sandbox, so serializing the directory swap alongside it is a
/// proportionate fix rather than a new bottleneck.
static CHDIR_LOCK: Lazy<StdMutex<()>> = Lazy::new(|| StdMutex::new(()));

const ALLOWED_BUILTINS: &[&str] = &[
    "abs", "divmod", "pow", "round", "range", "enumerate", "zip", "map", "filter", "sorted",
    "reversed", "sum", "min", "max", "all", "any", "len", "iter", "next", "type", "isinstance",
    "issubclass", "callable", "list", "dict", "set", "frozenset", "tuple", "bytearray", "str",
    "int", "float", "bool", "bytes", "complex", "hash", "getattr", "setattr", "hasattr",
    "delattr", "print", "repr", "format", "open", "__import__", "object", "Exception",
    "ValueError", "TypeError", "KeyError", "IndexError", "ZeroDivisionError", "AttributeError",
    "RuntimeError", "StopIteration", "NameError", "ArithmeticError", "OverflowError",
    "FileNotFoundError", "IOError", "OSError", "NotImplementedError", "AssertionError",
];

/// Present but inert: looking these up resolves to a callable that raises
/// instead of falling through to the real builtin (spec.md §4.2 Invariants
/// — blocked primitives are present, not absent).
const BLOCKED_BUILTINS: &[&str] = &["input", "eval", "exec", "compile", "globals", "locals"];

pub struct LocalReplEnvironment {
    temp_dir: StdMutex<Option<tempfile::TempDir>>,
    globals: StdMutex<Option<Py<PyDict>>>,
    handler: StdMutex<Option<LmHandlerAddress>>,
    execution_lock: AsyncMutex<()>,
}

impl LocalReplEnvironment {
    pub fn new(_options: &serde_json::Value) -> Self {
        Self {
            temp_dir: StdMutex::new(None),
            globals: StdMutex::new(None),
            handler: StdMutex::new(None),
            execution_lock: AsyncMutex::new(()),
        }
    }
}

#[async_trait]
impl Environment for LocalReplEnvironment {
    async fn setup(&self, handler: LmHandlerAddress) -> Result<(), EnvironmentError> {
        let dir = tempfile::Builder::new()
            .prefix("rlm-env-")
            .tempdir()
            .map_err(|e| EnvironmentError(format!("failed to create temp directory: {}", e)))?;

        let globals = Python::with_gil(build_restricted_globals)
            .map_err(|e| EnvironmentError(format!("failed to initialize interpreter: {}", e)))?;

        log::debug!("environment set up in {:?}", dir.path());
        *self.temp_dir.lock().unwrap() = Some(dir);
        *self.globals.lock().unwrap() = Some(globals);
        *self.handler.lock().unwrap() = Some(handler);
        Ok(())
    }

    async fn load_context(&self, payload: &CompletionRequest) -> Result<(), EnvironmentError> {
        let dir = self
            .temp_dir
            .lock()
            .unwrap()
            .as_ref()
            .map(|d| d.path().to_path_buf())
            .ok_or_else(|| EnvironmentError("load_context called before setup".to_string()))?;
        let globals = self
            .globals
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| EnvironmentError("load_context called before setup".to_string()))?;

        match payload {
            CompletionRequest::Text(text) => {
                tokio::fs::write(dir.join("context.txt"), text)
                    .await
                    .map_err(|e| EnvironmentError(format!("writing context.txt: {}", e)))?;
            }
            CompletionRequest::Structured(value) => {
                let serialized = serde_json::to_string(value)
                    .map_err(|e| EnvironmentError(format!("serializing context: {}", e)))?;
                tokio::fs::write(dir.join("context.json"), serialized)
                    .await
                    .map_err(|e| EnvironmentError(format!("writing context.json: {}", e)))?;
            }
        }

        let structured = matches!(payload, CompletionRequest::Structured(_));
        tokio::task::spawn_blocking(move || {
            run_in_sandbox(dir, globals, move |py, globals| {
                (|| -> PyResult<()> {
                    let builtins_any = globals.get_item("__builtins__")?.unwrap();
                    let builtins = builtins_any
                        .downcast::<PyDict>()
                        .map_err(|e| pyo3::exceptions::PyTypeError::new_err(e.to_string()))?;
                    let open_fn = builtins.get_item("open")?.unwrap();

                    if structured {
                        let json_mod = py.import("json")?;
                        let file = open_fn.call1(("context.json",))?;
                        let context = json_mod.call_method1("load", (&file,))?;
                        file.call_method0("close")?;
                        globals.set_item("context", context)?;
                    } else {
                        let file = open_fn.call1(("context.txt",))?;
                        let context = file.call_method0("read")?;
                        file.call_method0("close")?;
                        globals.set_item("context", context)?;
                    }
                    Ok(())
                })()
                .map_err(|e| e.to_string())
            })
        })
        .await
        .map_err(|e| EnvironmentError(format!("sandbox thread panicked: {}", e)))?
        .map_err(EnvironmentError)
    }

    async fn execute_code(&self, code: &str) -> ReplResult {
        let _serialize = self.execution_lock.lock().await;

        let dir = match self
            .temp_dir
            .lock()
            .unwrap()
            .as_ref()
            .map(|d| d.path().to_path_buf())
        {
            Some(d) => d,
            None => return environment_not_ready(),
        };
        let globals = match self.globals.lock().unwrap().clone() {
            Some(g) => g,
            None => return environment_not_ready(),
        };
        let handler = self.handler.lock().unwrap().clone();
        let code = code.to_string();
        let nested_calls: Arc<StdMutex<Vec<NestedCall>>> = Arc::new(StdMutex::new(Vec::new()));
        let nested_for_closures = nested_calls.clone();

        let start = Instant::now();
        let outcome = tokio::task::spawn_blocking(move || {
            run_in_sandbox(dir, globals, move |py, globals| {
                inject_helpers(py, globals, handler.as_ref(), nested_for_closures.clone())
                    .map_err(|e| e.to_string())?;
                execute_with_captured_stdio(py, globals, &code)
            })
        })
        .await;
        let elapsed = start.elapsed();

        let nested = Arc::try_unwrap(nested_calls)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_default();

        match outcome {
            Ok(Ok((stdout, stderr, bindings))) => ReplResult {
                stdout,
                stderr,
                bindings,
                execution_time: elapsed,
                nested_calls: nested,
            },
            Ok(Err(message)) => ReplResult {
                stdout: String::new(),
                stderr: message,
                bindings: HashMap::new(),
                execution_time: elapsed,
                nested_calls: nested,
            },
            Err(join_err) => ReplResult {
                stdout: String::new(),
                stderr: format!("sandbox thread panicked: {}", join_err),
                bindings: HashMap::new(),
                execution_time: elapsed,
                nested_calls: nested,
            },
        }
    }

    async fn cleanup(&self) {
        self.globals.lock().unwrap().take();
        self.handler.lock().unwrap().take();
        if self.temp_dir.lock().unwrap().take().is_some() {
            log::debug!("environment torn down");
        }
    }
}

fn environment_not_ready() -> ReplResult {
    let mut result = ReplResult::empty();
    result.stderr = "RuntimeError: environment used before setup() completed".to_string();
    result
}

fn build_restricted_globals(py: Python<'_>) -> PyResult<Py<PyDict>> {
    let real_builtins = py.import("builtins")?;
    let restricted = PyDict::new(py);

    for name in ALLOWED_BUILTINS {
        if let Ok(value) = real_builtins.getattr(*name) {
            restricted.set_item(*name, value)?;
        }
    }

    let blocked = blocked_sentinel(py)?;
    for name in BLOCKED_BUILTINS {
        restricted.set_item(*name, &blocked)?;
    }

    let globals = PyDict::new(py);
    globals.set_item("__builtins__", restricted)?;
    Ok(globals.unbind())
}

/// A callable that is falsy and raises `PermissionError` when invoked —
/// present in the namespace so `eval`/`exec`/`input`/`compile`/`globals`/
/// `locals` resolve to *something* rather than a `NameError`, matching the
/// original's "blocked, not missing" behavior.
fn blocked_sentinel(py: Python<'_>) -> PyResult<Py<PyAny>> {
    let source = "class _BlockedPrimitive:\n    def __bool__(self):\n        return False\n    def __call__(self, *args, **kwargs):\n        raise PermissionError('this primitive is blocked inside the execution environment')\n_blocked_primitive_instance = _BlockedPrimitive()\n";
    let code = std::ffi::CString::new(source).unwrap();
    let file_name = std::ffi::CString::new("<rlm-sandbox-bootstrap>").unwrap();
    let module_name = std::ffi::CString::new("_rlm_sandbox_bootstrap").unwrap();
    let module = PyModule::from_code(py, &code, &file_name, &module_name)?;
    Ok(module.getattr("_blocked_primitive_instance")?.unbind())
}

/// Bind `FINAL_VAR` (always) and `llm_query`/`llm_query_batched` (when a
/// handler address is known) as closures scoped to this single
/// `execute_code` call, so sub-query records land in `nested_calls` for
/// *this* call only.
fn inject_helpers(
    py: Python<'_>,
    globals: &Bound<PyDict>,
    handler: Option<&LmHandlerAddress>,
    nested_calls: Arc<StdMutex<Vec<NestedCall>>>,
) -> PyResult<()> {
    let globals_for_final_var = globals.clone().unbind();
    let final_var = PyCFunction::new_closure(
        py,
        None,
        None,
        move |args: &Bound<PyTuple>, _kwargs: Option<&Bound<PyDict>>| -> PyResult<Py<PyAny>> {
            Python::with_gil(|py| {
                let name: String = args.get_item(0)?.extract()?;
                let bound = globals_for_final_var.bind(py);
                match bound.get_item(name.as_str())? {
                    Some(value) => Ok(value.unbind()),
                    // A well-formed error string, not `None` (spec.md §4.2,
                    // §7 Marker resolution errors) — `find_final_answer`
                    // resolves this by printing the return value, so a bare
                    // `None` would surface as the ambiguous text "None"
                    // rather than an explicit, recognizable error.
                    None => Ok(pyo3::types::PyString::new(
                        py,
                        &format!("Error: variable '{}' is not defined", name),
                    )
                    .unbind()
                    .into_any()),
                }
            })
        },
    )?;
    globals.set_item("FINAL_VAR", final_var)?;

    if let Some(handler) = handler {
        let address_single = handler.clone();
        let nested_single = nested_calls.clone();
        let llm_query = PyCFunction::new_closure(
            py,
            None,
            None,
            move |args: &Bound<PyTuple>, kwargs: Option<&Bound<PyDict>>| -> PyResult<Py<PyAny>> {
                let prompt: String = args.get_item(0)?.extract()?;
                let model: Option<String> = kwargs
                    .and_then(|k| k.get_item("model").ok().flatten())
                    .and_then(|v| v.extract().ok());

                // Never raises into user code (spec.md §4.2): transport
                // failure becomes an "Error: ..." string reply instead.
                let reply = match call_handler_single(&address_single, &prompt, model.as_deref()) {
                    Ok((reply, nested)) => {
                        nested_single.lock().unwrap().push(nested);
                        reply
                    }
                    Err(message) => format!("Error: {}", message),
                };

                Python::with_gil(|py| {
                    Ok(pyo3::types::PyString::new(py, &reply).unbind().into_any())
                })
            },
        )?;
        globals.set_item("llm_query", llm_query)?;

        let address_batched = handler.clone();
        let nested_batched = nested_calls.clone();
        let llm_query_batched = PyCFunction::new_closure(
            py,
            None,
            None,
            move |args: &Bound<PyTuple>, kwargs: Option<&Bound<PyDict>>| -> PyResult<Py<PyAny>> {
                let prompts: Vec<String> = args.get_item(0)?.extract()?;
                let model: Option<String> = kwargs
                    .and_then(|k| k.get_item("model").ok().flatten())
                    .and_then(|v| v.extract().ok());

                // A transport failure reaching the handler itself (not a
                // per-prompt failure, which the handler already reports as
                // a per-index "Error: ..." reply) still must not raise.
                let replies = match call_handler_batched(&address_batched, &prompts, model.as_deref()) {
                    Ok((replies, nested)) => {
                        nested_batched.lock().unwrap().extend(nested);
                        replies
                    }
                    Err(message) => {
                        let error_reply = format!("Error: {}", message);
                        prompts.iter().map(|_| error_reply.clone()).collect()
                    }
                };

                Python::with_gil(|py| {
                    let list = PyList::new(py, replies.iter().map(|s| s.as_str()))?;
                    Ok(list.unbind().into_any())
                })
            },
        )?;
        globals.set_item("llm_query_batched", llm_query_batched)?;
    }

    Ok(())
}

/// Run `code` with `sys.stdout`/`sys.stderr` swapped for fresh `StringIO`
/// buffers, restoring the originals on every exit path, and return
/// `(stdout, stderr, bindings_snapshot)`. An exception is never propagated
/// to the caller — its class name and message are appended to the
/// captured stderr text instead (spec.md §4.2 Invariants).
fn execute_with_captured_stdio(
    py: Python<'_>,
    globals: &Bound<PyDict>,
    code: &str,
) -> Result<(String, String, HashMap<String, BindingValue>), String> {
    (|| -> PyResult<(String, String, HashMap<String, BindingValue>)> {
        let sys = py.import("sys")?;
        let io = py.import("io")?;
        let stdout_buf = io.call_method0("StringIO")?;
        let stderr_buf = io.call_method0("StringIO")?;
        let previous_stdout = sys.getattr("stdout")?;
        let previous_stderr = sys.getattr("stderr")?;
        sys.setattr("stdout", &stdout_buf)?;
        sys.setattr("stderr", &stderr_buf)?;

        let code_cstring =
            std::ffi::CString::new(code).unwrap_or_else(|_| std::ffi::CString::new("").unwrap());
        let run_result = py.run(&code_cstring, Some(globals), None);

        if let Err(err) = &run_result {
            stderr_buf.call_method1("write", (format!("{}\n", err),))?;
        }

        sys.setattr("stdout", previous_stdout)?;
        sys.setattr("stderr", previous_stderr)?;

        // Strip `_`-prefixed names from the persistent namespace itself, not
        // just from the returned snapshot — otherwise a `_tmp = 5` set this
        // call stays fully readable by the next `execute_code` call, which
        // violates the "skipping names starting with `_`" rule on what gets
        // lifted back into the persistent store (spec.md §4.2, §8 property 3).
        purge_underscore_bindings(globals)?;

        let stdout_text: String = stdout_buf.call_method0("getvalue")?.extract()?;
        let stderr_text: String = stderr_buf.call_method0("getvalue")?.extract()?;
        let bindings = snapshot_bindings(globals)?;

        Ok((stdout_text, stderr_text, bindings))
    })()
    .map_err(|e| e.to_string())
}

/// Remove every `_`-prefixed top-level name from the persistent namespace,
/// except `__builtins__` itself (the evaluator's own bookkeeping entry, not
/// a user binding). Collects names before deleting since mutating a
/// `PyDict` mid-iteration raises.
fn purge_underscore_bindings(globals: &Bound<PyDict>) -> PyResult<()> {
    let mut to_delete = Vec::new();
    for (key, _value) in globals.iter() {
        if let Ok(name) = key.extract::<String>() {
            if name.starts_with('_') && name != "__builtins__" {
                to_delete.push(name);
            }
        }
    }
    for name in to_delete {
        globals.del_item(name)?;
    }
    Ok(())
}

fn snapshot_bindings(globals: &Bound<PyDict>) -> PyResult<HashMap<String, BindingValue>> {
    let mut out = HashMap::new();
    for (key, value) in globals.iter() {
        let name: String = match key.extract() {
            Ok(n) => n,
            Err(_) => continue,
        };
        if name.starts_with('_') || matches!(name.as_str(), "FINAL_VAR" | "llm_query" | "llm_query_batched") {
            continue;
        }
        out.insert(name, pyobject_to_binding(&value));
    }
    Ok(out)
}

fn pyobject_to_binding(obj: &Bound<PyAny>) -> BindingValue {
    if obj.is_none() {
        return BindingValue::None;
    }
    if let Ok(v) = obj.extract::<bool>() {
        return BindingValue::Bool(v);
    }
    if let Ok(v) = obj.extract::<i64>() {
        return BindingValue::Int(v);
    }
    if let Ok(v) = obj.extract::<f64>() {
        return BindingValue::Float(v);
    }
    if let Ok(v) = obj.extract::<String>() {
        return BindingValue::Str(v);
    }
    if let Ok(v) = obj.extract::<Vec<u8>>() {
        return BindingValue::Bytes(v);
    }
    if let Ok(list) = obj.downcast::<PyList>() {
        return BindingValue::List(list.iter().map(|item| pyobject_to_binding(&item)).collect());
    }
    if let Ok(dict) = obj.downcast::<PyDict>() {
        let mut map = HashMap::new();
        for (k, v) in dict.iter() {
            if let Ok(key) = k.extract::<String>() {
                map.insert(key, pyobject_to_binding(&v));
            }
        }
        return BindingValue::Dict(map);
    }
    BindingValue::Other(
        obj.repr()
            .map(|r| r.to_string())
            .unwrap_or_else(|_| "<unrepresentable>".to_string()),
    )
}

/// Enter `dir`, run `body` under the GIL, then restore the previous
/// working directory — guarded by [`CHDIR_LOCK`] since `chdir` is process
/// state. Must be called from a blocking context (`spawn_blocking`), never
/// from an async task directly.
fn run_in_sandbox<R>(
    dir: PathBuf,
    globals: Py<PyDict>,
    body: impl FnOnce(Python<'_>, &Bound<PyDict>) -> Result<R, String>,
) -> Result<R, String> {
    let _guard = CHDIR_LOCK.lock().unwrap();
    let previous_cwd = std::env::current_dir().ok();
    std::env::set_current_dir(&dir)
        .map_err(|e| format!("entering sandbox directory {:?}: {}", dir, e))?;

    let outcome = Python::with_gil(|py| {
        let bound = globals.bind(py);
        body(py, bound)
    });

    if let Some(prev) = previous_cwd {
        let _ = std::env::set_current_dir(prev);
    }

    outcome
}

fn call_handler_single(
    address: &LmHandlerAddress,
    prompt: &str,
    model: Option<&str>,
) -> Result<(String, NestedCall), String> {
    let url = format!("http://{}:{}/query", address.host, address.port);
    let body = QueryRequest {
        prompt: prompt.to_string(),
        model: model.map(|s| s.to_string()),
    };
    let response = reqwest::blocking::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("LM handler returned status {}", response.status()));
    }
    let parsed: QueryResponse = response.json().map_err(|e| e.to_string())?;
    if let Some(message) = parsed.error {
        return Err(message);
    }
    let nested = nested_call_from_response(prompt, model, &parsed);
    Ok((parsed.response, nested))
}

fn call_handler_batched(
    address: &LmHandlerAddress,
    prompts: &[String],
    model: Option<&str>,
) -> Result<(Vec<String>, Vec<NestedCall>), String> {
    let url = format!("http://{}:{}/query_batched", address.host, address.port);
    let body = BatchedQueryRequest {
        prompts: prompts.to_vec(),
        model: model.map(|s| s.to_string()),
    };
    let response = reqwest::blocking::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("LM handler returned status {}", response.status()));
    }
    let parsed: BatchedQueryResponse = response.json().map_err(|e| e.to_string())?;

    // A failed entry's `response` is already an "Error: ..." string
    // (spec.md §4.3: per-index failure, not an aggregate one) and
    // contributes no nested_call, since no sub-completion actually happened.
    let mut replies = Vec::with_capacity(parsed.results.len());
    let mut nested = Vec::new();
    for (prompt, result) in prompts.iter().zip(parsed.results.iter()) {
        replies.push(result.response.clone());
        if result.error.is_none() {
            nested.push(nested_call_from_response(prompt, model, result));
        }
    }
    Ok((replies, nested))
}

fn nested_call_from_response(prompt: &str, model: Option<&str>, response: &QueryResponse) -> NestedCall {
    let mut usage_summary = UsageSummary::new();
    usage_summary.record(
        &response.model,
        response.input_tokens,
        response.output_tokens,
        response.cost,
    );

    NestedCall {
        prompt: prompt.to_string(),
        model: model.map(|s| s.to_string()),
        result: RlmChatCompletion {
            root_model: response.model.clone(),
            prompt: CompletionRequest::Text(prompt.to_string()),
            response: response.response.clone(),
            usage_summary,
            execution_time: Duration::from_millis(response.execution_time_ms),
        },
    }
}

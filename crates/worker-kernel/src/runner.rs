//! One-call code execution on top of [`KernelEngine`].
//!
//! [`CodeRunner::run`] issues a single execute_request and folds everything
//! it displayed into one MIME map, or into an [`ExecutionError`] when the
//! interpreter raised.

use std::borrow::Cow;
use std::sync::{Arc, OnceLock};

use jupyter_protocol::{ErrorOutput, ExecuteRequest};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::KernelEngine;
use crate::error::KernelError;
use crate::protocol::MimeBundle;

/// Key under which [`RunOutput::to_json`] reports an error.
pub const ERROR_KEY: &str = "error";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub name: String,
    pub message: String,
    pub stack: String,
}

impl From<&ErrorOutput> for ExecutionError {
    fn from(error: &ErrorOutput) -> Self {
        Self {
            name: error.ename.clone(),
            message: error.evalue.clone(),
            stack: strip_ansi(&error.traceback.join("\n")).into_owned(),
        }
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutput {
    Data(MimeBundle),
    Error(ExecutionError),
}

impl RunOutput {
    pub fn is_error(&self) -> bool {
        matches!(self, RunOutput::Error(_))
    }

    /// Concatenated `text/plain`, if any was produced.
    pub fn text(&self) -> Option<&str> {
        match self {
            RunOutput::Data(data) => data.get("text/plain").and_then(Value::as_str),
            RunOutput::Error(_) => None,
        }
    }

    /// The MIME map, or `{"error": {name, message, stack}}`.
    pub fn to_json(&self) -> Value {
        match self {
            RunOutput::Data(data) => Value::Object(data.clone()),
            RunOutput::Error(error) => {
                let mut map = MimeBundle::new();
                map.insert(
                    ERROR_KEY.to_string(),
                    serde_json::to_value(error).unwrap_or(Value::Null),
                );
                Value::Object(map)
            }
        }
    }
}

static ANSI_ESCAPE: OnceLock<Option<Regex>> = OnceLock::new();

pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    let pattern = ANSI_ESCAPE.get_or_init(|| {
        // CSI sequences, OSC sequences, then lone two-byte escapes
        Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-_]").ok()
    });
    match pattern {
        Some(pattern) => pattern.replace_all(text, ""),
        None => Cow::Borrowed(text),
    }
}

/// Fold output bundles into one map.
///
/// `text/plain` fragments concatenate in order. A bundle carrying any
/// `image/*` entry first drops `text/html` collected so far. Every other
/// key keeps its latest value, so HTML arriving after an image sits next
/// to it.
pub fn consolidate<'a>(bundles: impl IntoIterator<Item = &'a MimeBundle>) -> MimeBundle {
    let mut merged = MimeBundle::new();
    let mut text = String::new();
    let mut saw_text = false;

    for bundle in bundles {
        if bundle.keys().any(|mime| mime.starts_with("image/")) {
            merged.remove("text/html");
        }
        for (mime, value) in bundle {
            if mime == "text/plain" {
                saw_text = true;
                match value {
                    Value::String(fragment) => text.push_str(fragment),
                    other => text.push_str(&other.to_string()),
                }
            } else {
                merged.insert(mime.clone(), value.clone());
            }
        }
    }

    if saw_text {
        merged.insert("text/plain".to_string(), Value::String(text));
    }
    merged
}

#[derive(Clone)]
pub struct CodeRunner {
    engine: Arc<KernelEngine>,
}

impl CodeRunner {
    pub fn new(engine: Arc<KernelEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<KernelEngine> {
        &self.engine
    }

    /// Run `code` and consolidate what it produced.
    ///
    /// Only this call's outputs are consolidated; nothing carries over from
    /// earlier runs.
    pub async fn run(&self, code: &str) -> Result<RunOutput, KernelError> {
        self.engine.wait_ready().await?;

        let mut request = ExecuteRequest::new(code.to_string());
        request.allow_stdin = true;
        let outcome = self.engine.execute(request).await?;

        if let Some(error) = &outcome.error {
            return Ok(RunOutput::Error(error.into()));
        }
        Ok(RunOutput::Data(consolidate(&outcome.outputs)))
    }
}

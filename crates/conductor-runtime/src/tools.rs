//! Tool runtime contract.
//!
//! Tool steps run in an external sandboxed environment (browser automation,
//! code execution) that enforces its own resource and network isolation.
//! The executor treats it as an opaque governed call with the same
//! retryable/non-retryable classification as the LLM gateway.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use thiserror::Error;

use conductor_core::{ExecutionError, RunId, StepId};

/// Errors from the tool runtime.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("tool execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("tool runtime unavailable: {0}")]
    Unavailable(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool rejected the request: {0}")]
    Rejected(String),

    #[error("tool failed: {0}")]
    Failed(String),
}

lazy_static! {
    /// Failure text the sandbox reports for transient conditions. The
    /// runtime returns free-form error strings, so classification falls
    /// back to pattern matching.
    static ref TRANSIENT_PATTERNS: Regex =
        Regex::new(r"(?i)timeout|timed out|connection|unavailable|rate limit|\b50[234]\b")
            .expect("invalid transient pattern");
}

impl ToolError {
    /// Map into the platform failure taxonomy.
    pub fn classify(&self) -> ExecutionError {
        match self {
            ToolError::Timeout(_) | ToolError::Unavailable(_) => {
                ExecutionError::ToolTransient(self.to_string())
            }
            ToolError::UnknownTool(_) | ToolError::Rejected(_) => {
                ExecutionError::ToolRejected(self.to_string())
            }
            ToolError::Failed(message) => {
                if TRANSIENT_PATTERNS.is_match(message) {
                    ExecutionError::ToolTransient(message.clone())
                } else {
                    ExecutionError::ToolRejected(message.clone())
                }
            }
        }
    }
}

/// One tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub tool: String,
    #[serde(default)]
    pub params: JsonValue,
    pub run_id: RunId,
    pub step_id: StepId,
    /// Hard wall-clock timeout for this execution.
    pub timeout_seconds: u64,
}

/// Completion status the sandbox reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Failed,
}

/// Result of one tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub output: JsonValue,
    /// Storage keys of artifacts the tool produced.
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub status: ToolStatus,
}

/// Contract with the external sandboxed tool runtime.
#[async_trait]
pub trait ToolRuntime: Send + Sync {
    async fn execute(&self, request: ToolRequest) -> Result<ToolOutcome, ToolError>;

    /// Runtime name for logs.
    fn name(&self) -> &str;
}

/// HTTP client for a remote tool runtime.
#[cfg(feature = "tool-http")]
pub struct HttpToolRuntime {
    base_url: String,
}

#[cfg(feature = "tool-http")]
impl HttpToolRuntime {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn client() -> &'static reqwest::Client {
        static CLIENT: std::sync::OnceLock<reqwest::Client> = std::sync::OnceLock::new();
        CLIENT.get_or_init(|| {
            reqwest::Client::builder()
                .build()
                .expect("failed to build HTTP client")
        })
    }
}

#[cfg(feature = "tool-http")]
#[async_trait]
impl ToolRuntime for HttpToolRuntime {
    async fn execute(&self, request: ToolRequest) -> Result<ToolOutcome, ToolError> {
        let timeout = Duration::from_secs(request.timeout_seconds);
        let response = Self::client()
            .post(format!("{}/execute", self.base_url))
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ToolError::Timeout(timeout)
                } else {
                    ToolError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ToolError::UnknownTool(request.tool));
        }
        if status.as_u16() == 422 {
            let message = response.text().await.unwrap_or_default();
            return Err(ToolError::Rejected(message));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ToolError::Failed(format!("{status}: {message}")));
        }

        response
            .json::<ToolOutcome>()
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))
    }

    fn name(&self) -> &str {
        "http"
    }
}

//! Flat record types for persisted traces.

use serde::{Deserialize, Serialize};

/// One row of the traces table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace_id: String,
    pub name: String,
    /// Unix timestamp (milliseconds) when the trace started.
    pub created_at: i64,
    pub input: String,
    pub output: String,
    pub duration_ns: u64,
    pub status_code: Option<u16>,
    pub status: TraceStatus,
    pub session_id: Option<String>,
    pub llm_calls: u64,
    pub tool_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Status of a trace execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    /// Execution completed successfully.
    Success,
    /// Execution failed with an error.
    Error,
    /// Execution is still in progress.
    Running,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceStatus::Success => "success",
            TraceStatus::Error => "error",
            TraceStatus::Running => "running",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "success" => TraceStatus::Success,
            "error" => TraceStatus::Error,
            "running" => TraceStatus::Running,
            _ => TraceStatus::Error,
        }
    }

    /// Derives a status from a step's status code and completion.
    pub fn from_code(status_code: Option<u16>, complete: bool) -> Self {
        match status_code {
            Some(code) if spanwise_core::is_error_status(code) => TraceStatus::Error,
            _ if complete => TraceStatus::Success,
            _ => TraceStatus::Running,
        }
    }
}

/// One row of the spans table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanRecord {
    pub span_id: String,
    pub trace_id: String,
    /// Enclosing span, or the trace id for top-level spans.
    pub parent_id: String,
    /// Span kind (e.g., "llm", "tool", "agent").
    pub kind: String,
    pub name: String,
    pub created_at: i64,
    pub input: String,
    pub output: String,
    pub duration_ns: u64,
    pub status_code: Option<u16>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Query parameters for listing traces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceQuery {
    /// Filter by session.
    pub session_id: Option<String>,
    /// Filter by status.
    pub status: Option<TraceStatus>,
    /// Maximum number of traces to return.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

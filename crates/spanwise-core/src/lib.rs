//! Core domain types and error definitions for spanwise.
//!
//! This crate provides the fundamental types shared across the spanwise crates:
//!
//! - [`TraceError`] — Error type for trace building and ingestion
//! - [`Message`] and [`MessageRole`] — Chat message types recorded on LLM spans
//! - [`ToolCall`] — A tool invocation requested by a model
//! - Value helpers for turning arbitrary JSON into span text
//!
//! # Example
//!
//! ```rust
//! use spanwise_core::{stringify_value, Message, MessageRole};
//!
//! let msg = Message::user("What is 2+2?");
//! assert_eq!(msg.role, MessageRole::User);
//!
//! assert_eq!(stringify_value(&serde_json::Value::Null), "None");
//! ```

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Status code recorded on steps that completed normally.
pub const STATUS_OK: u16 = 200;

/// Status code recorded when no better code can be determined for a failure.
pub const STATUS_FAILURE: u16 = 500;

/// Errors that can occur while building or ingesting traces.
#[derive(Error, Debug)]
pub enum TraceError {
    /// A span was added while no trace is open.
    #[error("A trace needs to be created in order to add a span")]
    NoActiveTrace,

    /// Conclude was called on an empty parent stack.
    #[error("No existing workflow to conclude")]
    NoActiveWorkflow,

    /// The operation is not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The ingestion sink rejected or failed a request.
    #[error("Ingestion failed: {0}")]
    Ingest(String),

    /// All retry attempts against the sink failed.
    #[error("Ingestion failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// A value could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Message from the user.
    User,
    /// Message from the assistant/LLM.
    Assistant,
    /// System instruction.
    System,
    /// Tool call or tool result.
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Tool => "tool",
        }
    }

    /// Maps a host framework role name. Unknown roles are treated as user input.
    pub fn from_host(role: &str) -> Self {
        match role {
            "model" | "assistant" => MessageRole::Assistant,
            "system" => MessageRole::System,
            "tool" => MessageRole::Tool,
            _ => MessageRole::User,
        }
    }
}

/// A single message in a conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message sender.
    pub role: MessageRole,
    /// The content of the message.
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }

    /// Creates a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Creates a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Tool, content)
    }
}

/// A tool invocation requested by a model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Host-assigned call identifier, when the host provides one.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    /// JSON-encoded arguments.
    pub arguments: String,
}

/// Stringifies a metadata value: null becomes `"None"`, strings are kept
/// verbatim and everything else uses its JSON text.
pub fn stringify_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "None".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Serializes a step input or output to text. Strings are kept verbatim so
/// plain answers are not wrapped in quotes.
pub fn serialize_to_str(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Returns true for codes inside the HTTP status range.
pub fn is_http_status(code: i64) -> bool {
    (100..=599).contains(&code)
}

pub fn is_error_status(code: u16) -> bool {
    code >= 400
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

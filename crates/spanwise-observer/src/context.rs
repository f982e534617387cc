//! Typed callback contexts.
//!
//! Host adapters translate their native payloads into these structures once;
//! the observer only ever reads optional fields from them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One piece of a host message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Part {
    Text(String),
    InlineData {
        mime_type: String,
        data: Vec<u8>,
    },
    FileData {
        file_uri: String,
        mime_type: Option<String>,
    },
    FunctionCall {
        id: Option<String>,
        name: String,
        args: Value,
    },
    FunctionResponse {
        id: Option<String>,
        name: String,
        response: Value,
    },
}

/// A host message: a role plus ordered parts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Some("user".into()),
            parts: vec![Part::Text(text.into())],
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: Some("model".into()),
            parts: vec![Part::Text(text.into())],
        }
    }

    /// Text parts joined with a space.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub author: Option<String>,
    pub content: Option<Content>,
    #[serde(default)]
    pub is_final_response: bool,
}

/// Fields shared by every host callback. Every field is optional; missing
/// values degrade the trace, never the callback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallContext {
    pub invocation_id: Option<String>,
    pub session_id: Option<String>,
    pub agent_name: Option<String>,
    /// Ancestors of the current agent, nearest first.
    #[serde(default)]
    pub parent_agents: Vec<String>,
    pub user_message: Option<Content>,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub custom_metadata: BTreeMap<String, Value>,
    /// Host id of the function call a tool callback belongs to.
    pub function_call_id: Option<String>,
}

impl CallContext {
    pub fn new(invocation_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            invocation_id: Some(invocation_id.into()),
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    pub fn with_parent_agents(mut self, parents: Vec<String>) -> Self {
        self.parent_agents = parents;
        self
    }

    pub fn with_user_message(mut self, text: impl Into<String>) -> Self {
        self.user_message = Some(Content::user_text(text));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.custom_metadata.insert(key.into(), value);
        self
    }

    pub fn with_event(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }

    pub fn with_function_call_id(mut self, id: impl Into<String>) -> Self {
        self.function_call_id = Some(id.into());
        self
    }
}

/// A tool as offered to the model in a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    pub request_id: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub contents: Vec<Content>,
    pub system_instruction: Option<String>,
    /// An explicit null and an absent value both stay `None`; neither is
    /// replaced with a default.
    pub temperature: Option<f64>,
    #[serde(default)]
    pub tools: Vec<ToolDeclaration>,
}

/// Token counts as reported by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_token_count: Option<u64>,
    pub candidates_token_count: Option<u64>,
    pub total_token_count: Option<u64>,
    pub thoughts_token_count: Option<u64>,
    pub cached_content_token_count: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub request_id: Option<String>,
    pub content: Option<Content>,
    pub usage: Option<UsageMetadata>,
}

/// The tool a tool callback fires for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: Option<String>,
    /// Host type names of the tool, most derived first.
    #[serde(default)]
    pub type_lineage: Vec<String>,
    /// Capability tags attached to the wrapped function.
    #[serde(default)]
    pub markers: Vec<String>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.markers.push(marker.into());
        self
    }

    pub fn with_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_lineage.push(type_name.into());
        self
    }
}

/// Error code as the host reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Number(i64),
    Text(String),
}

/// An error delivered through `on_model_error` or `on_tool_error`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostError {
    pub message: String,
    pub code: Option<ErrorCode>,
    pub status_code: Option<i64>,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(ErrorCode::Number(code));
        self
    }

    pub fn with_status_code(mut self, status_code: i64) -> Self {
        self.status_code = Some(status_code);
        self
    }
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

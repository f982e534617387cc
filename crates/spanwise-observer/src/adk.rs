//! ADK payload adapter.
//!
//! ADK hands its callbacks loosely shaped objects: the session may sit on the
//! callback context or on `_invocation_context`, the agent hierarchy is a
//! chain of `parent_agent` links, and token counts use several field names.
//! The structures here mirror that JSON and are translated once into the
//! typed contexts the [`Observer`] consumes. [`AdkPlugin`] wraps an observer
//! and accepts raw payloads directly.

use crate::classify::RETRIEVER_MARKER;
use crate::context::{
    CallContext, Content, ErrorCode, Event, HostError, LlmRequest, LlmResponse, Part,
    ToolDeclaration, ToolDescriptor, UsageMetadata,
};
use crate::observer::{Observer, Passthrough};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// ADK's retrieval tool base class.
pub const RETRIEVAL_BASE_TYPE: &str = "BaseRetrievalTool";

// ─────────────────────────────────────────────────────────────────────────────
// Wire structures
// ─────────────────────────────────────────────────────────────────────────────

/// Decodes one field, falling back to its default when the value has the
/// wrong shape. A bad field never takes its siblings down with it.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(&value).unwrap_or_else(|e| {
        tracing::debug!("Ignoring unreadable field: {}", e);
        T::default()
    }))
}

/// Like [`lenient`] for lists, skipping only the unreadable items.
fn lenient_seq<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let Value::Array(items) = Value::deserialize(deserializer)? else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match T::deserialize(item) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::debug!("Skipping unreadable list item: {}", e);
                None
            }
        })
        .collect())
}

#[derive(Debug, Default, Deserialize)]
struct AdkBlob {
    #[serde(default, deserialize_with = "lenient")]
    mime_type: String,
    /// Base64 text.
    #[serde(default, deserialize_with = "lenient")]
    data: String,
}

#[derive(Debug, Default, Deserialize)]
struct AdkFileData {
    #[serde(default, deserialize_with = "lenient")]
    file_uri: String,
    #[serde(default, deserialize_with = "lenient")]
    mime_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AdkFunctionCall {
    #[serde(default, deserialize_with = "lenient")]
    id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    name: String,
    #[serde(default, deserialize_with = "lenient")]
    args: Value,
}

#[derive(Debug, Default, Deserialize)]
struct AdkFunctionResponse {
    #[serde(default, deserialize_with = "lenient")]
    id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    name: String,
    #[serde(default, deserialize_with = "lenient")]
    response: Value,
}

#[derive(Debug, Default, Deserialize)]
struct AdkPart {
    #[serde(default, deserialize_with = "lenient")]
    text: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    inline_data: Option<AdkBlob>,
    #[serde(default, deserialize_with = "lenient")]
    file_data: Option<AdkFileData>,
    #[serde(default, deserialize_with = "lenient")]
    function_call: Option<AdkFunctionCall>,
    #[serde(default, deserialize_with = "lenient")]
    function_response: Option<AdkFunctionResponse>,
}

impl AdkPart {
    fn into_part(self) -> Option<Part> {
        if let Some(text) = self.text {
            return Some(Part::Text(text));
        }
        if let Some(blob) = self.inline_data {
            return match STANDARD.decode(blob.data.as_bytes()) {
                Ok(data) => Some(Part::InlineData {
                    mime_type: blob.mime_type,
                    data,
                }),
                Err(e) => {
                    tracing::debug!("Skipping inline data that is not base64: {}", e);
                    None
                }
            };
        }
        if let Some(file) = self.file_data {
            return Some(Part::FileData {
                file_uri: file.file_uri,
                mime_type: file.mime_type,
            });
        }
        if let Some(call) = self.function_call {
            return Some(Part::FunctionCall {
                id: call.id,
                name: call.name,
                args: call.args,
            });
        }
        self.function_response.map(|r| Part::FunctionResponse {
            id: r.id,
            name: r.name,
            response: r.response,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct AdkContent {
    #[serde(default, deserialize_with = "lenient")]
    role: Option<String>,
    #[serde(default, deserialize_with = "lenient_seq")]
    parts: Vec<AdkPart>,
}

impl AdkContent {
    fn into_content(self) -> Content {
        Content {
            role: self.role,
            parts: self.parts.into_iter().filter_map(AdkPart::into_part).collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AdkEvent {
    #[serde(default, deserialize_with = "lenient")]
    author: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    content: Option<AdkContent>,
    #[serde(default, deserialize_with = "lenient")]
    is_final_response: bool,
}

impl AdkEvent {
    fn into_event(self) -> Event {
        Event {
            author: self.author,
            content: self.content.map(AdkContent::into_content),
            is_final_response: self.is_final_response,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AdkSession {
    #[serde(default, deserialize_with = "lenient")]
    id: Option<String>,
    #[serde(default, deserialize_with = "lenient_seq")]
    events: Vec<AdkEvent>,
}

#[derive(Debug, Default, Deserialize)]
struct AdkAgent {
    #[serde(default, deserialize_with = "lenient")]
    name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    parent_agent: Option<Box<AdkAgent>>,
}

impl AdkAgent {
    fn ancestors(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut next = self.parent_agent.as_deref();
        while let Some(agent) = next {
            if let Some(name) = &agent.name {
                names.push(name.clone());
            }
            next = agent.parent_agent.as_deref();
        }
        names
    }
}

#[derive(Debug, Default, Deserialize)]
struct AdkRunConfig {
    #[serde(default, deserialize_with = "lenient")]
    custom_metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct AdkParentContext {
    #[serde(default, deserialize_with = "lenient")]
    new_message: Option<AdkContent>,
    #[serde(default, deserialize_with = "lenient_seq")]
    events: Vec<AdkEvent>,
}

#[derive(Debug, Default, Deserialize)]
struct AdkInvocationContext {
    #[serde(default, deserialize_with = "lenient")]
    invocation_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    session: Option<AdkSession>,
    #[serde(default, deserialize_with = "lenient")]
    agent: Option<AdkAgent>,
    #[serde(default, deserialize_with = "lenient")]
    run_config: Option<AdkRunConfig>,
    #[serde(default, deserialize_with = "lenient")]
    user_content: Option<AdkContent>,
}

/// Any ADK callback or tool context.
#[derive(Debug, Default, Deserialize)]
struct AdkContext {
    #[serde(default, deserialize_with = "lenient")]
    invocation_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    agent_name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    function_call_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    session: Option<AdkSession>,
    #[serde(default, deserialize_with = "lenient")]
    agent: Option<AdkAgent>,
    #[serde(default, deserialize_with = "lenient")]
    run_config: Option<AdkRunConfig>,
    #[serde(default, deserialize_with = "lenient")]
    user_content: Option<AdkContent>,
    #[serde(default, deserialize_with = "lenient")]
    parent_context: Option<AdkParentContext>,
    #[serde(default, deserialize_with = "lenient", rename = "_invocation_context")]
    invocation_context: Option<AdkInvocationContext>,
}

impl AdkContext {
    fn into_call_context(self) -> CallContext {
        let mut ic = self.invocation_context.unwrap_or_default();
        let agent = self.agent.or(ic.agent.take());
        let mut session = self.session.or(ic.session.take()).unwrap_or_default();
        let mut parent = self.parent_context.unwrap_or_default();

        let events = if session.events.is_empty() {
            std::mem::take(&mut parent.events)
        } else {
            std::mem::take(&mut session.events)
        };
        let user_message = self
            .user_content
            .or(ic.user_content)
            .or(parent.new_message)
            .map(AdkContent::into_content);

        CallContext {
            invocation_id: self.invocation_id.or(ic.invocation_id),
            session_id: session.id,
            agent_name: self
                .agent_name
                .or_else(|| agent.as_ref().and_then(|a| a.name.clone())),
            parent_agents: agent.as_ref().map(AdkAgent::ancestors).unwrap_or_default(),
            user_message,
            events: events.into_iter().map(AdkEvent::into_event).collect(),
            custom_metadata: self
                .run_config
                .or(ic.run_config)
                .map(|r| r.custom_metadata)
                .unwrap_or_default(),
            function_call_id: self.function_call_id,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AdkFunctionDeclaration {
    #[serde(default, deserialize_with = "lenient")]
    name: String,
    #[serde(default, deserialize_with = "lenient")]
    description: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    parameters: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct AdkTool {
    #[serde(default, deserialize_with = "lenient_seq")]
    function_declarations: Vec<AdkFunctionDeclaration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum AdkInstruction {
    #[default]
    Empty,
    Text(String),
    Content(AdkContent),
}

#[derive(Debug, Default, Deserialize)]
struct AdkGenerateConfig {
    /// An explicit null stays `None`.
    #[serde(default, deserialize_with = "lenient")]
    temperature: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    system_instruction: Option<AdkInstruction>,
    #[serde(default, deserialize_with = "lenient_seq")]
    tools: Vec<AdkTool>,
}

#[derive(Debug, Default, Deserialize)]
struct AdkLlmRequest {
    #[serde(default, deserialize_with = "lenient")]
    request_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    model: Option<String>,
    #[serde(default, deserialize_with = "lenient_seq")]
    contents: Vec<AdkContent>,
    #[serde(default, deserialize_with = "lenient")]
    config: Option<AdkGenerateConfig>,
}

impl AdkLlmRequest {
    fn into_request(self) -> LlmRequest {
        let config = self.config.unwrap_or_default();
        let system_instruction = match config.system_instruction {
            Some(AdkInstruction::Text(text)) => Some(text),
            Some(AdkInstruction::Content(content)) => Some(content.into_content().text()),
            Some(AdkInstruction::Empty) | None => None,
        };
        LlmRequest {
            request_id: self.request_id,
            model: self.model,
            contents: self.contents.into_iter().map(AdkContent::into_content).collect(),
            system_instruction,
            temperature: config.temperature,
            tools: config
                .tools
                .into_iter()
                .flat_map(|t| t.function_declarations)
                .map(|d| ToolDeclaration {
                    name: d.name,
                    description: d.description,
                    parameters: d.parameters,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AdkUsage {
    #[serde(default, deserialize_with = "lenient", alias = "input_token_count")]
    prompt_token_count: Option<u64>,
    #[serde(default, deserialize_with = "lenient", alias = "output_token_count")]
    candidates_token_count: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    total_token_count: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    thoughts_token_count: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    cached_content_token_count: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AdkLlmResponse {
    #[serde(default, deserialize_with = "lenient")]
    request_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    content: Option<AdkContent>,
    #[serde(default, deserialize_with = "lenient")]
    usage_metadata: Option<AdkUsage>,
}

impl AdkLlmResponse {
    fn into_response(self) -> LlmResponse {
        LlmResponse {
            request_id: self.request_id,
            content: self.content.map(AdkContent::into_content),
            usage: self.usage_metadata.map(|u| UsageMetadata {
                prompt_token_count: u.prompt_token_count,
                candidates_token_count: u.candidates_token_count,
                total_token_count: u.total_token_count,
                thoughts_token_count: u.thoughts_token_count,
                cached_content_token_count: u.cached_content_token_count,
            }),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AdkToolInfo {
    #[serde(default, deserialize_with = "lenient")]
    name: String,
    #[serde(default, deserialize_with = "lenient")]
    description: Option<String>,
    /// Host type names of the tool, most derived first.
    #[serde(default, deserialize_with = "lenient_seq")]
    type_lineage: Vec<String>,
    /// Set when the wrapped function is marked as a retriever.
    #[serde(default, deserialize_with = "lenient")]
    is_retriever: bool,
}

#[derive(Debug, Default, Deserialize)]
struct AdkError {
    #[serde(default, deserialize_with = "lenient")]
    message: String,
    #[serde(default, deserialize_with = "lenient")]
    code: Option<ErrorCode>,
    #[serde(default, deserialize_with = "lenient")]
    status_code: Option<i64>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Translation
// ─────────────────────────────────────────────────────────────────────────────

fn parse<T: DeserializeOwned + Default>(payload: &Value, what: &str) -> T {
    match T::deserialize(payload) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!(payload = what, "Unreadable payload, using defaults: {}", e);
            T::default()
        }
    }
}

/// Typed context from an ADK callback, tool or invocation context.
pub fn call_context(payload: &Value) -> CallContext {
    parse::<AdkContext>(payload, "context").into_call_context()
}

pub fn llm_request(payload: &Value) -> LlmRequest {
    parse::<AdkLlmRequest>(payload, "llm_request").into_request()
}

pub fn llm_response(payload: &Value) -> LlmResponse {
    parse::<AdkLlmResponse>(payload, "llm_response").into_response()
}

pub fn tool(payload: &Value) -> ToolDescriptor {
    let info = parse::<AdkToolInfo>(payload, "tool");
    ToolDescriptor {
        name: info.name,
        description: info.description,
        type_lineage: info.type_lineage,
        markers: if info.is_retriever {
            vec![RETRIEVER_MARKER.to_string()]
        } else {
            Vec::new()
        },
    }
}

pub fn error(payload: &Value) -> HostError {
    match payload {
        Value::String(message) => HostError::new(message.clone()),
        other => {
            let e = parse::<AdkError>(other, "error");
            HostError {
                message: e.message,
                code: e.code,
                status_code: e.status_code,
            }
        }
    }
}

/// Observer driven by raw ADK payloads.
#[derive(Clone)]
pub struct AdkPlugin {
    observer: Arc<Observer>,
}

impl AdkPlugin {
    pub fn new(observer: Arc<Observer>) -> Self {
        Self { observer }
    }

    pub fn observer(&self) -> &Arc<Observer> {
        &self.observer
    }

    pub async fn on_user_message(&self, invocation_context: &Value) -> Passthrough {
        self.observer.on_user_message(&call_context(invocation_context)).await
    }

    pub async fn before_run(&self, invocation_context: &Value) -> Passthrough {
        self.observer.before_run(&call_context(invocation_context)).await
    }

    pub async fn after_run(&self, invocation_context: &Value) -> Passthrough {
        self.observer.after_run(&call_context(invocation_context)).await
    }

    pub async fn before_agent(&self, callback_context: &Value) -> Passthrough {
        self.observer.before_agent(&call_context(callback_context)).await
    }

    pub async fn after_agent(&self, callback_context: &Value) -> Passthrough {
        self.observer.after_agent(&call_context(callback_context)).await
    }

    pub async fn before_model(&self, callback_context: &Value, request: &Value) -> Passthrough {
        self.observer
            .before_model(&call_context(callback_context), &llm_request(request))
            .await
    }

    pub async fn after_model(&self, callback_context: &Value, response: &Value) -> Passthrough {
        self.observer
            .after_model(&call_context(callback_context), &llm_response(response))
            .await
    }

    pub async fn on_model_error(&self, callback_context: &Value, request: &Value, err: &Value) -> Passthrough {
        self.observer
            .on_model_error(&call_context(callback_context), &llm_request(request), &error(err))
            .await
    }

    pub async fn before_tool(&self, tool_info: &Value, args: &Value, tool_context: &Value) -> Passthrough {
        self.observer
            .before_tool(&call_context(tool_context), &tool(tool_info), args)
            .await
    }

    pub async fn after_tool(
        &self,
        tool_info: &Value,
        args: &Value,
        tool_context: &Value,
        result: &Value,
    ) -> Passthrough {
        self.observer
            .after_tool(&call_context(tool_context), &tool(tool_info), args, result)
            .await
    }

    pub async fn on_tool_error(
        &self,
        tool_info: &Value,
        args: &Value,
        tool_context: &Value,
        err: &Value,
    ) -> Passthrough {
        self.observer
            .on_tool_error(&call_context(tool_context), &tool(tool_info), args, &error(err))
            .await
    }
}

//! OpenAI Agents SDK tracing processor.
//!
//! The SDK reports traces and spans through a processor with four hooks.
//! Each SDK trace becomes a run in a [`NodeGraph`]; each SDK span opens a
//! node under its `parent_id` (or the trace root) and closes when the SDK
//! ends it. Span timestamps come from the SDK, so durations are measured
//! from `started_at`/`ended_at` rather than from arrival time.

use crate::graph::{deliver, Ended, NodeGraph, Step};
use crate::never_raise;
use chrono::{DateTime, NaiveDateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use spanwise_core::{
    serialize_to_str, stringify_value, Message, MessageRole, TraceError, STATUS_FAILURE, STATUS_OK,
};
use spanwise_monitor::{AgentSpan, LlmSpan, Span, ToolSpan, Trace, TraceLogger, WorkflowSpan};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Output given to traces still open at shutdown.
pub const SHUTDOWN_OUTPUT: &str = "interrupted";
/// Output given to traces still open at a forced flush.
pub const FORCE_FLUSH_OUTPUT: &str = "force_flushed";

/// An SDK trace as handed to `on_trace_start`/`on_trace_end`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentsTrace {
    pub trace_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl AgentsTrace {
    pub fn new(trace_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

/// Token counts on a generation span. Older SDKs say `prompt_tokens`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationUsage {
    #[serde(default, alias = "prompt_tokens")]
    pub input_tokens: Option<u64>,
    #[serde(default, alias = "completion_tokens")]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

/// Typed payload of an SDK span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpanData {
    Agent {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        handoffs: Value,
        #[serde(default)]
        tools: Value,
        #[serde(default)]
        output_type: Value,
    },
    Function {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        output: Value,
    },
    Generation {
        #[serde(default)]
        input: Value,
        #[serde(default)]
        output: Value,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        model_config: Value,
        #[serde(default)]
        usage: Option<GenerationUsage>,
    },
    Response {
        #[serde(default)]
        input: Value,
        #[serde(default)]
        response: Value,
    },
    Handoff {
        #[serde(default)]
        from_agent: Option<String>,
        #[serde(default)]
        to_agent: Option<String>,
    },
    Guardrail {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        triggered: bool,
    },
    Custom {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        data: BTreeMap<String, Value>,
    },
    /// A span type this processor does not know.
    #[serde(skip_deserializing)]
    Unknown {
        kind: String,
        name: Option<String>,
    },
}

/// Span data whose type is unknown still yields a name.
#[derive(Deserialize)]
#[serde(untagged)]
enum SpanDataWire {
    Known(SpanData),
    Other {
        #[serde(rename = "type", default)]
        kind: String,
        #[serde(default)]
        name: Option<String>,
    },
}

fn span_data<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SpanData, D::Error> {
    Ok(match SpanDataWire::deserialize(deserializer)? {
        SpanDataWire::Known(data) => data,
        SpanDataWire::Other { kind, name } => SpanData::Unknown { kind, name },
    })
}

impl SpanData {
    /// Display name: the SDK's own name when it has one, else the span type.
    pub fn name(&self) -> String {
        let (own, fallback) = match self {
            SpanData::Agent { name, .. } => (name.as_deref(), "AgentStep"),
            SpanData::Function { name, .. } => (name.as_deref(), "FunctionCall"),
            SpanData::Generation { .. } => (None, "Generation"),
            SpanData::Response { .. } => (None, "Response"),
            SpanData::Handoff { .. } => (None, "Handoff"),
            SpanData::Guardrail { name, .. } => (name.as_deref(), "Guardrail"),
            SpanData::Custom { name, .. } => (name.as_deref(), "CustomStep"),
            SpanData::Unknown { kind, name } => {
                let base = name.clone().unwrap_or_else(|| capitalize(kind));
                return format!("Unknown: {}", base);
            }
        };
        own.unwrap_or(fallback).to_string()
    }

    /// Output and error the span carries when it ends.
    fn output_and_error(&self) -> (String, Option<Value>) {
        match self {
            SpanData::Function { output, .. } | SpanData::Generation { output, .. } => {
                (serialize_to_str(output), None)
            }
            SpanData::Response { response, .. } => {
                let output = response.get("output").cloned().unwrap_or(Value::Null);
                (serialize_to_str(&output), None)
            }
            SpanData::Custom { data, .. } => (
                data.get("output").map(serialize_to_str).unwrap_or_default(),
                data.get("error").cloned(),
            ),
            _ => (String::new(), None),
        }
    }
}

/// Chat messages from a generation input: a message list or plain text.
fn generation_messages(input: &Value) -> Vec<Message> {
    match input {
        Value::Array(items) => items
            .iter()
            .map(|item| {
                let role = item.get("role").and_then(Value::as_str).unwrap_or("user");
                let content = item
                    .get("content")
                    .map(serialize_to_str)
                    .unwrap_or_else(|| serialize_to_str(item));
                Message::new(MessageRole::from_host(role), content)
            })
            .collect(),
        Value::Null => Vec::new(),
        other => vec![Message::user(serialize_to_str(other))],
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => "UnknownStep".to_string(),
    }
}

/// An SDK span as handed to `on_span_start`/`on_span_end`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentsSpan {
    pub span_id: String,
    pub trace_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(deserialize_with = "span_data")]
    pub span_data: SpanData,
}

impl AgentsSpan {
    pub fn new(trace_id: impl Into<String>, span_id: impl Into<String>, span_data: SpanData) -> Self {
        Self {
            span_id: span_id.into(),
            trace_id: trace_id.into(),
            parent_id: None,
            started_at: None,
            ended_at: None,
            error: None,
            span_data,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_times(mut self, started_at: impl Into<String>, ended_at: impl Into<String>) -> Self {
        self.started_at = Some(started_at.into());
        self.ended_at = Some(ended_at.into());
        self
    }

    pub fn with_error(mut self, error: Value) -> Self {
        self.error = Some(error);
        self
    }

    /// Error text, from the span itself or from custom span data.
    fn error_text(&self) -> Option<String> {
        let (_, data_error) = self.span_data.output_and_error();
        self.error
            .clone()
            .filter(|e| !e.is_null())
            .or(data_error.filter(|e| !e.is_null()))
            .map(|e| serialize_to_str(&e))
    }

    fn duration_ns(&self) -> Option<u64> {
        let started = parse_timestamp(self.started_at.as_deref()?)?;
        let ended = parse_timestamp(self.ended_at.as_deref()?)?;
        let nanos = (ended - started).num_nanoseconds()?;
        u64::try_from(nanos).ok()
    }

    fn base_metadata(&self) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        metadata.insert("agent_span_id".to_string(), self.span_id.clone());
        metadata.insert("agent_trace_id".to_string(), self.trace_id.clone());
        if let Some(parent) = &self.parent_id {
            metadata.insert("parent_span_id".to_string(), parent.clone());
        }
        metadata
    }

    /// The span this SDK span opens as.
    fn to_span(&self) -> Span {
        let name = self.span_data.name();
        let mut metadata = self.base_metadata();
        let mut span = match &self.span_data {
            SpanData::Agent {
                handoffs,
                tools,
                output_type,
                ..
            } => {
                metadata.insert("tools".into(), serialize_to_str(tools));
                metadata.insert("handoffs".into(), serialize_to_str(handoffs));
                metadata.insert("output_type".into(), serialize_to_str(output_type));
                Span::Agent(AgentSpan::new(name, "Agent Step Start"))
            }
            SpanData::Function { input, .. } => Span::Tool(ToolSpan::new(name, serialize_to_str(input))),
            SpanData::Generation {
                input,
                model,
                model_config,
                usage,
                ..
            } => {
                metadata.insert("model_config".into(), serialize_to_str(model_config));
                let mut llm = LlmSpan::new(name, generation_messages(input));
                llm.model = model.clone();
                if let Some(tokens) = usage.as_ref().and_then(|u| u.input_tokens) {
                    llm.usage.input_tokens = tokens;
                }
                Span::Llm(llm)
            }
            SpanData::Response { input, .. } => Span::Workflow(WorkflowSpan::new(name, serialize_to_str(input))),
            SpanData::Handoff { from_agent, to_agent } => {
                metadata.insert("from_agent".into(), from_agent.clone().unwrap_or_else(|| "None".into()));
                metadata.insert("to_agent".into(), to_agent.clone().unwrap_or_else(|| "None".into()));
                Span::Workflow(WorkflowSpan::new(name, "Handoff Start"))
            }
            SpanData::Guardrail { triggered, .. } => {
                metadata.insert("triggered".into(), triggered.to_string());
                Span::Workflow(WorkflowSpan::new(name, "Guardrail Check"))
            }
            SpanData::Custom { data, .. } => {
                for (key, value) in data {
                    if !matches!(key.as_str(), "input" | "output" | "metadata" | "metrics") {
                        metadata.insert(format!("custom_{}", key), stringify_value(value));
                    }
                }
                if let Some(Value::Object(extra)) = data.get("metadata") {
                    for (key, value) in extra {
                        metadata.insert(key.clone(), stringify_value(value));
                    }
                }
                let input = data
                    .get("input")
                    .map(serialize_to_str)
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "Custom Step Start".into());
                Span::Workflow(WorkflowSpan::new(name, input))
            }
            SpanData::Unknown { kind, .. } => {
                tracing::warn!(span_type = %kind, span_id = %self.span_id, "Unknown span type");
                Span::Workflow(WorkflowSpan::new(name, "Unknown Step Start"))
            }
        };
        let base = span.base_mut();
        base.user_metadata = metadata;
        if let Some(started) = self.started_at.as_deref().and_then(parse_timestamp) {
            base.created_at = started.timestamp_millis();
        }
        span
    }
}

/// Parses an SDK timestamp. Offsetless ISO timestamps are read as UTC.
fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f").map(|dt| dt.and_utc()))
        .map_err(|e| tracing::debug!(timestamp = ts, "Unreadable timestamp: {}", e))
        .ok()
}

/// Maps OpenAI Agents SDK traces and spans onto traces.
pub struct AgentsTracingProcessor {
    logger: Arc<TraceLogger>,
    graph: Mutex<NodeGraph>,
    /// SDK trace id to run node id.
    traces: DashMap<String, Uuid>,
    /// SDK span id to node id, for spans still open.
    spans: DashMap<String, Uuid>,
    flush_on_commit: bool,
}

impl AgentsTracingProcessor {
    pub fn new(logger: Arc<TraceLogger>) -> Self {
        Self {
            logger,
            graph: Mutex::new(NodeGraph::new()),
            traces: DashMap::new(),
            spans: DashMap::new(),
            flush_on_commit: true,
        }
    }

    pub fn with_flush_on_commit(mut self, enabled: bool) -> Self {
        self.flush_on_commit = enabled;
        self
    }

    pub fn open_nodes(&self) -> usize {
        self.graph().len()
    }

    pub fn open_traces(&self) -> usize {
        self.traces.len()
    }

    fn graph(&self) -> MutexGuard<'_, NodeGraph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn on_trace_start(&self, trace: &AgentsTrace) {
        never_raise("on_trace_start", async {
            self.trace_started(trace);
            Ok(())
        })
        .await;
    }

    pub async fn on_trace_end(&self, trace: &AgentsTrace) {
        never_raise("on_trace_end", self.trace_ended(trace)).await;
    }

    pub async fn on_span_start(&self, span: &AgentsSpan) {
        never_raise("on_span_start", async {
            self.span_started(span);
            Ok(())
        })
        .await;
    }

    pub async fn on_span_end(&self, span: &AgentsSpan) {
        never_raise("on_span_end", self.span_ended(span)).await;
    }

    /// Concludes every open trace as interrupted, then flushes.
    pub async fn shutdown(&self) {
        tracing::info!(open = self.traces.len(), "Agents processor shutting down");
        never_raise("shutdown", self.conclude_open(SHUTDOWN_OUTPUT)).await;
    }

    /// Concludes every open trace, then flushes.
    pub async fn force_flush(&self) {
        tracing::info!(open = self.traces.len(), "Agents processor force flush");
        never_raise("force_flush", self.conclude_open(FORCE_FLUSH_OUTPUT)).await;
    }

    fn trace_started(&self, trace: &AgentsTrace) {
        if self.traces.contains_key(&trace.trace_id) {
            tracing::debug!(trace_id = %trace.trace_id, "Trace already started");
            return;
        }
        let name = trace
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "Unnamed Agent Trace".to_string());
        let mut metadata: BTreeMap<String, String> = trace
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), stringify_value(v)))
            .collect();
        metadata.insert("agent_trace_id".into(), trace.trace_id.clone());
        if let Some(group) = &trace.group_id {
            metadata.insert("group_id".into(), group.clone());
        }
        metadata.insert("integration".into(), "openai_agents".into());

        let id = Uuid::new_v4();
        let run = Trace::new(name.clone()).with_name(name).with_metadata(metadata);
        self.graph().start(id, None, Step::Run(run));
        self.traces.insert(trace.trace_id.clone(), id);
        tracing::debug!(trace_id = %trace.trace_id, run_id = %id, "Agents trace started");
    }

    async fn trace_ended(&self, trace: &AgentsTrace) -> Result<(), TraceError> {
        let Some((_, root)) = self.traces.remove(&trace.trace_id) else {
            tracing::warn!(trace_id = %trace.trace_id, "Trace end for an unknown trace");
            return Ok(());
        };
        let output = trace.name.clone().unwrap_or_default();
        self.end_trace(root, output, self.flush_on_commit).await
    }

    /// Closes whatever the trace left open as failed, then commits it.
    async fn end_trace(&self, root: Uuid, output: String, flush: bool) -> Result<(), TraceError> {
        let (orphans, owned) = {
            let graph = self.graph();
            (graph.open_subtree(root), graph.subtree(root))
        };
        let owned: HashSet<Uuid> = owned.into_iter().collect();
        self.spans.retain(|_, id| !owned.contains(id));
        for id in orphans {
            tracing::debug!(node_id = %id, "Closing span left open by trace");
            self.end_node(id, STATUS_FAILURE, flush, |_| {}).await?;
        }
        self.end_node(root, STATUS_OK, flush, move |step| step.set_output(output))
            .await
    }

    fn span_started(&self, span: &AgentsSpan) {
        let Some(root) = self.traces.get(&span.trace_id).map(|id| *id) else {
            tracing::warn!(trace_id = %span.trace_id, span_id = %span.span_id, "Span start for an unknown trace");
            return;
        };
        let parent = span
            .parent_id
            .as_ref()
            .and_then(|p| self.spans.get(p).map(|id| *id))
            .unwrap_or(root);
        let id = Uuid::new_v4();
        if self.graph().start(id, Some(parent), Step::Span(span.to_span())) {
            self.spans.insert(span.span_id.clone(), id);
            tracing::debug!(span_id = %span.span_id, node_id = %id, "Agents span started");
        }
    }

    async fn span_ended(&self, span: &AgentsSpan) -> Result<(), TraceError> {
        if !self.traces.contains_key(&span.trace_id) {
            tracing::warn!(trace_id = %span.trace_id, span_id = %span.span_id, "Span end for an unknown trace");
            return Ok(());
        }
        let Some((_, id)) = self.spans.remove(&span.span_id) else {
            tracing::debug!(span_id = %span.span_id, "Span end without a matching start");
            return Ok(());
        };

        let (output, _) = span.span_data.output_and_error();
        let error = span.error_text();
        let status = if error.is_some() { STATUS_FAILURE } else { STATUS_OK };
        let output = match error {
            Some(error) if output.is_empty() => format!("Error: {}", error),
            Some(error) => format!("{} (Error: {})", output, error),
            None => output,
        };
        let duration = span.duration_ns();
        let usage = match &span.span_data {
            SpanData::Generation { usage, .. } => usage.clone(),
            _ => None,
        };

        self.end_node(id, status, self.flush_on_commit, move |step| {
            // Agent and handoff spans carry no output of their own.
            if !output.is_empty() {
                step.set_output(output);
            }
            if let Some(duration) = duration {
                step.base_mut().duration_ns = Some(duration);
            }
            if let (Some(usage), Step::Span(Span::Llm(llm))) = (usage, step) {
                llm.usage.output_tokens = usage.output_tokens.unwrap_or(llm.usage.output_tokens);
                llm.usage.total_tokens = usage
                    .total_tokens
                    .unwrap_or(llm.usage.input_tokens + llm.usage.output_tokens);
            }
        })
        .await
    }

    async fn end_node(
        &self,
        id: Uuid,
        status_code: u16,
        flush: bool,
        finish: impl FnOnce(&mut Step),
    ) -> Result<(), TraceError> {
        let ended = self.graph().end(id, status_code, finish)?;
        if let Ended::Committed(trace) = ended {
            deliver(&self.logger, trace, None, flush).await?;
        }
        Ok(())
    }

    async fn conclude_open(&self, output: &str) -> Result<(), TraceError> {
        let open: Vec<(String, Uuid)> = self.traces.iter().map(|e| (e.key().clone(), *e.value())).collect();
        let mut first_error = None;
        for (trace_id, root) in open {
            if self.traces.remove(&trace_id).is_none() {
                continue;
            }
            tracing::warn!(trace_id = %trace_id, output, "Concluding open trace");
            if let Err(e) = self.end_trace(root, output.to_string(), false).await {
                first_error.get_or_insert(e);
            }
        }
        if self.flush_on_commit {
            self.logger.flush().await?;
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spanwise_config::LoggerConfig;
    use spanwise_monitor::{MemorySink, StepKind};

    fn processor() -> (AgentsTracingProcessor, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let config = LoggerConfig::new().with_project("p").with_log_stream("s");
        let logger = TraceLogger::new(config, sink.clone()).unwrap();
        (AgentsTracingProcessor::new(Arc::new(logger)), sink)
    }

    fn agent(name: &str) -> SpanData {
        SpanData::Agent {
            name: Some(name.into()),
            handoffs: json!(["billing"]),
            tools: json!(["lookup"]),
            output_type: json!("str"),
        }
    }

    #[tokio::test]
    async fn test_agent_run_becomes_trace() {
        let (processor, sink) = processor();
        let trace = AgentsTrace::new("trace_1", "Support flow");
        let triage = AgentsSpan::new("trace_1", "span_a", agent("triage"));
        let generation = AgentsSpan::new(
            "trace_1",
            "span_g",
            SpanData::Generation {
                input: json!([{"role": "system", "content": "be brief"}, {"role": "user", "content": "refund?"}]),
                output: json!("calling lookup"),
                model: Some("gpt-4o".into()),
                model_config: json!({"temperature": 0.2}),
                usage: Some(GenerationUsage {
                    input_tokens: Some(12),
                    output_tokens: Some(3),
                    total_tokens: None,
                }),
            },
        )
        .with_parent("span_a")
        .with_times("2025-03-01T10:00:00.000000+00:00", "2025-03-01T10:00:01.500000+00:00");
        let lookup = AgentsSpan::new(
            "trace_1",
            "span_f",
            SpanData::Function {
                name: Some("lookup".into()),
                input: json!("{\"order\": 7}"),
                output: json!("shipped"),
            },
        )
        .with_parent("span_a");

        processor.on_trace_start(&trace).await;
        processor.on_span_start(&triage).await;
        processor.on_span_start(&generation).await;
        processor.on_span_end(&generation).await;
        processor.on_span_start(&lookup).await;
        processor.on_span_end(&lookup).await;
        processor.on_span_end(&triage).await;
        processor.on_trace_end(&trace).await;

        let traces = sink.traces();
        assert_eq!(traces.len(), 1);
        let trace = &traces[0];
        assert_eq!(trace.base.name, "Support flow");
        assert_eq!(trace.input, "Support flow");
        assert_eq!(trace.base.user_metadata["agent_trace_id"], "trace_1");

        let kinds: Vec<StepKind> = trace.flatten().iter().map(|(_, s)| s.kind()).collect();
        assert_eq!(kinds, vec![StepKind::Agent, StepKind::Llm, StepKind::Tool]);

        let Span::Agent(triage) = &trace.spans[0] else {
            panic!("expected agent span");
        };
        assert_eq!(triage.base.name, "triage");
        assert_eq!(triage.input, "Agent Step Start");
        assert_eq!(triage.base.user_metadata["tools"], "[\"lookup\"]");

        let Span::Llm(llm) = &triage.spans[0] else {
            panic!("expected llm span");
        };
        assert_eq!(llm.input.len(), 2);
        assert_eq!(llm.model.as_deref(), Some("gpt-4o"));
        assert_eq!(llm.base.duration_ns, Some(1_500_000_000));
        assert_eq!(llm.usage.input_tokens, 12);
        assert_eq!(llm.usage.output_tokens, 3);
        assert_eq!(llm.usage.total_tokens, 15);
        assert_eq!(llm.base.user_metadata["parent_span_id"], "span_a");

        let tool = trace.flatten()[2].1;
        assert_eq!(tool.name(), "lookup");
        assert_eq!(tool.output_text().as_deref(), Some("shipped"));
        assert_eq!(tool.base().status_code, Some(STATUS_OK));

        assert_eq!(processor.open_nodes(), 0);
        assert_eq!(processor.open_traces(), 0);
    }

    #[tokio::test]
    async fn test_span_error_fails_the_span() {
        let (processor, sink) = processor();
        let trace = AgentsTrace::new("t", "flow");
        let call = AgentsSpan::new(
            "t",
            "f",
            SpanData::Function {
                name: None,
                input: json!({}),
                output: json!("partial"),
            },
        )
        .with_error(json!({"message": "tool crashed"}));

        processor.on_trace_start(&trace).await;
        processor.on_span_start(&call).await;
        processor.on_span_end(&call).await;
        processor.on_trace_end(&trace).await;

        let traces = sink.traces();
        let tool = traces[0].flatten()[0].1;
        assert_eq!(tool.name(), "FunctionCall");
        assert_eq!(tool.base().status_code, Some(STATUS_FAILURE));
        assert_eq!(
            tool.output_text().as_deref(),
            Some("partial (Error: {\"message\":\"tool crashed\"})")
        );
    }

    #[tokio::test]
    async fn test_open_spans_fail_when_trace_ends() {
        let (processor, sink) = processor();
        let trace = AgentsTrace::new("t", "flow");
        processor.on_trace_start(&trace).await;
        processor.on_span_start(&AgentsSpan::new("t", "a", agent("triage"))).await;
        processor
            .on_span_start(
                &AgentsSpan::new(
                    "t",
                    "h",
                    SpanData::Handoff {
                        from_agent: Some("triage".into()),
                        to_agent: Some("billing".into()),
                    },
                )
                .with_parent("a"),
            )
            .await;
        processor.on_trace_end(&trace).await;

        let traces = sink.traces();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].base.status_code, Some(STATUS_OK));
        for (_, span) in traces[0].flatten() {
            assert_eq!(span.base().status_code, Some(STATUS_FAILURE), "{}", span.name());
        }
        let handoff = traces[0].flatten()[1].1;
        assert_eq!(handoff.base().user_metadata["to_agent"], "billing");
        assert_eq!(processor.open_nodes(), 0);

        // The spans were forgotten with their trace.
        processor.on_span_end(&AgentsSpan::new("t", "a", agent("triage"))).await;
        assert_eq!(sink.traces().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_trace_is_ignored() {
        let (processor, sink) = processor();
        let span = AgentsSpan::new("missing", "s", agent("x"));
        processor.on_span_start(&span).await;
        processor.on_span_end(&span).await;
        processor.on_trace_end(&AgentsTrace::new("missing", "x")).await;
        assert!(sink.traces().is_empty());
        assert_eq!(processor.open_nodes(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_concludes_open_traces() {
        let (processor, sink) = processor();
        processor.on_trace_start(&AgentsTrace::new("t1", "one")).await;
        processor.on_trace_start(&AgentsTrace::new("t2", "two")).await;
        processor.on_span_start(&AgentsSpan::new("t2", "a", agent("worker"))).await;

        processor.shutdown().await;

        let traces = sink.traces();
        assert_eq!(traces.len(), 2);
        assert!(traces.iter().all(|t| t.output.as_deref() == Some(SHUTDOWN_OUTPUT)));
        assert_eq!(processor.open_traces(), 0);
        assert_eq!(processor.open_nodes(), 0);
    }

    #[test]
    fn test_span_json_shape() {
        let span: AgentsSpan = serde_json::from_value(json!({
            "span_id": "s",
            "trace_id": "t",
            "span_data": {"type": "custom", "name": "retrieval", "data": {"input": "q", "hits": 3, "metadata": {"index": "docs"}}}
        }))
        .unwrap();
        let built = span.to_span();
        assert_eq!(built.name(), "retrieval");
        assert_eq!(built.input_text(), "q");
        assert_eq!(built.base().user_metadata["custom_hits"], "3");
        assert_eq!(built.base().user_metadata["index"], "docs");

        let unknown: AgentsSpan = serde_json::from_value(json!({
            "span_id": "s",
            "trace_id": "t",
            "span_data": {"type": "mcp_tools"}
        }))
        .unwrap();
        assert_eq!(unknown.span_data.name(), "Unknown: Mcp_tools");
        assert_eq!(unknown.to_span().input_text(), "Unknown Step Start");
    }

    #[test]
    fn test_timestamps_without_offset() {
        let span = AgentsSpan::new("t", "s", agent("a")).with_times("2025-03-01T10:00:00", "2025-03-01T10:00:00.250");
        assert_eq!(span.duration_ns(), Some(250_000_000));
        let bad = AgentsSpan::new("t", "s", agent("a")).with_times("yesterday", "2025-03-01T10:00:00");
        assert_eq!(bad.duration_ns(), None);
    }
}

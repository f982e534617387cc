//! Span and trace types.
//!
//! A [`Trace`] is the root of a tree of [`Span`]s. Workflow, agent and tool
//! spans may hold children; LLM and retriever spans are always leaves.

use serde::{Deserialize, Serialize};
use spanwise_core::{now_ms, Message, ToolCall};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Fields shared by every step (trace or span).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepBase {
    pub id: Uuid,
    pub name: String,
    /// Unix timestamp (milliseconds) when the step was opened.
    pub created_at: i64,
    #[serde(default)]
    pub duration_ns: Option<u64>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub user_metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub step_number: Option<u32>,
}

impl StepBase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: now_ms(),
            duration_ns: None,
            status_code: None,
            user_metadata: BTreeMap::new(),
            tags: Vec::new(),
            step_number: None,
        }
    }
}

/// Kind of a step, used for lookups and persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Trace,
    Llm,
    Tool,
    Retriever,
    Workflow,
    Agent,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Trace => "trace",
            StepKind::Llm => "llm",
            StepKind::Tool => "tool",
            StepKind::Retriever => "retriever",
            StepKind::Workflow => "workflow",
            StepKind::Agent => "agent",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "trace" => Some(StepKind::Trace),
            "llm" => Some(StepKind::Llm),
            "tool" => Some(StepKind::Tool),
            "retriever" => Some(StepKind::Retriever),
            "workflow" => Some(StepKind::Workflow),
            "agent" => Some(StepKind::Agent),
            _ => None,
        }
    }
}

/// Token counts reported for one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
}

/// A retrieved document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSpan {
    #[serde(flatten)]
    pub base: StepBase,
    pub input: Vec<Message>,
    #[serde(default)]
    pub output: Option<Message>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Tool definitions offered to the model, normalized to function schemas.
    #[serde(default)]
    pub tools: Vec<serde_json::Value>,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl LlmSpan {
    pub fn new(name: impl Into<String>, input: Vec<Message>) -> Self {
        Self {
            base: StepBase::new(name),
            input,
            output: None,
            tool_calls: Vec::new(),
            model: None,
            temperature: None,
            tools: Vec::new(),
            usage: TokenUsage::default(),
        }
    }

    pub fn with_output(mut self, output: Message) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// A tool call. Tools that run nested agent invocations carry child spans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpan {
    #[serde(flatten)]
    pub base: StepBase,
    pub input: String,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub spans: Vec<Span>,
}

impl ToolSpan {
    pub fn new(name: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            base: StepBase::new(name),
            input: input.into(),
            output: None,
            tool_call_id: None,
            spans: Vec::new(),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieverSpan {
    #[serde(flatten)]
    pub base: StepBase,
    pub input: String,
    #[serde(default)]
    pub output: Vec<Document>,
}

impl RetrieverSpan {
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            base: StepBase::new(name),
            input: query.into(),
            output: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpan {
    #[serde(flatten)]
    pub base: StepBase,
    pub input: String,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub spans: Vec<Span>,
}

impl WorkflowSpan {
    pub fn new(name: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            base: StepBase::new(name),
            input: input.into(),
            output: None,
            spans: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpan {
    #[serde(flatten)]
    pub base: StepBase,
    pub input: String,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub spans: Vec<Span>,
}

impl AgentSpan {
    pub fn new(name: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            base: StepBase::new(name),
            input: input.into(),
            output: None,
            spans: Vec::new(),
        }
    }
}

/// A node in the trace tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Span {
    Llm(LlmSpan),
    Tool(ToolSpan),
    Retriever(RetrieverSpan),
    Workflow(WorkflowSpan),
    Agent(AgentSpan),
}

impl Span {
    pub fn base(&self) -> &StepBase {
        match self {
            Span::Llm(s) => &s.base,
            Span::Tool(s) => &s.base,
            Span::Retriever(s) => &s.base,
            Span::Workflow(s) => &s.base,
            Span::Agent(s) => &s.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut StepBase {
        match self {
            Span::Llm(s) => &mut s.base,
            Span::Tool(s) => &mut s.base,
            Span::Retriever(s) => &mut s.base,
            Span::Workflow(s) => &mut s.base,
            Span::Agent(s) => &mut s.base,
        }
    }

    pub fn id(&self) -> Uuid {
        self.base().id
    }

    pub fn name(&self) -> &str {
        &self.base().name
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Span::Llm(_) => StepKind::Llm,
            Span::Tool(_) => StepKind::Tool,
            Span::Retriever(_) => StepKind::Retriever,
            Span::Workflow(_) => StepKind::Workflow,
            Span::Agent(_) => StepKind::Agent,
        }
    }

    /// Workflow and agent spans become the current parent when added.
    pub fn opens_scope(&self) -> bool {
        matches!(self, Span::Workflow(_) | Span::Agent(_))
    }

    pub fn children(&self) -> Option<&[Span]> {
        match self {
            Span::Tool(s) => Some(&s.spans),
            Span::Workflow(s) => Some(&s.spans),
            Span::Agent(s) => Some(&s.spans),
            Span::Llm(_) | Span::Retriever(_) => None,
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<Span>> {
        match self {
            Span::Tool(s) => Some(&mut s.spans),
            Span::Workflow(s) => Some(&mut s.spans),
            Span::Agent(s) => Some(&mut s.spans),
            Span::Llm(_) | Span::Retriever(_) => None,
        }
    }

    /// Input rendered as text.
    pub fn input_text(&self) -> String {
        match self {
            Span::Llm(s) => serde_json::to_string(&s.input).unwrap_or_default(),
            Span::Tool(s) => s.input.clone(),
            Span::Retriever(s) => s.input.clone(),
            Span::Workflow(s) => s.input.clone(),
            Span::Agent(s) => s.input.clone(),
        }
    }

    /// Output rendered as text, if one was recorded.
    pub fn output_text(&self) -> Option<String> {
        match self {
            Span::Llm(s) => s.output.as_ref().map(|m| m.content.clone()),
            Span::Tool(s) => s.output.clone(),
            Span::Retriever(s) if s.output.is_empty() => None,
            Span::Retriever(s) => serde_json::to_string(&s.output).ok(),
            Span::Workflow(s) => s.output.clone(),
            Span::Agent(s) => s.output.clone(),
        }
    }

    pub fn set_output_text(&mut self, output: String) {
        match self {
            Span::Llm(s) => s.output = Some(Message::assistant(output)),
            Span::Tool(s) => s.output = Some(output),
            Span::Workflow(s) => s.output = Some(output),
            Span::Agent(s) => s.output = Some(output),
            Span::Retriever(_) => {}
        }
    }

    /// Own output, else the last child's output, recursively.
    pub fn last_output(&self) -> Option<String> {
        self.output_text().or_else(|| {
            self.children()
                .and_then(|c| c.last())
                .and_then(Span::last_output)
        })
    }

    fn visit<'a>(&'a self, parent: Uuid, out: &mut Vec<(Uuid, &'a Span)>) {
        out.push((parent, self));
        for child in self.children().unwrap_or_default() {
            child.visit(self.id(), out);
        }
    }
}

/// The root of a tree of spans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    #[serde(flatten)]
    pub base: StepBase,
    pub input: String,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub spans: Vec<Span>,
}

impl Trace {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            base: StepBase::new("trace"),
            input: input.into(),
            output: None,
            spans: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.base.name = name.into();
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.base.user_metadata = metadata;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.base.tags = tags;
        self
    }

    pub fn id(&self) -> Uuid {
        self.base.id
    }

    /// Own output, else the last child's output.
    pub fn last_output(&self) -> Option<String> {
        self.output
            .clone()
            .or_else(|| self.spans.last().and_then(Span::last_output))
    }

    /// All spans in depth-first order, paired with their parent id.
    pub fn flatten(&self) -> Vec<(Uuid, &Span)> {
        let mut out = Vec::new();
        for span in &self.spans {
            span.visit(self.id(), &mut out);
        }
        out
    }

    pub fn find(&self, id: Uuid) -> Option<&Span> {
        self.flatten()
            .into_iter()
            .map(|(_, span)| span)
            .find(|span| span.id() == id)
    }

    pub fn span_count(&self) -> usize {
        self.flatten().len()
    }

    pub fn summary(&self) -> TraceSummary {
        let mut summary = TraceSummary::default();
        for (_, span) in self.flatten() {
            match span {
                Span::Llm(llm) => {
                    summary.llm_calls += 1;
                    summary.input_tokens += llm.usage.input_tokens;
                    summary.output_tokens += llm.usage.output_tokens;
                }
                Span::Tool(_) | Span::Retriever(_) => summary.tool_calls += 1,
                Span::Workflow(_) | Span::Agent(_) => {}
            }
        }
        summary
    }
}

/// Aggregated counts for one trace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub llm_calls: u64,
    pub tool_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TraceSummary {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

//! Parent-stack trace construction.
//!
//! A [`TraceBuilder`] owns the stack of open steps for the trace it is
//! building. The bottom entry is always the trace itself. Workflow and agent
//! spans are pushed when added, leaf spans attach to the current top, and
//! [`TraceBuilder::conclude`] pops the top and attaches it to the new top.
//! A finished trace moves to the builder's completed list.

use crate::span::{AgentSpan, LlmSpan, RetrieverSpan, Span, StepKind, ToolSpan, Trace, WorkflowSpan};
use spanwise_core::TraceError;
use std::time::Instant;
use uuid::Uuid;

/// Snapshot of an open step on the parent stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRef {
    pub id: Uuid,
    pub name: String,
    pub kind: StepKind,
}

/// Values applied to a step when it is concluded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conclusion {
    pub output: Option<String>,
    pub status_code: Option<u16>,
    pub duration_ns: Option<u64>,
}

impl Conclusion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn duration_ns(mut self, duration_ns: u64) -> Self {
        self.duration_ns = Some(duration_ns);
        self
    }
}

/// What a single conclude step produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcludedStep {
    pub step: StepRef,
    pub trace_id: Uuid,
    pub output: Option<String>,
    pub status_code: Option<u16>,
    pub duration_ns: Option<u64>,
    /// Set when the concluded step was the trace itself.
    pub trace_complete: bool,
}

enum Frame {
    Trace(Trace, Instant),
    Span(Span, Instant),
}

impl Frame {
    fn step_ref(&self) -> StepRef {
        match self {
            Frame::Trace(t, _) => StepRef {
                id: t.id(),
                name: t.base.name.clone(),
                kind: StepKind::Trace,
            },
            Frame::Span(s, _) => StepRef {
                id: s.id(),
                name: s.name().to_string(),
                kind: s.kind(),
            },
        }
    }

    fn children_mut(&mut self) -> Option<&mut Vec<Span>> {
        match self {
            Frame::Trace(t, _) => Some(&mut t.spans),
            Frame::Span(s, _) => s.children_mut(),
        }
    }

    fn apply(&mut self, conclusion: &Conclusion) -> (Option<String>, Option<u16>, Option<u64>) {
        match self {
            Frame::Trace(t, started) => {
                if let Some(output) = &conclusion.output {
                    t.output = Some(output.clone());
                } else if t.output.is_none() {
                    t.output = t.last_output();
                }
                apply_base(&mut t.base, conclusion, *started);
                (t.output.clone(), t.base.status_code, t.base.duration_ns)
            }
            Frame::Span(s, started) => {
                if let Some(output) = &conclusion.output {
                    s.set_output_text(output.clone());
                } else if s.output_text().is_none() {
                    if let Some(fallback) = s.last_output() {
                        s.set_output_text(fallback);
                    }
                }
                apply_base(s.base_mut(), conclusion, *started);
                (s.output_text(), s.base().status_code, s.base().duration_ns)
            }
        }
    }
}

fn apply_base(base: &mut crate::span::StepBase, conclusion: &Conclusion, started: Instant) {
    if let Some(code) = conclusion.status_code {
        base.status_code = Some(code);
    }
    if let Some(duration) = conclusion.duration_ns {
        base.duration_ns = Some(duration);
    } else if base.duration_ns.is_none() {
        base.duration_ns = Some(started.elapsed().as_nanos() as u64);
    }
}

/// Builds traces through a stack of open parents.
#[derive(Default)]
pub struct TraceBuilder {
    stack: Vec<Frame>,
    completed: Vec<Trace>,
}

impl TraceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new trace as the sole stack entry. A trace that is still open
    /// is concluded first.
    pub fn start_trace(&mut self, trace: Trace) -> Uuid {
        if !self.stack.is_empty() {
            tracing::warn!(
                open_steps = self.stack.len(),
                "Starting a trace while another is open, concluding it"
            );
            self.close_all(&Conclusion::default());
        }
        let id = trace.id();
        self.stack.push(Frame::Trace(trace, Instant::now()));
        id
    }

    /// Adds a span under the current parent. Workflow and agent spans become
    /// the new current parent.
    pub fn add_span(&mut self, span: Span) -> Result<Uuid, TraceError> {
        if span.opens_scope() {
            self.open_span(span)
        } else {
            self.attach(span)
        }
    }

    /// Adds a span and makes it the current parent. Used for tool spans that
    /// wrap nested invocations.
    pub fn open_span(&mut self, span: Span) -> Result<Uuid, TraceError> {
        if span.children().is_none() {
            return Err(TraceError::InvalidState(format!(
                "{} spans cannot hold children",
                span.kind().as_str()
            )));
        }
        if self.stack.is_empty() {
            return Err(TraceError::NoActiveTrace);
        }
        let id = span.id();
        self.stack.push(Frame::Span(span, Instant::now()));
        Ok(id)
    }

    fn attach(&mut self, span: Span) -> Result<Uuid, TraceError> {
        let id = span.id();
        let top = self.stack.last_mut().ok_or(TraceError::NoActiveTrace)?;
        let children = top
            .children_mut()
            .ok_or_else(|| TraceError::InvalidState("current parent cannot hold children".into()))?;
        children.push(span);
        Ok(id)
    }

    pub fn add_llm_span(&mut self, span: LlmSpan) -> Result<Uuid, TraceError> {
        self.add_span(Span::Llm(span))
    }

    pub fn add_tool_span(&mut self, span: ToolSpan) -> Result<Uuid, TraceError> {
        self.add_span(Span::Tool(span))
    }

    pub fn add_retriever_span(&mut self, span: RetrieverSpan) -> Result<Uuid, TraceError> {
        self.add_span(Span::Retriever(span))
    }

    pub fn add_workflow_span(&mut self, span: WorkflowSpan) -> Result<Uuid, TraceError> {
        self.add_span(Span::Workflow(span))
    }

    pub fn add_agent_span(&mut self, span: AgentSpan) -> Result<Uuid, TraceError> {
        self.add_span(Span::Agent(span))
    }

    /// Top of the parent stack.
    pub fn current_parent(&self) -> Option<StepRef> {
        self.stack.last().map(Frame::step_ref)
    }

    /// Second entry from the top of the parent stack.
    pub fn previous_parent(&self) -> Option<StepRef> {
        self.stack
            .len()
            .checked_sub(2)
            .and_then(|i| self.stack.get(i))
            .map(Frame::step_ref)
    }

    pub fn current_trace_id(&self) -> Option<Uuid> {
        match self.stack.first() {
            Some(Frame::Trace(t, _)) => Some(t.id()),
            _ => None,
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_idle(&self) -> bool {
        self.stack.is_empty()
    }

    /// Pops the current parent and returns the new one.
    pub fn conclude(&mut self, conclusion: Conclusion) -> Result<Option<StepRef>, TraceError> {
        self.conclude_step(&conclusion)?;
        Ok(self.current_parent())
    }

    /// Concludes every open step, including the trace.
    pub fn conclude_all(&mut self, conclusion: Conclusion) -> Result<Option<StepRef>, TraceError> {
        if self.stack.is_empty() {
            return Err(TraceError::NoActiveWorkflow);
        }
        self.close_all(&conclusion);
        Ok(None)
    }

    /// Concludes every open step, returning what each pop produced.
    pub fn close_all(&mut self, conclusion: &Conclusion) -> Vec<ConcludedStep> {
        let mut steps = Vec::new();
        while let Ok(step) = self.conclude_step(conclusion) {
            steps.push(step);
        }
        steps
    }

    /// Pops the top of the stack and attaches it to the new top.
    pub fn conclude_step(&mut self, conclusion: &Conclusion) -> Result<ConcludedStep, TraceError> {
        let trace_id = self.current_trace_id();
        let mut frame = self.stack.pop().ok_or(TraceError::NoActiveWorkflow)?;
        let step = frame.step_ref();
        let (output, status_code, duration_ns) = frame.apply(conclusion);

        let trace_complete = match frame {
            Frame::Trace(trace, _) => {
                tracing::debug!(trace_id = %trace.id(), spans = trace.span_count(), "Trace concluded");
                self.completed.push(trace);
                true
            }
            Frame::Span(span, _) => {
                let parent = self
                    .stack
                    .last_mut()
                    .and_then(Frame::children_mut)
                    .ok_or_else(|| TraceError::InvalidState("concluded span has no parent".into()))?;
                parent.push(span);
                false
            }
        };

        Ok(ConcludedStep {
            step,
            trace_id: trace_id.unwrap_or_default(),
            output,
            status_code,
            duration_ns,
            trace_complete,
        })
    }

    /// Removes and returns all traces concluded so far.
    pub fn take_completed(&mut self) -> Vec<Trace> {
        std::mem::take(&mut self.completed)
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    /// Drops every open step and completed trace.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.completed.clear();
    }
}

//! Run-id keyed node graph.
//!
//! Callbacks open and close nodes in whatever order the host delivers them.
//! Each node remembers its parent and its children in start order. When a
//! root node ends, its subtree is replayed through a fresh [`TraceBuilder`]
//! so the committed trace follows the parent-stack discipline, then the
//! subtree is dropped from the graph.

use spanwise_core::TraceError;
use spanwise_monitor::{
    Conclusion, SessionRef, Span, StepBase, Trace, TraceBuilder, TraceLogger, WorkflowSpan,
};
use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;

/// Payload of a node: a run (trace root) or a span.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Run(Trace),
    Span(Span),
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Step::Run(t) => &t.base.name,
            Step::Span(s) => s.name(),
        }
    }

    pub fn set_output(&mut self, output: String) {
        match self {
            Step::Run(t) => t.output = Some(output),
            Step::Span(s) => s.set_output_text(output),
        }
    }

    fn set_id(&mut self, id: Uuid) {
        match self {
            Step::Run(t) => t.base.id = id,
            Step::Span(s) => s.base_mut().id = id,
        }
    }

    pub fn base_mut(&mut self) -> &mut StepBase {
        match self {
            Step::Run(t) => &mut t.base,
            Step::Span(s) => s.base_mut(),
        }
    }
}

struct Node {
    step: Step,
    parent: Option<Uuid>,
    children: Vec<Uuid>,
    started: Instant,
    ended: bool,
}

/// Result of [`NodeGraph::end`].
#[derive(Debug)]
pub enum Ended {
    /// No node with that id is open.
    Missing,
    /// The node closed; its root is still open.
    Closed,
    /// The node was a root; its whole subtree was assembled into a trace.
    Committed(Trace),
}

/// Open nodes for every run in flight, keyed by node id.
#[derive(Default)]
pub struct NodeGraph {
    nodes: HashMap<Uuid, Node>,
}

impl NodeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a node. An unknown parent makes the node a root of its own.
    /// Returns false if the id is already taken.
    pub fn start(&mut self, id: Uuid, parent: Option<Uuid>, mut step: Step) -> bool {
        if self.nodes.contains_key(&id) {
            tracing::debug!(node_id = %id, "Node already started");
            return false;
        }
        let parent = match parent {
            Some(p) if self.nodes.contains_key(&p) => Some(p),
            Some(p) => {
                tracing::debug!(node_id = %id, parent_id = %p, "Parent is not open, starting a new root");
                None
            }
            None => None,
        };
        if let Some(p) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            p.children.push(id);
        }
        step.set_id(id);
        self.nodes.insert(
            id,
            Node {
                step,
                parent,
                children: Vec::new(),
                started: Instant::now(),
                ended: false,
            },
        );
        true
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn is_open(&self, id: Uuid) -> bool {
        self.nodes.get(&id).is_some_and(|n| !n.ended)
    }

    pub fn step(&self, id: Uuid) -> Option<&Step> {
        self.nodes.get(&id).map(|n| &n.step)
    }

    /// Applies `update` to an open node. Returns false if it is unknown.
    pub fn update(&mut self, id: Uuid, update: impl FnOnce(&mut Step)) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) => {
                update(&mut node.step);
                true
            }
            None => false,
        }
    }

    /// Closes a node with a status code after `finish` has filled in its
    /// output. A duration set by `finish` is kept, otherwise the time since
    /// start is used. Closing a root commits its subtree.
    pub fn end(
        &mut self,
        id: Uuid,
        status_code: u16,
        finish: impl FnOnce(&mut Step),
    ) -> Result<Ended, TraceError> {
        let Some(node) = self.nodes.get_mut(&id) else {
            return Ok(Ended::Missing);
        };
        if node.ended {
            tracing::debug!(node_id = %id, "Node already ended");
            return Ok(Ended::Closed);
        }
        finish(&mut node.step);
        let elapsed = node.started.elapsed().as_nanos() as u64;
        let base = node.step.base_mut();
        base.status_code = Some(status_code);
        base.duration_ns = Some(base.duration_ns.unwrap_or(elapsed));
        node.ended = true;

        if node.parent.is_some() {
            return Ok(Ended::Closed);
        }
        self.commit(id).map(Ended::Committed)
    }

    /// Open descendants of `id`, not counting `id` itself.
    pub fn open_descendants(&self, id: Uuid) -> usize {
        let Some(node) = self.nodes.get(&id) else {
            return 0;
        };
        node.children
            .iter()
            .map(|c| usize::from(self.is_open(*c)) + self.open_descendants(*c))
            .sum()
    }

    /// Descendants of `id`, children before their parents.
    pub fn subtree(&self, id: Uuid) -> Vec<Uuid> {
        let mut ids = Vec::new();
        self.collect_subtree(id, &mut ids);
        ids
    }

    fn collect_subtree(&self, id: Uuid, ids: &mut Vec<Uuid>) {
        let Some(node) = self.nodes.get(&id) else { return };
        for child in &node.children {
            self.collect_subtree(*child, ids);
            ids.push(*child);
        }
    }

    /// Open descendants of `id`, innermost first.
    pub fn open_subtree(&self, id: Uuid) -> Vec<Uuid> {
        self.subtree(id).into_iter().filter(|c| self.is_open(*c)).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn commit(&mut self, root: Uuid) -> Result<Trace, TraceError> {
        let node = self
            .nodes
            .remove(&root)
            .ok_or_else(|| TraceError::InvalidState(format!("root {} is not in the graph", root)))?;

        let mut builder = TraceBuilder::new();
        match node.step {
            Step::Run(trace) => {
                builder.start_trace(trace);
                for child in node.children {
                    self.replay(child, &mut builder)?;
                }
            }
            Step::Span(span) => {
                // A root that is not a run still needs a trace around it.
                let mut trace = Trace::new(span.input_text()).with_name(span.name());
                trace.base.user_metadata = span.base().user_metadata.clone();
                trace.output = span.output_text();
                trace.base.status_code = span.base().status_code;
                trace.base.duration_ns = span.base().duration_ns;
                builder.start_trace(trace);
                self.replay_leaf_or_scope(span, node.children, None, &mut builder)?;
            }
        }
        builder.conclude(Conclusion::new())?;

        builder
            .take_completed()
            .pop()
            .ok_or_else(|| TraceError::InvalidState("commit produced no trace".into()))
    }

    fn replay(&mut self, id: Uuid, builder: &mut TraceBuilder) -> Result<(), TraceError> {
        let Some(node) = self.nodes.remove(&id) else {
            return Ok(());
        };
        let open_for = (!node.ended).then(|| node.started.elapsed().as_nanos() as u64);
        let span = match node.step {
            Step::Span(span) => span,
            // A run nested under a tool is a sub-invocation.
            Step::Run(trace) => Span::Workflow(WorkflowSpan {
                base: trace.base,
                input: trace.input,
                output: trace.output,
                spans: trace.spans,
            }),
        };
        self.replay_leaf_or_scope(span, node.children, open_for, builder)
    }

    fn replay_leaf_or_scope(
        &mut self,
        mut span: Span,
        children: Vec<Uuid>,
        open_for: Option<u64>,
        builder: &mut TraceBuilder,
    ) -> Result<(), TraceError> {
        if span.base().duration_ns.is_none() {
            span.base_mut().duration_ns = open_for;
        }
        if span.children().is_none() || (!span.opens_scope() && children.is_empty()) {
            builder.add_span(span)?;
            // Leaf kinds cannot hold children; hoist them to the current parent.
            for child in children {
                self.replay(child, builder)?;
            }
            return Ok(());
        }
        builder.open_span(span)?;
        for child in children {
            self.replay(child, builder)?;
        }
        builder.conclude(Conclusion::new())?;
        Ok(())
    }
}

/// Hands a committed trace to the logger and optionally flushes it.
pub(crate) async fn deliver(
    logger: &TraceLogger,
    trace: Trace,
    session: Option<SessionRef>,
    flush: bool,
) -> Result<(), TraceError> {
    tracing::debug!(trace_id = %trace.id(), spans = trace.span_count(), "Committing trace");
    match session {
        Some(session) => logger.submit_trace_in(trace, session).await?,
        None => logger.submit_trace(trace).await?,
    }
    if flush {
        logger.flush().await?;
    }
    Ok(())
}

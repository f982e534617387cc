//! Host callback observer.
//!
//! Every public callback returns `None` (no override of host behaviour) and
//! never propagates an error or a panic: failures are logged and the trace
//! is left as complete as it can be.

use crate::classify::{ToolClass, ToolClassifier};
use crate::context::{CallContext, Content, HostError, LlmRequest, LlmResponse, ToolDescriptor};
use crate::convert::{
    documents, final_output, normalize_tools, request_messages, response_output, retriever_query,
    stringify_metadata, usage,
};
use crate::graph::{deliver, Ended, NodeGraph, Step};
use crate::never_raise;
use crate::status::extract_status_code;
use crate::tracker::{ParentQuery, Tracker};
use dashmap::DashMap;
use serde_json::{json, Value};
use spanwise_config::ObserverConfig;
use spanwise_core::{serialize_to_str, TraceError, STATUS_FAILURE, STATUS_OK};
use spanwise_monitor::{
    AgentSpan, LlmSpan, RetrieverSpan, SessionRef, Span, ToolSpan, Trace, TraceLogger,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Session id used when the host does not provide one.
pub const UNKNOWN_SESSION: &str = "unknown";

const AGENT_INPUT_PLACEHOLDER: &str = "Agent invocation";

/// Callback return value: always `None`.
pub type Passthrough = Option<Value>;

/// How [`Observer`] closes what is left of an invocation.
struct Sweep {
    orphan_status: u16,
    orphan_output: Option<String>,
    run_status: u16,
    run_output: Option<String>,
}

fn session_of(ctx: &CallContext) -> String {
    ctx.session_id
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| UNKNOWN_SESSION.to_string())
}

fn run_name(agent: &str) -> String {
    format!("invocation [{}]", agent)
}

fn tool_key(name: &str, function_call_id: Option<&str>) -> String {
    match function_call_id {
        Some(id) => format!("{}:{}", name, id),
        None => name.to_string(),
    }
}

/// Turns host callbacks into traces.
pub struct Observer {
    logger: Arc<TraceLogger>,
    config: ObserverConfig,
    tracker: Tracker,
    graph: Mutex<NodeGraph>,
    classifier: ToolClassifier,
    tool_classes: DashMap<String, ToolClass>,
    /// Host session id to backend session id.
    sessions: DashMap<String, String>,
    /// Backend session mapped most recently, linked as the next one's predecessor.
    last_session: Mutex<Option<String>>,
    /// Backend session each open run is ingested under.
    run_sessions: DashMap<Uuid, SessionRef>,
}

impl Observer {
    pub fn new(logger: Arc<TraceLogger>) -> Self {
        Self {
            logger,
            config: ObserverConfig::default(),
            tracker: Tracker::new(),
            graph: Mutex::new(NodeGraph::new()),
            classifier: ToolClassifier::new(),
            tool_classes: DashMap::new(),
            sessions: DashMap::new(),
            last_session: Mutex::new(None),
            run_sessions: DashMap::new(),
        }
    }

    pub fn with_config(mut self, config: ObserverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_classifier(mut self, classifier: ToolClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    pub fn logger(&self) -> &Arc<TraceLogger> {
        &self.logger
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Backend session a host session was mapped to.
    pub fn backend_session(&self, host_session: &str) -> Option<String> {
        self.sessions.get(host_session).map(|id| id.value().clone())
    }

    /// Nodes still held for runs that have not committed.
    pub fn open_nodes(&self) -> usize {
        self.graph().len()
    }

    /// Classifies a tool once and caches the result by name.
    pub fn register_tool(&self, tool: &ToolDescriptor) -> ToolClass {
        *self
            .tool_classes
            .entry(tool.name.clone())
            .or_insert_with(|| {
                let class = self.classifier.classify(tool);
                tracing::debug!(tool = %tool.name, class = class.as_str(), "Registered tool");
                class
            })
    }

    fn graph(&self) -> MutexGuard<'_, NodeGraph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn invocation_of(&self, ctx: &CallContext) -> String {
        if let Some(id) = ctx.invocation_id.as_deref().filter(|s| !s.is_empty()) {
            return id.to_string();
        }
        let generated = match ctx.session_id.as_deref() {
            Some(session) => format!("{}_{}", session, Uuid::new_v4()),
            None => Uuid::new_v4().to_string(),
        };
        tracing::debug!(invocation_id = %generated, "Context has no invocation id, generated one");
        generated
    }

    fn metadata_for(&self, invocation_id: &str, session_id: &str) -> BTreeMap<String, String> {
        self.tracker.get_invocation_metadata(invocation_id, session_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Callbacks
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn on_user_message(&self, ctx: &CallContext) -> Passthrough {
        never_raise("on_user_message", async {
            let inv = self.invocation_of(ctx);
            self.start_invocation(ctx, &inv).await
        })
        .await
    }

    pub async fn before_run(&self, ctx: &CallContext) -> Passthrough {
        never_raise("before_run", self.handle_before_run(ctx)).await
    }

    pub async fn before_agent(&self, ctx: &CallContext) -> Passthrough {
        never_raise("before_agent", self.handle_before_agent(ctx)).await
    }

    pub async fn after_agent(&self, ctx: &CallContext) -> Passthrough {
        never_raise("after_agent", self.handle_after_agent(ctx)).await
    }

    pub async fn before_model(&self, ctx: &CallContext, request: &LlmRequest) -> Passthrough {
        never_raise("before_model", self.handle_before_model(ctx, request)).await
    }

    pub async fn after_model(&self, ctx: &CallContext, response: &LlmResponse) -> Passthrough {
        never_raise("after_model", self.handle_after_model(ctx, response)).await
    }

    pub async fn on_model_error(&self, ctx: &CallContext, request: &LlmRequest, error: &HostError) -> Passthrough {
        never_raise("on_model_error", self.handle_model_error(ctx, request, error)).await
    }

    pub async fn before_tool(&self, ctx: &CallContext, tool: &ToolDescriptor, args: &Value) -> Passthrough {
        never_raise("before_tool", self.handle_before_tool(ctx, tool, args)).await
    }

    pub async fn after_tool(
        &self,
        ctx: &CallContext,
        tool: &ToolDescriptor,
        _args: &Value,
        result: &Value,
    ) -> Passthrough {
        never_raise("after_tool", self.handle_after_tool(ctx, tool, result)).await
    }

    pub async fn on_tool_error(
        &self,
        ctx: &CallContext,
        tool: &ToolDescriptor,
        _args: &Value,
        error: &HostError,
    ) -> Passthrough {
        never_raise("on_tool_error", self.handle_tool_error(ctx, tool, error)).await
    }

    pub async fn after_run(&self, ctx: &CallContext) -> Passthrough {
        never_raise("after_run", async {
            let inv = self.invocation_of(ctx);
            self.sweep(
                &inv,
                Sweep {
                    orphan_status: STATUS_FAILURE,
                    orphan_output: None,
                    run_status: STATUS_OK,
                    run_output: final_output(&ctx.events),
                },
            )
            .await
        })
        .await
    }

    /// Closes every open LLM, tool and agent span of the invocation, then
    /// the run, marking each with the error. Never fails.
    pub async fn force_commit_partial_trace(&self, invocation_id: &str, error: &HostError) {
        never_raise("force_commit_partial_trace", self.force_commit(invocation_id, error)).await;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Runs and sessions
    // ─────────────────────────────────────────────────────────────────────────

    async fn start_invocation(&self, ctx: &CallContext, inv: &str) -> Result<(), TraceError> {
        let session = session_of(ctx);
        let is_sub = self.tracker.get_run(inv).is_none() && self.tracker.get_active_tool(&session).is_some();
        let backend = match self.map_session(&session, is_sub).await {
            Ok(backend) => backend,
            Err(e) => {
                tracing::warn!(session_id = %session, "Failed to map session: {}", e);
                None
            }
        };
        self.tracker
            .store_invocation_metadata(inv, &session, stringify_metadata(&ctx.custom_metadata));
        self.open_run(ctx, inv, &session, backend);
        Ok(())
    }

    fn open_run(&self, ctx: &CallContext, inv: &str, session: &str, backend: Option<SessionRef>) {
        // A session with an active tool is running a sub-invocation.
        let parent = self.tracker.get_active_tool(session);
        let Some(run_id) = self.tracker.open_run(inv, Some(session)) else {
            return;
        };
        if let Some(backend) = backend {
            self.run_sessions.insert(run_id, backend);
        }

        let agent = ctx.agent_name.as_deref().unwrap_or("unknown");
        let input = ctx.user_message.as_ref().map(Content::text).unwrap_or_default();
        let mut metadata = self.metadata_for(inv, session);
        metadata.insert("invocation_id".into(), inv.to_string());
        metadata.insert("session_id".into(), session.to_string());
        metadata.insert("integration".into(), self.config.integration.clone());

        let trace = Trace::new(input).with_name(run_name(agent)).with_metadata(metadata);
        self.graph().start(run_id, parent, Step::Run(trace));
        tracing::debug!(invocation_id = inv, run_id = %run_id, nested = parent.is_some(), "Run started");
    }

    /// Maps a host session to a backend session once per distinct id.
    /// Sub-invocations ride along in their parent's trace and map nothing new.
    async fn map_session(&self, session: &str, is_sub: bool) -> Result<Option<SessionRef>, TraceError> {
        if session == UNKNOWN_SESSION {
            return Ok(None);
        }
        let external = Some(session.to_string());
        if let Some(id) = self.backend_session(session) {
            return Ok(Some(SessionRef::new(id, external)));
        }
        if is_sub {
            return Ok(None);
        }

        let previous = self.last_session.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let id = self
            .logger
            .resolve_session(Some(session.to_string()), previous, external.clone())
            .await?;
        let id = self.sessions.entry(session.to_string()).or_insert(id).value().clone();
        *self.last_session.lock().unwrap_or_else(PoisonError::into_inner) = Some(id.clone());
        tracing::debug!(session_id = session, backend_session_id = %id, "Mapped host session");
        Ok(Some(SessionRef::new(id, external)))
    }

    async fn handle_before_run(&self, ctx: &CallContext) -> Result<(), TraceError> {
        let inv = self.invocation_of(ctx);
        if self.tracker.get_run(&inv).is_none() {
            self.start_invocation(ctx, &inv).await?;
        }
        let (Some(run_id), Some(agent)) = (self.tracker.get_run(&inv), ctx.agent_name.as_deref()) else {
            return Ok(());
        };
        self.graph().update(run_id, |step| {
            let Step::Run(trace) = step else { return };
            let name = run_name(agent);
            if trace.base.name != name {
                trace.base.name = name;
                trace
                    .base
                    .user_metadata
                    .insert("routed_agent".into(), agent.to_string());
            }
        });
        Ok(())
    }

    /// Ends a node and delivers the trace if that committed a root.
    async fn end_node(
        &self,
        id: Uuid,
        status_code: u16,
        finish: impl FnOnce(&mut Step),
    ) -> Result<(), TraceError> {
        let ended = self.graph().end(id, status_code, finish)?;
        match ended {
            Ended::Committed(trace) => {
                let session = self.run_sessions.remove(&trace.id()).map(|(_, s)| s);
                self.release_nested_runs(&trace);
                deliver(&self.logger, trace, session, self.config.ingest_on_commit).await
            }
            Ended::Closed => Ok(()),
            Ended::Missing => {
                tracing::debug!(node_id = %id, "Node is not open");
                Ok(())
            }
        }
    }

    /// Drops tracker state of sub-invocations whose nodes went out with a
    /// committed trace before their own callbacks closed them.
    fn release_nested_runs(&self, trace: &Trace) {
        let ids: HashSet<Uuid> = trace.flatten().iter().map(|(_, span)| span.id()).collect();
        for (inv, run_id) in self.tracker.runs_among(&ids) {
            let cleanup = self.tracker.cleanup_invocation(&inv);
            self.run_sessions.remove(&run_id);
            tracing::debug!(
                invocation_id = %inv,
                run_id = %run_id,
                agents = cleanup.agents.len(),
                tools = cleanup.tools.len(),
                "Released nested invocation committed with its parent"
            );
        }
    }

    async fn sweep(&self, inv: &str, sweep: Sweep) -> Result<(), TraceError> {
        let cleanup = self.tracker.cleanup_invocation(inv);
        if cleanup.is_empty() {
            tracing::debug!(invocation_id = inv, "Nothing open for invocation");
            return Ok(());
        }

        let orphans = cleanup.llms.iter().chain(&cleanup.tools).chain(&cleanup.agents);
        for id in orphans {
            tracing::debug!(invocation_id = inv, span_id = %id, "Closing orphaned span");
            let output = sweep.orphan_output.clone();
            let closed = self
                .end_node(*id, sweep.orphan_status, move |step| {
                    if let Some(output) = output {
                        step.set_output(output);
                    }
                })
                .await;
            if let Err(e) = closed {
                tracing::warn!(invocation_id = inv, span_id = %id, "Failed to close span: {}", e);
            }
        }

        let Some(run_id) = cleanup.run else {
            return Ok(());
        };
        let output = sweep.run_output;
        let ended = self
            .end_node(run_id, sweep.run_status, move |step| {
                if let Some(output) = output {
                    step.set_output(output);
                }
            })
            .await;
        self.run_sessions.remove(&run_id);
        ended?;
        tracing::debug!(invocation_id = inv, run_id = %run_id, "Run concluded");
        Ok(())
    }

    async fn force_commit(&self, inv: &str, error: &HostError) -> Result<(), TraceError> {
        let status = extract_status_code(error);
        let output = format!("Error: {}", error.message);
        tracing::warn!(invocation_id = inv, status_code = status, "Force committing partial trace");
        self.sweep(
            inv,
            Sweep {
                orphan_status: status,
                orphan_output: Some(output.clone()),
                run_status: status,
                run_output: Some(output),
            },
        )
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Agents
    // ─────────────────────────────────────────────────────────────────────────

    async fn handle_before_agent(&self, ctx: &CallContext) -> Result<(), TraceError> {
        let inv = self.invocation_of(ctx);
        let session = session_of(ctx);
        if self.tracker.get_run(&inv).is_none() {
            self.start_invocation(ctx, &inv).await?;
        }

        let agent = ctx.agent_name.clone().unwrap_or_else(|| "unknown".to_string());
        let parent = self.tracker.resolve_parent(ParentQuery {
            invocation_id: &inv,
            agent_name: None,
            ancestors: &ctx.parent_agents,
            session_id: &session,
        });
        let span_id = self.tracker.register_agent(&inv, &agent);

        let input = ctx
            .user_message
            .as_ref()
            .map(Content::text)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| AGENT_INPUT_PLACEHOLDER.to_string());
        let mut span = AgentSpan::new(&agent, input);
        span.base.user_metadata = self.metadata_for(&inv, &session);
        span.base.user_metadata.insert("agent_name".into(), agent.clone());

        self.graph().start(span_id, parent, Step::Span(Span::Agent(span)));
        tracing::debug!(invocation_id = %inv, agent = %agent, span_id = %span_id, "Agent started");
        Ok(())
    }

    async fn handle_after_agent(&self, ctx: &CallContext) -> Result<(), TraceError> {
        let inv = self.invocation_of(ctx);
        let agent = ctx.agent_name.as_deref().unwrap_or("unknown");
        let Some(span_id) = self.tracker.unregister_agent(&inv, agent) else {
            tracing::debug!(invocation_id = %inv, agent, "after_agent without matching before_agent");
            return Ok(());
        };

        let output = final_output(&ctx.events);
        let agent_output = output.clone();
        self.end_node(span_id, STATUS_OK, move |step| {
            if let Some(output) = agent_output {
                step.set_output(output);
            }
        })
        .await?;

        if self.tracker.open_agents(&inv) > 0 {
            return Ok(());
        }
        let Some(run_id) = self.tracker.get_run(&inv) else {
            return Ok(());
        };
        if self.graph().open_descendants(run_id) > 0 {
            return Ok(());
        }
        self.sweep(
            &inv,
            Sweep {
                orphan_status: STATUS_FAILURE,
                orphan_output: None,
                run_status: STATUS_OK,
                run_output: output,
            },
        )
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Models
    // ─────────────────────────────────────────────────────────────────────────

    async fn handle_before_model(&self, ctx: &CallContext, request: &LlmRequest) -> Result<(), TraceError> {
        let inv = self.invocation_of(ctx);
        let session = session_of(ctx);
        let parent = self.tracker.resolve_parent(ParentQuery {
            invocation_id: &inv,
            agent_name: ctx.agent_name.as_deref(),
            ancestors: &[],
            session_id: &session,
        });
        let span_id = self.tracker.register_llm(&inv, request.request_id.as_deref());

        let name = request.model.clone().unwrap_or_else(|| "llm".to_string());
        let mut span = LlmSpan::new(name, request_messages(request));
        span.model = request.model.clone();
        span.temperature = request.temperature;
        span.tools = normalize_tools(&request.tools);
        span.base.user_metadata = self.metadata_for(&inv, &session);

        self.graph().start(span_id, parent, Step::Span(Span::Llm(span)));
        Ok(())
    }

    async fn handle_after_model(&self, ctx: &CallContext, response: &LlmResponse) -> Result<(), TraceError> {
        let inv = self.invocation_of(ctx);
        let Some(span_id) = self.tracker.pop_llm(&inv, response.request_id.as_deref()) else {
            tracing::debug!(invocation_id = %inv, "after_model without matching before_model");
            return Ok(());
        };
        let (message, tool_calls) = response_output(response.content.as_ref());
        let usage = usage(response.usage.as_ref());
        self.end_node(span_id, STATUS_OK, move |step| {
            if let Step::Span(Span::Llm(llm)) = step {
                llm.output = Some(message);
                llm.tool_calls = tool_calls;
                llm.usage = usage;
            }
        })
        .await
    }

    async fn handle_model_error(
        &self,
        ctx: &CallContext,
        request: &LlmRequest,
        error: &HostError,
    ) -> Result<(), TraceError> {
        let inv = self.invocation_of(ctx);
        let status = extract_status_code(error);
        if let Some(span_id) = self.tracker.pop_llm(&inv, request.request_id.as_deref()) {
            let output = format!("Error: {}", error.message);
            self.end_node(span_id, status, move |step| step.set_output(output))
                .await?;
        }
        if self.config.is_fatal(status) {
            self.force_commit(&inv, error).await?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tools
    // ─────────────────────────────────────────────────────────────────────────

    async fn handle_before_tool(
        &self,
        ctx: &CallContext,
        tool: &ToolDescriptor,
        args: &Value,
    ) -> Result<(), TraceError> {
        let inv = self.invocation_of(ctx);
        let session = session_of(ctx);
        let class = self.register_tool(tool);
        let parent = self.tracker.resolve_parent(ParentQuery {
            invocation_id: &inv,
            agent_name: ctx.agent_name.as_deref(),
            ancestors: &[],
            session_id: &session,
        });

        let key = tool_key(&tool.name, ctx.function_call_id.as_deref());
        let span_id = self.tracker.register_tool(&session, &inv, &key);
        self.tracker.set_active_tool(&session, span_id);

        let mut span = match class {
            ToolClass::Retriever => Span::Retriever(RetrieverSpan::new(&tool.name, retriever_query(args))),
            ToolClass::Tool => {
                let mut span = ToolSpan::new(&tool.name, serialize_to_str(args));
                span.tool_call_id = ctx.function_call_id.clone();
                Span::Tool(span)
            }
        };
        span.base_mut().user_metadata = self.metadata_for(&inv, &session);

        self.graph().start(span_id, parent, Step::Span(span));
        tracing::debug!(invocation_id = %inv, tool = %tool.name, class = class.as_str(), "Tool started");
        Ok(())
    }

    async fn handle_after_tool(
        &self,
        ctx: &CallContext,
        tool: &ToolDescriptor,
        result: &Value,
    ) -> Result<(), TraceError> {
        let session = session_of(ctx);
        let key = tool_key(&tool.name, ctx.function_call_id.as_deref());
        let Some(span_id) = self.tracker.pop_tool(&session, &key) else {
            tracing::debug!(session_id = %session, tool = %tool.name, "after_tool without matching before_tool");
            return Ok(());
        };
        self.tracker.release_active_tool(&session, span_id);

        let result = result.clone();
        self.end_node(span_id, STATUS_OK, move |step| match step {
            Step::Span(Span::Retriever(retriever)) => retriever.output = documents(&result),
            other => other.set_output(serialize_to_str(&result)),
        })
        .await
    }

    async fn handle_tool_error(
        &self,
        ctx: &CallContext,
        tool: &ToolDescriptor,
        error: &HostError,
    ) -> Result<(), TraceError> {
        let inv = self.invocation_of(ctx);
        let session = session_of(ctx);
        let status = extract_status_code(error);
        let key = tool_key(&tool.name, ctx.function_call_id.as_deref());

        if let Some(span_id) = self.tracker.pop_tool(&session, &key) {
            self.tracker.release_active_tool(&session, span_id);
            let output = json!({ "error": error.message }).to_string();
            self.end_node(span_id, status, move |step| step.set_output(output))
                .await?;
        }
        if self.config.is_fatal(status) {
            self.force_commit(&inv, error).await?;
        }
        Ok(())
    }
}

use async_trait::async_trait;
use serde_json::{json, Value};
use spanwise_config::{LoggerConfig, LoggerMode, ObserverConfig};
use spanwise_core::{TraceError, STATUS_FAILURE};
use spanwise_monitor::{IngestRequest, Ingestor, MemorySink, Span, StepKind, TraceLogger};
use spanwise_observer::{
    CallContext, Content, Event, HostError, LlmRequest, LlmResponse, Observer, ToolDescriptor,
    RETRIEVER_MARKER,
};
use std::collections::BTreeMap;
use std::sync::Arc;

fn observer_with(config: LoggerConfig) -> (Observer, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let logger = TraceLogger::new(config, sink.clone()).unwrap();
    (Observer::new(Arc::new(logger)), sink)
}

fn observer() -> (Observer, Arc<MemorySink>) {
    observer_with(LoggerConfig::new().with_project("p").with_log_stream("s"))
}

fn ctx(inv: &str, session: &str, agent: &str) -> CallContext {
    CallContext::new(inv, session).with_agent(agent)
}

fn request(id: Option<&str>) -> LlmRequest {
    LlmRequest {
        request_id: id.map(str::to_string),
        model: Some("gemini-2.0-flash".into()),
        contents: vec![Content::user_text("What is 2+2?")],
        ..Default::default()
    }
}

fn response(id: Option<&str>, text: &str) -> LlmResponse {
    LlmResponse {
        request_id: id.map(str::to_string),
        content: Some(Content::model_text(text)),
        usage: None,
    }
}

fn final_event(text: &str) -> Event {
    Event {
        author: Some("A".into()),
        content: Some(Content::model_text(text)),
        is_final_response: true,
    }
}

#[tokio::test]
async fn test_single_invocation_trace() {
    let (observer, sink) = observer();
    let c = ctx("inv1", "s1", "A");
    let calc = ToolDescriptor::new("calc");

    assert!(observer.before_agent(&c).await.is_none());
    observer.before_model(&c, &request(Some("r1"))).await;
    observer.after_model(&c, &response(Some("r1"), "4")).await;
    observer.before_tool(&c, &calc, &json!({"x": 1})).await;
    observer.after_tool(&c, &calc, &json!({"x": 1}), &json!({"y": 2})).await;
    observer.after_agent(&c.clone().with_event(final_event("4"))).await;
    observer.after_run(&c).await;

    let traces = sink.traces();
    assert_eq!(traces.len(), 1);
    let trace = &traces[0];
    assert_eq!(trace.base.name, "invocation [A]");
    assert_eq!(trace.output.as_deref(), Some("4"));
    assert_eq!(trace.spans.len(), 1);

    let Span::Agent(agent) = &trace.spans[0] else {
        panic!("expected agent span");
    };
    assert_eq!(agent.base.name, "A");
    assert_eq!(agent.spans.len(), 2);

    let Span::Llm(llm) = &agent.spans[0] else {
        panic!("expected llm span");
    };
    assert_eq!(llm.output.as_ref().map(|m| m.content.as_str()), Some("4"));
    assert_eq!(llm.base.status_code, Some(200));

    let Span::Tool(tool) = &agent.spans[1] else {
        panic!("expected tool span");
    };
    assert_eq!(tool.base.name, "calc");
    assert_eq!(tool.input, r#"{"x":1}"#);
    assert_eq!(tool.output.as_deref(), Some(r#"{"y":2}"#));

    assert_eq!(observer.tracker().entries_for("inv1"), 0);
    assert!(observer.tracker().is_empty());
    assert_eq!(observer.open_nodes(), 0);
}

#[tokio::test]
async fn test_model_correlation_without_request_id() {
    let (observer, sink) = observer();
    let c = ctx("inv1", "s1", "A");

    observer.before_agent(&c).await;
    observer.before_model(&c, &request(None)).await;
    observer.after_model(&c, &response(None, "4")).await;
    observer.after_agent(&c).await;

    let trace = sink.traces().pop().unwrap();
    let llm = trace
        .flatten()
        .into_iter()
        .find(|(_, s)| s.kind() == StepKind::Llm)
        .map(|(_, s)| s.clone())
        .unwrap();
    assert_eq!(llm.output_text().as_deref(), Some("4"));
    assert_eq!(llm.base().status_code, Some(200));
}

#[tokio::test]
async fn test_sub_invocation_inherits_metadata_and_nests() {
    let (observer, sink) = observer();
    let root = ctx("inv1", "s1", "A").with_metadata("turn", json!(1));
    let delegate = ToolDescriptor::new("delegate");

    observer.on_user_message(&root).await;
    observer.before_agent(&root).await;
    observer.before_tool(&root, &delegate, &json!({"request": "sum"})).await;

    // The tool runs a sub-agent under a new invocation in the same session.
    let sub = ctx("inv2", "s1", "B");
    observer.on_user_message(&sub).await;
    let expected: BTreeMap<String, String> = [("turn".to_string(), "1".to_string())].into();
    assert_eq!(observer.tracker().get_invocation_metadata("inv2", "s1"), expected);

    observer.before_agent(&sub).await;
    observer.after_agent(&sub.clone().with_event(final_event("3"))).await;
    observer.after_run(&sub).await;

    observer.after_tool(&root, &delegate, &json!({}), &json!("3")).await;
    observer.after_agent(&root).await;
    observer.after_run(&root).await;

    let traces = sink.traces();
    assert_eq!(traces.len(), 1);
    let flat = traces[0].flatten();
    let kinds: Vec<StepKind> = flat.iter().map(|(_, s)| s.kind()).collect();
    assert_eq!(
        kinds,
        vec![StepKind::Agent, StepKind::Tool, StepKind::Workflow, StepKind::Agent]
    );
    let workflow = flat[2].1;
    assert_eq!(workflow.name(), "invocation [B]");
    assert_eq!(workflow.base().user_metadata["turn"], "1");
    assert_eq!(workflow.output_text().as_deref(), Some("3"));
    assert_eq!(flat[3].1.name(), "B");
    assert!(observer.tracker().is_empty());
}

#[tokio::test]
async fn test_after_run_sweeps_orphans() {
    let (observer, sink) = observer();
    let c = ctx("inv1", "s1", "A");
    let calc = ToolDescriptor::new("calc");

    observer.before_agent(&c).await;
    observer.before_tool(&c, &calc, &json!({"x": 1})).await;
    observer.after_run(&c).await;

    assert_eq!(observer.tracker().entries_for("inv1"), 0);
    assert!(observer.tracker().get_active_tool("s1").is_none());
    assert_eq!(observer.open_nodes(), 0);

    let trace = sink.traces().pop().unwrap();
    let flat = trace.flatten();
    assert_eq!(flat.len(), 2);
    assert!(flat
        .iter()
        .all(|(_, s)| s.base().status_code == Some(STATUS_FAILURE)));
    assert_eq!(trace.base.status_code, Some(200));
}

#[tokio::test]
async fn test_fatal_model_error_force_commits() {
    let (observer, sink) = observer();
    let c = ctx("inv1", "s1", "A");

    observer.before_agent(&c).await;
    observer.before_tool(&c, &ToolDescriptor::new("calc"), &json!({})).await;
    observer.before_model(&c, &request(Some("r1"))).await;
    let err = HostError::new("429 RESOURCE_EXHAUSTED: quota exceeded");
    observer.on_model_error(&c, &request(Some("r1")), &err).await;

    assert_eq!(observer.tracker().entries_for("inv1"), 0);
    assert_eq!(observer.open_nodes(), 0);

    let trace = sink.traces().pop().unwrap();
    assert_eq!(trace.base.status_code, Some(429));
    assert_eq!(
        trace.output.as_deref(),
        Some("Error: 429 RESOURCE_EXHAUSTED: quota exceeded")
    );
    for (_, span) in trace.flatten() {
        assert_eq!(span.base().status_code, Some(429), "{}", span.name());
    }

    // Nothing is left for the host's own after_run.
    observer.after_run(&c).await;
    assert_eq!(sink.traces().len(), 1);
}

#[tokio::test]
async fn test_non_fatal_tool_error_keeps_run_open() {
    let (observer, sink) = observer();
    let c = ctx("inv1", "s1", "A");
    let calc = ToolDescriptor::new("calc");

    observer.before_agent(&c).await;
    observer.before_tool(&c, &calc, &json!({})).await;
    observer
        .on_tool_error(&c, &calc, &json!({}), &HostError::new("division by zero"))
        .await;
    assert!(sink.traces().is_empty());

    observer.after_agent(&c).await;
    let trace = sink.traces().pop().unwrap();
    let tool = trace.flatten()[1].1.clone();
    assert_eq!(tool.base().status_code, Some(500));
    assert_eq!(tool.output_text().as_deref(), Some(r#"{"error":"division by zero"}"#));
}

#[tokio::test]
async fn test_retriever_tool() {
    let (observer, sink) = observer();
    let c = ctx("inv1", "s1", "A");
    let docs = ToolDescriptor::new("docs").with_marker(RETRIEVER_MARKER);
    let args = json!({"query": "borrow checker", "k": 2});

    observer.before_agent(&c).await;
    observer.before_tool(&c, &docs, &args).await;
    observer
        .after_tool(&c, &docs, &args, &json!([{"content": "ownership"}, "lifetimes"]))
        .await;
    observer.after_agent(&c).await;

    let trace = sink.traces().pop().unwrap();
    let Span::Retriever(retriever) = trace.flatten()[1].1.clone() else {
        panic!("expected retriever span");
    };
    assert_eq!(retriever.input, "borrow checker");
    assert_eq!(retriever.output.len(), 2);
    assert_eq!(retriever.output[1].content, "lifetimes");
}

#[tokio::test]
async fn test_interleaved_invocations_stay_separate() {
    let (observer, sink) = observer();
    let a = ctx("inv1", "s1", "A");
    let b = ctx("inv2", "s2", "B");

    observer.before_agent(&a).await;
    observer.before_agent(&b).await;
    observer.before_model(&a, &request(None)).await;
    observer.before_model(&b, &request(None)).await;
    observer.after_model(&b, &response(None, "b")).await;
    observer.after_model(&a, &response(None, "a")).await;
    observer.after_agent(&b).await;
    observer.after_agent(&a).await;

    let traces = sink.traces();
    assert_eq!(traces.len(), 2);
    for trace in &traces {
        assert_eq!(trace.span_count(), 2);
    }
    assert_eq!(traces[0].base.name, "invocation [B]");
    assert_eq!(traces[0].last_output().as_deref(), Some("b"));
    assert_eq!(traces[1].last_output().as_deref(), Some("a"));
}

#[tokio::test]
async fn test_interleaved_sessions_ingest_under_their_own_session() {
    let (observer, sink) = observer();
    let a = ctx("inv1", "s1", "A");
    let b = ctx("inv2", "s2", "B");

    observer.before_agent(&a).await;
    observer.before_agent(&b).await;
    observer.after_agent(&a.clone().with_event(final_event("a"))).await;
    observer.after_agent(&b.clone().with_event(final_event("b"))).await;

    let requests = sink.requests();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert_eq!(request.traces.len(), 1);
        let host_session = &request.traces[0].base.user_metadata["session_id"];
        assert_eq!(request.session_external_id.as_ref(), Some(host_session));
        assert_eq!(request.session_id, observer.backend_session(host_session));
    }
    assert_eq!(requests[0].session_external_id.as_deref(), Some("s1"));
    assert_eq!(requests[1].session_external_id.as_deref(), Some("s2"));
    assert_ne!(requests[0].session_id, requests[1].session_id);
}

#[tokio::test]
async fn test_force_commit_releases_nested_invocation() {
    let (observer, sink) = observer();
    let root = ctx("inv1", "s1", "A");
    let delegate = ToolDescriptor::new("delegate");

    observer.before_agent(&root).await;
    observer.before_tool(&root, &delegate, &json!({})).await;
    let sub = ctx("inv2", "s1", "B");
    observer.before_agent(&sub).await;
    observer.before_model(&sub, &request(Some("r1"))).await;

    let err = HostError::new("quota exceeded").with_code(429);
    observer.on_model_error(&root, &request(None), &err).await;

    let traces = sink.traces();
    assert_eq!(traces.len(), 1);
    let kinds: Vec<StepKind> = traces[0].flatten().iter().map(|(_, s)| s.kind()).collect();
    assert_eq!(
        kinds,
        vec![StepKind::Agent, StepKind::Tool, StepKind::Workflow, StepKind::Agent, StepKind::Llm]
    );
    assert_eq!(observer.tracker().entries_for("inv2"), 0);
    assert!(observer.tracker().is_empty());
    assert_eq!(observer.open_nodes(), 0);

    // Late callbacks from the abandoned sub-invocation change nothing.
    observer.after_model(&sub, &response(Some("r1"), "late")).await;
    observer.after_agent(&sub).await;
    observer.after_run(&sub).await;
    assert_eq!(sink.traces().len(), 1);
    assert!(observer.tracker().is_empty());
}

#[tokio::test]
async fn test_malformed_contexts_never_raise() {
    let (observer, sink) = observer();
    let empty = CallContext::default();
    let tool = ToolDescriptor::default();
    let err = HostError::default();

    assert!(observer.on_user_message(&empty).await.is_none());
    assert!(observer.before_run(&empty).await.is_none());
    assert!(observer.after_agent(&empty).await.is_none());
    assert!(observer.after_model(&empty, &LlmResponse::default()).await.is_none());
    assert!(observer.after_tool(&empty, &tool, &Value::Null, &Value::Null).await.is_none());
    assert!(observer.on_tool_error(&empty, &tool, &Value::Null, &err).await.is_none());
    assert!(observer.on_model_error(&empty, &LlmRequest::default(), &err).await.is_none());
    assert!(observer.before_agent(&empty).await.is_none());
    assert!(observer.before_model(&empty, &LlmRequest::default()).await.is_none());
    assert!(observer.before_tool(&empty, &tool, &Value::Null).await.is_none());
    assert!(observer.after_run(&empty).await.is_none());
    observer.force_commit_partial_trace("never-started", &err).await;

    assert!(sink.sessions().is_empty());
}

struct PanickingSink;

#[async_trait]
impl Ingestor for PanickingSink {
    async fn ingest_traces(&self, _request: &IngestRequest) -> Result<(), TraceError> {
        panic!("sink exploded");
    }
}

#[tokio::test]
async fn test_panicking_sink_never_raises() {
    let config = LoggerConfig::new().with_project("p").with_log_stream("s");
    let logger = TraceLogger::new(config, Arc::new(PanickingSink)).unwrap();
    let observer = Observer::new(Arc::new(logger));
    let c = ctx("inv1", "s1", "A");

    observer.before_agent(&c).await;
    assert!(observer.after_agent(&c).await.is_none());
    assert!(observer.tracker().is_empty());

    // The observer keeps working after the failure.
    let next = ctx("inv2", "s1", "A");
    assert!(observer.before_agent(&next).await.is_none());
    assert!(observer.tracker().get_run("inv2").is_some());
}

#[tokio::test]
async fn test_deferred_ingestion() {
    let sink = Arc::new(MemorySink::new());
    let config = LoggerConfig::new().with_project("p").with_log_stream("s");
    let logger = Arc::new(TraceLogger::new(config, sink.clone()).unwrap());
    let observer = Observer::new(logger.clone())
        .with_config(ObserverConfig::new().with_ingest_on_commit(false));
    let c = ctx("inv1", "s1", "A");

    observer.before_agent(&c).await;
    observer.after_agent(&c).await;
    assert!(sink.traces().is_empty());
    assert_eq!(logger.pending_traces(), 1);

    assert_eq!(logger.flush().await.unwrap().len(), 1);
    assert_eq!(sink.traces().len(), 1);
}

#[tokio::test]
async fn test_streaming_mode_delivers_traces() {
    let (observer, sink) = observer_with(
        LoggerConfig::new()
            .with_project("p")
            .with_log_stream("s")
            .with_mode(LoggerMode::Streaming),
    );
    let c = ctx("inv1", "s1", "A");

    observer.before_agent(&c).await;
    observer.before_model(&c, &request(Some("r1"))).await;
    observer.after_model(&c, &response(Some("r1"), "4")).await;
    observer.after_agent(&c).await;

    let traces = sink.traces();
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].span_count(), 2);
    observer.logger().terminate().await.unwrap();
}

#[tokio::test]
async fn test_agents_processor_handoff_scenario() {
    use spanwise_observer::{AgentsSpan, AgentsTrace, AgentsTracingProcessor};

    let sink = Arc::new(MemorySink::new());
    let config = LoggerConfig::new().with_project("p").with_log_stream("s");
    let logger = TraceLogger::new(config, sink.clone()).unwrap();
    let processor = AgentsTracingProcessor::new(Arc::new(logger));

    let trace: AgentsTrace = serde_json::from_value(json!({"trace_id": "t", "name": "Support flow"})).unwrap();
    let span = |value: Value| -> AgentsSpan { serde_json::from_value(value).unwrap() };
    let triage = span(json!({"trace_id": "t", "span_id": "a", "span_data": {"type": "agent", "name": "triage"}}));
    let handoff = span(json!({
        "trace_id": "t", "span_id": "h", "parent_id": "a",
        "span_data": {"type": "handoff", "from_agent": "triage", "to_agent": "billing"}
    }));
    let billing = span(json!({"trace_id": "t", "span_id": "b", "span_data": {"type": "agent", "name": "billing"}}));
    let guardrail = span(json!({
        "trace_id": "t", "span_id": "g", "parent_id": "b",
        "error": {"message": "refund limit"},
        "span_data": {"type": "guardrail", "name": "refund_limit", "triggered": true}
    }));

    processor.on_trace_start(&trace).await;
    processor.on_span_start(&triage).await;
    processor.on_span_start(&handoff).await;
    processor.on_span_end(&handoff).await;
    processor.on_span_end(&triage).await;
    processor.on_span_start(&billing).await;
    processor.on_span_start(&guardrail).await;
    processor.on_span_end(&guardrail).await;
    processor.on_span_end(&billing).await;
    processor.on_trace_end(&trace).await;

    let traces = sink.traces();
    assert_eq!(traces.len(), 1);
    let kinds: Vec<StepKind> = traces[0].flatten().iter().map(|(_, s)| s.kind()).collect();
    assert_eq!(
        kinds,
        vec![StepKind::Agent, StepKind::Workflow, StepKind::Agent, StepKind::Workflow]
    );
    let check = traces[0].flatten()[3].1;
    assert_eq!(check.name(), "refund_limit");
    assert_eq!(check.base().status_code, Some(STATUS_FAILURE));
    assert_eq!(check.base().user_metadata["triggered"], "true");
    assert_eq!(processor.open_nodes(), 0);
}

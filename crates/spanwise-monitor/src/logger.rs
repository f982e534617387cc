//! Trace logger: the builder API plus batching, streaming and sessions.

use crate::builder::{ConcludedStep, Conclusion, StepRef, TraceBuilder};
use crate::ingest::{with_retry, IngestRequest, Ingestor, MetricResolver, SessionCreate, StreamEvent};
use crate::pool::StreamingPool;
use crate::span::{AgentSpan, LlmSpan, RetrieverSpan, Span, ToolSpan, Trace, WorkflowSpan};
use spanwise_config::{LoggerConfig, LoggerMode};
use spanwise_core::TraceError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Backend session a batch of traces is ingested under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRef {
    pub id: Option<String>,
    pub external_id: Option<String>,
}

impl SessionRef {
    pub fn new(id: impl Into<String>, external_id: Option<String>) -> Self {
        Self {
            id: Some(id.into()),
            external_id,
        }
    }
}

#[derive(Default)]
struct LoggerState {
    builder: TraceBuilder,
    /// Traces built elsewhere and handed over whole. `None` means the
    /// logger's session at flush time.
    submitted: Vec<(Trace, Option<SessionRef>)>,
    session: SessionRef,
}

/// Builds traces and delivers them to an [`Ingestor`].
///
/// In batch mode concluded traces accumulate until [`TraceLogger::flush`].
/// In streaming mode every step is pushed to a worker pool as it happens.
pub struct TraceLogger {
    config: LoggerConfig,
    sink: Arc<dyn Ingestor>,
    state: Mutex<LoggerState>,
    pool: Option<StreamingPool>,
    metrics: Option<Arc<dyn MetricResolver>>,
    metrics_resolved: AtomicBool,
}

impl TraceLogger {
    /// Creates a logger. Streaming mode spawns its workers on the current
    /// tokio runtime.
    pub fn new(config: LoggerConfig, sink: Arc<dyn Ingestor>) -> Result<Self, TraceError> {
        let pool = match config.mode {
            LoggerMode::Batch => None,
            LoggerMode::Streaming => Some(StreamingPool::start(
                &config.streaming,
                config.retry.clone(),
                sink.clone(),
            )?),
        };

        tracing::debug!(
            mode = config.mode.as_str(),
            project = config.project.as_deref().unwrap_or("-"),
            log_stream = config.log_stream.as_deref().unwrap_or("-"),
            "Trace logger created"
        );

        Ok(Self {
            config,
            sink,
            state: Mutex::new(LoggerState::default()),
            pool,
            metrics: None,
            metrics_resolved: AtomicBool::new(false),
        })
    }

    pub fn with_metric_resolver(mut self, resolver: Arc<dyn MetricResolver>) -> Self {
        self.metrics = Some(resolver);
        self
    }

    pub fn mode(&self) -> LoggerMode {
        self.config.mode
    }

    pub fn config(&self) -> &LoggerConfig {
        &self.config
    }

    fn state(&self) -> Result<MutexGuard<'_, LoggerState>, TraceError> {
        self.state
            .lock()
            .map_err(|_| TraceError::InvalidState("logger state lock poisoned".into()))
    }

    async fn stream(&self, event: StreamEvent) {
        if let Some(pool) = &self.pool {
            pool.submit(event).await;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder API
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn start_trace(&self, trace: Trace) -> Result<Uuid, TraceError> {
        let snapshot = self.pool.as_ref().map(|_| trace.clone());
        let (id, closed, session_id) = {
            let mut state = self.state()?;
            let previous = state.builder.current_trace_id();
            let completed_before = state.builder.completed_len();
            let id = state.builder.start_trace(trace);
            // A restart concludes the previous trace.
            let closed = previous.filter(|_| state.builder.completed_len() > completed_before);
            (id, closed, state.session.id.clone())
        };

        if let Some(previous) = closed {
            self.stream(StreamEvent::StepUpdated {
                trace_id: previous,
                step_id: previous,
                output: None,
                status_code: None,
                duration_ns: None,
                is_complete: true,
            })
            .await;
        }
        if let Some(trace) = snapshot {
            self.stream(StreamEvent::TraceStarted { trace, session_id }).await;
        }
        Ok(id)
    }

    pub async fn add_span(&self, span: Span) -> Result<Uuid, TraceError> {
        let snapshot = self.pool.as_ref().map(|_| span.clone());
        let (id, trace_id, parent_id) = {
            let mut state = self.state()?;
            let parent = state.builder.current_parent().ok_or(TraceError::NoActiveTrace)?;
            let trace_id = state.builder.current_trace_id().unwrap_or_default();
            let id = state.builder.add_span(span)?;
            (id, trace_id, parent.id)
        };

        if let Some(span) = snapshot {
            self.stream(StreamEvent::SpanAdded {
                trace_id,
                parent_id,
                span,
            })
            .await;
        }
        Ok(id)
    }

    pub async fn add_llm_span(&self, span: LlmSpan) -> Result<Uuid, TraceError> {
        self.add_span(Span::Llm(span)).await
    }

    pub async fn add_tool_span(&self, span: ToolSpan) -> Result<Uuid, TraceError> {
        self.add_span(Span::Tool(span)).await
    }

    pub async fn add_retriever_span(&self, span: RetrieverSpan) -> Result<Uuid, TraceError> {
        self.add_span(Span::Retriever(span)).await
    }

    pub async fn add_workflow_span(&self, span: WorkflowSpan) -> Result<Uuid, TraceError> {
        self.add_span(Span::Workflow(span)).await
    }

    pub async fn add_agent_span(&self, span: AgentSpan) -> Result<Uuid, TraceError> {
        self.add_span(Span::Agent(span)).await
    }

    /// Concludes the current parent and returns the new one.
    pub async fn conclude(&self, conclusion: Conclusion) -> Result<Option<StepRef>, TraceError> {
        let (step, parent) = {
            let mut state = self.state()?;
            let step = state.builder.conclude_step(&conclusion)?;
            (step, state.builder.current_parent())
        };
        self.stream_concluded(vec![step]).await;
        Ok(parent)
    }

    /// Concludes every open step including the trace.
    pub async fn conclude_all(&self, conclusion: Conclusion) -> Result<Option<StepRef>, TraceError> {
        let steps = {
            let mut state = self.state()?;
            if state.builder.is_idle() {
                return Err(TraceError::NoActiveWorkflow);
            }
            state.builder.close_all(&conclusion)
        };
        self.stream_concluded(steps).await;
        Ok(None)
    }

    async fn stream_concluded(&self, steps: Vec<ConcludedStep>) {
        if self.pool.is_none() {
            return;
        }
        for step in steps {
            self.stream(StreamEvent::StepUpdated {
                trace_id: step.trace_id,
                step_id: step.step.id,
                output: step.output,
                status_code: step.status_code,
                duration_ns: step.duration_ns,
                is_complete: step.trace_complete,
            })
            .await;
        }
    }

    pub fn current_parent(&self) -> Option<StepRef> {
        self.state().ok().and_then(|s| s.builder.current_parent())
    }

    pub fn previous_parent(&self) -> Option<StepRef> {
        self.state().ok().and_then(|s| s.builder.previous_parent())
    }

    /// Number of concluded traces waiting for the next flush.
    pub fn pending_traces(&self) -> usize {
        self.state()
            .map(|s| s.builder.completed_len() + s.submitted.len())
            .unwrap_or(0)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Delivery
    // ─────────────────────────────────────────────────────────────────────────

    fn request(&self, traces: Vec<Trace>, session: &SessionRef) -> IngestRequest {
        IngestRequest {
            traces,
            session_id: session.id.clone(),
            session_external_id: session.external_id.clone(),
            project: self.config.project.clone(),
            log_stream: self.config.log_stream.clone(),
            experiment_id: self.config.experiment_id.clone(),
        }
    }

    /// Hands over a trace that was built outside the logger's own stack.
    /// Batch mode holds it until the next flush; streaming mode sends it now.
    pub async fn submit_trace(&self, trace: Trace) -> Result<(), TraceError> {
        self.submit(trace, None).await
    }

    /// Like [`TraceLogger::submit_trace`], but the trace is ingested under
    /// `session` whatever the logger's current session is.
    pub async fn submit_trace_in(&self, trace: Trace, session: SessionRef) -> Result<(), TraceError> {
        self.submit(trace, Some(session)).await
    }

    async fn submit(&self, trace: Trace, session: Option<SessionRef>) -> Result<(), TraceError> {
        if self.pool.is_some() {
            let request = {
                let state = self.state()?;
                self.request(vec![trace], session.as_ref().unwrap_or(&state.session))
            };
            self.stream(StreamEvent::TracesIngested { request }).await;
            return Ok(());
        }
        self.state()?.submitted.push((trace, session));
        Ok(())
    }

    /// Concludes anything still open, ingests every pending trace and clears
    /// the batch. Traces are sent in one request per session. The batch is
    /// cleared even when ingestion fails.
    pub async fn flush(&self) -> Result<Vec<Trace>, TraceError> {
        let (requests, auto_concluded) = {
            let mut state = self.state()?;
            let auto_concluded = if state.builder.is_idle() {
                Vec::new()
            } else {
                tracing::debug!(depth = state.builder.depth(), "Concluding open trace before flush");
                state.builder.close_all(&Conclusion::default())
            };
            let current = state.session.clone();
            let mut pending: Vec<(Trace, SessionRef)> = state
                .builder
                .take_completed()
                .into_iter()
                .map(|t| (t, current.clone()))
                .collect();
            pending.extend(
                state
                    .submitted
                    .drain(..)
                    .map(|(t, s)| (t, s.unwrap_or_else(|| current.clone()))),
            );
            (self.group_by_session(pending), auto_concluded)
        };
        self.stream_concluded(auto_concluded).await;

        if let Some(pool) = &self.pool {
            pool.wait_idle().await;
        }

        if requests.is_empty() {
            tracing::debug!("No traces to flush");
            return Ok(Vec::new());
        }

        self.resolve_metrics().await;

        let count: usize = requests.iter().map(|r| r.traces.len()).sum();
        // Streaming already delivered every step.
        if self.pool.is_none() {
            let mut failed = None;
            for request in &requests {
                let sent = with_retry(&self.config.retry, "ingest_traces", || {
                    self.sink.ingest_traces(request)
                })
                .await;
                if let Err(e) = sent {
                    failed.get_or_insert(e);
                }
            }
            if let Some(e) = failed {
                return Err(e);
            }
        }

        tracing::info!(traces = count, requests = requests.len(), "Flushed traces");
        Ok(requests.into_iter().flat_map(|r| r.traces).collect())
    }

    fn group_by_session(&self, pending: Vec<(Trace, SessionRef)>) -> Vec<IngestRequest> {
        let mut groups: Vec<(SessionRef, Vec<Trace>)> = Vec::new();
        for (trace, session) in pending {
            match groups.iter_mut().find(|(s, _)| *s == session) {
                Some((_, traces)) => traces.push(trace),
                None => groups.push((session, vec![trace])),
            }
        }
        groups
            .into_iter()
            .map(|(session, traces)| self.request(traces, &session))
            .collect()
    }

    async fn resolve_metrics(&self) {
        let Some(resolver) = &self.metrics else { return };
        if self.config.metrics.is_empty() || self.metrics_resolved.swap(true, Ordering::SeqCst) {
            return;
        }
        match resolver
            .create_metric_configs(
                self.config.project.as_deref(),
                self.config.log_stream.as_deref(),
                &self.config.metrics,
            )
            .await
        {
            Ok(scorers) => tracing::debug!(scorers = scorers.len(), "Registered metric scorers"),
            Err(e) => {
                self.metrics_resolved.store(false, Ordering::SeqCst);
                tracing::warn!("Failed to register metrics: {}", e);
            }
        }
    }

    /// Flushes and stops the streaming workers.
    pub async fn terminate(&self) -> Result<(), TraceError> {
        let flushed = self.flush().await;
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
            if pool.dropped() > 0 {
                tracing::warn!(dropped = pool.dropped(), "Stream events were dropped");
            }
        }
        flushed.map(|_| ())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────────

    /// Reuses the session registered under `external_id`, or creates one,
    /// and makes it the logger's current session.
    pub async fn start_session(
        &self,
        name: Option<String>,
        previous_session_id: Option<String>,
        external_id: Option<String>,
    ) -> Result<String, TraceError> {
        let id = self
            .resolve_session(name, previous_session_id, external_id.clone())
            .await?;
        self.set_session(id.clone(), external_id);
        Ok(id)
    }

    /// Reuses the session registered under `external_id`, or creates one.
    /// The logger's current session is left alone.
    pub async fn resolve_session(
        &self,
        name: Option<String>,
        previous_session_id: Option<String>,
        external_id: Option<String>,
    ) -> Result<String, TraceError> {
        if let Some(external) = external_id.as_deref() {
            if let Some(existing) = self.sink.find_session_by_external_id(external).await? {
                tracing::debug!(session_id = %existing, external_id = external, "Reusing session");
                return Ok(existing);
            }
        }

        let id = self
            .sink
            .create_session(&SessionCreate {
                name,
                previous_session_id,
                external_id,
            })
            .await?;
        tracing::debug!(session_id = %id, "Started session");
        Ok(id)
    }

    pub fn set_session(&self, id: String, external_id: Option<String>) {
        let Ok(mut state) = self.state() else { return };
        state.session = SessionRef::new(id, external_id);
    }

    pub fn clear_session(&self) {
        let Ok(mut state) = self.state() else { return };
        state.session = SessionRef::default();
    }

    pub fn session_id(&self) -> Option<String> {
        self.state().ok().and_then(|s| s.session.id.clone())
    }

    pub fn session_external_id(&self) -> Option<String> {
        self.state().ok().and_then(|s| s.session.external_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::MemorySink;
    use async_trait::async_trait;
    use spanwise_config::{RetryConfig, StreamingConfig};
    use spanwise_core::Message;
    use std::sync::atomic::AtomicUsize;

    fn batch_logger() -> (TraceLogger, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let config = LoggerConfig::new().with_project("p").with_log_stream("s");
        (TraceLogger::new(config, sink.clone()).unwrap(), sink)
    }

    #[tokio::test]
    async fn test_batch_flush_ingests_concluded_traces() {
        let (logger, sink) = batch_logger();
        logger.start_trace(Trace::new("What is 2+2?")).await.unwrap();
        logger.add_agent_span(AgentSpan::new("A", "What is 2+2?")).await.unwrap();
        logger
            .add_llm_span(LlmSpan::new("model", vec![Message::user("What is 2+2?")]))
            .await
            .unwrap();
        logger.conclude(Conclusion::new().output("4")).await.unwrap();
        logger.conclude(Conclusion::new()).await.unwrap();

        assert!(sink.traces().is_empty());
        assert_eq!(logger.pending_traces(), 1);

        let flushed = logger.flush().await.unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].output.as_deref(), Some("4"));

        let requests = sink.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].project.as_deref(), Some("p"));
        assert_eq!(logger.pending_traces(), 0);
    }

    #[tokio::test]
    async fn test_flush_auto_concludes_open_trace() {
        let (logger, sink) = batch_logger();
        logger.start_trace(Trace::new("q")).await.unwrap();
        logger.add_workflow_span(WorkflowSpan::new("wf", "q")).await.unwrap();

        logger.flush().await.unwrap();
        assert!(logger.current_parent().is_none());
        assert_eq!(sink.traces()[0].span_count(), 1);
    }

    #[tokio::test]
    async fn test_flush_with_nothing_pending() {
        let (logger, sink) = batch_logger();
        assert!(logger.flush().await.unwrap().is_empty());
        assert!(sink.requests().is_empty());
    }

    #[tokio::test]
    async fn test_flush_clears_batch_on_failure() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next(10);
        let config = LoggerConfig::new().with_retry(RetryConfig {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
        });
        let logger = TraceLogger::new(config, sink.clone()).unwrap();
        logger.submit_trace(Trace::new("q")).await.unwrap();

        assert!(logger.flush().await.is_err());
        assert_eq!(logger.pending_traces(), 0);
    }

    #[tokio::test]
    async fn test_span_requires_trace() {
        let (logger, _) = batch_logger();
        let err = logger.add_tool_span(ToolSpan::new("t", "{}")).await.unwrap_err();
        assert!(matches!(err, TraceError::NoActiveTrace));
    }

    #[tokio::test]
    async fn test_session_reused_by_external_id() {
        let (logger, sink) = batch_logger();
        let first = logger
            .start_session(Some("chat".into()), None, Some("ext-1".into()))
            .await
            .unwrap();
        logger.clear_session();
        assert!(logger.session_id().is_none());

        let second = logger.start_session(None, None, Some("ext-1".into())).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(sink.sessions().len(), 1);

        logger.submit_trace(Trace::new("q")).await.unwrap();
        logger.flush().await.unwrap();
        assert_eq!(sink.requests()[0].session_id, Some(first));
        assert_eq!(sink.requests()[0].session_external_id.as_deref(), Some("ext-1"));
    }

    #[tokio::test]
    async fn test_submitted_traces_keep_their_session() {
        let (logger, sink) = batch_logger();
        logger.set_session("global".into(), Some("g".into()));
        logger
            .submit_trace_in(Trace::new("one").with_name("one"), SessionRef::new("b-1", Some("s1".into())))
            .await
            .unwrap();
        logger
            .submit_trace_in(Trace::new("two").with_name("two"), SessionRef::new("b-2", Some("s2".into())))
            .await
            .unwrap();
        logger.submit_trace(Trace::new("three").with_name("three")).await.unwrap();
        logger
            .submit_trace_in(Trace::new("four").with_name("four"), SessionRef::new("b-1", Some("s1".into())))
            .await
            .unwrap();

        let flushed = logger.flush().await.unwrap();
        assert_eq!(flushed.len(), 4);

        let requests = sink.requests();
        assert_eq!(requests.len(), 3);
        let names = |r: &IngestRequest| r.traces.iter().map(|t| t.base.name.clone()).collect::<Vec<_>>();
        assert_eq!(requests[0].session_id.as_deref(), Some("b-1"));
        assert_eq!(names(&requests[0]), vec!["one", "four"]);
        assert_eq!(requests[1].session_external_id.as_deref(), Some("s2"));
        assert_eq!(names(&requests[1]), vec!["two"]);
        assert_eq!(requests[2].session_id.as_deref(), Some("global"));
        assert_eq!(names(&requests[2]), vec!["three"]);
    }

    #[tokio::test]
    async fn test_resolve_session_leaves_current_session() {
        let (logger, sink) = batch_logger();
        let id = logger.resolve_session(None, None, Some("ext".into())).await.unwrap();
        assert!(logger.session_id().is_none());
        assert_eq!(logger.resolve_session(None, None, Some("ext".into())).await.unwrap(), id);
        assert_eq!(sink.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_streaming_emits_step_events() {
        let sink = Arc::new(MemorySink::new());
        let config = LoggerConfig::new()
            .with_mode(LoggerMode::Streaming)
            .with_streaming(StreamingConfig {
                workers: 2,
                ..StreamingConfig::default()
            });
        let logger = TraceLogger::new(config, sink.clone()).unwrap();

        let trace_id = logger.start_trace(Trace::new("q")).await.unwrap();
        let tool_id = logger.add_tool_span(ToolSpan::new("t", "{}")).await.unwrap();
        logger.conclude(Conclusion::new().output("done")).await.unwrap();
        logger.terminate().await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], StreamEvent::TraceStarted { trace, .. } if trace.id() == trace_id));
        assert!(matches!(
            &events[1],
            StreamEvent::SpanAdded { parent_id, span, .. } if *parent_id == trace_id && span.id() == tool_id
        ));
        assert!(matches!(
            &events[2],
            StreamEvent::StepUpdated { step_id, is_complete: true, output: Some(out), .. }
                if *step_id == trace_id && out == "done"
        ));
    }

    struct CountingResolver(AtomicUsize);

    #[async_trait]
    impl MetricResolver for CountingResolver {
        async fn create_metric_configs(
            &self,
            _project: Option<&str>,
            _log_stream: Option<&str>,
            metrics: &[String],
        ) -> Result<Vec<String>, TraceError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(metrics.to_vec())
        }
    }

    #[tokio::test]
    async fn test_metrics_resolved_once() {
        let sink = Arc::new(MemorySink::new());
        let resolver = Arc::new(CountingResolver(AtomicUsize::new(0)));
        let config = LoggerConfig::new().with_metrics(vec!["correctness".into()]);
        let logger = TraceLogger::new(config, sink).unwrap().with_metric_resolver(resolver.clone());

        for _ in 0..2 {
            logger.submit_trace(Trace::new("q")).await.unwrap();
            logger.flush().await.unwrap();
        }
        assert_eq!(resolver.0.load(Ordering::SeqCst), 1);
    }
}

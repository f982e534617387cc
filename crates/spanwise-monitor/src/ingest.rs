//! Ingestion boundary between the logger and the trace backend.

use crate::span::{Span, Trace};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use spanwise_config::RetryConfig;
use spanwise_core::TraceError;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// A batch of completed traces bound for the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub traces: Vec<Trace>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub session_external_id: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub log_stream: Option<String>,
    #[serde(default)]
    pub experiment_id: Option<String>,
}

/// An incremental update emitted in streaming mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    TraceStarted {
        trace: Trace,
        session_id: Option<String>,
    },
    SpanAdded {
        trace_id: Uuid,
        parent_id: Uuid,
        span: Span,
    },
    /// A step was concluded. `step_id == trace_id` marks the trace itself.
    StepUpdated {
        trace_id: Uuid,
        step_id: Uuid,
        output: Option<String>,
        status_code: Option<u16>,
        duration_ns: Option<u64>,
        is_complete: bool,
    },
    TracesIngested {
        request: IngestRequest,
    },
}

impl StreamEvent {
    /// Trace the event belongs to, used to keep one trace on one worker.
    pub fn routing_key(&self) -> Uuid {
        match self {
            StreamEvent::TraceStarted { trace, .. } => trace.id(),
            StreamEvent::SpanAdded { trace_id, .. } => *trace_id,
            StreamEvent::StepUpdated { trace_id, .. } => *trace_id,
            StreamEvent::TracesIngested { request } => {
                request.traces.first().map(Trace::id).unwrap_or_default()
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::TraceStarted { .. } => "trace_started",
            StreamEvent::SpanAdded { .. } => "span_added",
            StreamEvent::StepUpdated { .. } => "step_updated",
            StreamEvent::TracesIngested { .. } => "traces_ingested",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreate {
    pub name: Option<String>,
    pub previous_session_id: Option<String>,
    pub external_id: Option<String>,
}

/// Destination for traces, stream events and sessions.
#[async_trait]
pub trait Ingestor: Send + Sync {
    async fn ingest_traces(&self, request: &IngestRequest) -> Result<(), TraceError>;

    /// Handles one streaming event. Sinks without incremental support only
    /// act on whole-trace batches.
    async fn send_event(&self, event: &StreamEvent) -> Result<(), TraceError> {
        match event {
            StreamEvent::TracesIngested { request } => self.ingest_traces(request).await,
            other => {
                tracing::debug!(event = other.name(), "Sink ignores incremental event");
                Ok(())
            }
        }
    }

    /// Creates a session and returns its id.
    async fn create_session(&self, _session: &SessionCreate) -> Result<String, TraceError> {
        Ok(Uuid::new_v4().to_string())
    }

    async fn find_session_by_external_id(
        &self,
        _external_id: &str,
    ) -> Result<Option<String>, TraceError> {
        Ok(None)
    }
}

/// Resolves configured metric names into backend scorers at flush time.
#[async_trait]
pub trait MetricResolver: Send + Sync {
    /// Returns the names of the scorers that were registered.
    async fn create_metric_configs(
        &self,
        project: Option<&str>,
        log_stream: Option<&str>,
        metrics: &[String],
    ) -> Result<Vec<String>, TraceError>;
}

/// Runs `op` until it succeeds or the configured attempts are used up,
/// sleeping with exponential backoff between attempts.
pub async fn with_retry<T, F, Fut>(retry: &RetryConfig, what: &str, mut op: F) -> Result<T, TraceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TraceError>>,
{
    let attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => {
                tracing::warn!(what, attempts, error = %e, "Giving up after retries");
                return Err(TraceError::RetriesExhausted {
                    attempts,
                    last_error: e.to_string(),
                });
            }
            Err(e) => {
                let backoff = retry.backoff_ms(attempt);
                tracing::debug!(what, attempt, backoff_ms = backoff, error = %e, "Retrying");
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory sink
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    requests: Vec<IngestRequest>,
    events: Vec<StreamEvent>,
    sessions: Vec<(String, SessionCreate)>,
}

/// Sink that keeps everything it receives in memory.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
    failures: AtomicU32,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls fail.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn check_failure(&self) -> Result<(), TraceError> {
        let remaining = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match remaining {
            Ok(_) => Err(TraceError::Ingest("injected failure".into())),
            Err(_) => Ok(()),
        }
    }

    pub fn requests(&self) -> Vec<IngestRequest> {
        let Ok(guard) = self.state.lock() else { return Vec::new() };
        guard.requests.clone()
    }

    /// Every trace received, through batches or whole-trace stream events.
    pub fn traces(&self) -> Vec<Trace> {
        let Ok(guard) = self.state.lock() else { return Vec::new() };
        let batched = guard.requests.iter().flat_map(|r| r.traces.iter());
        let streamed = guard
            .events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TracesIngested { request } => Some(request.traces.iter()),
                _ => None,
            })
            .flatten();
        batched.chain(streamed).cloned().collect()
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        let Ok(guard) = self.state.lock() else { return Vec::new() };
        guard.events.clone()
    }

    pub fn sessions(&self) -> Vec<(String, SessionCreate)> {
        let Ok(guard) = self.state.lock() else { return Vec::new() };
        guard.sessions.clone()
    }
}

#[async_trait]
impl Ingestor for MemorySink {
    async fn ingest_traces(&self, request: &IngestRequest) -> Result<(), TraceError> {
        self.check_failure()?;
        let mut guard = self
            .state
            .lock()
            .map_err(|_| TraceError::Ingest("memory sink lock poisoned".into()))?;
        guard.requests.push(request.clone());
        Ok(())
    }

    async fn send_event(&self, event: &StreamEvent) -> Result<(), TraceError> {
        self.check_failure()?;
        let mut guard = self
            .state
            .lock()
            .map_err(|_| TraceError::Ingest("memory sink lock poisoned".into()))?;
        guard.events.push(event.clone());
        Ok(())
    }

    async fn create_session(&self, session: &SessionCreate) -> Result<String, TraceError> {
        let id = Uuid::new_v4().to_string();
        let mut guard = self
            .state
            .lock()
            .map_err(|_| TraceError::Ingest("memory sink lock poisoned".into()))?;
        guard.sessions.push((id.clone(), session.clone()));
        Ok(id)
    }

    async fn find_session_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<String>, TraceError> {
        let Ok(guard) = self.state.lock() else { return Ok(None) };
        Ok(guard
            .sessions
            .iter()
            .find(|(_, s)| s.external_id.as_deref() == Some(external_id))
            .map(|(id, _)| id.clone()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hook sink
// ─────────────────────────────────────────────────────────────────────────────

type Hook = Box<dyn Fn(IngestRequest) -> BoxFuture<'static, Result<(), TraceError>> + Send + Sync>;

/// Hands every batch to a user callback instead of a remote backend.
pub struct HookSink {
    hook: Hook,
}

impl HookSink {
    pub fn new<F, Fut>(hook: F) -> Self
    where
        F: Fn(IngestRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TraceError>> + Send + 'static,
    {
        Self {
            hook: Box::new(move |request| Box::pin(hook(request))),
        }
    }
}

#[async_trait]
impl Ingestor for HookSink {
    async fn ingest_traces(&self, request: &IngestRequest) -> Result<(), TraceError> {
        (self.hook)(request.clone()).await
    }
}

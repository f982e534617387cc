//! Trace model, parent-stack builder and ingestion for spanwise.

mod builder;
mod http;
mod ingest;
mod logger;
mod pool;
mod record;
mod span;
mod store;

pub use builder::{ConcludedStep, Conclusion, StepRef, TraceBuilder};
pub use http::HttpIngestor;
pub use ingest::{
    with_retry, HookSink, IngestRequest, Ingestor, MemorySink, MetricResolver, SessionCreate,
    StreamEvent,
};
pub use logger::{SessionRef, TraceLogger};
pub use pool::StreamingPool;
pub use record::{SpanRecord, TraceQuery, TraceRecord, TraceStatus};
pub use span::{
    AgentSpan, Document, LlmSpan, RetrieverSpan, Span, StepBase, StepKind, TokenUsage, ToolSpan,
    Trace, TraceSummary, WorkflowSpan,
};
pub use store::{MetricsSummary, StoreError, TraceStore};

use spanwise_config::LoggerConfig;
use spanwise_core::TraceError;
use std::sync::Arc;

/// Picks the sink a configuration describes: the local SQLite store when a
/// path is set, otherwise the HTTP backend.
pub fn sink_from_config(config: &LoggerConfig) -> Result<Arc<dyn Ingestor>, TraceError> {
    if let Some(path) = &config.local_store {
        tracing::info!(path = %path.display(), "Using local trace store");
        return Ok(Arc::new(TraceStore::new(path)?));
    }
    Ok(Arc::new(HttpIngestor::new(config)?))
}

//! # spanwise
//!
//! Trace and span lifecycle tracking for agent frameworks.
//!
//! Host frameworks report their work through before/after callbacks or event
//! streams. spanwise correlates those callbacks into a tree of spans (agent,
//! LLM, tool, retriever, workflow) under one trace per invocation and hands
//! every completed trace to an ingestion sink.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use spanwise::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LoggerConfig::new().with_project("demo").with_log_stream("dev");
//! let sink = Arc::new(MemorySink::new());
//! let logger = Arc::new(TraceLogger::new(config, sink.clone())?);
//! let observer = Observer::new(logger);
//!
//! let ctx = CallContext::new("inv-1", "session-1").with_agent("assistant");
//! observer.before_agent(&ctx).await;
//! observer.after_agent(&ctx).await;
//!
//! assert_eq!(sink.traces().len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Crates
//!
//! - [`core`]: errors, chat messages and value helpers
//! - [`config`]: logger and observer configuration
//! - [`monitor`]: span model, trace builder, logger and sinks
//! - [`observer`]: callback observer, correlation tracker and host adapters

pub use spanwise_config as config;
pub use spanwise_core as core;
pub use spanwise_monitor as monitor;
pub use spanwise_observer as observer;

pub mod prelude {
    pub use spanwise_config::{LoggerConfig, LoggerMode, ObserverConfig, RetryConfig, StreamingConfig};
    pub use spanwise_core::{Message, MessageRole, ToolCall, TraceError};
    pub use spanwise_monitor::{
        sink_from_config, AgentSpan, Conclusion, HookSink, Ingestor, LlmSpan, MemorySink,
        RetrieverSpan, Span, TraceBuilder, TraceLogger, ToolSpan, Trace, TraceStore, WorkflowSpan,
    };
    pub use spanwise_observer::adk::AdkPlugin;
    pub use spanwise_observer::{
        AgentsSpan, AgentsTrace, AgentsTracingProcessor, CallContext, Content, CrewEvent, CrewHandler,
        HostError, LlmRequest, LlmResponse, Observer, SpanData, ToolDescriptor,
    };
}

//! Callback observers that turn agent framework hooks into traces.
//!
//! - [`Observer`] — before/after callbacks for ADK-style hosts
//! - [`Tracker`] — correlation of open callbacks with span ids
//! - [`NodeGraph`] — open nodes per run, committed through a `TraceBuilder`
//! - [`adk`] — translation of ADK JSON payloads into typed contexts
//! - [`CrewHandler`] — CrewAI event stream handler
//! - [`AgentsTracingProcessor`] — OpenAI Agents SDK tracing processor

pub mod adk;
mod classify;
mod context;
mod convert;
mod crewai;
mod graph;
mod observer;
mod openai_agents;
mod status;
mod tracker;

pub use classify::{ToolClass, ToolClassifier, RETRIEVER_MARKER};
pub use context::{
    CallContext, Content, ErrorCode, Event, HostError, LlmRequest, LlmResponse, Part,
    ToolDeclaration, ToolDescriptor, UsageMetadata,
};
pub use convert::{contents_to_messages, documents, final_output, normalize_tools, usage};
pub use crewai::{CrewEvent, CrewHandler};
pub use graph::{Ended, NodeGraph, Step};
pub use observer::{Observer, Passthrough, UNKNOWN_SESSION};
pub use openai_agents::{
    AgentsSpan, AgentsTrace, AgentsTracingProcessor, GenerationUsage, SpanData, FORCE_FLUSH_OUTPUT,
    SHUTDOWN_OUTPUT,
};
pub use status::extract_status_code;
pub use tracker::{Cleanup, ParentQuery, Tracker};

use futures::FutureExt;
use spanwise_core::TraceError;
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// Runs a callback body, logging any error or panic instead of returning it.
pub(crate) async fn never_raise<F>(callback: &'static str, body: F) -> Passthrough
where
    F: Future<Output = Result<(), TraceError>>,
{
    match AssertUnwindSafe(body).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(callback, "Observer callback failed: {}", e),
        Err(_) => tracing::error!(callback, "Observer callback panicked"),
    }
    None
}

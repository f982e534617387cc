//! Replays OpenAI Agents SDK processor hooks (one JSON record per line) into a trace.
//!
//! Run with: cargo run --example agents_trace

use serde_json::Value;
use spanwise::prelude::*;
use std::sync::Arc;

const HOOKS: &str = r#"
{"hook": "trace_start", "trace_id": "trace_1", "name": "Support flow"}
{"hook": "span_start", "trace_id": "trace_1", "span_id": "a", "span_data": {"type": "agent", "name": "triage", "tools": ["lookup"], "handoffs": ["billing"]}}
{"hook": "span_start", "trace_id": "trace_1", "span_id": "g", "parent_id": "a", "started_at": "2025-03-01T10:00:00+00:00", "span_data": {"type": "generation", "model": "gpt-4o", "input": [{"role": "user", "content": "Where is order 7?"}]}}
{"hook": "span_end", "trace_id": "trace_1", "span_id": "g", "parent_id": "a", "started_at": "2025-03-01T10:00:00+00:00", "ended_at": "2025-03-01T10:00:01.2+00:00", "span_data": {"type": "generation", "model": "gpt-4o", "output": "Calling lookup.", "usage": {"input_tokens": 9, "output_tokens": 3}}}
{"hook": "span_start", "trace_id": "trace_1", "span_id": "f", "parent_id": "a", "span_data": {"type": "function", "name": "lookup", "input": "{\"order\": 7}"}}
{"hook": "span_end", "trace_id": "trace_1", "span_id": "f", "parent_id": "a", "span_data": {"type": "function", "name": "lookup", "output": "shipped"}}
{"hook": "span_end", "trace_id": "trace_1", "span_id": "a", "span_data": {"type": "agent", "name": "triage"}}
{"hook": "trace_end", "trace_id": "trace_1", "name": "Support flow"}
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();

    let sink = Arc::new(MemorySink::new());
    let config = LoggerConfig::new().with_project("demo").with_log_stream("agents");
    let logger = Arc::new(TraceLogger::new(config, sink.clone())?);
    let processor = AgentsTracingProcessor::new(logger);

    for line in HOOKS.lines().filter(|l| !l.trim().is_empty()) {
        let record: Value = serde_json::from_str(line)?;
        match record["hook"].as_str() {
            Some("trace_start") => processor.on_trace_start(&serde_json::from_value(record)?).await,
            Some("trace_end") => processor.on_trace_end(&serde_json::from_value(record)?).await,
            Some("span_start") => processor.on_span_start(&serde_json::from_value(record)?).await,
            Some("span_end") => processor.on_span_end(&serde_json::from_value(record)?).await,
            other => tracing::warn!(hook = ?other, "Skipping unknown hook"),
        }
    }
    processor.shutdown().await;

    for trace in sink.traces() {
        println!("{} -> {:?}", trace.base.name, trace.output);
        for (parent, span) in trace.flatten() {
            println!(
                "  {:?} {} (parent {}, {:?} ns)",
                span.kind(),
                span.name(),
                parent,
                span.base().duration_ns
            );
        }
    }
    Ok(())
}

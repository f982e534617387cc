//! Builds a trace by hand with the logger's parent-stack API and persists it
//! to an in-memory SQLite store.
//!
//! Run with: cargo run --example manual_trace

use spanwise::monitor::{TokenUsage, TraceQuery};
use spanwise::prelude::*;
use std::sync::Arc;

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

    let store = Arc::new(TraceStore::in_memory()?);
    let config = LoggerConfig::new().with_project("demo").with_log_stream("manual");
    let logger = TraceLogger::new(config, store.clone())?;

    logger
        .start_session(Some("manual".into()), None, Some("manual-1".into()))
        .await?;

    logger
        .start_trace(Trace::new("Summarise the release notes").with_name("release-summary"))
        .await?;
    logger
        .add_agent_span(AgentSpan::new("summariser", "Summarise the release notes"))
        .await?;
    logger
        .add_retriever_span(RetrieverSpan::new("notes", "release 0.4"))
        .await?;
    logger
        .add_llm_span(
            LlmSpan::new("gpt-4o", vec![Message::user("Summarise: faster flush, new store")])
                .with_model("gpt-4o")
                .with_output(Message::assistant("Flush is faster and traces persist locally."))
                .with_usage(TokenUsage {
                    input_tokens: 18,
                    output_tokens: 9,
                    total_tokens: 27,
                    ..Default::default()
                }),
        )
        .await?;

    // Close the agent, then the trace; both inherit the LLM output.
    logger.conclude(Conclusion::new()).await?;
    logger.conclude(Conclusion::new().status(200)).await?;

    let flushed = logger.flush().await?;
    tracing::info!(traces = flushed.len(), "Flushed");

    for record in store.list_traces(&TraceQuery::default())? {
        println!(
            "{} {} [{}] llm_calls={} tokens={}/{} output={:?}",
            record.trace_id,
            record.name,
            record.status.as_str(),
            record.llm_calls,
            record.input_tokens,
            record.output_tokens,
            record.output,
        );
    }

    let summary = store.get_metrics_summary()?;
    println!(
        "total={} errors={} avg_latency_ms={:.2}",
        summary.total_traces, summary.error_traces, summary.avg_latency_ms
    );
    Ok(())
}

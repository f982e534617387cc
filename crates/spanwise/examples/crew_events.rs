//! Replays a CrewAI event stream (one JSON event per line) into a trace.
//!
//! Run with: cargo run --example crew_events

use spanwise::prelude::*;
use std::sync::Arc;

const EVENTS: &str = r#"
{"type": "crew_kickoff_started", "crew_id": "c1", "crew_name": "research", "inputs": {"topic": "ownership"}}
{"type": "task_started", "task_id": "t1", "crew_id": "c1", "description": "Explain ownership"}
{"type": "agent_execution_started", "agent_id": "a1", "task_id": "t1", "role": "Researcher", "task_prompt": "Explain ownership"}
{"type": "llm_call_started", "call_id": "l1", "agent_id": "a1", "model": "gpt-4o", "messages": [{"role": "user", "content": "Explain ownership"}]}
{"type": "llm_call_completed", "call_id": "l1", "response": "Search first.", "usage": {"input_tokens": 10, "output_tokens": 3, "total_tokens": 13}}
{"type": "tool_usage_started", "agent_id": "a1", "tool_name": "search", "tool_args": {"q": "rust ownership"}}
{"type": "tool_usage_finished", "agent_id": "a1", "tool_name": "search", "output": ["Each value has one owner."]}
{"type": "agent_execution_completed", "agent_id": "a1", "output": "Each value has exactly one owner."}
{"type": "task_completed", "task_id": "t1", "output": "Each value has exactly one owner."}
{"type": "crew_kickoff_completed", "crew_id": "c1", "output": "Each value has exactly one owner."}
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
    let config = LoggerConfig::new().with_project("demo").with_log_stream("crew");
    let logger = Arc::new(TraceLogger::new(config, sink.clone())?);
    let handler = CrewHandler::new(logger);

    for line in EVENTS.lines().filter(|l| !l.trim().is_empty()) {
        let event: CrewEvent = serde_json::from_str(line)?;
        handler.handle(event).await;
    }

    for trace in sink.traces() {
        println!("{} -> {:?}", trace.base.name, trace.output);
        for (parent, span) in trace.flatten() {
            println!("  {:?} {} (parent {})", span.kind(), span.name(), parent);
        }
    }
    Ok(())
}

//! Drives an ADK-style callback sequence through the observer and prints the
//! committed trace.
//!
//! Run with: cargo run --example adk_session

use serde_json::json;
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

    // Print every batch instead of sending it to a backend
    let sink = HookSink::new(|request| async move {
        for trace in &request.traces {
            let summary = trace.summary();
            tracing::info!(
                trace = %trace.base.name,
                spans = trace.span_count(),
                llm_calls = summary.llm_calls,
                tool_calls = summary.tool_calls,
                "Trace ingested"
            );
            println!("{}", serde_json::to_string_pretty(trace).unwrap_or_default());
        }
        Ok(())
    });

    let config = LoggerConfig::new().with_project("demo").with_log_stream("adk");
    let logger = Arc::new(TraceLogger::new(config, Arc::new(sink))?);
    let plugin = AdkPlugin::new(Arc::new(Observer::new(logger)));

    let invocation = json!({
        "invocation_id": "e-42",
        "session": {"id": "session-1"},
        "agent": {"name": "assistant"},
        "run_config": {"custom_metadata": {"user": "demo"}},
        "user_content": {"role": "user", "parts": [{"text": "What is 2+2?"}]}
    });
    let callback = json!({
        "agent_name": "assistant",
        "_invocation_context": invocation.clone(),
    });
    let tool_context = json!({
        "agent_name": "assistant",
        "function_call_id": "call-1",
        "_invocation_context": invocation.clone(),
    });

    plugin.on_user_message(&invocation).await;
    plugin.before_run(&invocation).await;
    plugin.before_agent(&callback).await;

    let request = json!({
        "model": "gemini-2.0-flash",
        "contents": [{"role": "user", "parts": [{"text": "What is 2+2?"}]}],
        "config": {
            "temperature": 0.2,
            "system_instruction": "Answer with a number.",
            "tools": [{"function_declarations": [{"name": "calc", "description": "Adds numbers"}]}]
        }
    });
    plugin.before_model(&callback, &request).await;
    plugin
        .after_model(
            &callback,
            &json!({
                "content": {"role": "model", "parts": [{"function_call": {"id": "call-1", "name": "calc", "args": {"a": 2, "b": 2}}}]},
                "usage_metadata": {"prompt_token_count": 12, "candidates_token_count": 5}
            }),
        )
        .await;

    let tool = json!({"name": "calc", "description": "Adds numbers"});
    let args = json!({"a": 2, "b": 2});
    plugin.before_tool(&tool, &args, &tool_context).await;
    plugin
        .after_tool(&tool, &args, &tool_context, &json!({"result": 4}))
        .await;

    let done = json!({
        "agent_name": "assistant",
        "_invocation_context": {
            "invocation_id": "e-42",
            "session": {
                "id": "session-1",
                "events": [{"author": "assistant", "content": {"role": "model", "parts": [{"text": "4"}]}, "is_final_response": true}]
            }
        }
    });
    plugin.after_agent(&done).await;
    plugin.after_run(&done).await;

    plugin.observer().logger().terminate().await?;
    Ok(())
}

//! CrewAI event stream handler.
//!
//! Crew kickoffs become traces, tasks become workflow spans, agent
//! executions become agent spans, and tool usages and LLM calls become
//! leaves under the agent that made them.

use crate::graph::{deliver, Ended, NodeGraph, Step};
use crate::never_raise;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spanwise_core::{serialize_to_str, Message, TraceError, STATUS_FAILURE, STATUS_OK};
use spanwise_monitor::{AgentSpan, LlmSpan, Span, TokenUsage, ToolSpan, Trace, TraceLogger, WorkflowSpan};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// One event from the CrewAI event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CrewEvent {
    CrewKickoffStarted {
        crew_id: String,
        crew_name: String,
        #[serde(default)]
        inputs: Value,
    },
    CrewKickoffCompleted {
        crew_id: String,
        output: String,
    },
    CrewKickoffFailed {
        crew_id: String,
        error: String,
    },
    TaskStarted {
        task_id: String,
        crew_id: String,
        description: String,
    },
    TaskCompleted {
        task_id: String,
        output: String,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
    AgentExecutionStarted {
        agent_id: String,
        task_id: String,
        role: String,
        task_prompt: String,
    },
    AgentExecutionCompleted {
        agent_id: String,
        output: String,
    },
    AgentExecutionError {
        agent_id: String,
        error: String,
    },
    ToolUsageStarted {
        agent_id: String,
        tool_name: String,
        #[serde(default)]
        tool_args: Value,
    },
    ToolUsageFinished {
        agent_id: String,
        tool_name: String,
        #[serde(default)]
        output: Value,
    },
    ToolUsageError {
        agent_id: String,
        tool_name: String,
        error: String,
    },
    LlmCallStarted {
        call_id: String,
        agent_id: Option<String>,
        model: Option<String>,
        #[serde(default)]
        messages: Vec<Message>,
        #[serde(default)]
        tools: Vec<Value>,
    },
    LlmCallCompleted {
        call_id: String,
        response: String,
        #[serde(default)]
        usage: Option<TokenUsage>,
    },
    LlmCallFailed {
        call_id: String,
        error: String,
    },
}

impl CrewEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CrewEvent::CrewKickoffStarted { .. } => "crew_kickoff_started",
            CrewEvent::CrewKickoffCompleted { .. } => "crew_kickoff_completed",
            CrewEvent::CrewKickoffFailed { .. } => "crew_kickoff_failed",
            CrewEvent::TaskStarted { .. } => "task_started",
            CrewEvent::TaskCompleted { .. } => "task_completed",
            CrewEvent::TaskFailed { .. } => "task_failed",
            CrewEvent::AgentExecutionStarted { .. } => "agent_execution_started",
            CrewEvent::AgentExecutionCompleted { .. } => "agent_execution_completed",
            CrewEvent::AgentExecutionError { .. } => "agent_execution_error",
            CrewEvent::ToolUsageStarted { .. } => "tool_usage_started",
            CrewEvent::ToolUsageFinished { .. } => "tool_usage_finished",
            CrewEvent::ToolUsageError { .. } => "tool_usage_error",
            CrewEvent::LlmCallStarted { .. } => "llm_call_started",
            CrewEvent::LlmCallCompleted { .. } => "llm_call_completed",
            CrewEvent::LlmCallFailed { .. } => "llm_call_failed",
        }
    }
}

fn crew_key(id: &str) -> String {
    format!("crew:{}", id)
}

fn task_key(id: &str) -> String {
    format!("task:{}", id)
}

fn agent_key(id: &str) -> String {
    format!("agent:{}", id)
}

fn llm_key(id: &str) -> String {
    format!("llm:{}", id)
}

fn tool_key(agent_id: &str, tool_name: &str) -> String {
    format!("tool:{}:{}", agent_id, tool_name)
}

/// Maps CrewAI events onto traces.
pub struct CrewHandler {
    logger: Arc<TraceLogger>,
    graph: Mutex<NodeGraph>,
    /// Event key to node id for crews, tasks, agents and LLM calls.
    nodes: DashMap<String, Uuid>,
    /// Open tool usages per agent and tool name, most recent last.
    tools: DashMap<String, Vec<Uuid>>,
    flush_on_commit: bool,
}

impl CrewHandler {
    pub fn new(logger: Arc<TraceLogger>) -> Self {
        Self {
            logger,
            graph: Mutex::new(NodeGraph::new()),
            nodes: DashMap::new(),
            tools: DashMap::new(),
            flush_on_commit: true,
        }
    }

    pub fn with_flush_on_commit(mut self, enabled: bool) -> Self {
        self.flush_on_commit = enabled;
        self
    }

    pub fn open_nodes(&self) -> usize {
        self.graph().len()
    }

    fn graph(&self) -> MutexGuard<'_, NodeGraph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handles one event. Never fails.
    pub async fn handle(&self, event: CrewEvent) {
        let name = event.name();
        never_raise(name, self.dispatch(event)).await;
    }

    fn start(&self, key: String, parent: Option<Uuid>, step: Step) {
        let id = Uuid::new_v4();
        self.graph().start(id, parent, step);
        self.nodes.insert(key, id);
    }

    fn lookup(&self, key: &str) -> Option<Uuid> {
        self.nodes.get(key).map(|id| *id)
    }

    async fn end(&self, key: &str, status_code: u16, output: Option<String>) -> Result<(), TraceError> {
        let Some((_, id)) = self.nodes.remove(key) else {
            tracing::debug!(key, "End event without a matching start");
            return Ok(());
        };
        self.end_id(id, status_code, output).await
    }

    async fn end_id(&self, id: Uuid, status_code: u16, output: Option<String>) -> Result<(), TraceError> {
        let ended = self.graph().end(id, status_code, move |step| {
            if let Some(output) = output {
                step.set_output(output);
            }
        })?;
        if let Ended::Committed(trace) = ended {
            deliver(&self.logger, trace, None, self.flush_on_commit).await?;
        }
        Ok(())
    }

    /// Ends a crew. Whatever it left open is closed as failed first, and
    /// every event key under it is forgotten.
    async fn end_crew(&self, crew_id: &str, status_code: u16, output: String) -> Result<(), TraceError> {
        let Some((_, root)) = self.nodes.remove(&crew_key(crew_id)) else {
            tracing::debug!(crew_id, "Crew end without a matching kickoff");
            return Ok(());
        };
        let (orphans, owned) = {
            let graph = self.graph();
            (graph.open_subtree(root), graph.subtree(root))
        };
        self.release_keys(&owned);
        for id in orphans {
            tracing::debug!(crew_id, node_id = %id, "Closing span left open by crew");
            self.end_id(id, STATUS_FAILURE, None).await?;
        }
        self.end_id(root, status_code, Some(output)).await
    }

    fn release_keys(&self, ids: &[Uuid]) {
        if ids.is_empty() {
            return;
        }
        let ids: HashSet<Uuid> = ids.iter().copied().collect();
        self.nodes.retain(|_, id| !ids.contains(id));
        self.tools.retain(|_, stack| {
            stack.retain(|id| !ids.contains(id));
            !stack.is_empty()
        });
    }

    async fn dispatch(&self, event: CrewEvent) -> Result<(), TraceError> {
        match event {
            CrewEvent::CrewKickoffStarted {
                crew_id,
                crew_name,
                inputs,
            } => {
                let mut trace = Trace::new(serialize_to_str(&inputs)).with_name(crew_name);
                trace.base.user_metadata.insert("crew_id".into(), crew_id.clone());
                trace.base.user_metadata.insert("integration".into(), "crewai".into());
                self.start(crew_key(&crew_id), None, Step::Run(trace));
            }
            CrewEvent::CrewKickoffCompleted { crew_id, output } => {
                self.end_crew(&crew_id, STATUS_OK, output).await?;
            }
            CrewEvent::CrewKickoffFailed { crew_id, error } => {
                self.end_crew(&crew_id, STATUS_FAILURE, error).await?;
            }
            CrewEvent::TaskStarted {
                task_id,
                crew_id,
                description,
            } => {
                let parent = self.lookup(&crew_key(&crew_id));
                let span = WorkflowSpan::new(format!("task {}", task_id), description);
                self.start(task_key(&task_id), parent, Step::Span(Span::Workflow(span)));
            }
            CrewEvent::TaskCompleted { task_id, output } => {
                self.end(&task_key(&task_id), STATUS_OK, Some(output)).await?;
            }
            CrewEvent::TaskFailed { task_id, error } => {
                self.end(&task_key(&task_id), STATUS_FAILURE, Some(error)).await?;
            }
            CrewEvent::AgentExecutionStarted {
                agent_id,
                task_id,
                role,
                task_prompt,
            } => {
                let parent = self.lookup(&task_key(&task_id));
                let mut span = AgentSpan::new(role.clone(), task_prompt);
                span.base.user_metadata.insert("agent_name".into(), role);
                self.start(agent_key(&agent_id), parent, Step::Span(Span::Agent(span)));
            }
            CrewEvent::AgentExecutionCompleted { agent_id, output } => {
                self.end(&agent_key(&agent_id), STATUS_OK, Some(output)).await?;
            }
            CrewEvent::AgentExecutionError { agent_id, error } => {
                self.end(&agent_key(&agent_id), STATUS_FAILURE, Some(error)).await?;
            }
            CrewEvent::ToolUsageStarted {
                agent_id,
                tool_name,
                tool_args,
            } => {
                let parent = self.lookup(&agent_key(&agent_id));
                let id = Uuid::new_v4();
                let span = ToolSpan::new(tool_name.clone(), serialize_to_str(&tool_args));
                self.graph().start(id, parent, Step::Span(Span::Tool(span)));
                self.tools.entry(tool_key(&agent_id, &tool_name)).or_default().push(id);
            }
            CrewEvent::ToolUsageFinished {
                agent_id,
                tool_name,
                output,
            } => {
                if let Some(id) = self.pop_tool(&agent_id, &tool_name) {
                    self.end_id(id, STATUS_OK, Some(serialize_to_str(&output))).await?;
                }
            }
            CrewEvent::ToolUsageError {
                agent_id,
                tool_name,
                error,
            } => {
                if let Some(id) = self.pop_tool(&agent_id, &tool_name) {
                    self.end_id(id, STATUS_FAILURE, Some(error)).await?;
                }
            }
            CrewEvent::LlmCallStarted {
                call_id,
                agent_id,
                model,
                messages,
                tools,
            } => {
                let parent = agent_id.and_then(|a| self.lookup(&agent_key(&a)));
                let mut span = LlmSpan::new(model.clone().unwrap_or_else(|| "llm".into()), messages);
                span.model = model;
                span.tools = tools;
                self.start(llm_key(&call_id), parent, Step::Span(Span::Llm(span)));
            }
            CrewEvent::LlmCallCompleted {
                call_id,
                response,
                usage,
            } => {
                let Some((_, id)) = self.nodes.remove(&llm_key(&call_id)) else {
                    tracing::debug!(call_id = %call_id, "LLM completion without a matching start");
                    return Ok(());
                };
                let ended = self.graph().end(id, STATUS_OK, move |step| {
                    if let Step::Span(Span::Llm(llm)) = step {
                        llm.output = Some(Message::assistant(response));
                        llm.usage = usage.unwrap_or_default();
                    }
                })?;
                if let Ended::Committed(trace) = ended {
                    deliver(&self.logger, trace, None, self.flush_on_commit).await?;
                }
            }
            CrewEvent::LlmCallFailed { call_id, error } => {
                self.end(&llm_key(&call_id), STATUS_FAILURE, Some(error)).await?;
            }
        }
        Ok(())
    }

    fn pop_tool(&self, agent_id: &str, tool_name: &str) -> Option<Uuid> {
        let key = tool_key(agent_id, tool_name);
        let id = self.tools.get_mut(&key).and_then(|mut stack| stack.pop());
        self.tools.remove_if(&key, |_, v| v.is_empty());
        if id.is_none() {
            tracing::debug!(agent_id, tool_name, "Tool event without a matching start");
        }
        id
    }
}

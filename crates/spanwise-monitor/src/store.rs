//! SQLite-backed trace storage.

use crate::ingest::{IngestRequest, Ingestor, SessionCreate, StreamEvent};
use crate::record::{SpanRecord, TraceQuery, TraceRecord, TraceStatus};
use crate::span::{Span, Trace};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use spanwise_core::{now_ms, TraceError};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

/// Errors from trace store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Lock error")]
    Lock,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for TraceError {
    fn from(err: StoreError) -> Self {
        TraceError::Ingest(err.to_string())
    }
}

/// SQLite-backed trace storage.
pub struct TraceStore {
    conn: Mutex<Connection>,
}

impl TraceStore {
    /// Creates a new trace store with the given database path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Creates an in-memory trace store (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS traces (
                trace_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                input TEXT NOT NULL,
                output TEXT NOT NULL,
                duration_ns INTEGER NOT NULL,
                status_code INTEGER,
                status TEXT NOT NULL,
                session_id TEXT,
                llm_calls INTEGER NOT NULL,
                tool_calls INTEGER NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                body TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS spans (
                span_id TEXT PRIMARY KEY,
                trace_id TEXT NOT NULL,
                parent_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                input TEXT NOT NULL,
                output TEXT NOT NULL,
                duration_ns INTEGER NOT NULL,
                status_code INTEGER,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                body TEXT NOT NULL,
                FOREIGN KEY (trace_id) REFERENCES traces(trace_id)
            );

            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                name TEXT,
                external_id TEXT,
                previous_session_id TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_traces_created ON traces(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_traces_session ON traces(session_id);
            CREATE INDEX IF NOT EXISTS idx_spans_trace ON spans(trace_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_external ON sessions(external_id);
            "#,
        )?;

        Ok(())
    }

    /// Inserts or replaces a trace together with all of its spans.
    pub fn insert_trace(&self, trace: &Trace, session_id: Option<&str>) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        let tx = conn.transaction()?;
        let trace_id = trace.id().to_string();

        tx.execute("DELETE FROM spans WHERE trace_id = ?1", params![trace_id])?;
        write_trace_row(&tx, trace, session_id, true)?;
        for (parent, span) in trace.flatten() {
            write_span_row(&tx, &trace_id, &parent.to_string(), span)?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Records the start of a streamed trace.
    pub fn begin_trace(&self, trace: &Trace, session_id: Option<&str>) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        write_trace_row(&conn, trace, session_id, false)
    }

    /// Records one streamed span.
    pub fn insert_span(&self, trace_id: Uuid, parent_id: Uuid, span: &Span) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        write_span_row(&conn, &trace_id.to_string(), &parent_id.to_string(), span)
    }

    /// Applies a streamed conclusion to a trace or span row.
    pub fn update_step(
        &self,
        trace_id: Uuid,
        step_id: Uuid,
        output: Option<&str>,
        status_code: Option<u16>,
        duration_ns: Option<u64>,
    ) -> Result<(), StoreError> {
        let is_trace = trace_id == step_id;
        {
            let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
            let table = if is_trace { "traces" } else { "spans" };
            let key = if is_trace { "trace_id" } else { "span_id" };
            let body: Option<String> = conn
                .query_row(
                    &format!("SELECT body FROM {table} WHERE {key} = ?1"),
                    params![step_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(body) = body else {
                tracing::debug!(step_id = %step_id, "Update for unknown step");
                return Ok(());
            };

            let body = if is_trace {
                let mut trace: Trace = serde_json::from_str(&body)?;
                if let Some(out) = output {
                    trace.output = Some(out.to_string());
                }
                trace.base.status_code = status_code.or(trace.base.status_code);
                trace.base.duration_ns = duration_ns.or(trace.base.duration_ns);
                serde_json::to_string(&trace)?
            } else {
                let mut span: Span = serde_json::from_str(&body)?;
                if let Some(out) = output {
                    span.set_output_text(out.to_string());
                }
                let base = span.base_mut();
                base.status_code = status_code.or(base.status_code);
                base.duration_ns = duration_ns.or(base.duration_ns);
                serde_json::to_string(&span)?
            };

            conn.execute(
                &format!(
                    "UPDATE {table} SET output = COALESCE(?1, output), status_code = COALESCE(?2, status_code),
                     duration_ns = COALESCE(?3, duration_ns), body = ?4 WHERE {key} = ?5"
                ),
                params![output, status_code, duration_ns, body, step_id.to_string()],
            )?;
        }

        if is_trace {
            self.refresh_summary(trace_id)?;
        }
        Ok(())
    }

    fn refresh_summary(&self, trace_id: Uuid) -> Result<(), StoreError> {
        let Some(trace) = self.get_trace(&trace_id.to_string())? else {
            return Ok(());
        };
        let summary = trace.summary();
        let status = TraceStatus::from_code(trace.base.status_code, true);
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        conn.execute(
            r#"UPDATE traces SET status = ?1, llm_calls = ?2, tool_calls = ?3,
               input_tokens = ?4, output_tokens = ?5 WHERE trace_id = ?6"#,
            params![
                status.as_str(),
                summary.llm_calls,
                summary.tool_calls,
                summary.input_tokens,
                summary.output_tokens,
                trace_id.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Retrieves a trace by ID with its span tree rebuilt.
    pub fn get_trace(&self, trace_id: &str) -> Result<Option<Trace>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM traces WHERE trace_id = ?1",
                params![trace_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(body) = body else { return Ok(None) };
        let mut trace: Trace = serde_json::from_str(&body)?;

        let mut stmt = conn.prepare(
            "SELECT span_id, parent_id, body FROM spans WHERE trace_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![trace_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut nodes = HashMap::new();
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            let (span_id, parent_id, body) = row?;
            let span: Span = serde_json::from_str(&body)?;
            children.entry(parent_id).or_default().push(span_id.clone());
            nodes.insert(span_id, span);
        }

        trace.spans = assemble(trace_id, &mut nodes, &children);
        Ok(Some(trace))
    }

    /// Lists traces with optional filtering.
    pub fn list_traces(&self, query: &TraceQuery) -> Result<Vec<TraceRecord>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        let mut sql = String::from(
            r#"SELECT trace_id, name, created_at, input, output, duration_ns, status_code,
               status, session_id, llm_calls, tool_calls, input_tokens, output_tokens
               FROM traces WHERE 1=1"#,
        );

        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref sid) = query.session_id {
            sql.push_str(" AND session_id = ?");
            params_vec.push(Box::new(sid.clone()));
        }

        if let Some(status) = query.status {
            sql.push_str(" AND status = ?");
            params_vec.push(Box::new(status.as_str().to_string()));
        }

        sql.push_str(" ORDER BY created_at DESC");

        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        if let Some(offset) = query.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        let mut stmt = conn.prepare(&sql)?;

        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

        let rows = stmt.query_map(params_refs.as_slice(), |row| {
            Ok(TraceRecord {
                trace_id: row.get(0)?,
                name: row.get(1)?,
                created_at: row.get(2)?,
                input: row.get(3)?,
                output: row.get(4)?,
                duration_ns: row.get(5)?,
                status_code: row.get(6)?,
                status: TraceStatus::from_str(&row.get::<_, String>(7)?),
                session_id: row.get(8)?,
                llm_calls: row.get(9)?,
                tool_calls: row.get(10)?,
                input_tokens: row.get(11)?,
                output_tokens: row.get(12)?,
            })
        })?;

        let mut traces = Vec::new();
        for row in rows {
            traces.push(row?);
        }

        Ok(traces)
    }

    /// Gets all spans for a trace, in insertion order.
    pub fn get_spans(&self, trace_id: &str) -> Result<Vec<SpanRecord>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        let mut stmt = conn.prepare(
            r#"SELECT span_id, trace_id, parent_id, kind, name, created_at, input, output,
               duration_ns, status_code, input_tokens, output_tokens
               FROM spans WHERE trace_id = ?1 ORDER BY rowid"#,
        )?;

        let rows = stmt.query_map(params![trace_id], |row| {
            Ok(SpanRecord {
                span_id: row.get(0)?,
                trace_id: row.get(1)?,
                parent_id: row.get(2)?,
                kind: row.get(3)?,
                name: row.get(4)?,
                created_at: row.get(5)?,
                input: row.get(6)?,
                output: row.get(7)?,
                duration_ns: row.get(8)?,
                status_code: row.get(9)?,
                input_tokens: row.get(10)?,
                output_tokens: row.get(11)?,
            })
        })?;

        let mut spans = Vec::new();
        for row in rows {
            spans.push(row?);
        }

        Ok(spans)
    }

    /// Deletes a trace and all its spans.
    pub fn delete_trace(&self, trace_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        conn.execute("DELETE FROM spans WHERE trace_id = ?1", params![trace_id])?;
        conn.execute("DELETE FROM traces WHERE trace_id = ?1", params![trace_id])?;

        Ok(())
    }

    pub fn insert_session(&self, session: &SessionCreate) -> Result<String, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        let id = Uuid::new_v4().to_string();
        conn.execute(
            r#"INSERT INTO sessions (session_id, name, external_id, previous_session_id, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                id,
                session.name,
                session.external_id,
                session.previous_session_id,
                now_ms(),
            ],
        )?;
        Ok(id)
    }

    pub fn find_session(&self, external_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        Ok(conn
            .query_row(
                "SELECT session_id FROM sessions WHERE external_id = ?1 ORDER BY created_at DESC LIMIT 1",
                params![external_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Gets aggregate metrics for the dashboard.
    pub fn get_metrics_summary(&self) -> Result<MetricsSummary, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        let mut stmt = conn.prepare(
            r#"SELECT
               COUNT(*) as total_traces,
               COALESCE(SUM(input_tokens), 0) as total_input_tokens,
               COALESCE(SUM(output_tokens), 0) as total_output_tokens,
               COALESCE(SUM(tool_calls), 0) as total_tool_calls,
               COALESCE(SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END), 0) as error_traces,
               COALESCE(AVG(duration_ns), 0) / 1000000.0 as avg_latency_ms
               FROM traces"#,
        )?;

        let summary = stmt.query_row([], |row| {
            Ok(MetricsSummary {
                total_traces: row.get(0)?,
                total_input_tokens: row.get(1)?,
                total_output_tokens: row.get(2)?,
                total_tool_calls: row.get(3)?,
                error_traces: row.get(4)?,
                avg_latency_ms: row.get(5)?,
            })
        })?;

        Ok(summary)
    }
}

fn write_trace_row(
    conn: &Connection,
    trace: &Trace,
    session_id: Option<&str>,
    complete: bool,
) -> Result<(), StoreError> {
    let mut shell = trace.clone();
    shell.spans.clear();
    let summary = trace.summary();
    let status = TraceStatus::from_code(trace.base.status_code, complete);

    conn.execute(
        r#"INSERT OR REPLACE INTO traces
           (trace_id, name, created_at, input, output, duration_ns, status_code, status,
            session_id, llm_calls, tool_calls, input_tokens, output_tokens, body)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"#,
        params![
            trace.id().to_string(),
            trace.base.name,
            trace.base.created_at,
            trace.input,
            trace.output.clone().unwrap_or_default(),
            trace.base.duration_ns.unwrap_or(0),
            trace.base.status_code,
            status.as_str(),
            session_id,
            summary.llm_calls,
            summary.tool_calls,
            summary.input_tokens,
            summary.output_tokens,
            serde_json::to_string(&shell)?,
        ],
    )?;
    Ok(())
}

fn write_span_row(conn: &Connection, trace_id: &str, parent_id: &str, span: &Span) -> Result<(), StoreError> {
    let mut shell = span.clone();
    if let Some(children) = shell.children_mut() {
        children.clear();
    }
    let (input_tokens, output_tokens) = match span {
        Span::Llm(llm) => (llm.usage.input_tokens, llm.usage.output_tokens),
        _ => (0, 0),
    };

    conn.execute(
        r#"INSERT OR REPLACE INTO spans
           (span_id, trace_id, parent_id, kind, name, created_at, input, output,
            duration_ns, status_code, input_tokens, output_tokens, body)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"#,
        params![
            span.id().to_string(),
            trace_id,
            parent_id,
            span.kind().as_str(),
            span.name(),
            span.base().created_at,
            span.input_text(),
            span.output_text().unwrap_or_default(),
            span.base().duration_ns.unwrap_or(0),
            span.base().status_code,
            input_tokens,
            output_tokens,
            serde_json::to_string(&shell)?,
        ],
    )?;
    Ok(())
}

fn assemble(
    parent: &str,
    nodes: &mut HashMap<String, Span>,
    children: &HashMap<String, Vec<String>>,
) -> Vec<Span> {
    let Some(ids) = children.get(parent) else {
        return Vec::new();
    };
    let mut spans = Vec::with_capacity(ids.len());
    for id in ids {
        let Some(mut span) = nodes.remove(id) else { continue };
        let nested = assemble(id, nodes, children);
        if let Some(slot) = span.children_mut() {
            *slot = nested;
        }
        spans.push(span);
    }
    spans
}

#[async_trait]
impl Ingestor for TraceStore {
    async fn ingest_traces(&self, request: &IngestRequest) -> Result<(), TraceError> {
        for trace in &request.traces {
            self.insert_trace(trace, request.session_id.as_deref())?;
        }
        tracing::debug!(traces = request.traces.len(), "Stored traces");
        Ok(())
    }

    async fn send_event(&self, event: &StreamEvent) -> Result<(), TraceError> {
        match event {
            StreamEvent::TraceStarted { trace, session_id } => {
                self.begin_trace(trace, session_id.as_deref())?
            }
            StreamEvent::SpanAdded {
                trace_id,
                parent_id,
                span,
            } => self.insert_span(*trace_id, *parent_id, span)?,
            StreamEvent::StepUpdated {
                trace_id,
                step_id,
                output,
                status_code,
                duration_ns,
                ..
            } => self.update_step(*trace_id, *step_id, output.as_deref(), *status_code, *duration_ns)?,
            StreamEvent::TracesIngested { request } => self.ingest_traces(request).await?,
        }
        Ok(())
    }

    async fn create_session(&self, session: &SessionCreate) -> Result<String, TraceError> {
        Ok(self.insert_session(session)?)
    }

    async fn find_session_by_external_id(&self, external_id: &str) -> Result<Option<String>, TraceError> {
        Ok(self.find_session(external_id)?)
    }
}

/// Aggregate metrics summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_traces: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tool_calls: u64,
    pub error_traces: u64,
    pub avg_latency_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{AgentSpan, LlmSpan, TokenUsage, ToolSpan};
    use spanwise_core::Message;

    fn sample_trace() -> Trace {
        let mut agent = AgentSpan::new("A", "What is 2+2?");
        agent.spans.push(Span::Llm(
            LlmSpan::new("model", vec![Message::user("What is 2+2?")])
                .with_output(Message::assistant("4"))
                .with_usage(TokenUsage {
                    input_tokens: 5,
                    output_tokens: 10,
                    total_tokens: 15,
                    ..Default::default()
                }),
        ));
        agent.spans.push(Span::Tool(ToolSpan::new("calc", "{}").with_output("4")));
        let mut trace = Trace::new("What is 2+2?").with_name("invocation [A]");
        trace.output = Some("4".into());
        trace.base.status_code = Some(200);
        trace.base.duration_ns = Some(2_000_000);
        trace.spans.push(Span::Agent(agent));
        trace
    }

    #[test]
    fn test_trace_store_crud() {
        let store = TraceStore::in_memory().unwrap();
        let trace = sample_trace();
        let id = trace.id().to_string();

        store.insert_trace(&trace, Some("session-1")).unwrap();

        let retrieved = store.get_trace(&id).unwrap().unwrap();
        assert_eq!(retrieved, trace);

        let traces = store.list_traces(&TraceQuery::default()).unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].status, TraceStatus::Success);
        assert_eq!(traces[0].llm_calls, 1);
        assert_eq!(traces[0].tool_calls, 1);
        assert_eq!(traces[0].session_id.as_deref(), Some("session-1"));

        let spans = store.get_spans(&id).unwrap();
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].kind, "agent");
        assert_eq!(spans[1].parent_id, spans[0].span_id);
        assert_eq!(spans[1].output, "4");

        store.delete_trace(&id).unwrap();
        assert!(store.get_trace(&id).unwrap().is_none());
        assert!(store.get_spans(&id).unwrap().is_empty());
    }

    #[test]
    fn test_list_filters_by_status() {
        let store = TraceStore::in_memory().unwrap();
        store.insert_trace(&sample_trace(), None).unwrap();
        let mut failed = sample_trace();
        failed.base.status_code = Some(429);
        store.insert_trace(&failed, None).unwrap();

        let errors = store
            .list_traces(&TraceQuery {
                status: Some(TraceStatus::Error),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].status_code, Some(429));

        let summary = store.get_metrics_summary().unwrap();
        assert_eq!(summary.total_traces, 2);
        assert_eq!(summary.error_traces, 1);
        assert_eq!(summary.total_input_tokens, 10);
        assert!((summary.avg_latency_ms - 2.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_streamed_events_rebuild_tree() {
        let store = TraceStore::in_memory().unwrap();
        let trace = Trace::new("q");
        let agent = Span::Agent(AgentSpan::new("A", "q"));
        let tool = Span::Tool(ToolSpan::new("calc", "{}"));

        store
            .send_event(&StreamEvent::TraceStarted {
                trace: trace.clone(),
                session_id: None,
            })
            .await
            .unwrap();
        for (parent, span) in [(trace.id(), &agent), (agent.id(), &tool)] {
            store
                .send_event(&StreamEvent::SpanAdded {
                    trace_id: trace.id(),
                    parent_id: parent,
                    span: span.clone(),
                })
                .await
                .unwrap();
        }

        let running = store.list_traces(&TraceQuery::default()).unwrap();
        assert_eq!(running[0].status, TraceStatus::Running);

        store
            .send_event(&StreamEvent::StepUpdated {
                trace_id: trace.id(),
                step_id: tool.id(),
                output: Some("4".into()),
                status_code: Some(200),
                duration_ns: Some(10),
                is_complete: false,
            })
            .await
            .unwrap();
        store
            .send_event(&StreamEvent::StepUpdated {
                trace_id: trace.id(),
                step_id: trace.id(),
                output: Some("4".into()),
                status_code: Some(200),
                duration_ns: Some(20),
                is_complete: true,
            })
            .await
            .unwrap();

        let rebuilt = store.get_trace(&trace.id().to_string()).unwrap().unwrap();
        assert_eq!(rebuilt.output.as_deref(), Some("4"));
        let nested = rebuilt.spans[0].children().unwrap();
        assert_eq!(nested[0].output_text().as_deref(), Some("4"));

        let listed = store.list_traces(&TraceQuery::default()).unwrap();
        assert_eq!(listed[0].status, TraceStatus::Success);
        assert_eq!(listed[0].tool_calls, 1);
    }

    #[tokio::test]
    async fn test_sessions() {
        let store = TraceStore::in_memory().unwrap();
        let id = store
            .create_session(&SessionCreate {
                name: Some("chat".into()),
                previous_session_id: None,
                external_id: Some("ext".into()),
            })
            .await
            .unwrap();
        assert_eq!(store.find_session_by_external_id("ext").await.unwrap(), Some(id));
        assert_eq!(store.find_session_by_external_id("nope").await.unwrap(), None);
    }
}

//! HTTP ingestion client.

use crate::ingest::{IngestRequest, Ingestor, SessionCreate, StreamEvent};
use crate::span::{Span, Trace};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use spanwise_config::LoggerConfig;
use spanwise_core::TraceError;
use uuid::Uuid;

#[derive(Serialize)]
struct TracesBody<'a> {
    log_stream: Option<&'a str>,
    experiment_id: Option<&'a str>,
    session_id: Option<&'a str>,
    session_external_id: Option<&'a str>,
    traces: &'a [Trace],
}

#[derive(Serialize)]
struct SpanBody<'a> {
    log_stream: Option<&'a str>,
    trace_id: Uuid,
    parent_id: Uuid,
    span: &'a Span,
}

#[derive(Serialize)]
struct StepUpdateBody<'a> {
    log_stream: Option<&'a str>,
    output: Option<&'a str>,
    status_code: Option<u16>,
    duration_ns: Option<u64>,
    is_complete: bool,
}

#[derive(Serialize)]
struct SessionSearch<'a> {
    external_id: &'a str,
    limit: u32,
}

#[derive(Deserialize)]
struct SessionRecord {
    id: String,
}

#[derive(Deserialize)]
struct SessionSearchResponse {
    #[serde(default)]
    records: Vec<SessionRecord>,
}

/// Sends traces, stream events and session requests to a remote backend.
pub struct HttpIngestor {
    client: Client,
    base_url: String,
    api_key: String,
    project: String,
    log_stream: Option<String>,
    experiment_id: Option<String>,
}

impl HttpIngestor {
    pub fn new(config: &LoggerConfig) -> Result<Self, TraceError> {
        config
            .validate(false)
            .map_err(|e| TraceError::InvalidState(e.to_string()))?;
        let base_url = config
            .api_url
            .clone()
            .ok_or_else(|| TraceError::InvalidState("api_url is required for HTTP ingestion".into()))?;
        let project = config
            .project
            .clone()
            .ok_or_else(|| TraceError::InvalidState("project is required for HTTP ingestion".into()))?;

        Ok(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().unwrap_or_default(),
            project,
            log_stream: config.log_stream.clone(),
            experiment_id: config.experiment_id.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/projects/{}/{}", self.base_url, self.project, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header("x-api-key", &self.api_key)
            .header("content-type", "application/json")
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, TraceError> {
        let response = builder
            .send()
            .await
            .map_err(|e| TraceError::Ingest(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TraceError::Ingest(format!("backend error {}: {}", status, body)));
        }
        Ok(response)
    }
}

#[async_trait]
impl Ingestor for HttpIngestor {
    async fn ingest_traces(&self, request: &IngestRequest) -> Result<(), TraceError> {
        let body = TracesBody {
            log_stream: request.log_stream.as_deref().or(self.log_stream.as_deref()),
            experiment_id: request.experiment_id.as_deref().or(self.experiment_id.as_deref()),
            session_id: request.session_id.as_deref(),
            session_external_id: request.session_external_id.as_deref(),
            traces: &request.traces,
        };
        self.send(self.request(Method::POST, "traces").json(&body)).await?;
        tracing::debug!(traces = request.traces.len(), "Posted traces");
        Ok(())
    }

    async fn send_event(&self, event: &StreamEvent) -> Result<(), TraceError> {
        let log_stream = self.log_stream.as_deref();
        let builder = match event {
            StreamEvent::TraceStarted { trace, session_id } => {
                let body = TracesBody {
                    log_stream,
                    experiment_id: self.experiment_id.as_deref(),
                    session_id: session_id.as_deref(),
                    session_external_id: None,
                    traces: std::slice::from_ref(trace),
                };
                self.request(Method::POST, "traces").json(&body)
            }
            StreamEvent::SpanAdded {
                trace_id,
                parent_id,
                span,
            } => self.request(Method::POST, "spans").json(&SpanBody {
                log_stream,
                trace_id: *trace_id,
                parent_id: *parent_id,
                span,
            }),
            StreamEvent::StepUpdated {
                trace_id,
                step_id,
                output,
                status_code,
                duration_ns,
                is_complete,
            } => {
                let path = if trace_id == step_id {
                    format!("traces/{}", trace_id)
                } else {
                    format!("spans/{}", step_id)
                };
                self.request(Method::PATCH, &path).json(&StepUpdateBody {
                    log_stream,
                    output: output.as_deref(),
                    status_code: *status_code,
                    duration_ns: *duration_ns,
                    is_complete: *is_complete,
                })
            }
            StreamEvent::TracesIngested { request } => return self.ingest_traces(request).await,
        };
        self.send(builder).await?;
        Ok(())
    }

    async fn create_session(&self, session: &SessionCreate) -> Result<String, TraceError> {
        let response = self
            .send(self.request(Method::POST, "sessions").json(session))
            .await?;
        let record: SessionRecord = response
            .json()
            .await
            .map_err(|e| TraceError::Ingest(e.to_string()))?;
        Ok(record.id)
    }

    async fn find_session_by_external_id(&self, external_id: &str) -> Result<Option<String>, TraceError> {
        let response = self
            .send(
                self.request(Method::POST, "sessions/search")
                    .json(&SessionSearch { external_id, limit: 1 }),
            )
            .await?;
        let found: SessionSearchResponse = response
            .json()
            .await
            .map_err(|e| TraceError::Ingest(e.to_string()))?;
        Ok(found.records.into_iter().next().map(|r| r.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_api_url_and_project() {
        assert!(HttpIngestor::new(&LoggerConfig::new().with_project("p")).is_err());
        assert!(HttpIngestor::new(&LoggerConfig::new().with_api("http://localhost", "k")).is_err());
        let no_stream = LoggerConfig::new().with_project("p").with_api("http://localhost", "k");
        assert!(HttpIngestor::new(&no_stream).is_err());
    }

    #[test]
    fn test_url_layout() {
        let config = LoggerConfig::new()
            .with_project("demo")
            .with_log_stream("dev")
            .with_api("http://localhost:8088/v2/", "key");
        let ingestor = HttpIngestor::new(&config).unwrap();
        assert_eq!(ingestor.url("traces"), "http://localhost:8088/v2/projects/demo/traces");
    }
}

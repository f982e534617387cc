//! Run/span correlation.
//!
//! Host callbacks arrive as independent before/after pairs. The [`Tracker`]
//! remembers which span each open callback belongs to. Runs, agents and
//! LLM calls are partitioned by invocation id; tools and active tools by
//! session id, so a tool that spawns a sub-invocation with a new invocation
//! id can still be found.

use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct RunEntry {
    run_id: Uuid,
    session_id: Option<String>,
}

#[derive(Debug, Clone)]
struct AgentEntry {
    name: String,
    span_id: Uuid,
}

#[derive(Debug, Clone)]
struct LlmEntry {
    request_id: Option<String>,
    span_id: Uuid,
}

#[derive(Debug, Clone)]
struct ToolEntry {
    key: String,
    invocation_id: String,
    span_id: Uuid,
}

/// Spans removed by [`Tracker::cleanup_invocation`], innermost first within
/// each kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cleanup {
    pub llms: Vec<Uuid>,
    pub tools: Vec<Uuid>,
    pub agents: Vec<Uuid>,
    pub run: Option<Uuid>,
}

impl Cleanup {
    pub fn is_empty(&self) -> bool {
        self.llms.is_empty() && self.tools.is_empty() && self.agents.is_empty() && self.run.is_none()
    }
}

/// Inputs to [`Tracker::resolve_parent`].
#[derive(Debug, Clone, Copy)]
pub struct ParentQuery<'a> {
    pub invocation_id: &'a str,
    /// Agent whose span should parent the new step.
    pub agent_name: Option<&'a str>,
    /// Ancestors of a nested agent, nearest first.
    pub ancestors: &'a [String],
    /// Session whose active tool is the last resort.
    pub session_id: &'a str,
}

/// Correlates host callbacks with open span ids.
#[derive(Debug, Default)]
pub struct Tracker {
    runs: DashMap<String, RunEntry>,
    agents: DashMap<String, Vec<AgentEntry>>,
    llms: DashMap<String, Vec<LlmEntry>>,
    tools: DashMap<String, Vec<ToolEntry>>,
    active_tools: DashMap<String, Vec<Uuid>>,
    metadata: DashMap<String, BTreeMap<String, String>>,
    session_roots: DashMap<String, String>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Runs
    // ─────────────────────────────────────────────────────────────────────────

    /// Run id for the invocation, creating one if none is active.
    pub fn register_run(&self, invocation_id: &str, session_id: Option<&str>) -> Uuid {
        self.open_run(invocation_id, session_id)
            .or_else(|| self.get_run(invocation_id))
            .unwrap_or_default()
    }

    /// Creates a run for the invocation. Returns `None` when one is
    /// already active.
    pub fn open_run(&self, invocation_id: &str, session_id: Option<&str>) -> Option<Uuid> {
        let mut created = None;
        self.runs.entry(invocation_id.to_string()).or_insert_with(|| {
            let run_id = Uuid::new_v4();
            created = Some(run_id);
            RunEntry {
                run_id,
                session_id: session_id.map(str::to_string),
            }
        });
        created
    }

    pub fn get_run(&self, invocation_id: &str) -> Option<Uuid> {
        self.runs.get(invocation_id).map(|r| r.run_id)
    }

    /// Invocations whose run id is in `ids`.
    pub fn runs_among(&self, ids: &HashSet<Uuid>) -> Vec<(String, Uuid)> {
        self.runs
            .iter()
            .filter(|r| ids.contains(&r.run_id))
            .map(|r| (r.key().clone(), r.run_id))
            .collect()
    }

    pub fn run_session(&self, invocation_id: &str) -> Option<String> {
        self.runs.get(invocation_id).and_then(|r| r.session_id.clone())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Agents
    // ─────────────────────────────────────────────────────────────────────────

    pub fn register_agent(&self, invocation_id: &str, agent_name: &str) -> Uuid {
        let span_id = Uuid::new_v4();
        self.agents
            .entry(invocation_id.to_string())
            .or_default()
            .push(AgentEntry {
                name: agent_name.to_string(),
                span_id,
            });
        span_id
    }

    /// Most recently registered span for the agent.
    pub fn get_agent(&self, invocation_id: &str, agent_name: &str) -> Option<Uuid> {
        self.agents
            .get(invocation_id)?
            .iter()
            .rev()
            .find(|a| a.name == agent_name)
            .map(|a| a.span_id)
    }

    pub fn unregister_agent(&self, invocation_id: &str, agent_name: &str) -> Option<Uuid> {
        let mut agents = self.agents.get_mut(invocation_id)?;
        let index = agents.iter().rposition(|a| a.name == agent_name)?;
        let entry = agents.remove(index);
        let now_empty = agents.is_empty();
        drop(agents);
        if now_empty {
            self.agents.remove_if(invocation_id, |_, v| v.is_empty());
        }
        Some(entry.span_id)
    }

    pub fn open_agents(&self, invocation_id: &str) -> usize {
        self.agents.get(invocation_id).map_or(0, |a| a.len())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // LLM calls
    // ─────────────────────────────────────────────────────────────────────────

    pub fn register_llm(&self, invocation_id: &str, request_id: Option<&str>) -> Uuid {
        let span_id = Uuid::new_v4();
        self.llms
            .entry(invocation_id.to_string())
            .or_default()
            .push(LlmEntry {
                request_id: request_id.map(str::to_string),
                span_id,
            });
        span_id
    }

    /// Removes the LLM span matching `request_id`. Without a request id the
    /// invocation's last-opened LLM span is used. An id that matches nothing
    /// removes nothing.
    pub fn pop_llm(&self, invocation_id: &str, request_id: Option<&str>) -> Option<Uuid> {
        let mut llms = self.llms.get_mut(invocation_id)?;
        let index = match request_id {
            Some(id) => {
                let matched = llms.iter().rposition(|l| l.request_id.as_deref() == Some(id));
                if matched.is_none() {
                    tracing::debug!(invocation_id, request_id = id, "No open LLM span for request id");
                }
                matched?
            }
            None => llms.len().checked_sub(1)?,
        };
        let entry = llms.remove(index);
        let now_empty = llms.is_empty();
        drop(llms);
        if now_empty {
            self.llms.remove_if(invocation_id, |_, v| v.is_empty());
        }
        Some(entry.span_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tools
    // ─────────────────────────────────────────────────────────────────────────

    pub fn register_tool(&self, session_id: &str, invocation_id: &str, key: &str) -> Uuid {
        let span_id = Uuid::new_v4();
        self.tools
            .entry(session_id.to_string())
            .or_default()
            .push(ToolEntry {
                key: key.to_string(),
                invocation_id: invocation_id.to_string(),
                span_id,
            });
        span_id
    }

    pub fn get_tool(&self, session_id: &str, key: &str) -> Option<Uuid> {
        self.tools
            .get(session_id)?
            .iter()
            .rev()
            .find(|t| t.key == key)
            .map(|t| t.span_id)
    }

    pub fn pop_tool(&self, session_id: &str, key: &str) -> Option<Uuid> {
        let mut tools = self.tools.get_mut(session_id)?;
        let index = tools.iter().rposition(|t| t.key == key)?;
        let entry = tools.remove(index);
        let now_empty = tools.is_empty();
        drop(tools);
        if now_empty {
            self.tools.remove_if(session_id, |_, v| v.is_empty());
        }
        Some(entry.span_id)
    }

    /// Makes `span_id` the session's active tool.
    pub fn set_active_tool(&self, session_id: &str, span_id: Uuid) {
        self.active_tools
            .entry(session_id.to_string())
            .or_default()
            .push(span_id);
    }

    /// The most recently set, still-active tool for the session.
    pub fn get_active_tool(&self, session_id: &str) -> Option<Uuid> {
        self.active_tools.get(session_id)?.last().copied()
    }

    /// Clears every active tool of the session.
    pub fn clear_active_tool(&self, session_id: &str) {
        self.active_tools.remove(session_id);
    }

    /// Removes one closed tool from the session's active set. Tools set
    /// after it stay active.
    pub fn release_active_tool(&self, session_id: &str, span_id: Uuid) -> bool {
        let Some(mut active) = self.active_tools.get_mut(session_id) else {
            return false;
        };
        let before = active.len();
        active.retain(|id| *id != span_id);
        let released = active.len() != before;
        let now_empty = active.is_empty();
        drop(active);
        if now_empty {
            self.active_tools.remove_if(session_id, |_, v| v.is_empty());
        }
        released
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metadata
    // ─────────────────────────────────────────────────────────────────────────

    /// Stores an invocation's own metadata. The first invocation with
    /// metadata in a session becomes the session's root until it is cleaned up.
    pub fn store_invocation_metadata(
        &self,
        invocation_id: &str,
        session_id: &str,
        metadata: BTreeMap<String, String>,
    ) {
        if metadata.is_empty() {
            return;
        }
        self.metadata.insert(invocation_id.to_string(), metadata);
        self.session_roots
            .entry(session_id.to_string())
            .or_insert_with(|| invocation_id.to_string());
    }

    /// Own metadata, else the session root's, else empty.
    pub fn get_invocation_metadata(&self, invocation_id: &str, session_id: &str) -> BTreeMap<String, String> {
        if let Some(own) = self.metadata.get(invocation_id) {
            return own.clone();
        }
        let Some(root) = self.session_roots.get(session_id).map(|r| r.clone()) else {
            return BTreeMap::new();
        };
        self.metadata
            .get(&root)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn session_root(&self, session_id: &str) -> Option<String> {
        self.session_roots.get(session_id).map(|r| r.clone())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Parents and cleanup
    // ─────────────────────────────────────────────────────────────────────────

    /// Parent for a new step: nearest registered ancestor agent, then the
    /// named agent, then the invocation's run, then the session's active tool.
    pub fn resolve_parent(&self, query: ParentQuery<'_>) -> Option<Uuid> {
        query
            .ancestors
            .iter()
            .find_map(|name| self.get_agent(query.invocation_id, name))
            .or_else(|| {
                query
                    .agent_name
                    .and_then(|name| self.get_agent(query.invocation_id, name))
            })
            .or_else(|| self.get_run(query.invocation_id))
            .or_else(|| self.get_active_tool(query.session_id))
            .or_else(|| {
                tracing::debug!(invocation_id = query.invocation_id, "No parent found for step");
                None
            })
    }

    /// Removes every entry owned by the invocation and returns the span ids
    /// that were still open. A second call returns an empty [`Cleanup`].
    pub fn cleanup_invocation(&self, invocation_id: &str) -> Cleanup {
        let mut cleanup = Cleanup {
            llms: self
                .llms
                .remove(invocation_id)
                .map(|(_, v)| v.into_iter().rev().map(|l| l.span_id).collect())
                .unwrap_or_default(),
            agents: self
                .agents
                .remove(invocation_id)
                .map(|(_, v)| v.into_iter().rev().map(|a| a.span_id).collect())
                .unwrap_or_default(),
            run: self.runs.remove(invocation_id).map(|(_, r)| r.run_id),
            ..Cleanup::default()
        };

        for mut entry in self.tools.iter_mut() {
            let owned: Vec<Uuid> = entry
                .iter()
                .rev()
                .filter(|t| t.invocation_id == invocation_id)
                .map(|t| t.span_id)
                .collect();
            entry.retain(|t| t.invocation_id != invocation_id);
            cleanup.tools.extend(owned);
        }
        self.tools.retain(|_, v| !v.is_empty());

        if !cleanup.tools.is_empty() {
            for mut active in self.active_tools.iter_mut() {
                active.retain(|id| !cleanup.tools.contains(id));
            }
            self.active_tools.retain(|_, v| !v.is_empty());
        }

        self.metadata.remove(invocation_id);
        self.session_roots.retain(|_, root| root.as_str() != invocation_id);
        cleanup
    }

    /// Entries of every kind still held for the invocation.
    pub fn entries_for(&self, invocation_id: &str) -> usize {
        let tools: usize = self
            .tools
            .iter()
            .map(|e| e.iter().filter(|t| t.invocation_id == invocation_id).count())
            .sum();
        usize::from(self.runs.contains_key(invocation_id))
            + usize::from(self.metadata.contains_key(invocation_id))
            + self.open_agents(invocation_id)
            + self.llms.get(invocation_id).map_or(0, |l| l.len())
            + tools
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
            && self.agents.is_empty()
            && self.llms.is_empty()
            && self.tools.is_empty()
            && self.active_tools.is_empty()
            && self.metadata.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_register_run_idempotent() {
        let tracker = Tracker::new();
        let a = tracker.register_run("inv1", Some("s1"));
        assert_eq!(tracker.register_run("inv1", Some("s1")), a);
        assert!(tracker.open_run("inv1", None).is_none());
        assert_ne!(tracker.register_run("inv2", Some("s1")), a);
        assert_eq!(tracker.run_session("inv1").as_deref(), Some("s1"));
    }

    #[test]
    fn test_agents_by_name() {
        let tracker = Tracker::new();
        let outer = tracker.register_agent("inv1", "router");
        let inner = tracker.register_agent("inv1", "worker");
        assert_eq!(tracker.get_agent("inv1", "router"), Some(outer));
        assert_eq!(tracker.open_agents("inv1"), 2);
        assert_eq!(tracker.unregister_agent("inv1", "worker"), Some(inner));
        assert_eq!(tracker.unregister_agent("inv1", "worker"), None);
        assert_eq!(tracker.get_agent("inv2", "router"), None);
    }

    #[test]
    fn test_llm_correlation_by_request_id() {
        let tracker = Tracker::new();
        let r1 = tracker.register_llm("inv1", Some("r1"));
        let r2 = tracker.register_llm("inv1", Some("r2"));
        assert_eq!(tracker.pop_llm("inv1", Some("r1")), Some(r1));
        assert_eq!(tracker.pop_llm("inv1", Some("r2")), Some(r2));
        assert_eq!(tracker.pop_llm("inv1", Some("r2")), None);
    }

    #[test]
    fn test_unmatched_request_id_leaves_spans_open() {
        let tracker = Tracker::new();
        let r1 = tracker.register_llm("inv1", Some("r1"));
        assert_eq!(tracker.pop_llm("inv1", Some("r9")), None);
        assert_eq!(tracker.entries_for("inv1"), 1);
        assert_eq!(tracker.pop_llm("inv1", Some("r1")), Some(r1));
    }

    #[test]
    fn test_runs_among() {
        let tracker = Tracker::new();
        let outer = tracker.register_run("inv1", Some("s1"));
        let inner = tracker.register_run("inv2", Some("s1"));
        let ids: HashSet<Uuid> = [inner, Uuid::new_v4()].into();
        assert_eq!(tracker.runs_among(&ids), vec![("inv2".to_string(), inner)]);
        assert_ne!(outer, inner);
    }

    #[test]
    fn test_llm_correlation_without_request_id() {
        let tracker = Tracker::new();
        let span = tracker.register_llm("inv1", None);
        assert_eq!(tracker.pop_llm("inv1", None), Some(span));
        assert_eq!(tracker.pop_llm("inv1", None), None);
    }

    #[test]
    fn test_active_tool_last_writer_wins() {
        let tracker = Tracker::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        tracker.set_active_tool("s1", a);
        tracker.set_active_tool("s1", b);
        assert_eq!(tracker.get_active_tool("s1"), Some(b));

        assert!(tracker.release_active_tool("s1", b));
        assert_eq!(tracker.get_active_tool("s1"), Some(a));
        tracker.clear_active_tool("s1");
        assert_eq!(tracker.get_active_tool("s1"), None);
    }

    #[test]
    fn test_release_out_of_order_keeps_newer_tool() {
        let tracker = Tracker::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        tracker.set_active_tool("s1", a);
        tracker.set_active_tool("s1", b);
        assert!(tracker.release_active_tool("s1", a));
        assert_eq!(tracker.get_active_tool("s1"), Some(b));
    }

    #[test]
    fn test_metadata_inheritance() {
        let tracker = Tracker::new();
        tracker.store_invocation_metadata("root", "s1", meta(&[("turn", "1")]));
        tracker.store_invocation_metadata("child", "s1", BTreeMap::new());
        assert_eq!(tracker.get_invocation_metadata("child", "s1"), meta(&[("turn", "1")]));
        assert!(tracker.get_invocation_metadata("other", "s2").is_empty());
    }

    fn query<'a>(agent: Option<&'a str>, ancestors: &'a [String]) -> ParentQuery<'a> {
        ParentQuery {
            invocation_id: "inv1",
            agent_name: agent,
            ancestors,
            session_id: "s1",
        }
    }

    #[test]
    fn test_resolve_parent_priority() {
        let tracker = Tracker::new();
        let tool = Uuid::new_v4();
        tracker.set_active_tool("s1", tool);
        assert_eq!(tracker.resolve_parent(query(None, &[])), Some(tool));
        let run = tracker.register_run("inv1", Some("s1"));
        assert_eq!(tracker.resolve_parent(query(None, &[])), Some(run));
        let router = tracker.register_agent("inv1", "router");
        assert_eq!(tracker.resolve_parent(query(Some("router"), &[])), Some(router));

        let ancestors = vec!["missing".to_string(), "router".to_string()];
        assert_eq!(tracker.resolve_parent(query(Some("worker"), &ancestors)), Some(router));

        let empty = Tracker::new();
        assert_eq!(empty.resolve_parent(query(None, &[])), None);
    }

    #[test]
    fn test_cleanup_idempotent() {
        let tracker = Tracker::new();
        let run = tracker.register_run("inv1", Some("s1"));
        let agent = tracker.register_agent("inv1", "A");
        let tool = tracker.register_tool("s1", "inv1", "calc");
        let other = tracker.register_tool("s1", "inv2", "calc");
        tracker.set_active_tool("s1", other);
        tracker.set_active_tool("s1", tool);
        tracker.store_invocation_metadata("inv1", "s1", meta(&[("k", "v")]));

        let cleanup = tracker.cleanup_invocation("inv1");
        assert_eq!(cleanup.run, Some(run));
        assert_eq!(cleanup.agents, vec![agent]);
        assert_eq!(cleanup.tools, vec![tool]);
        assert_eq!(tracker.entries_for("inv1"), 0);
        assert_eq!(tracker.get_active_tool("s1"), Some(other));
        assert!(tracker.session_root("s1").is_none());

        assert!(tracker.cleanup_invocation("inv1").is_empty());
    }
}

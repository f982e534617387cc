//! Tool classification.

use crate::context::ToolDescriptor;
use serde::{Deserialize, Serialize};

/// Marker a host attaches to functions that return documents.
pub const RETRIEVER_MARKER: &str = "retriever";

/// Which span kind a tool call produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolClass {
    Tool,
    Retriever,
}

impl ToolClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolClass::Tool => "tool",
            ToolClass::Retriever => "retriever",
        }
    }
}

type BasePredicate = Box<dyn Fn(&ToolDescriptor) -> bool + Send + Sync>;

/// Decides whether a tool is a retriever: either it derives from the host's
/// retrieval base type, or its function carries [`RETRIEVER_MARKER`].
#[derive(Default)]
pub struct ToolClassifier {
    retrieval_base: Option<BasePredicate>,
}

impl ToolClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treats tools whose type lineage contains `type_name` as retrievers.
    pub fn with_retrieval_type(self, type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        self.with_retrieval_base(move |tool| tool.type_lineage.iter().any(|t| *t == type_name))
    }

    pub fn with_retrieval_base<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ToolDescriptor) -> bool + Send + Sync + 'static,
    {
        self.retrieval_base = Some(Box::new(predicate));
        self
    }

    pub fn classify(&self, tool: &ToolDescriptor) -> ToolClass {
        let derives = self.retrieval_base.as_ref().is_some_and(|p| p(tool));
        let marked = tool.markers.iter().any(|m| m == RETRIEVER_MARKER);
        if derives || marked {
            ToolClass::Retriever
        } else {
            ToolClass::Tool
        }
    }
}

impl std::fmt::Debug for ToolClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolClassifier")
            .field("retrieval_base", &self.retrieval_base.is_some())
            .finish()
    }
}

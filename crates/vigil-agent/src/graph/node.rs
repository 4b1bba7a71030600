use std::fmt;

use serde::{Deserialize, Serialize};

use vigil_core::types::ScoreRange;

/// The closed set of node behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Invokes an analyzer on the shared history. Fan-out target.
    #[serde(alias = "independent-worker", alias = "worker")]
    IndependentWorker,
    /// Invokes an analyzer once every predecessor has produced output.
    Aggregator,
    /// Invokes a router and follows the single matching guarded edge.
    Router,
    /// Executes the tool calls of the latest proposal, one at a time.
    #[serde(alias = "tool-executor", alias = "tools")]
    ToolExecutor,
}

impl NodeKind {
    /// Whether this kind writes an output slot.
    pub fn has_slot(self) -> bool {
        !matches!(self, Self::Router)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::IndependentWorker => "independent-worker",
            Self::Aggregator => "aggregator",
            Self::Router => "router",
            Self::ToolExecutor => "tool-executor",
        };
        f.write_str(s)
    }
}

/// A node declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier; also the output slot key.
    pub id: String,
    pub kind: NodeKind,
    /// Capability the node invokes. Defaults to the node id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    /// Inclusive range the node's score must fall into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_range: Option<ScoreRange>,
    /// Per-node override of the engine's capability timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            capability: None,
            score_range: None,
            timeout_secs: None,
        }
    }

    pub fn worker(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::IndependentWorker)
    }

    pub fn aggregator(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Aggregator)
    }

    pub fn router(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Router)
    }

    pub fn tool_executor(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::ToolExecutor)
    }

    /// Invoke a differently named capability.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn with_score_range(mut self, min: f64, max: f64) -> Self {
        self.score_range = Some(ScoreRange::new(min, max));
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// The capability name this node resolves.
    pub fn capability(&self) -> &str {
        self.capability.as_deref().unwrap_or(&self.id)
    }
}
